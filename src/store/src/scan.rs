//! Partition discovery.
//!
//! Walks a volume root and carves it into layer-sized units: every
//! directory below the root becomes a partition, and a `no_deep_scan`
//! marker file turns its directory into a leaf whose subtree is not
//! descended into.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use chrono::{SecondsFormat, Utc};

use volstow_core::error::{Result, VolError};
use volstow_core::volume::{Partition, VolumeIndex};

/// Marker file that stops the walk from descending below its directory.
pub const NO_DEEP_SCAN_MARKER: &str = "no_deep_scan";

/// Scan `root` and build a fresh [`VolumeIndex`] for it.
///
/// The returned index has an empty `volume_ref` and empty per-partition
/// `manifest_ref`s; publishing fills both. All partitions share a single
/// timestamp captured when the walk starts, and are visited in sorted
/// name order so the output is deterministic.
pub fn generate_volume_index(root: &Path, display_name: &str) -> Result<VolumeIndex> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let root_base = root_base_name(root);

    let mut partitions = Vec::new();
    scan_dir(root, root, &root_base, &now, &mut partitions)?;

    Ok(VolumeIndex {
        volume_ref: String::new(),
        display_name: display_name.to_string(),
        created_at: now,
        partitions,
    })
}

/// Basename of a volume root, used to prefix partition paths.
pub fn root_base_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string())
}

fn scan_dir(
    root: &Path,
    current: &Path,
    root_base: &str,
    now: &str,
    partitions: &mut Vec<Partition>,
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(current)
        .map_err(|e| {
            VolError::Other(format!(
                "failed to read dir {}: {}",
                current.display(),
                e
            ))
        })?
        .collect::<std::io::Result<_>>()
        .map_err(|e| {
            VolError::Other(format!(
                "error accessing entry under {}: {}",
                current.display(),
                e
            ))
        })?;
    entries.sort_by(|a, b| a.file_name().as_bytes().cmp(b.file_name().as_bytes()));

    for entry in entries {
        let file_type = entry.file_type().map_err(|e| {
            VolError::Other(format!(
                "error accessing {}: {}",
                entry.path().display(),
                e
            ))
        })?;
        if !file_type.is_dir() {
            continue;
        }

        let path = entry.path();
        let rel = path.strip_prefix(root).map_err(|e| {
            VolError::Other(format!(
                "failed to get rel path for {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut full_path = String::from(root_base);
        for comp in rel.components() {
            full_path.push('/');
            full_path.push_str(&comp.as_os_str().to_string_lossy());
        }

        partitions.push(Partition {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: full_path,
            manifest_ref: String::new(),
            created_at: now.to_string(),
            compression: String::new(),
        });

        if !has_marker(&path)? {
            scan_dir(root, &path, root_base, now, partitions)?;
        }
    }

    Ok(())
}

/// Whether `dir` contains a regular file named [`NO_DEEP_SCAN_MARKER`].
fn has_marker(dir: &Path) -> Result<bool> {
    let marker = dir.join(NO_DEEP_SCAN_MARKER);
    match std::fs::symlink_metadata(&marker) {
        Ok(meta) => Ok(meta.is_file()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(VolError::Other(format!(
            "failed to read dir {}: {}",
            dir.display(),
            e
        ))),
    }
}
