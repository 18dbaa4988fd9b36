//! Deterministic layer packing and extraction.
//!
//! Packs a directory subtree into a gzip-compressed tar whose bytes are a
//! pure function of file contents and paths: entries are written in sorted
//! byte order and every header field that would leak the environment
//! (timestamps, owner ids, gzip OS byte) is zeroed. Identical inputs
//! therefore produce identical digests across runs and machines.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use tar::{Archive, Builder, EntryType, Header};

use volstow_core::error::{Result, VolError};

/// Compute the SHA-256 of raw bytes as a bare hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Content digest of a blob in `sha256:<hex>` form.
pub fn digest(data: &[u8]) -> String {
    format!("sha256:{}", sha256_hex(data))
}

/// Pack the subtree at `src` into a deterministic tar.gz byte vector.
///
/// Entry names inside the archive are the forward-slash join of `prefix`
/// and each path's `src`-relative path; the entry for `src` itself is the
/// literal `prefix`. Regular files, directories, and symlinks are
/// recorded; other entry kinds are skipped.
pub fn tar_gz_dir(src: &Path, prefix: &str) -> Result<Vec<u8>> {
    let mut paths = Vec::new();
    collect_paths(src, &mut paths)?;
    paths.sort_by(|a, b| a.as_os_str().as_bytes().cmp(b.as_os_str().as_bytes()));

    let mut buf = Vec::new();
    // Zeroed mtime and OS byte; no filename or comment is recorded.
    let gz = GzBuilder::new()
        .mtime(0)
        .operating_system(0)
        .write(&mut buf, Compression::best());
    let mut builder = Builder::new(gz);

    for path in &paths {
        let meta = std::fs::symlink_metadata(path)
            .map_err(|e| VolError::Other(format!("failed to stat {}: {}", path.display(), e)))?;
        let rel = path.strip_prefix(src).map_err(|e| {
            VolError::Other(format!(
                "failed to compute relative path for {}: {}",
                path.display(),
                e
            ))
        })?;
        let name = archive_name(prefix, rel);

        let mut header = Header::new_gnu();
        header.set_mode(meta.permissions().mode() & 0o7777);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);

        let file_type = meta.file_type();
        if file_type.is_symlink() {
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            let target = std::fs::read_link(path).map_err(|e| {
                VolError::Other(format!("failed to read link {}: {}", path.display(), e))
            })?;
            builder.append_link(&mut header, &name, &target).map_err(|e| {
                VolError::Other(format!("failed to append symlink {}: {}", name, e))
            })?;
        } else if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, &name, io::empty()).map_err(|e| {
                VolError::Other(format!("failed to append directory {}: {}", name, e))
            })?;
        } else if file_type.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            let file = File::open(path).map_err(|e| {
                VolError::Other(format!("failed to open {}: {}", path.display(), e))
            })?;
            builder.append_data(&mut header, &name, file).map_err(|e| {
                VolError::Other(format!("failed to append file {}: {}", name, e))
            })?;
        }
    }

    let gz = builder
        .into_inner()
        .map_err(|e| VolError::Other(format!("failed to finalize tar stream: {}", e)))?;
    gz.finish()
        .map_err(|e| VolError::Other(format!("failed to finalize gzip stream: {}", e)))?;

    Ok(buf)
}

/// Extract a gzip tar stream into `dest`.
///
/// Entry names are cleaned of traversal components before being joined
/// with `dest`. Directories, regular files, and symlinks are restored;
/// other entry kinds are skipped. Partially extracted output is left in
/// place on failure.
pub fn untar_gz<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    let entries = archive
        .entries()
        .map_err(|e| VolError::Other(format!("failed to read archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| VolError::Other(format!("failed to read tar entry: {}", e)))?;
        let raw = entry
            .path()
            .map_err(|e| VolError::Format(format!("invalid entry path: {}", e)))?
            .into_owned();

        let clean = sanitize(&raw);
        if clean.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&clean);
        let mode = entry
            .header()
            .mode()
            .map_err(|e| VolError::Format(format!("invalid mode for {}: {}", raw.display(), e)))?
            & 0o7777;

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| {
                VolError::Other(format!("mkdir {}: {}", target.display(), e))
            })?;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode)).map_err(
                |e| VolError::Other(format!("chmod {}: {}", target.display(), e)),
            )?;
        } else if entry_type.is_file() {
            ensure_parent(&target)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(mode)
                .open(&target)
                .map_err(|e| VolError::Other(format!("open file {}: {}", target.display(), e)))?;
            io::copy(&mut entry, &mut file)
                .map_err(|e| VolError::Other(format!("copy file {}: {}", target.display(), e)))?;
        } else if entry_type.is_symlink() {
            let link_target = entry
                .link_name()
                .map_err(|e| VolError::Format(format!("invalid link name for {}: {}", raw.display(), e)))?
                .ok_or_else(|| {
                    VolError::Format(format!("missing link target for {}", raw.display()))
                })?
                .into_owned();
            ensure_parent(&target)?;
            std::os::unix::fs::symlink(&link_target, &target).map_err(|e| {
                VolError::Other(format!(
                    "symlink {} -> {}: {}",
                    target.display(),
                    link_target.display(),
                    e
                ))
            })?;
        }
    }

    Ok(())
}

/// Recursively collect all paths under `dir`, including `dir` itself.
/// Symlinks are recorded but never followed.
fn collect_paths(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    out.push(dir.to_path_buf());
    let entries = std::fs::read_dir(dir)
        .map_err(|e| VolError::Other(format!("failed to read directory {}: {}", dir.display(), e)))?;
    for entry in entries {
        let entry = entry
            .map_err(|e| VolError::Other(format!("failed to read directory entry: {}", e)))?;
        let file_type = entry.file_type().map_err(|e| {
            VolError::Other(format!(
                "failed to read file type for {}: {}",
                entry.path().display(),
                e
            ))
        })?;
        if file_type.is_dir() {
            collect_paths(&entry.path(), out)?;
        } else {
            out.push(entry.path());
        }
    }
    Ok(())
}

/// Forward-slash join of `prefix` and a relative path; the bare `prefix`
/// when the relative path is empty.
fn archive_name(prefix: &str, rel: &Path) -> String {
    let mut name = String::from(prefix);
    for comp in rel.components() {
        name.push('/');
        name.push_str(&comp.as_os_str().to_string_lossy());
    }
    name
}

/// Drop every non-normal component (`..`, `.`, roots) from an entry path.
fn sanitize(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p),
            _ => None,
        })
        .collect()
}

fn ensure_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            VolError::Other(format!("mkdir parent {}: {}", parent.display(), e))
        })?;
    }
    Ok(())
}
