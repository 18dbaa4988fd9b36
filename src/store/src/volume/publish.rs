//! Volume validation and publishing.
//!
//! Publishing turns a volume directory into an OCI artifact: the config
//! blob and one layer per partition are pushed if absent, then a manifest
//! binds them together and gets the caller's tag. When every blob already
//! existed and the tag resolves, the existing manifest is reused so
//! republishing an unchanged volume is a no-op.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};

use volstow_core::error::{Result, VolError};
use volstow_core::volume::{VolumeIndex, CONFIG_BLOB_FILE};

use crate::archive;
use crate::oci::{
    BlobStore, OciDescriptor, ANNOTATION_CREATED, IMAGE_CONFIG_MEDIA_TYPE,
    IMAGE_LAYER_GZIP_MEDIA_TYPE, PARTITION_PATH_ANNOTATION,
};
use crate::scan::root_base_name;

/// Check that `vol_dir` is a publishable volume directory and return the
/// raw bytes of its config blob.
///
/// The directory must exist and contain at least one visible entry;
/// hidden (dot-prefixed) entries are ignored with a warning. A missing
/// `configblob.json` is created with content `{}`.
pub fn validate_volume_dir(vol_dir: &Path) -> Result<Vec<u8>> {
    let meta = std::fs::metadata(vol_dir).map_err(|e| {
        VolError::Other(format!(
            "volume dir {:?} does not exist: {}",
            vol_dir.display(),
            e
        ))
    })?;
    if !meta.is_dir() {
        return Err(VolError::Other(format!(
            "volume path {:?} is not a directory",
            vol_dir.display()
        )));
    }

    let entries = std::fs::read_dir(vol_dir).map_err(|e| {
        VolError::Other(format!(
            "failed to read directory {:?}: {}",
            vol_dir.display(),
            e
        ))
    })?;
    let mut visible = 0;
    for entry in entries {
        let entry = entry.map_err(|e| {
            VolError::Other(format!(
                "failed to read entry in {:?}: {}",
                vol_dir.display(),
                e
            ))
        })?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            tracing::warn!(
                entry = %name.to_string_lossy(),
                dir = %vol_dir.display(),
                "hidden entry found, skipping"
            );
            continue;
        }
        visible += 1;
    }
    if visible == 0 {
        return Err(VolError::Other(format!(
            "volume directory {:?} is empty (only hidden files present)",
            vol_dir.display()
        )));
    }

    let cfg_path = vol_dir.join(CONFIG_BLOB_FILE);
    if !cfg_path.exists() {
        tracing::info!(path = %cfg_path.display(), "configblob.json not found; creating an empty one");
        let raw = b"{}".to_vec();
        std::fs::write(&cfg_path, &raw).map_err(|e| {
            VolError::Other(format!("failed to create {}: {}", cfg_path.display(), e))
        })?;
        return Ok(raw);
    }
    load_metadata_json(&cfg_path)
}

/// Read a JSON file and return its raw bytes after checking it parses.
pub fn load_metadata_json(path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(path).map_err(|e| {
        VolError::Other(format!("failed to read JSON file {}: {}", path.display(), e))
    })?;
    serde_json::from_slice::<serde_json::Value>(&data)
        .map_err(|e| VolError::Format(format!("invalid JSON in {}: {}", path.display(), e)))?;
    Ok(data)
}

/// Publishes volume directories into a blob store.
pub struct VolumePublisher<S> {
    store: Arc<S>,
}

impl<S: BlobStore> VolumePublisher<S> {
    /// Create a publisher over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// The underlying blob store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Publish `vol_dir` under `tag` and return the stamped index.
    ///
    /// `vi` is the planner's output for `vol_dir`; `config_blob` is the
    /// raw JSON config. On return `volume_ref` holds the manifest digest
    /// and every partition's `manifest_ref` its layer digest.
    pub async fn publish_volume(
        &self,
        mut vi: VolumeIndex,
        vol_dir: &Path,
        tag: &str,
        config_blob: &[u8],
    ) -> Result<VolumeIndex> {
        let root_base = root_base_name(vol_dir);

        // Config first, then layers, then the manifest: a crash can leave
        // orphan blobs but never a tagged manifest missing its blobs.
        let config_desc = OciDescriptor {
            media_type: IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            digest: archive::digest(config_blob),
            size: config_blob.len() as i64,
            ..Default::default()
        };
        let mut any_pushed = self
            .push_if_needed(&config_desc, config_blob.to_vec())
            .await?;

        let mut layers = Vec::with_capacity(vi.partitions.len().max(1));
        if vi.partitions.is_empty() {
            // Fallback: the whole volume directory as one layer.
            let data = archive::tar_gz_dir(vol_dir, &root_base).map_err(|e| {
                VolError::Other(format!("tar.gz fallback {:?}: {}", vol_dir.display(), e))
            })?;
            let desc = layer_descriptor(&data, &root_base);
            if self.push_if_needed(&desc, data).await? {
                any_pushed = true;
            }
            layers.push(desc);
        } else {
            for part in vi.partitions.iter_mut() {
                let rel = part
                    .path
                    .strip_prefix(&format!("{}/", root_base))
                    .unwrap_or(&part.path);
                let fs_path = vol_dir.join(rel);

                let data = archive::tar_gz_dir(&fs_path, &part.path).map_err(|e| {
                    VolError::Other(format!("tar.gz {:?}: {}", fs_path.display(), e))
                })?;
                let desc = layer_descriptor(&data, &part.path);
                if self.push_if_needed(&desc, data).await.map_err(|e| {
                    VolError::Storage(format!("push layer {}: {}", part.name, e))
                })? {
                    any_pushed = true;
                }
                part.manifest_ref = desc.digest.clone();
                part.compression = "gzip".to_string();
                layers.push(desc);
            }
        }

        // If nothing changed, reuse the already-tagged manifest.
        if !any_pushed {
            if let Ok(existing) = self.store.resolve(tag).await {
                tracing::info!(
                    tag,
                    digest = %existing.digest,
                    "no changes detected (config+layers), skipping manifest update"
                );
                vi.volume_ref = existing.digest;
                return Ok(vi);
            }
        }

        let mut annotations = BTreeMap::new();
        annotations.insert(
            ANNOTATION_CREATED.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        let manifest_desc = self
            .store
            .pack_manifest(&config_desc, layers, annotations)
            .await
            .map_err(|e| VolError::Storage(format!("pack manifest: {}", e)))?;
        self.store
            .tag(&manifest_desc, tag)
            .await
            .map_err(|e| VolError::Storage(format!("tag manifest {:?}: {}", tag, e)))?;

        vi.volume_ref = manifest_desc.digest.clone();
        tracing::info!(tag, digest = %manifest_desc.digest, "volume artifact tagged");
        Ok(vi)
    }

    /// Push a blob unless the store already has it. Returns whether a
    /// push actually happened.
    async fn push_if_needed(&self, desc: &OciDescriptor, data: Vec<u8>) -> Result<bool> {
        let exists = self
            .store
            .exists(desc)
            .await
            .map_err(|e| VolError::Storage(format!("check exists ({}): {}", desc.digest, e)))?;
        if exists {
            tracing::info!(digest = %desc.digest, "blob already exists, skipping");
            return Ok(false);
        }
        self.store
            .push(desc, data)
            .await
            .map_err(|e| VolError::Storage(format!("push blob ({}): {}", desc.digest, e)))?;
        Ok(true)
    }
}

fn layer_descriptor(data: &[u8], partition_path: &str) -> OciDescriptor {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        PARTITION_PATH_ANNOTATION.to_string(),
        partition_path.to_string(),
    );
    OciDescriptor {
        media_type: IMAGE_LAYER_GZIP_MEDIA_TYPE.to_string(),
        digest: archive::digest(data),
        size: data.len() as i64,
        annotations: Some(annotations.into_iter().collect()),
        ..Default::default()
    }
}
