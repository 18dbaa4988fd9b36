//! Local OCI image-layout store.
//!
//! Keeps blobs by digest under `blobs/sha256/` with an `oci-layout`
//! marker and an `index.json` of tagged manifests:
//!
//! ```text
//! <root>/
//! ├── oci-layout           (layout version marker)
//! ├── index.json           (tagged manifest descriptors)
//! └── blobs/
//!     └── sha256/
//!         └── <hex>        (config, layer, and manifest blobs)
//! ```
//!
//! Tags are recorded as the `org.opencontainers.image.ref.name`
//! annotation on index entries. Blob and index writes go to a temp file
//! first and are renamed into place.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use volstow_core::error::{Result, VolError};

use super::{BlobStore, OciDescriptor, ANNOTATION_REF_NAME};

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";

/// Top-level `index.json` document of an image layout.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutIndex {
    schema_version: u32,
    #[serde(default)]
    manifests: Vec<OciDescriptor>,
}

impl Default for LayoutIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            manifests: Vec::new(),
        }
    }
}

/// Content-addressed blob store over a local image-layout directory.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Open the layout at `root`, creating the directory tree and seed
    /// files when absent.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let blobs = root.join("blobs").join("sha256");
        tokio::fs::create_dir_all(&blobs).await.map_err(|e| {
            VolError::Other(format!(
                "failed to create blobs directory {}: {}",
                blobs.display(),
                e
            ))
        })?;

        let marker = root.join(OCI_LAYOUT_FILE);
        if !marker.exists() {
            tokio::fs::write(&marker, OCI_LAYOUT_CONTENT).await.map_err(|e| {
                VolError::Other(format!("failed to write {}: {}", marker.display(), e))
            })?;
        }

        let store = Self { root };
        if !store.index_path().exists() {
            store.write_index(&LayoutIndex::default()).await?;
        }
        Ok(store)
    }

    /// Root directory of the layout.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Filesystem path of a blob, validating the digest shape first.
    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = digest.strip_prefix("sha256:").ok_or_else(|| {
            VolError::Format(format!("unsupported digest {:?}", digest))
        })?;
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(VolError::Format(format!("malformed digest {:?}", digest)));
        }
        Ok(self.root.join("blobs").join("sha256").join(hex))
    }

    async fn read_index(&self) -> Result<LayoutIndex> {
        let path = self.index_path();
        let data = tokio::fs::read(&path).await.map_err(|e| {
            VolError::Storage(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&data)
            .map_err(|e| VolError::Format(format!("failed to parse {}: {}", path.display(), e)))
    }

    async fn write_index(&self, index: &LayoutIndex) -> Result<()> {
        let path = self.index_path();
        let data = serde_json::to_vec_pretty(index)?;
        write_atomic(&path, &data).await
    }
}

#[async_trait]
impl BlobStore for OciLayout {
    async fn exists(&self, desc: &OciDescriptor) -> Result<bool> {
        let path = self.blob_path(&desc.digest)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VolError::Storage(format!(
                "failed to stat blob {}: {}",
                desc.digest, e
            ))),
        }
    }

    async fn push(&self, desc: &OciDescriptor, data: Vec<u8>) -> Result<()> {
        let path = self.blob_path(&desc.digest)?;
        if path.exists() {
            return Ok(());
        }
        write_atomic(&path, &data).await
            .map_err(|e| VolError::Storage(format!("failed to write blob {}: {}", desc.digest, e)))
    }

    async fn fetch(&self, desc: &OciDescriptor) -> Result<Vec<u8>> {
        let path = self.blob_path(&desc.digest)?;
        tokio::fs::read(&path).await.map_err(|e| {
            VolError::Storage(format!("failed to read blob {}: {}", desc.digest, e))
        })
    }

    async fn resolve(&self, tag: &str) -> Result<OciDescriptor> {
        let index = self.read_index().await?;
        index
            .manifests
            .into_iter()
            .find(|m| {
                m.annotations
                    .as_ref()
                    .and_then(|a| a.get(ANNOTATION_REF_NAME))
                    .is_some_and(|name| name == tag)
            })
            .ok_or_else(|| VolError::Storage(format!("tag not found: {:?}", tag)))
    }

    async fn tag(&self, desc: &OciDescriptor, tag: &str) -> Result<()> {
        let mut index = self.read_index().await?;
        index.manifests.retain(|m| {
            m.annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_REF_NAME))
                .map_or(true, |name| name != tag)
        });

        let mut tagged = desc.clone();
        tagged
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_REF_NAME.to_string(), tag.to_string());
        index.manifests.push(tagged);

        self.write_index(&index).await?;
        tracing::debug!(tag, digest = %desc.digest, "tagged manifest");
        Ok(())
    }
}

/// Write `data` to a temp file next to `path`, then rename into place.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await.map_err(|e| {
        VolError::Other(format!("failed to write tmp file {}: {}", tmp.display(), e))
    })?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| {
        VolError::Other(format!(
            "failed to rename {} -> {}: {}",
            tmp.display(),
            path.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive;
    use crate::oci::{IMAGE_CONFIG_MEDIA_TYPE, IMAGE_LAYER_GZIP_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn desc_for(data: &[u8], media_type: &str) -> OciDescriptor {
        OciDescriptor {
            media_type: media_type.to_string(),
            digest: archive::digest(data),
            size: data.len() as i64,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_open_seeds_layout() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("repo");
        let store = OciLayout::open(&root).await.unwrap();

        assert!(root.join("blobs/sha256").is_dir());
        assert!(root.join("oci-layout").is_file());
        assert!(root.join("index.json").is_file());
        assert_eq!(store.root(), root);

        // Reopening an existing layout must not clobber it.
        OciLayout::open(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_push_exists_fetch() {
        let tmp = TempDir::new().unwrap();
        let store = OciLayout::open(tmp.path()).await.unwrap();

        let data = b"layer bytes".to_vec();
        let desc = desc_for(&data, IMAGE_LAYER_GZIP_MEDIA_TYPE);

        assert!(!store.exists(&desc).await.unwrap());
        store.push(&desc, data.clone()).await.unwrap();
        assert!(store.exists(&desc).await.unwrap());
        assert_eq!(store.fetch(&desc).await.unwrap(), data);

        // Re-pushing an existing blob is a no-op.
        store.push(&desc, data).await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_missing_blob() {
        let tmp = TempDir::new().unwrap();
        let store = OciLayout::open(tmp.path()).await.unwrap();
        let desc = desc_for(b"never pushed", IMAGE_LAYER_GZIP_MEDIA_TYPE);

        let err = store.fetch(&desc).await.unwrap_err();
        assert!(err.to_string().contains(&desc.digest));
    }

    #[tokio::test]
    async fn test_rejects_malformed_digest() {
        let tmp = TempDir::new().unwrap();
        let store = OciLayout::open(tmp.path()).await.unwrap();

        let desc = OciDescriptor {
            digest: "sha256:../escape".to_string(),
            ..Default::default()
        };
        assert!(store.exists(&desc).await.is_err());

        let desc = OciDescriptor {
            digest: "md5:abcd".to_string(),
            ..Default::default()
        };
        assert!(store.fetch(&desc).await.is_err());
    }

    #[tokio::test]
    async fn test_tag_and_resolve() {
        let tmp = TempDir::new().unwrap();
        let store = OciLayout::open(tmp.path()).await.unwrap();

        let data = b"{\"layers\":[]}".to_vec();
        let desc = desc_for(&data, OCI_IMAGE_MEDIA_TYPE);
        store.push(&desc, data).await.unwrap();

        store.tag(&desc, "demo.v1").await.unwrap();
        let resolved = store.resolve("demo.v1").await.unwrap();
        assert_eq!(resolved.digest, desc.digest);

        assert!(store.resolve("missing.v1").await.is_err());
    }

    #[tokio::test]
    async fn test_retag_replaces_previous_target() {
        let tmp = TempDir::new().unwrap();
        let store = OciLayout::open(tmp.path()).await.unwrap();

        let first = b"first manifest".to_vec();
        let second = b"second manifest".to_vec();
        let first_desc = desc_for(&first, OCI_IMAGE_MEDIA_TYPE);
        let second_desc = desc_for(&second, OCI_IMAGE_MEDIA_TYPE);
        store.push(&first_desc, first).await.unwrap();
        store.push(&second_desc, second).await.unwrap();

        store.tag(&first_desc, "demo.v1").await.unwrap();
        store.tag(&second_desc, "demo.v1").await.unwrap();

        let resolved = store.resolve("demo.v1").await.unwrap();
        assert_eq!(resolved.digest, second_desc.digest);

        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(tmp.path().join("index.json")).unwrap()).unwrap();
        assert_eq!(index["manifests"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pack_manifest() {
        let tmp = TempDir::new().unwrap();
        let store = OciLayout::open(tmp.path()).await.unwrap();

        let config = b"{}".to_vec();
        let config_desc = desc_for(&config, IMAGE_CONFIG_MEDIA_TYPE);
        store.push(&config_desc, config).await.unwrap();

        let layer = b"layer".to_vec();
        let layer_desc = desc_for(&layer, IMAGE_LAYER_GZIP_MEDIA_TYPE);
        store.push(&layer_desc, layer).await.unwrap();

        let mut annotations = BTreeMap::new();
        annotations.insert("org.opencontainers.image.created".to_string(), "2025-07-15T19:30:00Z".to_string());

        let manifest_desc = store
            .pack_manifest(&config_desc, vec![layer_desc.clone()], annotations)
            .await
            .unwrap();
        assert_eq!(manifest_desc.media_type, OCI_IMAGE_MEDIA_TYPE);

        let manifest: crate::oci::OciImageManifest =
            serde_json::from_slice(&store.fetch(&manifest_desc).await.unwrap()).unwrap();
        assert_eq!(manifest.config.digest, config_desc.digest);
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(manifest.layers[0].digest, layer_desc.digest);
        assert!(manifest
            .annotations
            .as_ref()
            .unwrap()
            .contains_key("org.opencontainers.image.created"));
    }
}
