//! OCI artifact plumbing for volume storage.
//!
//! Volumes are stored as standard image artifacts: a config blob holding
//! the caller's JSON, one gzip tar layer per partition, and a manifest
//! binding them together. The [`BlobStore`] trait is the capability
//! surface the publisher and fetchers require; [`layout::OciLayout`]
//! implements it over a local image-layout directory, and
//! [`registry`] copies tagged volumes from a local layout to a remote
//! repository.

pub mod layout;
pub mod registry;

use std::collections::BTreeMap;

use async_trait::async_trait;

use volstow_core::error::Result;

use crate::archive;

pub use oci_distribution::manifest::{
    OciDescriptor, OciImageManifest, IMAGE_CONFIG_MEDIA_TYPE, IMAGE_LAYER_GZIP_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE,
};

/// Per-layer annotation carrying the partition path the layer restores to.
pub const PARTITION_PATH_ANNOTATION: &str = "org.example.partitionPath";

/// Standard manifest annotation recording creation time.
pub const ANNOTATION_CREATED: &str = "org.opencontainers.image.created";

/// Standard index annotation naming the tag of a manifest entry.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Capability surface of a content-addressed blob store.
///
/// Implementations are either a local image-layout directory or a remote
/// repository; callers address blobs exclusively through descriptors.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Whether the blob named by `desc` is already present.
    async fn exists(&self, desc: &OciDescriptor) -> Result<bool>;

    /// Store a blob under its digest. Idempotent when combined with
    /// [`BlobStore::exists`].
    async fn push(&self, desc: &OciDescriptor, data: Vec<u8>) -> Result<()>;

    /// Read a blob's bytes back.
    async fn fetch(&self, desc: &OciDescriptor) -> Result<Vec<u8>>;

    /// Resolve a tag to its manifest descriptor. Fails when the tag is
    /// unknown.
    async fn resolve(&self, tag: &str) -> Result<OciDescriptor>;

    /// Point `tag` at the given descriptor, replacing any previous target.
    async fn tag(&self, desc: &OciDescriptor, tag: &str) -> Result<()>;

    /// Build, push, and describe an image manifest referencing `config`
    /// and the ordered `layers`.
    async fn pack_manifest(
        &self,
        config: &OciDescriptor,
        layers: Vec<OciDescriptor>,
        annotations: BTreeMap<String, String>,
    ) -> Result<OciDescriptor> {
        let manifest = OciImageManifest {
            media_type: Some(OCI_IMAGE_MEDIA_TYPE.to_string()),
            config: config.clone(),
            layers,
            annotations: Some(annotations.into_iter().collect()),
            ..Default::default()
        };
        let data = serde_json::to_vec(&manifest).map_err(volstow_core::error::VolError::from)?;

        let desc = OciDescriptor {
            media_type: OCI_IMAGE_MEDIA_TYPE.to_string(),
            digest: archive::digest(&data),
            size: data.len() as i64,
            ..Default::default()
        };
        self.push(&desc, data).await?;
        Ok(desc)
    }
}
