//! Volstow Store - Volume packaging and publishing engine.
//!
//! Packages directory trees ("volumes") as content-addressed OCI
//! artifacts and retrieves them back onto a filesystem:
//!
//! - [`archive`] packs partitions into deterministic gzip tar layers.
//! - [`scan`] carves a volume root into partitions.
//! - [`oci`] is the blob store surface: a local image-layout directory
//!   plus a remote registry push path.
//! - [`volume`] orchestrates publish and fetch and catalogs every
//!   published volume in a versioned collection.

pub mod archive;
pub mod oci;
pub mod scan;
pub mod volume;

// Re-export common types
pub use oci::layout::OciLayout;
pub use oci::registry::push_local_to_remote;
pub use oci::{BlobStore, OciDescriptor, OciImageManifest};
pub use scan::generate_volume_index;
pub use volume::{
    validate_volume_dir, CollectionManager, VolumeFetcher, VolumePublisher,
};

/// Volstow Store version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
