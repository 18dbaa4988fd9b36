//! Volume publishing, restore, and catalog management.

mod collection;
mod fetch;
mod publish;

pub use collection::CollectionManager;
pub use fetch::VolumeFetcher;
pub use publish::{load_metadata_json, validate_volume_dir, VolumePublisher};
