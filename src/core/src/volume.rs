//! Volume metadata model.
//!
//! A volume is a directory tree packaged as a single OCI artifact. It is
//! carved into partitions (one gzip tar layer each), described by a
//! [`VolumeIndex`], paired with its user configuration blob, and catalogued
//! in a versioned [`VolumeCollection`] persisted next to the local store.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, VolError};

/// File name of the per-volume user configuration blob.
pub const CONFIG_BLOB_FILE: &str = "configblob.json";

/// File name of the on-disk volume catalog.
pub const COLLECTION_FILE: &str = "volume-collection.json";

/// File name of the per-volume metadata document.
pub const VOLUME_INDEX_FILE: &str = "volume-index.json";

/// Free-form JSON object supplied by the caller. Its raw bytes are hashed
/// and pushed as the OCI config blob; the decoded map is what the catalog
/// stores.
pub type ConfigBlob = serde_json::Map<String, serde_json::Value>;

/// One unit of layering: a subdirectory that becomes a single layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    /// Basename of the source directory.
    pub name: String,

    /// Volume-relative path (forward slashes), prefixed by the volume
    /// root basename.
    pub path: String,

    /// Content digest of the produced layer; empty before publish.
    #[serde(default)]
    pub manifest_ref: String,

    /// RFC 3339 creation time, second precision.
    #[serde(default)]
    pub created_at: String,

    /// Compression tag; "gzip" once published.
    #[serde(default)]
    pub compression: String,
}

/// Metadata document for a single volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeIndex {
    /// Digest of the volume's manifest; empty before publish.
    #[serde(default)]
    pub volume_ref: String,

    /// Human label; not unique.
    pub display_name: String,

    /// RFC 3339 creation time, second precision.
    #[serde(default)]
    pub created_at: String,

    /// Ordered partitions. May be empty, in which case publishing emits a
    /// single layer covering the whole volume root.
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

impl VolumeIndex {
    /// Write this index as pretty JSON to `volume-index.json` under `dir`.
    pub fn save_to_file(&self, dir: &Path) -> Result<()> {
        let out = dir.join(VOLUME_INDEX_FILE);
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(&out, data)
            .map_err(|e| VolError::Other(format!("failed to write {}: {}", out.display(), e)))?;
        Ok(())
    }
}

/// The unit stored in a collection: a volume's index plus its config blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub index: VolumeIndex,

    #[serde(rename = "configBlob", default)]
    pub config_blob: ConfigBlob,
}

/// Catalog of every volume this node has published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeCollection {
    /// Bumped on every mutation that changes the serialized content.
    pub version: u64,

    #[serde(default)]
    pub volumes: Vec<VolumeEntry>,
}

impl Default for VolumeCollection {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl VolumeCollection {
    /// Create a fresh collection at version 1 from initial entries.
    pub fn new(initial: Vec<VolumeEntry>) -> Self {
        Self {
            version: 1,
            volumes: initial,
        }
    }

    /// Whether any stored entry matches `vi` by display name or volume ref.
    pub fn has_volume(&self, vi: &VolumeIndex) -> bool {
        self.volumes.iter().any(|entry| {
            entry.index.display_name == vi.display_name || entry.index.volume_ref == vi.volume_ref
        })
    }

    /// Append every entry of `other` not already present. Bumps the version
    /// once if anything was added; returns whether anything changed.
    pub fn merge(&mut self, other: &VolumeCollection) -> bool {
        let mut added = false;
        for entry in &other.volumes {
            if !self.has_volume(&entry.index) {
                self.volumes.push(entry.clone());
                added = true;
            }
        }
        if added {
            self.version += 1;
        }
        added
    }

    /// Append an entry unconditionally and bump the version.
    pub fn add_volume(&mut self, entry: VolumeEntry) {
        self.volumes.push(entry);
        self.version += 1;
    }

    /// Remove the entry at `idx` and bump the version.
    pub fn remove_volume(&mut self, idx: usize) -> Result<()> {
        if idx >= self.volumes.len() {
            return Err(VolError::State(format!("index {} out of range", idx)));
        }
        self.volumes.remove(idx);
        self.version += 1;
        Ok(())
    }
}
