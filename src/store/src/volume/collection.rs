//! Catalog of published volumes.
//!
//! Keeps a [`VolumeCollection`] in memory behind a read/write lock with a
//! digest-keyed index, and persists it to `volume-collection.json` after
//! every accepted mutation. Persistence happens while the lock is held so
//! on-disk version order matches in-memory order, and goes through a temp
//! file + rename to avoid torn documents.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use volstow_core::error::{Result, VolError};
use volstow_core::volume::{
    ConfigBlob, VolumeCollection, VolumeEntry, COLLECTION_FILE, CONFIG_BLOB_FILE,
};

use crate::oci::BlobStore;
use crate::scan::generate_volume_index;
use crate::volume::fetch::VolumeFetcher;
use crate::volume::publish::{validate_volume_dir, VolumePublisher};

struct Inner {
    coll: VolumeCollection,
    /// volume_ref → slot in `coll.volumes`.
    by_ref: HashMap<String, usize>,
}

/// Thread-safe catalog of every volume this node has published.
pub struct CollectionManager<S> {
    root: PathBuf,
    publisher: VolumePublisher<S>,
    fetcher: VolumeFetcher<S>,
    inner: RwLock<Inner>,
}

impl<S: BlobStore + 'static> CollectionManager<S> {
    /// Open the catalog rooted at `root` over the given blob store.
    ///
    /// Loads `volume-collection.json` when present; otherwise creates a
    /// fresh collection from `initial` and saves it immediately.
    pub async fn new(
        root: impl Into<PathBuf>,
        store: Arc<S>,
        initial: Vec<VolumeEntry>,
    ) -> Result<Self> {
        let root = root.into();
        let coll = load_or_new_collection(&root, initial).await?;

        let mut by_ref = HashMap::with_capacity(coll.volumes.len());
        for (i, entry) in coll.volumes.iter().enumerate() {
            if !entry.index.volume_ref.is_empty() {
                by_ref.insert(entry.index.volume_ref.clone(), i);
            }
        }

        Ok(Self {
            root,
            publisher: VolumePublisher::new(Arc::clone(&store)),
            fetcher: VolumeFetcher::new(store),
            inner: RwLock::new(Inner { coll, by_ref }),
        })
    }

    /// Insert `entry` or update the entry with the same `volume_ref`.
    ///
    /// A deep-equal update is a silent no-op: no version bump, no write.
    pub async fn add_or_update(&self, entry: VolumeEntry) -> Result<()> {
        let mut inner = self.inner.write().await;

        let volume_ref = entry.index.volume_ref.clone();
        if let Some(&idx) = inner.by_ref.get(&volume_ref) {
            if inner.coll.volumes[idx] == entry {
                return Ok(());
            }
            inner.coll.volumes[idx] = entry;
        } else {
            inner.coll.volumes.push(entry);
            let idx = inner.coll.volumes.len() - 1;
            inner.by_ref.insert(volume_ref, idx);
        }
        inner.coll.version += 1;

        save_collection(&self.root, &inner.coll).await
    }

    /// Remove the entry with the given ref using swap-and-pop.
    ///
    /// Returns `false` without error (and without a write) when absent.
    pub async fn remove(&self, volume_ref: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;

        let Some(idx) = inner.by_ref.get(volume_ref).copied() else {
            return Ok(false);
        };

        let last = inner.coll.volumes.len() - 1;
        if idx != last {
            inner.coll.volumes.swap(idx, last);
            let moved_ref = inner.coll.volumes[idx].index.volume_ref.clone();
            inner.by_ref.insert(moved_ref, idx);
        }
        inner.coll.volumes.truncate(last);
        inner.by_ref.remove(volume_ref);
        inner.coll.version += 1;

        save_collection(&self.root, &inner.coll).await?;
        Ok(true)
    }

    /// Look up a single entry by ref.
    pub async fn get(&self, volume_ref: &str) -> Option<VolumeEntry> {
        let inner = self.inner.read().await;
        inner
            .by_ref
            .get(volume_ref)
            .map(|&idx| inner.coll.volumes[idx].clone())
    }

    /// Deep copy of the collection at a single point in time.
    ///
    /// Later mutations are never observable through the snapshot.
    pub async fn get_snapshot(&self) -> VolumeCollection {
        let inner = self.inner.read().await;
        inner.coll.clone()
    }

    /// Re-persist the current collection unconditionally.
    pub async fn flush(&self) -> Result<()> {
        let inner = self.inner.read().await;
        save_collection(&self.root, &inner.coll).await
    }

    /// Validate, plan, publish, and catalog a volume directory in one call.
    pub async fn publish_volume_from_dir(
        &self,
        vol_dir: &Path,
        display_name: &str,
        tag: &str,
    ) -> Result<VolumeEntry> {
        let raw_config = validate_volume_dir(vol_dir)
            .map_err(|e| VolError::Other(format!("volume validation failed: {}", e)))?;
        let config_blob: ConfigBlob = serde_json::from_slice(&raw_config).map_err(|e| {
            VolError::Format(format!("failed to parse {}: {}", CONFIG_BLOB_FILE, e))
        })?;

        let vi = generate_volume_index(vol_dir, display_name)?;
        let vi = self
            .publisher
            .publish_volume(vi, vol_dir, tag, &raw_config)
            .await?;

        let entry = VolumeEntry {
            index: vi,
            config_blob,
        };
        self.add_or_update(entry.clone()).await?;
        Ok(entry)
    }

    /// The publisher bound to this catalog's blob store.
    pub fn publisher(&self) -> &VolumePublisher<S> {
        &self.publisher
    }

    /// The fetcher bound to this catalog's blob store.
    pub fn fetcher(&self) -> &VolumeFetcher<S> {
        &self.fetcher
    }
}

async fn load_or_new_collection(
    root: &Path,
    initial: Vec<VolumeEntry>,
) -> Result<VolumeCollection> {
    let path = root.join(COLLECTION_FILE);
    match tokio::fs::read(&path).await {
        Ok(data) => serde_json::from_slice(&data).map_err(|e| {
            VolError::Format(format!("failed to parse {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let coll = VolumeCollection::new(initial);
            save_collection(root, &coll)
                .await
                .map_err(|e| VolError::Other(format!("failed to save new collection: {}", e)))?;
            Ok(coll)
        }
        Err(e) => Err(VolError::Other(format!(
            "failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Persist the collection as pretty JSON via temp file + rename.
async fn save_collection(root: &Path, coll: &VolumeCollection) -> Result<()> {
    let path = root.join(COLLECTION_FILE);
    let data = serde_json::to_vec_pretty(coll)?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &data).await.map_err(|e| {
        VolError::Other(format!("failed to write tmp file {}: {}", tmp.display(), e))
    })?;
    tokio::fs::rename(&tmp, &path).await.map_err(|e| {
        VolError::Other(format!(
            "failed to rename {} -> {}: {}",
            tmp.display(),
            path.display(),
            e
        ))
    })?;

    tracing::debug!(version = coll.version, path = %path.display(), "collection persisted");
    Ok(())
}
