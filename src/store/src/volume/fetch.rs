//! Volume restore from a blob store.
//!
//! Resolves a tag to its manifest, extracts each layer into the partition
//! directory named by its `org.example.partitionPath` annotation, and
//! regenerates `volume-index.json` in the destination. The parallel path
//! validates every annotation up front, then extracts on a bounded worker
//! pool with index-ordered results.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};

use volstow_core::error::{Result, VolError};
use volstow_core::volume::{Partition, VolumeIndex};

use crate::archive;
use crate::oci::{BlobStore, OciDescriptor, OciImageManifest, PARTITION_PATH_ANNOTATION};

/// Restores published volumes onto the filesystem.
pub struct VolumeFetcher<S> {
    store: Arc<S>,
}

impl<S: BlobStore + 'static> VolumeFetcher<S> {
    /// Create a fetcher over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Fetch the volume tagged `tag` into `dest`, one layer at a time.
    ///
    /// Returns the regenerated index, which is also written to
    /// `volume-index.json` inside `dest`.
    pub async fn fetch_volume(&self, dest: &Path, tag: &str) -> Result<VolumeIndex> {
        let (manifest_desc, manifest) = self.load_manifest(tag).await?;

        let mut vi = VolumeIndex {
            volume_ref: manifest_desc.digest.clone(),
            partitions: Vec::with_capacity(manifest.layers.len()),
            ..Default::default()
        };

        let mut seen = HashSet::new();
        for layer in &manifest.layers {
            let part_path = partition_path(layer)?;
            if !seen.insert(part_path.clone()) {
                return Err(VolError::Format(format!(
                    "duplicate partition path {:?}",
                    part_path
                )));
            }
            let partition =
                extract_layer(self.store.as_ref(), dest, layer, &part_path).await?;
            vi.partitions.push(partition);
        }

        vi.save_to_file(dest)?;
        Ok(vi)
    }

    /// Fetch the volume tagged `tag` into `dest` with up to `concurrency`
    /// extractions in flight.
    ///
    /// Passing 0 sizes the pool from the machine's parallelism. Layer
    /// annotations are validated before any extraction starts; the first
    /// extraction error cancels the remaining jobs, every in-flight job is
    /// joined, and that first error is returned. Partial extraction is not
    /// rolled back.
    pub async fn fetch_volume_parallel(
        &self,
        dest: &Path,
        tag: &str,
        concurrency: usize,
    ) -> Result<VolumeIndex> {
        let (manifest_desc, manifest) = self.load_manifest(tag).await?;
        let layer_count = manifest.layers.len();

        // Validation phase: every annotation is checked before anything
        // touches the destination.
        let mut seen = HashSet::with_capacity(layer_count);
        let mut jobs = Vec::with_capacity(layer_count);
        for (idx, layer) in manifest.layers.iter().enumerate() {
            let part_path = partition_path(layer)?;
            if !seen.insert(part_path.clone()) {
                return Err(VolError::Format(format!(
                    "duplicate partition path {:?}",
                    part_path
                )));
            }
            jobs.push((idx, layer.clone(), part_path));
        }

        let mut vi = VolumeIndex {
            volume_ref: manifest_desc.digest.clone(),
            partitions: vec![Partition::default(); layer_count],
            ..Default::default()
        };
        if layer_count == 0 {
            vi.save_to_file(dest)?;
            return Ok(vi);
        }

        let workers = effective_concurrency(concurrency, layer_count);
        tracing::debug!(tag, layers = layer_count, workers, "starting parallel fetch");

        let semaphore = Arc::new(Semaphore::new(workers));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let dest: PathBuf = dest.to_path_buf();

        let mut handles = Vec::with_capacity(layer_count);
        for (idx, layer, part_path) in jobs {
            let store = Arc::clone(&self.store);
            let dest = dest.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel_tx = cancel_tx.clone();
            let cancel_rx = cancel_rx.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return (
                            idx,
                            Some(Err(VolError::Other(format!("worker pool closed: {}", e)))),
                        )
                    }
                };

                // Observe cancellation before starting the job.
                if *cancel_rx.borrow() {
                    return (idx, None);
                }

                let result = extract_layer(store.as_ref(), &dest, &layer, &part_path).await;
                if result.is_err() {
                    let _ = cancel_tx.send(true);
                }
                (idx, Some(result))
            }));
        }

        // Drain every worker before reporting, so no task outlives the call.
        let mut first_err: Option<VolError> = None;
        for handle in handles {
            match handle.await {
                Ok((idx, Some(Ok(partition)))) => vi.partitions[idx] = partition,
                Ok((_, Some(Err(e)))) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Ok((_, None)) => {} // skipped after cancellation
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(VolError::Other(format!("layer task failed: {}", e)));
                    }
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        vi.save_to_file(&dest)?;
        Ok(vi)
    }

    async fn load_manifest(&self, tag: &str) -> Result<(OciDescriptor, OciImageManifest)> {
        let manifest_desc = self.store.resolve(tag).await.map_err(|e| {
            VolError::Storage(format!("failed to resolve reference {:?}: {}", tag, e))
        })?;
        let data = self
            .store
            .fetch(&manifest_desc)
            .await
            .map_err(|e| VolError::Storage(format!("failed to fetch manifest: {}", e)))?;
        let manifest: OciImageManifest = serde_json::from_slice(&data)
            .map_err(|e| VolError::Format(format!("failed to decode manifest: {}", e)))?;
        Ok((manifest_desc, manifest))
    }
}

/// Read the partition path annotation of a layer descriptor.
fn partition_path(layer: &OciDescriptor) -> Result<String> {
    layer
        .annotations
        .as_ref()
        .and_then(|a| a.get(PARTITION_PATH_ANNOTATION))
        .filter(|p| !p.is_empty())
        .cloned()
        .ok_or_else(|| {
            VolError::Format(format!(
                "missing partitionPath annotation for layer {}",
                layer.digest
            ))
        })
}

/// Fetch one layer and extract it under `dest`, returning its partition.
///
/// Entries inside the layer are already prefixed with the partition path,
/// so extraction targets `dest` itself; the partition directory is
/// created up front so even an empty layer restores it.
async fn extract_layer<S: BlobStore + ?Sized>(
    store: &S,
    dest: &Path,
    layer: &OciDescriptor,
    part_path: &str,
) -> Result<Partition> {
    let target = dest.join(part_path);
    tokio::fs::create_dir_all(&target).await.map_err(|e| {
        VolError::Other(format!("failed to create directory {}: {}", target.display(), e))
    })?;

    let data = store
        .fetch(layer)
        .await
        .map_err(|e| VolError::Storage(format!("fetch layer {}: {}", layer.digest, e)))?;
    archive::untar_gz(&data[..], dest)
        .map_err(|e| VolError::Other(format!("extract layer {}: {}", layer.digest, e)))?;

    Ok(Partition {
        name: part_path.to_string(),
        path: part_path.to_string(),
        manifest_ref: layer.digest.clone(),
        ..Default::default()
    })
}

/// Worker pool size: `min(requested, jobs)`, with 0 meaning the machine's
/// available parallelism.
fn effective_concurrency(requested: usize, jobs: usize) -> usize {
    let cap = if requested == 0 {
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    } else {
        requested
    };
    cap.min(jobs).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::layout::OciLayout;
    use crate::oci::{
        BlobStore, IMAGE_CONFIG_MEDIA_TYPE, IMAGE_LAYER_GZIP_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE,
    };
    use crate::scan::generate_volume_index;
    use crate::volume::publish::VolumePublisher;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;
    use volstow_core::volume::VOLUME_INDEX_FILE;

    async fn published_volume(tmp: &TempDir, tag: &str) -> Arc<OciLayout> {
        let vol = tmp.path().join("vol");
        fs::create_dir_all(vol.join("a")).unwrap();
        fs::create_dir_all(vol.join("b/nested")).unwrap();
        fs::write(vol.join("a/one.txt"), "one").unwrap();
        fs::write(vol.join("b/two.txt"), "two").unwrap();
        fs::write(vol.join("b/nested/three.txt"), "three").unwrap();

        let store = Arc::new(OciLayout::open(tmp.path().join("repo")).await.unwrap());
        let publisher = VolumePublisher::new(Arc::clone(&store));
        let vi = generate_volume_index(&vol, "demo").unwrap();
        publisher.publish_volume(vi, &vol, tag, b"{}").await.unwrap();
        store
    }

    fn assert_restored(dest: &Path) {
        assert_eq!(
            fs::read_to_string(dest.join("vol/a/one.txt")).unwrap(),
            "one"
        );
        assert_eq!(
            fs::read_to_string(dest.join("vol/b/two.txt")).unwrap(),
            "two"
        );
        assert_eq!(
            fs::read_to_string(dest.join("vol/b/nested/three.txt")).unwrap(),
            "three"
        );
    }

    #[tokio::test]
    async fn test_fetch_sequential_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = published_volume(&tmp, "test.v1.0.0").await;

        let dest = tmp.path().join("restored");
        let fetcher = VolumeFetcher::new(store);
        let vi = fetcher.fetch_volume(&dest, "test.v1.0.0").await.unwrap();

        assert_restored(&dest);
        assert!(vi.volume_ref.starts_with("sha256:"));
        // One partition per manifest layer: a, b, b/nested.
        assert_eq!(vi.partitions.len(), 3);
        assert!(vi.partitions.iter().all(|p| p.manifest_ref.starts_with("sha256:")));

        // The regenerated index document lands in the destination.
        let on_disk: VolumeIndex = serde_json::from_slice(
            &fs::read(dest.join(VOLUME_INDEX_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk, vi);
    }

    #[tokio::test]
    async fn test_fetch_parallel_matches_sequential() {
        let tmp = TempDir::new().unwrap();
        let store = published_volume(&tmp, "test.v1.0.0").await;
        let fetcher = VolumeFetcher::new(store);

        let seq_dest = tmp.path().join("seq");
        let par_dest = tmp.path().join("par");
        let seq = fetcher.fetch_volume(&seq_dest, "test.v1.0.0").await.unwrap();
        let par = fetcher
            .fetch_volume_parallel(&par_dest, "test.v1.0.0", 2)
            .await
            .unwrap();

        assert_restored(&par_dest);
        assert_eq!(seq.volume_ref, par.volume_ref);
        // Output order is deterministic regardless of completion order.
        assert_eq!(seq.partitions, par.partitions);
    }

    #[tokio::test]
    async fn test_fetch_parallel_default_concurrency() {
        let tmp = TempDir::new().unwrap();
        let store = published_volume(&tmp, "test.v1.0.0").await;
        let fetcher = VolumeFetcher::new(store);

        let dest = tmp.path().join("restored");
        fetcher
            .fetch_volume_parallel(&dest, "test.v1.0.0", 0)
            .await
            .unwrap();
        assert_restored(&dest);
    }

    #[tokio::test]
    async fn test_fetch_unknown_tag() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(OciLayout::open(tmp.path().join("repo")).await.unwrap());
        let fetcher = VolumeFetcher::new(store);

        let err = fetcher
            .fetch_volume(&tmp.path().join("dest"), "missing.v1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing.v1"));
    }

    async fn tag_manifest_with_layers(
        store: &OciLayout,
        layers: Vec<OciDescriptor>,
        tag: &str,
    ) {
        let config = b"{}".to_vec();
        let config_desc = OciDescriptor {
            media_type: IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            digest: archive::digest(&config),
            size: config.len() as i64,
            ..Default::default()
        };
        store.push(&config_desc, config).await.unwrap();
        let manifest_desc = store
            .pack_manifest(&config_desc, layers, BTreeMap::new())
            .await
            .unwrap();
        store.tag(&manifest_desc, tag).await.unwrap();
    }

    fn gzip_layer(content: &[(&str, &str)]) -> (Vec<u8>, OciDescriptor) {
        let src = TempDir::new().unwrap();
        for (name, body) in content {
            fs::write(src.path().join(name), body).unwrap();
        }
        let data = archive::tar_gz_dir(src.path(), "part").unwrap();
        let desc = OciDescriptor {
            media_type: IMAGE_LAYER_GZIP_MEDIA_TYPE.to_string(),
            digest: archive::digest(&data),
            size: data.len() as i64,
            ..Default::default()
        };
        (data, desc)
    }

    #[tokio::test]
    async fn test_fetch_fails_on_missing_annotation_before_extraction() {
        let tmp = TempDir::new().unwrap();
        let store = OciLayout::open(tmp.path().join("repo")).await.unwrap();

        // A layer without the partition path annotation.
        let (data, desc) = gzip_layer(&[("file.txt", "data")]);
        store.push(&desc, data).await.unwrap();
        tag_manifest_with_layers(&store, vec![desc], "broken.v1").await;

        let dest = tmp.path().join("dest");
        let fetcher = VolumeFetcher::new(Arc::new(store));

        let err = fetcher
            .fetch_volume_parallel(&dest, "broken.v1", 2)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing partitionPath annotation"));
        // Validation failed before anything was extracted.
        assert!(!dest.exists());

        let err = fetcher.fetch_volume(&dest, "broken.v1").await.unwrap_err();
        assert!(err.to_string().contains("missing partitionPath annotation"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_fetch_fails_on_duplicate_partition_path() {
        let tmp = TempDir::new().unwrap();
        let store = OciLayout::open(tmp.path().join("repo")).await.unwrap();

        let (data_a, mut desc_a) = gzip_layer(&[("a.txt", "a")]);
        let (data_b, mut desc_b) = gzip_layer(&[("b.txt", "b")]);
        let mut annotations = BTreeMap::new();
        annotations.insert(PARTITION_PATH_ANNOTATION.to_string(), "root/dup".to_string());
        desc_a.annotations = Some(annotations.clone().into_iter().collect());
        desc_b.annotations = Some(annotations.into_iter().collect());
        store.push(&desc_a, data_a).await.unwrap();
        store.push(&desc_b, data_b).await.unwrap();
        tag_manifest_with_layers(&store, vec![desc_a, desc_b], "dup.v1").await;

        let dest = tmp.path().join("dest");
        let fetcher = VolumeFetcher::new(Arc::new(store));

        let err = fetcher
            .fetch_volume_parallel(&dest, "dup.v1", 0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate partition path"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_fetch_parallel_surfaces_first_error() {
        let tmp = TempDir::new().unwrap();
        let store = OciLayout::open(tmp.path().join("repo")).await.unwrap();

        // Two good layers and one whose blob is missing from the store.
        let (data_a, desc_a) = gzip_layer(&[("a.txt", "a")]);
        let desc_a = annotated(desc_a, "root/a");
        let (data_b, desc_b) = gzip_layer(&[("b.txt", "b")]);
        let desc_b = annotated(desc_b, "root/b");
        let (_, missing) = gzip_layer(&[("c.txt", "c")]);
        let missing = annotated(missing, "root/c");
        store.push(&desc_a, data_a).await.unwrap();
        store.push(&desc_b, data_b).await.unwrap();
        tag_manifest_with_layers(&store, vec![desc_a, desc_b, missing.clone()], "partial.v1")
            .await;

        let dest = tmp.path().join("dest");
        let fetcher = VolumeFetcher::new(Arc::new(store));

        let err = fetcher
            .fetch_volume_parallel(&dest, "partial.v1", 2)
            .await
            .unwrap_err();
        assert!(err.to_string().contains(&missing.digest));
    }

    fn annotated(mut desc: OciDescriptor, part_path: &str) -> OciDescriptor {
        let mut annotations = BTreeMap::new();
        annotations.insert(PARTITION_PATH_ANNOTATION.to_string(), part_path.to_string());
        desc.annotations = Some(annotations.into_iter().collect());
        desc
    }

    #[test]
    fn test_effective_concurrency() {
        assert_eq!(effective_concurrency(4, 2), 2);
        assert_eq!(effective_concurrency(2, 8), 2);
        assert_eq!(effective_concurrency(1, 1), 1);
        let defaulted = effective_concurrency(0, 3);
        assert!(defaulted >= 1 && defaulted <= 3);
    }
}
