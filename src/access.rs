//! Volume data access - async API over the block store and region cache

use crate::cache::{CacheLookup, CacheStats, RegionCache};
use crate::config::StoreConfig;
use crate::error::{Result, VdsError};
use crate::grid::Grid;
use crate::metadata::DatasetMetadata;
use crate::pipeline::PipelineStage;
use crate::store::BlockStore;
use crate::types::{ValueRange, VoxelBox};
use futures::future::try_join_all;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// One region to fetch through [`VolumeDataAccess::read_regions`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRequest {
    pub var: String,
    pub timestep: usize,
    pub reflevel: usize,
    pub lod: usize,
    pub min: [usize; 3],
    pub max: [usize; 3],
}

impl RegionRequest {
    pub fn new(var: impl Into<String>, timestep: usize, min: [usize; 3], max: [usize; 3]) -> Self {
        Self {
            var: var.into(),
            timestep,
            reflevel: 0,
            lod: 0,
            min,
            max,
        }
    }

    /// Refinement level and LOD of the request
    pub fn at(mut self, reflevel: usize, lod: usize) -> Self {
        self.reflevel = reflevel;
        self.lod = lod;
        self
    }
}

/// Main interface for accessing a dataset from async code.
///
/// Blocking store and codec work runs on the tokio blocking pool. The
/// region cache is shared session state behind a mutex; it is held for
/// lookups, insertion and pipeline stages, not while stored regions are
/// decoded.
#[derive(Clone)]
pub struct VolumeDataAccess {
    store: BlockStore,
    cache: Arc<Mutex<RegionCache>>,
}

impl VolumeDataAccess {
    /// Open an existing dataset
    pub async fn open(root: impl Into<PathBuf>, config: StoreConfig) -> Result<Self> {
        let root = root.into();
        let store = blocking(move || BlockStore::open(root, config)).await?;
        Ok(Self::from_store(store))
    }

    /// Create a new dataset
    pub async fn create(root: impl Into<PathBuf>, metadata: DatasetMetadata, config: StoreConfig) -> Result<Self> {
        let root = root.into();
        let store = blocking(move || BlockStore::create(root, metadata, config)).await?;
        Ok(Self::from_store(store))
    }

    pub fn from_store(store: BlockStore) -> Self {
        let cache = RegionCache::new(store.clone());
        Self {
            store,
            cache: Arc::new(Mutex::new(cache)),
        }
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    /// Get the dataset description
    pub fn metadata(&self) -> DatasetMetadata {
        self.store.metadata().clone()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }

    pub fn last_error(&self) -> Option<String> {
        self.store.last_error()
    }

    /// Read one region through the cache
    pub async fn read_region(&self, request: RegionRequest) -> Result<Grid> {
        let cache = Arc::clone(&self.cache);
        blocking(move || {
            let mut guard = cache.lock();
            let lookup = guard.begin_read(
                request.timestep,
                &request.var,
                request.reflevel,
                request.lod,
                request.min,
                request.max,
                false,
            )?;
            match lookup {
                CacheLookup::Cached(handle) => {
                    let grid = guard.grid(handle)?.clone();
                    Ok(grid)
                }
                CacheLookup::Pending(pending) => {
                    drop(guard);
                    let grid = pending.load()?;
                    let out = grid.clone();
                    cache.lock().finish_read(pending, grid)?;
                    Ok(out)
                }
            }
        })
        .await
    }

    /// Read several regions; stored regions missing from the cache are
    /// decoded in parallel. Results follow request order.
    pub async fn read_regions(&self, requests: &[RegionRequest]) -> Result<Vec<Grid>> {
        let futures: Vec<_> = requests
            .iter()
            .cloned()
            .map(|request| self.read_region(request))
            .collect();
        let grids = try_join_all(futures).await?;
        debug!(count = grids.len(), "read regions");
        Ok(grids)
    }

    /// Write a region of a stored variable and drop cached grids that may
    /// depend on it
    pub async fn write_region(
        &self,
        var: impl Into<String>,
        timestep: usize,
        min: [usize; 3],
        max: [usize; 3],
        data: Vec<f32>,
    ) -> Result<()> {
        let var = var.into();
        let store = self.store.clone();
        let cache = Arc::clone(&self.cache);
        blocking(move || {
            let mut writer = store.open_writer(&var, timestep)?;
            writer.write_region(min, max, &data)?;
            writer.close()?;

            let mut cache = cache.lock();
            let derived: Vec<String> = cache
                .pipelines()
                .names()
                .iter()
                .filter_map(|name| cache.pipelines().stage(name))
                .flat_map(|stage| stage.outputs().into_iter().map(|(out, _)| out))
                .collect();
            cache.purge_variable(&var);
            for out in &derived {
                cache.purge_variable(out);
            }
            Ok(())
        })
        .await
    }

    pub async fn data_range(&self, var: impl Into<String>, timestep: usize) -> Result<Option<ValueRange>> {
        let var = var.into();
        let cache = Arc::clone(&self.cache);
        blocking(move || cache.lock().get_data_range(timestep, &var)).await
    }

    pub async fn valid_region(&self, var: impl Into<String>, timestep: usize, reflevel: usize) -> Result<Option<VoxelBox>> {
        let var = var.into();
        let cache = Arc::clone(&self.cache);
        blocking(move || cache.lock().get_valid_region(timestep, &var, reflevel)).await
    }

    /// Register a derived-variable stage with the shared cache
    pub fn new_pipeline(&self, stage: Arc<dyn PipelineStage>) -> Result<()> {
        self.cache.lock().new_pipeline(stage)
    }

    pub fn remove_pipeline(&self, name: &str) -> Result<()> {
        self.cache.lock().remove_pipeline(name)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VdsError::Worker(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::VariableDescriptor;
    use crate::types::VarType;
    use crate::wavelet::{BoundaryMode, WaveletFamily};
    use tempfile::TempDir;

    fn metadata() -> DatasetMetadata {
        DatasetMetadata::new([16, 16, 8], [8, 8, 8])
            .with_wavelet(WaveletFamily::Haar, BoundaryMode::Symh)
            .with_cratios(vec![1, 4])
            .with_variable(VariableDescriptor::new("p", VarType::Var3D))
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read_regions() {
        let dir = TempDir::new().unwrap();
        let vda = VolumeDataAccess::create(dir.path(), metadata(), StoreConfig::default().with_threads(2))
            .await
            .unwrap();
        let max = vda.store().max_reflevel();

        let data: Vec<f32> = (0..16 * 16 * 8).map(|i| (i % 7) as f32).collect();
        vda.write_region("p", 0, [0, 0, 0], [15, 15, 7], data.clone()).await.unwrap();

        let requests = vec![
            RegionRequest::new("p", 0, [0, 0, 0], [15, 15, 7]).at(max, 1),
            RegionRequest::new("p", 0, [0, 0, 0], [7, 7, 7]).at(max, 1),
        ];
        let grids = vda.read_regions(&requests).await.unwrap();
        assert_eq!(grids.len(), 2);
        assert_eq!(grids[0].dims(), [16, 16, 8]);
        for (a, b) in grids[0].to_vec().iter().zip(&data) {
            assert!((a - b).abs() < 1e-3);
        }
        assert_eq!(vda.data_range("p", 0).await.unwrap(), Some(ValueRange::new(0.0, 6.0)));
        assert!(vda.stats().hits + vda.stats().misses >= 2);
    }

    #[tokio::test]
    async fn test_errors_propagate() {
        let dir = TempDir::new().unwrap();
        let vda = VolumeDataAccess::create(dir.path(), metadata(), StoreConfig::default())
            .await
            .unwrap();
        let err = vda
            .read_region(RegionRequest::new("missing", 0, [0, 0, 0], [1, 1, 1]))
            .await
            .unwrap_err();
        assert!(matches!(err, VdsError::UnknownVariable(_)));
        assert!(vda.last_error().unwrap().contains("missing"));

        let reopened = VolumeDataAccess::open(dir.path(), StoreConfig::default()).await.unwrap();
        assert_eq!(reopened.metadata().dims, [16, 16, 8]);
    }
}
