//! Region cache: session-level LRU of grids over a block store, with
//! derived variables computed by registered pipeline stages

use crate::error::{ErrorRegister, Result, VdsError};
use crate::grid::Grid;
use crate::pipeline::{PipelineRegistry, PipelineStage};
use crate::quantize::{quantize_as, QuantizedData, Quantization};
use crate::store::BlockStore;
use crate::types::{ValueRange, VarType, VoxelBox};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Opaque reference to a cached grid. Handles are never reused, so a handle
/// to an evicted or purged grid fails cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridHandle(u64);

impl GridHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GridHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grid#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RegionKey {
    timestep: usize,
    var: String,
    reflevel: usize,
    lod: usize,
    region: VoxelBox,
}

impl RegionKey {
    fn same_instance(&self, other: &RegionKey) -> bool {
        self.timestep == other.timestep
            && self.var == other.var
            && self.reflevel == other.reflevel
            && self.lod == other.lod
    }
}

struct CacheEntry {
    key: RegionKey,
    grid: Grid,
    locks: usize,
    last_used: u64,
}

/// Outcome of [`RegionCache::begin_read`]
pub enum CacheLookup {
    /// Served from the cache or computed by a pipeline stage
    Cached(GridHandle),
    /// Must be decoded from the block store, then handed to
    /// [`RegionCache::finish_read`]
    Pending(PendingRead),
}

/// Store read of a region that missed the cache. Loading needs no access to
/// the cache, so it can run while other requests are served.
pub struct PendingRead {
    key: RegionKey,
    store: BlockStore,
    var_type: VarType,
    missing_value: Option<f32>,
    lock: bool,
}

impl PendingRead {
    pub fn var(&self) -> &str {
        &self.key.var
    }

    pub fn region(&self) -> VoxelBox {
        self.key.region
    }

    /// Decode the region from the block store
    pub fn load(&self) -> Result<Grid> {
        let key = &self.key;
        let result = self
            .store
            .open_reader(&key.var, key.timestep, key.reflevel, key.lod)
            .and_then(|mut reader| reader.read_region(key.region.min, key.region.max))
            .and_then(|data| Grid::new(self.var_type, key.region, data, self.missing_value));
        self.store.errors().track(result)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub backing_reads: u64,
    pub pipeline_runs: u64,
    pub entries: usize,
    pub memory_bytes: usize,
    pub budget_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Grid cache for one session.
///
/// Requests are answered from an exact cached region, from a cached
/// region containing the request, from a registered pipeline stage, or
/// from the block store, in that order. Entries are evicted least recently
/// used first when the memory budget would be exceeded; locked entries are
/// never evicted.
pub struct RegionCache {
    store: BlockStore,
    budget: usize,
    entries: HashMap<GridHandle, CacheEntry>,
    index: HashMap<RegionKey, GridHandle>,
    next_handle: u64,
    tick: u64,
    memory: usize,
    pipelines: PipelineRegistry,
    ranges: HashMap<(usize, String), Option<ValueRange>>,
    valid_regions: HashMap<(usize, String, usize), Option<VoxelBox>>,
    errors: ErrorRegister,
    hits: u64,
    misses: u64,
    evictions: u64,
    pipeline_runs: u64,
}

impl RegionCache {
    /// Cache over `store` with the budget from its configuration
    pub fn new(store: BlockStore) -> Self {
        let budget = store.config().cache_size_bytes();
        let errors = store.errors();
        Self {
            store,
            budget,
            entries: HashMap::new(),
            index: HashMap::new(),
            next_handle: 0,
            tick: 0,
            memory: 0,
            pipelines: PipelineRegistry::new(),
            ranges: HashMap::new(),
            valid_regions: HashMap::new(),
            errors,
            hits: 0,
            misses: 0,
            evictions: 0,
            pipeline_runs: 0,
        }
    }

    /// Override the memory budget
    pub fn with_budget_bytes(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_error(&self) -> Option<String> {
        self.errors.message()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            backing_reads: self.store.backing_reads(),
            pipeline_runs: self.pipeline_runs,
            entries: self.entries.len(),
            memory_bytes: self.memory,
            budget_bytes: self.budget,
        }
    }

    /// Fetch the region `min..=max` of a stored or derived variable and
    /// return a handle to it. With `lock` the grid stays resident until
    /// [`RegionCache::unlock_grid`].
    #[allow(clippy::too_many_arguments)]
    pub fn get_grid(
        &mut self,
        timestep: usize,
        var: &str,
        reflevel: usize,
        lod: usize,
        min: [usize; 3],
        max: [usize; 3],
        lock: bool,
    ) -> Result<GridHandle> {
        let result = self
            .request_key(timestep, var, reflevel, lod, min, max)
            .and_then(|key| self.fetch(key, lock));
        self.errors.track(result)
    }

    /// First half of a split fetch: answer from the cache or a pipeline
    /// stage, or describe the store read that is needed. A pending read is
    /// loaded by the caller and completed with [`RegionCache::finish_read`].
    #[allow(clippy::too_many_arguments)]
    pub fn begin_read(
        &mut self,
        timestep: usize,
        var: &str,
        reflevel: usize,
        lod: usize,
        min: [usize; 3],
        max: [usize; 3],
        lock: bool,
    ) -> Result<CacheLookup> {
        let result = self
            .request_key(timestep, var, reflevel, lod, min, max)
            .and_then(|key| self.lookup(key, lock));
        self.errors.track(result)
    }

    /// Cache a grid loaded for `pending`. When another request cached the
    /// same region in the meantime, that entry is returned instead.
    pub fn finish_read(&mut self, pending: PendingRead, grid: Grid) -> Result<GridHandle> {
        let result = self.complete(pending, grid);
        self.errors.track(result)
    }

    /// Grid behind a handle
    pub fn grid(&self, handle: GridHandle) -> Result<&Grid> {
        self.entries
            .get(&handle)
            .map(|e| &e.grid)
            .ok_or_else(|| VdsError::Cache(format!("{} is no longer cached", handle)))
    }

    /// Release one lock taken by `get_grid`
    pub fn unlock_grid(&mut self, handle: GridHandle) -> Result<()> {
        let result = match self.entries.get_mut(&handle) {
            Some(entry) => {
                entry.locks = entry.locks.saturating_sub(1);
                Ok(())
            }
            None => Err(VdsError::Cache(format!("{} is no longer cached", handle))),
        };
        self.errors.track(result)
    }

    /// Drop every cached grid and session value
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.memory = 0;
        self.ranges.clear();
        self.valid_regions.clear();
    }

    /// Drop every cached grid of `var`, locked or not
    pub fn purge_variable(&mut self, var: &str) {
        let handles: Vec<GridHandle> = self
            .entries
            .iter()
            .filter(|(_, e)| e.key.var == var)
            .map(|(h, _)| *h)
            .collect();
        for handle in handles {
            self.remove_entry(handle);
        }
        self.ranges.retain(|(_, v), _| v != var);
        self.valid_regions.retain(|(_, v, _), _| v != var);
    }

    /// Register a derived-variable stage, replacing any stage of the same
    /// name
    pub fn new_pipeline(&mut self, stage: Arc<dyn PipelineStage>) -> Result<()> {
        let result = self.new_pipeline_inner(stage);
        self.errors.track(result)
    }

    fn new_pipeline_inner(&mut self, stage: Arc<dyn PipelineStage>) -> Result<()> {
        let native = self.store.metadata().variable_names();
        let outputs = stage.outputs();
        let name = stage.name().to_string();
        if let Some(old) = self.pipelines.add(stage, &native)? {
            for (var, _) in old.outputs() {
                self.purge_variable(&var);
            }
        }
        for (var, _) in &outputs {
            self.purge_variable(var);
        }
        info!(stage = %name, outputs = outputs.len(), "registered pipeline stage");
        Ok(())
    }

    /// Unregister a stage and drop its cached outputs
    pub fn remove_pipeline(&mut self, name: &str) -> Result<()> {
        let result = self.pipelines.remove(name).map(|outputs| {
            for var in &outputs {
                self.purge_variable(var);
            }
            info!(stage = name, "removed pipeline stage");
        });
        self.errors.track(result)
    }

    /// Data range of a variable instance. Derived variables are estimated
    /// from the coarsest refinement level.
    pub fn get_data_range(&mut self, timestep: usize, var: &str) -> Result<Option<ValueRange>> {
        let key = (timestep, var.to_string());
        if let Some(range) = self.ranges.get(&key) {
            return Ok(*range);
        }
        let result = self.compute_data_range(timestep, var);
        let range = self.errors.track(result)?;
        self.ranges.insert(key, range);
        Ok(range)
    }

    fn compute_data_range(&mut self, timestep: usize, var: &str) -> Result<Option<ValueRange>> {
        if self.store.metadata().variable(var).is_some() {
            return Ok(self.store.variable_info(var, timestep)?.data_range);
        }
        let var_type = self.var_type(var)?;
        let full = self.store.layout_for_type(var_type)?.full_box(0)?;
        let key = self.request_key(timestep, var, 0, 0, full.min, full.max)?;
        let handle = self.fetch(key, false)?;
        Ok(self.grid(handle)?.value_range())
    }

    /// Valid region of a variable instance at `reflevel`. Derived variables
    /// are valid over the whole domain.
    pub fn get_valid_region(&mut self, timestep: usize, var: &str, reflevel: usize) -> Result<Option<VoxelBox>> {
        let key = (timestep, var.to_string(), reflevel);
        if let Some(region) = self.valid_regions.get(&key) {
            return Ok(*region);
        }
        let result = self.compute_valid_region(timestep, var, reflevel);
        let region = self.errors.track(result)?;
        self.valid_regions.insert(key, region);
        Ok(region)
    }

    fn compute_valid_region(&self, timestep: usize, var: &str, reflevel: usize) -> Result<Option<VoxelBox>> {
        let var_type = self.var_type(var)?;
        let layout = self.store.layout_for_type(var_type)?;
        let full = layout.full_box(reflevel)?;
        if self.store.metadata().variable(var).is_none() {
            return Ok(Some(full));
        }
        let info = self.store.variable_info(var, timestep)?;
        let ld = layout.max_reflevel() - reflevel;
        Ok(info.valid_region.map(|v| v.coarsen(ld)))
    }

    /// True when a stored variable's files exist, or when every input of a
    /// derived variable exists
    pub fn variable_exists(&self, timestep: usize, var: &str, reflevel: usize, lod: usize) -> bool {
        if self.store.metadata().variable(var).is_some() {
            return self.store.variable_exists(timestep, var, reflevel, lod);
        }
        match self.pipelines.stage_for_output(var) {
            Some(stage) => stage
                .inputs()
                .iter()
                .all(|input| self.variable_exists(timestep, input, reflevel, lod)),
            None => false,
        }
    }

    /// Region mapped linearly from `range` into unsigned integers.
    /// Missing voxels map to zero.
    #[allow(clippy::too_many_arguments)]
    pub fn get_grid_quantized(
        &mut self,
        timestep: usize,
        var: &str,
        reflevel: usize,
        lod: usize,
        min: [usize; 3],
        max: [usize; 3],
        range: ValueRange,
        width: Quantization,
    ) -> Result<QuantizedData> {
        let handle = self.get_grid(timestep, var, reflevel, lod, min, max, false)?;
        let result = self.grid(handle).and_then(|grid| {
            quantize_as(&grid.to_vec(), range, width, |v| grid.is_missing(v))
        });
        self.errors.track(result)
    }

    fn var_type(&self, var: &str) -> Result<VarType> {
        if let Some(desc) = self.store.metadata().variable(var) {
            return Ok(desc.var_type);
        }
        self.pipelines
            .output_type(var)
            .ok_or_else(|| VdsError::UnknownVariable(var.to_string()))
    }

    fn request_key(
        &self,
        timestep: usize,
        var: &str,
        reflevel: usize,
        lod: usize,
        min: [usize; 3],
        max: [usize; 3],
    ) -> Result<RegionKey> {
        let var_type = self.var_type(var)?;
        let metadata = self.store.metadata();
        if timestep >= metadata.num_timesteps {
            return Err(VdsError::OutOfBounds(format!(
                "timestep {} >= {}",
                timestep, metadata.num_timesteps
            )));
        }
        if lod >= metadata.num_lods() {
            return Err(VdsError::OutOfBounds(format!("LOD {} >= {}", lod, metadata.num_lods())));
        }
        let layout = self.store.layout_for_type(var_type)?;
        let region = layout.validate_region(min, max, reflevel)?;
        Ok(RegionKey {
            timestep,
            var: var.to_string(),
            reflevel,
            lod,
            region,
        })
    }

    fn fetch(&mut self, key: RegionKey, lock: bool) -> Result<GridHandle> {
        match self.lookup(key, lock)? {
            CacheLookup::Cached(handle) => Ok(handle),
            CacheLookup::Pending(pending) => {
                let grid = pending.load()?;
                self.complete(pending, grid)
            }
        }
    }

    fn lookup(&mut self, key: RegionKey, lock: bool) -> Result<CacheLookup> {
        if let Some(&handle) = self.index.get(&key) {
            self.hits += 1;
            self.touch(handle, lock);
            debug!(var = %key.var, region = %key.region, "cache hit");
            return Ok(CacheLookup::Cached(handle));
        }

        let superset = self
            .entries
            .iter()
            .filter(|(_, e)| e.key.same_instance(&key) && e.grid.contains(&key.region))
            .min_by_key(|(_, e)| e.grid.len())
            .map(|(h, e)| (*h, e.grid.subgrid(&key.region)));
        if let Some((source, sub)) = superset {
            self.hits += 1;
            self.touch(source, false);
            debug!(var = %key.var, region = %key.region, "cache hit in enclosing region");
            return self.insert(key, sub?, lock).map(CacheLookup::Cached);
        }

        self.misses += 1;
        if let Some(stage) = self.pipelines.stage_for_output(&key.var) {
            return self.run_pipeline(stage, key, lock).map(CacheLookup::Cached);
        }

        let desc = self.store.metadata().require_variable(&key.var)?;
        Ok(CacheLookup::Pending(PendingRead {
            var_type: desc.var_type,
            missing_value: desc.missing_value,
            store: self.store.clone(),
            key,
            lock,
        }))
    }

    fn complete(&mut self, pending: PendingRead, grid: Grid) -> Result<GridHandle> {
        if *grid.region() != pending.key.region {
            return Err(VdsError::Cache(format!(
                "grid covers {}, read was for {}",
                grid.region(),
                pending.key.region
            )));
        }
        if let Some(&handle) = self.index.get(&pending.key) {
            self.touch(handle, pending.lock);
            debug!(var = %pending.key.var, region = %pending.key.region, "region cached by a concurrent read");
            return Ok(handle);
        }
        debug!(var = %pending.key.var, region = %pending.key.region, "cache miss served from store");
        self.insert(pending.key, grid, pending.lock)
    }

    fn run_pipeline(&mut self, stage: Arc<dyn PipelineStage>, key: RegionKey, lock: bool) -> Result<GridHandle> {
        let outputs = stage.outputs();
        let out_type = self.var_type(&key.var)?;

        let mut locked = Vec::new();
        let computed = self
            .lock_inputs(stage.as_ref(), &key, out_type, &mut locked)
            .and_then(|()| self.calculate(stage.as_ref(), &key, out_type, &locked));
        for handle in &locked {
            self.release(*handle);
        }
        let grids = computed.map_err(|e| match e {
            VdsError::Pipeline(msg) => VdsError::Pipeline(msg),
            other => VdsError::Pipeline(format!("stage {} : {}", stage.name(), other)),
        })?;
        self.pipeline_runs += 1;
        debug!(stage = stage.name(), region = %key.region, "ran pipeline stage");

        let mut requested = None;
        let mut others = Vec::new();
        for ((name, _), grid) in outputs.into_iter().zip(grids) {
            let out_key = RegionKey {
                var: name,
                ..key.clone()
            };
            if out_key == key {
                requested = Some(grid);
            } else {
                others.push((out_key, grid));
            }
        }
        let grid = requested.ok_or_else(|| {
            VdsError::Pipeline(format!("stage {} did not produce {}", stage.name(), key.var))
        })?;

        // Held while siblings are inserted so they cannot evict it
        let handle = self.insert(key, grid, true)?;
        for (out_key, grid) in others {
            if self.index.contains_key(&out_key) {
                continue;
            }
            if let Err(e) = self.insert(out_key, grid, false) {
                debug!(error = %e, "sibling output not cached");
            }
        }
        if !lock {
            self.release(handle);
        }
        Ok(handle)
    }

    fn lock_inputs(
        &mut self,
        stage: &dyn PipelineStage,
        key: &RegionKey,
        out_type: VarType,
        locked: &mut Vec<GridHandle>,
    ) -> Result<()> {
        let volume = self
            .store
            .layout_for_type(VarType::Var3D)?
            .dims_at(key.reflevel)?;
        let mut min = out_type.unpack(key.region.min, 0);
        let mut max = out_type.unpack(key.region.max, 0);
        if let Some(axis) = out_type.unused_axis() {
            min[axis] = 0;
            max[axis] = volume[axis] - 1;
        }
        for input in stage.inputs() {
            let in_type = self.var_type(&input)?;
            let in_key = self.request_key(
                key.timestep,
                &input,
                key.reflevel,
                key.lod,
                in_type.pack(min, 0),
                in_type.pack(max, 0),
            )?;
            locked.push(self.fetch(in_key, true)?);
        }
        Ok(())
    }

    fn calculate(
        &self,
        stage: &dyn PipelineStage,
        key: &RegionKey,
        out_type: VarType,
        locked: &[GridHandle],
    ) -> Result<Vec<Grid>> {
        let inputs = locked
            .iter()
            .map(|h| self.grid(*h))
            .collect::<Result<Vec<&Grid>>>()?;
        let mut outputs: Vec<Grid> = stage
            .outputs()
            .iter()
            .map(|_| Grid::filled(out_type, key.region, 0.0))
            .collect();
        stage.calculate(&inputs, &mut outputs, key.timestep, key.reflevel, key.lod)?;
        if outputs.len() != stage.outputs().len() {
            return Err(VdsError::Pipeline(format!(
                "stage {} changed its output count",
                stage.name()
            )));
        }
        Ok(outputs)
    }

    fn touch(&mut self, handle: GridHandle, lock: bool) {
        self.tick += 1;
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.last_used = self.tick;
            if lock {
                entry.locks += 1;
            }
        }
    }

    fn release(&mut self, handle: GridHandle) {
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.locks = entry.locks.saturating_sub(1);
        }
    }

    fn insert(&mut self, key: RegionKey, grid: Grid, lock: bool) -> Result<GridHandle> {
        let size = grid.size_bytes();
        self.make_room(size)?;
        let handle = GridHandle(self.next_handle);
        self.next_handle += 1;
        self.tick += 1;
        self.memory += size;
        self.index.insert(key.clone(), handle);
        self.entries.insert(
            handle,
            CacheEntry {
                key,
                grid,
                locks: usize::from(lock),
                last_used: self.tick,
            },
        );
        Ok(handle)
    }

    fn make_room(&mut self, size: usize) -> Result<()> {
        if size > self.budget {
            return Err(VdsError::Cache(format!(
                "grid of {} bytes exceeds the cache budget of {} bytes",
                size, self.budget
            )));
        }
        while self.memory + size > self.budget {
            let victim = self
                .entries
                .iter()
                .filter(|(_, e)| e.locks == 0)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(h, _)| *h);
            match victim {
                Some(handle) => {
                    self.remove_entry(handle);
                    self.evictions += 1;
                }
                None => {
                    return Err(VdsError::Cache(format!(
                        "no unlocked grids left to evict for {} bytes",
                        size
                    )))
                }
            }
        }
        Ok(())
    }

    fn remove_entry(&mut self, handle: GridHandle) {
        if let Some(entry) = self.entries.remove(&handle) {
            self.memory -= entry.grid.size_bytes();
            if self.index.get(&entry.key) == Some(&handle) {
                self.index.remove(&entry.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::metadata::{DatasetMetadata, VariableDescriptor};
    use crate::pipeline::FnStage;
    use crate::wavelet::{BoundaryMode, WaveletFamily};
    use tempfile::TempDir;

    const DIMS: [usize; 3] = [16, 16, 16];

    fn setup(dir: &TempDir) -> BlockStore {
        let metadata = DatasetMetadata::new(DIMS, [8, 8, 8])
            .with_wavelet(WaveletFamily::Haar, BoundaryMode::Symh)
            .with_cratios(vec![1])
            .with_variable(VariableDescriptor::new("a", VarType::Var3D))
            .unwrap()
            .with_variable(VariableDescriptor::new("b", VarType::Var3D))
            .unwrap();
        let store = BlockStore::create(dir.path(), metadata, StoreConfig::default().with_threads(2)).unwrap();
        for (var, value) in [("a", 1.0f32), ("b", 2.0)] {
            let mut writer = store.open_writer(var, 0).unwrap();
            let data = vec![value; DIMS.iter().product()];
            writer.write_region([0, 0, 0], [15, 15, 15], &data).unwrap();
            writer.close().unwrap();
        }
        store
    }

    fn sum_stage() -> Arc<dyn PipelineStage> {
        Arc::new(FnStage::new(
            "sum",
            vec!["a".to_string(), "b".to_string()],
            vec![("s".to_string(), VarType::Var3D)],
            |inputs, outputs, _, _, _| {
                let sum = inputs[0].data() + inputs[1].data();
                outputs[0].data_mut().assign(&sum);
                Ok(())
            },
        ))
    }

    #[test]
    fn test_exact_and_superset_hits_skip_the_store() {
        let dir = TempDir::new().unwrap();
        let mut cache = RegionCache::new(setup(&dir));
        let max = cache.store().max_reflevel();

        let h = cache.get_grid(0, "a", max, 0, [0, 0, 0], [15, 15, 15], false).unwrap();
        assert_eq!(cache.stats().backing_reads, 1);
        assert_eq!(cache.grid(h).unwrap().get([3, 3, 3]), Some(1.0));

        let again = cache.get_grid(0, "a", max, 0, [0, 0, 0], [15, 15, 15], false).unwrap();
        assert_eq!(again, h);
        let sub = cache.get_grid(0, "a", max, 0, [2, 2, 2], [4, 5, 6], false).unwrap();
        assert_eq!(cache.grid(sub).unwrap().dims(), [3, 4, 5]);

        let stats = cache.stats();
        assert_eq!(stats.backing_reads, 1);
        assert_eq!((stats.hits, stats.misses), (2, 1));
    }

    #[test]
    fn test_eviction_spares_locked_grids() {
        let dir = TempDir::new().unwrap();
        let grid_bytes = 8 * 8 * 8 * 4;
        let mut cache = RegionCache::new(setup(&dir)).with_budget_bytes(2 * grid_bytes);
        let max = cache.store().max_reflevel();

        let locked = cache.get_grid(0, "a", max, 0, [0, 0, 0], [7, 7, 7], true).unwrap();
        let first = cache.get_grid(0, "a", max, 0, [8, 8, 8], [15, 15, 15], false).unwrap();
        let _second = cache.get_grid(0, "b", max, 0, [0, 0, 0], [7, 7, 7], false).unwrap();

        assert!(cache.grid(locked).is_ok());
        assert!(cache.grid(first).is_err());
        assert_eq!(cache.stats().evictions, 1);

        // Too large for the budget
        assert!(cache.get_grid(0, "a", max, 0, [0, 0, 0], [15, 15, 15], false).is_err());
        assert!(cache.last_error().unwrap().contains("budget"));

        cache.unlock_grid(locked).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().memory_bytes, 0);
    }

    #[test]
    fn test_enclosing_grid_stays_recent_when_it_serves_a_subregion() {
        let dir = TempDir::new().unwrap();
        let grid_bytes = 8 * 8 * 8 * 4;
        let mut cache = RegionCache::new(setup(&dir)).with_budget_bytes(3 * grid_bytes);
        let max = cache.store().max_reflevel();

        let enclosing = cache.get_grid(0, "a", max, 0, [0, 0, 0], [7, 7, 7], false).unwrap();
        let older = cache.get_grid(0, "b", max, 0, [0, 0, 0], [7, 7, 7], false).unwrap();
        let sub = cache.get_grid(0, "a", max, 0, [1, 1, 1], [2, 2, 2], false).unwrap();
        assert_eq!(cache.stats().backing_reads, 2);

        // Needs one full grid evicted; the enclosing one was used last
        cache.get_grid(0, "b", max, 0, [8, 8, 8], [15, 15, 15], false).unwrap();
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.grid(enclosing).is_ok());
        assert!(cache.grid(sub).is_ok());
        assert!(cache.grid(older).is_err());
    }

    #[test]
    fn test_split_read_runs_outside_the_cache() {
        let dir = TempDir::new().unwrap();
        let mut cache = RegionCache::new(setup(&dir));
        let max = cache.store().max_reflevel();

        let first = match cache.begin_read(0, "a", max, 0, [0, 0, 0], [7, 7, 7], false).unwrap() {
            CacheLookup::Pending(p) => p,
            CacheLookup::Cached(_) => panic!("empty cache answered a read"),
        };
        let twin = match cache.begin_read(0, "a", max, 0, [0, 0, 0], [7, 7, 7], false).unwrap() {
            CacheLookup::Pending(p) => p,
            CacheLookup::Cached(_) => panic!("read was cached before it finished"),
        };
        assert_eq!(first.var(), "a");
        assert_eq!(first.region(), VoxelBox::new([0, 0, 0], [7, 7, 7]).unwrap());

        // The cache keeps serving other requests while reads are pending
        let other = cache.get_grid(0, "b", max, 0, [8, 8, 8], [15, 15, 15], false).unwrap();
        assert_eq!(cache.grid(other).unwrap().get([9, 9, 9]), Some(2.0));

        let grid = first.load().unwrap();
        let twin_grid = twin.load().unwrap();
        let h = cache.finish_read(first, grid).unwrap();
        assert_eq!(cache.finish_read(twin, twin_grid).unwrap(), h);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.grid(h).unwrap().get([3, 3, 3]), Some(1.0));

        match cache.begin_read(0, "a", max, 0, [0, 0, 0], [7, 7, 7], false).unwrap() {
            CacheLookup::Cached(handle) => assert_eq!(handle, h),
            CacheLookup::Pending(_) => panic!("finished read was not cached"),
        }
        let stats = cache.stats();
        assert_eq!(stats.backing_reads, 3);
        assert_eq!((stats.hits, stats.misses), (1, 3));

        // A grid for some other region is refused
        let pending = match cache.begin_read(0, "b", max, 0, [0, 0, 0], [3, 3, 3], false).unwrap() {
            CacheLookup::Pending(p) => p,
            CacheLookup::Cached(_) => panic!("region was never read"),
        };
        let wrong = Grid::filled(VarType::Var3D, VoxelBox::new([0, 0, 0], [1, 1, 1]).unwrap(), 0.0);
        assert!(matches!(cache.finish_read(pending, wrong), Err(VdsError::Cache(_))));
    }

    #[test]
    fn test_pipeline_runs_once_and_caches_output() {
        let dir = TempDir::new().unwrap();
        let mut cache = RegionCache::new(setup(&dir));
        cache.new_pipeline(sum_stage()).unwrap();
        let max = cache.store().max_reflevel();

        let h = cache.get_grid(0, "s", max, 0, [0, 0, 0], [7, 7, 7], false).unwrap();
        assert_eq!(cache.grid(h).unwrap().get([1, 2, 3]), Some(3.0));
        cache.get_grid(0, "s", max, 0, [0, 0, 0], [7, 7, 7], false).unwrap();
        assert_eq!(cache.stats().pipeline_runs, 1);
        assert!(cache.variable_exists(0, "s", max, 0));
        assert!(!cache.variable_exists(1, "s", max, 0));
        assert_eq!(cache.get_valid_region(0, "s", max).unwrap().unwrap().max, [15, 15, 15]);

        cache.remove_pipeline("sum").unwrap();
        assert!(cache.grid(h).is_err());
        assert!(cache.get_grid(0, "s", max, 0, [0, 0, 0], [7, 7, 7], false).is_err());
    }

    #[test]
    fn test_pipeline_collisions_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut cache = RegionCache::new(setup(&dir));
        let clash = Arc::new(FnStage::new(
            "clash",
            vec!["a".to_string()],
            vec![("b".to_string(), VarType::Var3D)],
            |_, _, _, _, _| Ok(()),
        ));
        assert!(cache.new_pipeline(clash).is_err());
        assert!(cache.last_error().unwrap().contains("collides"));
    }

    #[test]
    fn test_quantized_region() {
        let dir = TempDir::new().unwrap();
        let mut cache = RegionCache::new(setup(&dir));
        let max = cache.store().max_reflevel();
        let q = cache
            .get_grid_quantized(0, "b", max, 0, [0, 0, 0], [1, 0, 0], ValueRange::new(0.0, 4.0), Quantization::U8)
            .unwrap();
        assert_eq!(q, QuantizedData::U8(vec![128, 128]));
        assert_eq!(cache.get_data_range(0, "b").unwrap(), Some(ValueRange::new(2.0, 2.0)));
    }
}
