//! Block store: maps (timestep, variable, refinement level, LOD, block) to
//! persisted coefficient records

use crate::collective::{Collective, SingleProcess};
use crate::compression::BlockCompressor;
use crate::config::StoreConfig;
use crate::error::{ErrorRegister, Result, VdsError};
use crate::io::{LodFile, LodFileHeader, LOD_FORMAT_VERSION};
use crate::layout::VolumeLayout;
use crate::mask::BlockMask;
use crate::metadata::{lod_file_path, DatasetMetadata, VariableDescriptor, VariableInfo};
use crate::pool::BlockPool;
use crate::reader::VariableReader;
use crate::types::VarType;
use crate::writer::VariableWriter;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// State shared by a store and every reader and writer it hands out
pub(crate) struct StoreShared {
    pub(crate) root: PathBuf,
    pub(crate) metadata: DatasetMetadata,
    pub(crate) config: StoreConfig,
    pub(crate) pool: BlockPool,
    pub(crate) collective: Arc<dyn Collective>,
    pub(crate) writers: Mutex<HashSet<String>>,
    pub(crate) errors: ErrorRegister,
    pub(crate) reads: AtomicU64,
    pub(crate) levels: usize,
}

impl StoreShared {
    pub(crate) fn descriptor(&self, var: &str) -> Result<VariableDescriptor> {
        self.metadata.require_variable(var).cloned()
    }

    pub(crate) fn compressor(&self, var_type: VarType) -> Result<BlockCompressor> {
        let md = &self.metadata;
        let cap = if var_type.is_3d() { None } else { Some(self.levels) };
        BlockCompressor::new(
            var_type.pack(md.block_size, 1),
            md.wavelet,
            md.boundary_mode,
            &md.cratios_for(var_type),
            cap,
        )
    }

    pub(crate) fn layout(&self, var_type: VarType) -> Result<VolumeLayout> {
        VolumeLayout::for_variable(self.metadata.dims, self.metadata.block_size, var_type, self.levels)
    }

    pub(crate) fn lod_path(&self, var: &str, timestep: usize, lod: usize) -> PathBuf {
        lod_file_path(&self.root, var, timestep, lod)
    }

    pub(crate) fn check_timestep(&self, timestep: usize) -> Result<()> {
        if timestep >= self.metadata.num_timesteps {
            return Err(VdsError::OutOfBounds(format!(
                "timestep {} >= {}",
                timestep, self.metadata.num_timesteps
            )));
        }
        Ok(())
    }

    /// Headers every LOD file of a variable must carry
    pub(crate) fn expected_headers(
        &self,
        descriptor: &VariableDescriptor,
        compressor: &BlockCompressor,
        layout: &VolumeLayout,
    ) -> Vec<LodFileHeader> {
        let nlods = compressor.num_lods();
        let sizes = compressor.sigmap_sizes();
        let u32x3 = |v: [usize; 3]| v.map(|x| x as u32);
        (0..nlods)
            .map(|lod| {
                let map_stored = lod + 1 < nlods || compressor.final_map_stored();
                let mask_len = if lod == 0 && descriptor.missing_value.is_some() {
                    BlockMask::byte_len(layout.block_voxels())
                } else {
                    0
                };
                LodFileHeader {
                    version: LOD_FORMAT_VERSION,
                    lod: lod as u32,
                    cratio: compressor.cratios()[lod] as u32,
                    wavelet: compressor.wavelet(),
                    boundary_mode: compressor.boundary_mode(),
                    var_type: descriptor.var_type,
                    block_size: u32x3(layout.block_size()),
                    dims: u32x3(layout.dims()),
                    blocks: u32x3(layout.blocks_per_axis()),
                    num_coeffs: compressor.lod_coeff_counts()[lod] as u32,
                    sigmap_len: sizes[lod] as u32,
                    mask_len: mask_len as u32,
                    map_stored,
                    has_range: false,
                    data_min: 0.0,
                    data_max: 0.0,
                    has_valid_region: false,
                    valid_min: [0; 3],
                    valid_max: [0; 3],
                }
            })
            .collect()
    }

    pub(crate) fn count_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Claim the single write slot of a variable
    pub(crate) fn claim_writer(&self, var: &str) -> Result<()> {
        if !self.writers.lock().insert(var.to_string()) {
            return Err(VdsError::AlreadyOpen(var.to_string()));
        }
        Ok(())
    }

    pub(crate) fn release_writer(&self, var: &str) {
        self.writers.lock().remove(var);
    }
}

/// Handle to a dataset on disk. Cloning shares the writer registry, the
/// error register and the backing-read counter.
#[derive(Clone)]
pub struct BlockStore {
    shared: Arc<StoreShared>,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("root", &self.shared.root)
            .field("levels", &self.shared.levels)
            .finish()
    }
}

impl BlockStore {
    /// Write `metadata.json` under `root` and open the new dataset
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub fn create(root: impl AsRef<Path>, metadata: DatasetMetadata, config: StoreConfig) -> Result<Self> {
        let store = Self::with_metadata(root.as_ref(), metadata, config)?;
        store.shared.metadata.save(root.as_ref())?;
        Ok(store)
    }

    /// Open an existing dataset
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub fn open(root: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let metadata = DatasetMetadata::load(root.as_ref())?;
        Self::with_metadata(root.as_ref(), metadata, config)
    }

    fn with_metadata(root: &Path, metadata: DatasetMetadata, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        metadata.validate()?;
        let probe = BlockCompressor::new(
            metadata.block_size,
            metadata.wavelet,
            metadata.boundary_mode,
            &metadata.cratios,
            None,
        )?;
        let levels = probe.num_levels();
        if probe.num_transforms() == 0 {
            warn!(
                wavelet = %metadata.wavelet,
                mode = %metadata.boundary_mode,
                "boundary mode does not match wavelet symmetry"
            );
        }
        let shared = StoreShared {
            root: root.to_path_buf(),
            pool: BlockPool::new(config.num_threads),
            metadata,
            config,
            collective: Arc::new(SingleProcess),
            writers: Mutex::new(HashSet::new()),
            errors: ErrorRegister::new(),
            reads: AtomicU64::new(0),
            levels,
        };
        // Every variable type must accept the ratio schedule
        for var in &shared.metadata.variables {
            shared.compressor(var.var_type)?;
        }
        info!(
            root = %shared.root.display(),
            levels,
            variables = shared.metadata.variables.len(),
            "opened dataset"
        );
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Use `collective` for close-time reductions. Must be called before
    /// any handle is shared.
    pub fn with_collective(self, collective: Arc<dyn Collective>) -> Result<Self> {
        match Arc::try_unwrap(self.shared) {
            Ok(mut shared) => {
                shared.collective = collective;
                Ok(Self {
                    shared: Arc::new(shared),
                })
            }
            Err(shared) => Err(VdsError::Configuration(format!(
                "store at {} already shared",
                shared.root.display()
            ))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn metadata(&self) -> &DatasetMetadata {
        &self.shared.metadata
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Highest refinement level (native resolution)
    pub fn max_reflevel(&self) -> usize {
        self.shared.levels
    }

    pub fn num_lods(&self) -> usize {
        self.shared.metadata.num_lods()
    }

    /// Register shared with caches layered over this store
    pub fn errors(&self) -> ErrorRegister {
        self.shared.errors.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.errors.message()
    }

    /// Number of region reads served from disk
    pub fn backing_reads(&self) -> u64 {
        self.shared.reads.load(Ordering::Relaxed)
    }

    pub fn layout(&self, var: &str) -> Result<VolumeLayout> {
        let shared = &self.shared;
        shared
            .errors
            .track(shared.descriptor(var).and_then(|d| shared.layout(d.var_type)))
    }

    /// Layout of any variable of `var_type`, declared or not
    pub fn layout_for_type(&self, var_type: VarType) -> Result<VolumeLayout> {
        self.shared.layout(var_type)
    }

    pub fn compressor(&self, var: &str) -> Result<BlockCompressor> {
        let shared = &self.shared;
        shared
            .errors
            .track(shared.descriptor(var).and_then(|d| shared.compressor(d.var_type)))
    }

    /// Open a variable instance for writing; only one writer per variable
    /// may be open at a time.
    pub fn open_writer(&self, var: &str, timestep: usize) -> Result<VariableWriter> {
        self.shared
            .errors
            .track(VariableWriter::open(self.shared.clone(), var, timestep))
    }

    /// Open a variable instance for reading at a refinement level and LOD
    pub fn open_reader(&self, var: &str, timestep: usize, reflevel: usize, lod: usize) -> Result<VariableReader> {
        self.shared
            .errors
            .track(VariableReader::open(self.shared.clone(), var, timestep, reflevel, lod))
    }

    /// True when LOD files `0..=lod` exist and the levels are in range
    pub fn variable_exists(&self, timestep: usize, var: &str, reflevel: usize, lod: usize) -> bool {
        let shared = &self.shared;
        if shared.metadata.variable(var).is_none()
            || timestep >= shared.metadata.num_timesteps
            || reflevel > shared.levels
            || lod >= shared.metadata.num_lods()
        {
            return false;
        }
        (0..=lod).all(|l| shared.lod_path(var, timestep, l).exists())
    }

    /// Range, valid region and LOD count recorded for a variable instance
    pub fn variable_info(&self, var: &str, timestep: usize) -> Result<VariableInfo> {
        self.shared.errors.track(self.variable_info_inner(var, timestep))
    }

    fn variable_info_inner(&self, var: &str, timestep: usize) -> Result<VariableInfo> {
        let shared = &self.shared;
        let descriptor = shared.descriptor(var)?;
        shared.check_timestep(timestep)?;
        let num_lods = (0..shared.metadata.num_lods())
            .take_while(|&l| shared.lod_path(var, timestep, l).exists())
            .count();
        let (data_range, valid_region) = if num_lods > 0 {
            let file = LodFile::open(shared.lod_path(var, timestep, 0), false)?;
            (file.header().data_range(), file.header().valid_region())
        } else {
            (None, None)
        };
        Ok(VariableInfo {
            name: descriptor.name,
            var_type: descriptor.var_type,
            timestep,
            missing_value: descriptor.missing_value,
            data_range,
            valid_region,
            num_lods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::VariableDescriptor;
    use crate::wavelet::{BoundaryMode, WaveletFamily};
    use tempfile::TempDir;

    fn create_store(dir: &TempDir) -> BlockStore {
        let metadata = DatasetMetadata::new([40, 24, 16], [16, 16, 16])
            .with_wavelet(WaveletFamily::Haar, BoundaryMode::Symh)
            .with_cratios(vec![1, 8])
            .with_timesteps(2)
            .with_variable(VariableDescriptor::new("t", VarType::Var3D))
            .unwrap()
            .with_variable(VariableDescriptor::new("h", VarType::Var2DXY))
            .unwrap();
        BlockStore::create(dir.path(), metadata, StoreConfig::default().with_threads(2)).unwrap()
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);
        assert_eq!(store.max_reflevel(), 4);
        assert_eq!(store.num_lods(), 2);
        assert_eq!(store.layout("h").unwrap().dims(), [40, 24, 1]);

        let reopened = BlockStore::open(dir.path(), StoreConfig::default()).unwrap();
        assert_eq!(reopened.metadata().dims, [40, 24, 16]);
        assert_eq!(reopened.compressor("h").unwrap().num_levels(), 4);
    }

    #[test]
    fn test_rejects_impossible_schedule() {
        let dir = TempDir::new().unwrap();
        let metadata = DatasetMetadata::new([32, 32, 32], [32, 32, 32])
            .with_wavelet(WaveletFamily::Bior44, BoundaryMode::Symw)
            .with_cratios(vec![1, 100])
            .with_variable(VariableDescriptor::new("t", VarType::Var3D))
            .unwrap();
        let err = BlockStore::create(dir.path(), metadata, StoreConfig::default()).unwrap_err();
        assert_eq!(err.code(), -1);
    }

    #[test]
    fn test_unknown_variable_is_recorded() {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);
        assert!(store.open_reader("nope", 0, 0, 0).is_err());
        assert!(store.last_error().unwrap().contains("nope"));
        assert!(!store.variable_exists(0, "t", 0, 0));
        assert!(store.variable_info("t", 5).is_err());
    }

    #[test]
    fn test_single_writer_per_variable() {
        let dir = TempDir::new().unwrap();
        let store = create_store(&dir);
        let writer = store.open_writer("t", 0).unwrap();
        let second = store.open_writer("t", 1);
        assert!(matches!(second, Err(VdsError::AlreadyOpen(_))));
        assert!(store.open_writer("h", 0).is_ok());
        writer.close().unwrap();
        assert!(store.open_writer("t", 1).is_ok());
    }
}
