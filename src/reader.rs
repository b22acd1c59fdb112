//! Read path of the block store

use crate::compression::BlockCompressor;
use crate::error::{Result, VdsError};
use crate::io::{BlockRecord, LodFile};
use crate::layout::VolumeLayout;
use crate::mask::BlockMask;
use crate::metadata::VariableDescriptor;
use crate::sigmap::SignificanceMap;
use crate::store::StoreShared;
use crate::types::{ValueRange, VoxelBox};
use crate::wavelet::Scratch;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Reconstructed block at the reader's refinement level
pub(crate) struct DecodedBlock {
    pub(crate) values: Vec<f32>,
    pub(crate) mask: Option<BlockMask>,
}

/// Open-for-read handle of one variable instance at a fixed refinement
/// level and LOD
pub struct VariableReader {
    shared: Arc<StoreShared>,
    descriptor: VariableDescriptor,
    timestep: usize,
    reflevel: usize,
    lod: usize,
    layout: VolumeLayout,
    compressor: BlockCompressor,
    files: Vec<LodFile>,
    range: Option<ValueRange>,
    valid: Option<VoxelBox>,
    slab: Vec<f32>,
    slab_start: usize,
    next_slice: usize,
}

impl std::fmt::Debug for VariableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableReader")
            .field("variable", &self.descriptor.name)
            .field("timestep", &self.timestep)
            .field("reflevel", &self.reflevel)
            .field("lod", &self.lod)
            .finish_non_exhaustive()
    }
}

impl VariableReader {
    pub(crate) fn open(
        shared: Arc<StoreShared>,
        var: &str,
        timestep: usize,
        reflevel: usize,
        lod: usize,
    ) -> Result<Self> {
        let descriptor = shared.descriptor(var)?;
        shared.check_timestep(timestep)?;
        if reflevel > shared.levels {
            return Err(VdsError::OutOfBounds(format!(
                "refinement level {} > {}",
                reflevel, shared.levels
            )));
        }
        if lod >= shared.metadata.num_lods() {
            return Err(VdsError::OutOfBounds(format!(
                "LOD {} >= {}",
                lod,
                shared.metadata.num_lods()
            )));
        }
        let compressor = shared.compressor(descriptor.var_type)?;
        let layout = shared.layout(descriptor.var_type)?;
        let expected = shared.expected_headers(&descriptor, &compressor, &layout);

        let mut files = Vec::with_capacity(lod + 1);
        for (l, header) in expected.iter().enumerate().take(lod + 1) {
            let file = LodFile::open(shared.lod_path(var, timestep, l), false)?;
            if !file.header().same_layout(header) {
                return Err(VdsError::Mismatch(format!(
                    "{} does not match dataset description",
                    file.path().display()
                )));
            }
            files.push(file);
        }
        let range = files[0].header().data_range();
        let valid = files[0].header().valid_region();
        debug!(var, timestep, reflevel, lod, "opened variable for reading");
        Ok(Self {
            shared,
            descriptor,
            timestep,
            reflevel,
            lod,
            layout,
            compressor,
            files,
            range,
            valid,
            slab: Vec::new(),
            slab_start: 0,
            next_slice: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn timestep(&self) -> usize {
        self.timestep
    }

    pub fn reflevel(&self) -> usize {
        self.reflevel
    }

    pub fn lod(&self) -> usize {
        self.lod
    }

    pub fn layout(&self) -> &VolumeLayout {
        &self.layout
    }

    /// Dimensions at the opened refinement level
    pub fn dims(&self) -> Result<[usize; 3]> {
        self.layout.dims_at(self.reflevel)
    }

    /// Recorded scalar range, `None` if nothing valid was written
    pub fn data_range(&self) -> Option<ValueRange> {
        self.range
    }

    /// Recorded valid region at `reflevel`
    pub fn valid_region(&self, reflevel: usize) -> Result<Option<VoxelBox>> {
        let ld = self
            .layout
            .max_reflevel()
            .checked_sub(reflevel)
            .ok_or_else(|| VdsError::OutOfBounds(format!("refinement level {}", reflevel)))?;
        Ok(self.valid.map(|v| v.coarsen(ld)))
    }

    fn fill_value(&self) -> f32 {
        self.descriptor.missing_value.unwrap_or(0.0)
    }

    /// Read a region (inclusive bounds) at the opened refinement level into
    /// an x-fastest buffer
    #[instrument(skip(self), fields(var = %self.descriptor.name, ts = self.timestep, reflevel = self.reflevel, lod = self.lod))]
    pub fn read_region(&mut self, min: [usize; 3], max: [usize; 3]) -> Result<Vec<f32>> {
        let result = self.read_region_inner(min, max);
        self.shared.errors.track(result)
    }

    fn read_region_inner(&mut self, min: [usize; 3], max: [usize; 3]) -> Result<Vec<f32>> {
        let region = self.layout.validate_region(min, max, self.reflevel)?;
        let blocks = self.layout.blocks_for_region(&region, self.reflevel)?;
        self.read_box(region, &blocks)
    }

    /// Read whole blocks `bmin..=bmax` at the opened refinement level.
    /// Voxels past the volume edge hold the fill value.
    #[instrument(skip(self), fields(var = %self.descriptor.name, ts = self.timestep))]
    pub fn block_read_region(&mut self, bmin: [usize; 3], bmax: [usize; 3]) -> Result<Vec<f32>> {
        let result = self.block_read_region_inner(bmin, bmax);
        self.shared.errors.track(result)
    }

    fn block_read_region_inner(&mut self, bmin: [usize; 3], bmax: [usize; 3]) -> Result<Vec<f32>> {
        let blocks = self.layout.validate_block_region(bmin, bmax)?;
        let first = self.layout.block_box(blocks.min, self.reflevel)?;
        let last = self.layout.block_box(blocks.max, self.reflevel)?;
        self.read_box(first.union(&last), &blocks)
    }

    /// Next z-slice at the opened refinement level; `None` past the end
    pub fn read_slice(&mut self) -> Result<Option<Vec<f32>>> {
        let result = self.read_slice_inner();
        self.shared.errors.track(result)
    }

    fn read_slice_inner(&mut self) -> Result<Option<Vec<f32>>> {
        let dims = self.dims()?;
        if self.next_slice >= dims[2] {
            return Ok(None);
        }
        let plane = dims[0] * dims[1];
        let bz = self.layout.block_size_at(self.reflevel)?[2];
        if self.next_slice % bz == 0 || self.slab.is_empty() {
            let last = (self.next_slice - self.next_slice % bz + bz - 1).min(dims[2] - 1);
            self.slab_start = self.next_slice;
            self.slab = self.read_region_inner(
                [0, 0, self.next_slice],
                [dims[0] - 1, dims[1] - 1, last],
            )?;
        }
        let offset = (self.next_slice - self.slab_start) * plane;
        let slice = self.slab[offset..offset + plane].to_vec();
        self.next_slice += 1;
        Ok(Some(slice))
    }

    fn read_box(&mut self, region: VoxelBox, blocks: &VoxelBox) -> Result<Vec<f32>> {
        self.shared.count_read();
        let indices = self.layout.block_indices(blocks);
        let skip = self.layout.max_reflevel() - self.reflevel;
        let clamp = if self.shared.config.clamp_to_range {
            self.range
        } else {
            None
        };
        let lod = self.lod;
        let compressor = &self.compressor;
        let native_bs = self.layout.block_size();
        let files = &mut self.files;

        let decoded = self.shared.pool.ordered_read(
            indices.len(),
            |pos| read_records(&mut files[..], indices[pos]),
            Scratch::default,
            |scratch, _, records| {
                decode_block(compressor, records.as_deref(), lod, skip, clamp, native_bs, scratch)
            },
        )?;

        let fill = self.fill_value();
        let dims = region.dims();
        let mut out = vec![fill; region.num_voxels()];
        let valid = self.valid.map(|v| v.coarsen(skip));
        let bs = self.layout.block_size_at(self.reflevel)?;

        for (&index, block) in indices.iter().zip(&decoded) {
            let Some(block) = block else { continue };
            let bbox = self.layout.block_box(self.layout.block_coords(index), self.reflevel)?;
            let Some(overlap) = bbox.intersect(&region) else { continue };
            let Some(overlap) = valid.and_then(|v| v.intersect(&overlap)) else { continue };
            for z in overlap.min[2]..=overlap.max[2] {
                for y in overlap.min[1]..=overlap.max[1] {
                    for x in overlap.min[0]..=overlap.max[0] {
                        let bi = (x - bbox.min[0]) + bs[0] * ((y - bbox.min[1]) + bs[1] * (z - bbox.min[2]));
                        if block.mask.as_ref().is_some_and(|m| m.is_missing(bi)) {
                            continue;
                        }
                        let oi = (x - region.min[0])
                            + dims[0] * ((y - region.min[1]) + dims[1] * (z - region.min[2]));
                        out[oi] = block.values[bi];
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Records of LODs `0..=lod` for a block; `None` if it was never written
pub(crate) fn read_records(files: &mut [LodFile], index: usize) -> Result<Option<Vec<BlockRecord>>> {
    let mut records = Vec::with_capacity(files.len());
    for file in files.iter_mut() {
        match file.read_record(index)? {
            Some(record) => records.push(record),
            None if records.is_empty() => return Ok(None),
            None => {
                return Err(VdsError::InvalidFormat(format!(
                    "block {} missing from {}",
                    index,
                    file.path().display()
                )))
            }
        }
    }
    Ok(Some(records))
}

pub(crate) fn decode_block(
    compressor: &BlockCompressor,
    records: Option<&[BlockRecord]>,
    lod: usize,
    skip: usize,
    clamp: Option<ValueRange>,
    native_bs: [usize; 3],
    scratch: &mut Scratch,
) -> Result<Option<DecodedBlock>> {
    let Some(records) = records else {
        return Ok(None);
    };
    let ntotal = compressor.num_wave_coeffs();
    let counts = compressor.lod_coeff_counts();
    let mut maps: Vec<SignificanceMap> = Vec::with_capacity(records.len());
    let mut coeffs = Vec::with_capacity(counts[..=lod].iter().sum());
    for (l, record) in records.iter().enumerate() {
        let map = match &record.map {
            Some(bytes) => {
                let mut map = SignificanceMap::new(ntotal);
                map.set_map(bytes, counts[l])?;
                map
            }
            None => compressor.final_map(&maps)?,
        };
        maps.push(map);
        coeffs.extend_from_slice(&record.coeffs);
    }
    let values = compressor.reconstruct(&coeffs, &maps, lod, skip, clamp, scratch)?;
    let mask = match records.first().and_then(|r| r.mask.as_ref()) {
        Some(bytes) => {
            let mask = BlockMask::from_bytes(bytes, native_bs.iter().product())?;
            Some(mask.coarsen(native_bs, skip))
        }
        None => None,
    };
    Ok(Some(DecodedBlock { values, mask }))
}
