//! Write path of the block store

use crate::collective::{EMPTY_MAX, EMPTY_MIN};
use crate::compression::BlockCompressor;
use crate::error::{Result, VdsError};
use crate::io::{BlockRecord, LodFile, LodFileHeader};
use crate::layout::VolumeLayout;
use crate::mask::{is_missing_value, BlockMask};
use crate::metadata::VariableDescriptor;
use crate::padding::pad_block;
use crate::reader::{decode_block, read_records};
use crate::store::StoreShared;
use crate::types::{ValueRange, VoxelBox};
use crate::wavelet::{BoundaryMode, Scratch};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Source buffer of a write: a dense x-fastest box of voxels
struct Source<'a> {
    data: &'a [f32],
    origin: [usize; 3],
    dims: [usize; 3],
    /// Voxels of the source that carry real data
    covered: VoxelBox,
}

impl Source<'_> {
    fn at(&self, p: [usize; 3]) -> f32 {
        let l = [p[0] - self.origin[0], p[1] - self.origin[1], p[2] - self.origin[2]];
        self.data[l[0] + self.dims[0] * (l[1] + self.dims[1] * l[2])]
    }
}

/// Transformed block ready to be written
struct EncodedBlock {
    index: usize,
    records: Vec<BlockRecord>,
    range: Option<ValueRange>,
}

/// Open-for-write handle of one variable instance.
///
/// A block only partly covered by a write keeps the voxels an earlier write
/// stored there, decoded at the finest LOD. Closing reduces the data range and valid
/// region across participants and rewrites every LOD file header; a writer
/// dropped without `close` is finalized on a best-effort basis.
pub struct VariableWriter {
    shared: Arc<StoreShared>,
    descriptor: VariableDescriptor,
    timestep: usize,
    layout: VolumeLayout,
    compressor: BlockCompressor,
    files: Vec<LodFile>,
    range: Option<ValueRange>,
    valid: Option<VoxelBox>,
    slab: Vec<f32>,
    slab_start: usize,
    next_slice: usize,
    finished: bool,
}

impl VariableWriter {
    pub(crate) fn open(shared: Arc<StoreShared>, var: &str, timestep: usize) -> Result<Self> {
        let descriptor = shared.descriptor(var)?;
        shared.check_timestep(timestep)?;
        let compressor = shared.compressor(descriptor.var_type)?;
        let layout = shared.layout(descriptor.var_type)?;
        let expected = shared.expected_headers(&descriptor, &compressor, &layout);

        shared.claim_writer(var)?;
        let opened = Self::open_files(&shared, &descriptor, timestep, expected);
        let (files, range, valid) = match opened {
            Ok(v) => v,
            Err(err) => {
                shared.release_writer(var);
                return Err(err);
            }
        };
        info!(var, timestep, lods = files.len(), "opened variable for writing");
        Ok(Self {
            shared,
            descriptor,
            timestep,
            layout,
            compressor,
            files,
            range,
            valid,
            slab: Vec::new(),
            slab_start: 0,
            next_slice: 0,
            finished: false,
        })
    }

    /// Reuse existing files with a matching layout, keeping their recorded
    /// range and valid region; otherwise start fresh.
    #[allow(clippy::type_complexity)]
    fn open_files(
        shared: &StoreShared,
        descriptor: &VariableDescriptor,
        timestep: usize,
        expected: Vec<LodFileHeader>,
    ) -> Result<(Vec<LodFile>, Option<ValueRange>, Option<VoxelBox>)> {
        let paths: Vec<_> = (0..expected.len())
            .map(|lod| shared.lod_path(&descriptor.name, timestep, lod))
            .collect();
        if paths.iter().all(|p| p.exists()) {
            let existing: Result<Vec<LodFile>> = paths.iter().map(|p| LodFile::open(p, true)).collect();
            match existing {
                Ok(files) if files.iter().zip(&expected).all(|(f, h)| f.header().same_layout(h)) => {
                    let range = files[0].header().data_range();
                    let valid = files[0].header().valid_region();
                    return Ok((files, range, valid));
                }
                Ok(_) => warn!(var = %descriptor.name, timestep, "layout changed, rewriting variable"),
                Err(err) => warn!(var = %descriptor.name, timestep, %err, "unreadable files, rewriting variable"),
            }
        }
        let files = paths
            .iter()
            .zip(expected)
            .map(|(p, h)| LodFile::create(p, h))
            .collect::<Result<Vec<_>>>()?;
        Ok((files, None, None))
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn timestep(&self) -> usize {
        self.timestep
    }

    pub fn layout(&self) -> &VolumeLayout {
        &self.layout
    }

    /// Range of everything written so far (before reduction)
    pub fn data_range(&self) -> Option<ValueRange> {
        self.range
    }

    /// Bounding box of everything written so far (before reduction)
    pub fn valid_region(&self) -> Option<VoxelBox> {
        self.valid
    }

    /// Write a native-resolution region given in packed coordinates
    #[instrument(skip(self, data), fields(var = %self.descriptor.name, ts = self.timestep))]
    pub fn write_region(&mut self, min: [usize; 3], max: [usize; 3], data: &[f32]) -> Result<()> {
        let result = self.write_region_inner(min, max, data);
        self.shared.errors.track(result)
    }

    fn write_region_inner(&mut self, min: [usize; 3], max: [usize; 3], data: &[f32]) -> Result<()> {
        let region = self
            .layout
            .validate_region(min, max, self.layout.max_reflevel())?;
        check_len(data, region.num_voxels())?;
        let source = Source {
            data,
            origin: region.min,
            dims: region.dims(),
            covered: region,
        };
        let blocks = self.layout.blocks_for_region(&region, self.layout.max_reflevel())?;
        self.encode_and_write(&source, &blocks)?;
        self.valid = Some(self.valid.map_or(region, |v| v.union(&region)));
        Ok(())
    }

    /// Write whole blocks `bmin..=bmax`; `data` spans the full block extents
    /// even where they reach past the volume.
    #[instrument(skip(self, data), fields(var = %self.descriptor.name, ts = self.timestep))]
    pub fn block_write_region(&mut self, bmin: [usize; 3], bmax: [usize; 3], data: &[f32]) -> Result<()> {
        let result = self.block_write_region_inner(bmin, bmax, data);
        self.shared.errors.track(result)
    }

    fn block_write_region_inner(&mut self, bmin: [usize; 3], bmax: [usize; 3], data: &[f32]) -> Result<()> {
        let blocks = self.layout.validate_block_region(bmin, bmax)?;
        let level = self.layout.max_reflevel();
        let first = self.layout.block_box(blocks.min, level)?;
        let last = self.layout.block_box(blocks.max, level)?;
        let span = first.union(&last);
        check_len(data, span.num_voxels())?;
        let covered = span
            .intersect(&self.layout.full_box(level)?)
            .ok_or_else(|| VdsError::OutOfBounds(format!("blocks {} outside volume", blocks)))?;
        let source = Source {
            data,
            origin: span.min,
            dims: span.dims(),
            covered,
        };
        self.encode_and_write(&source, &blocks)?;
        self.valid = Some(self.valid.map_or(covered, |v| v.union(&covered)));
        Ok(())
    }

    /// Append the next z-slice (x-fastest plane). 2D variables take a
    /// single plane. Slices are buffered into block-high slabs.
    pub fn write_slice(&mut self, slice: &[f32]) -> Result<()> {
        let result = self.write_slice_inner(slice);
        self.shared.errors.track(result)
    }

    fn write_slice_inner(&mut self, slice: &[f32]) -> Result<()> {
        let dims = self.layout.dims();
        if self.next_slice >= dims[2] {
            return Err(VdsError::OutOfBounds(format!(
                "slice {} past volume depth {}",
                self.next_slice, dims[2]
            )));
        }
        check_len(slice, dims[0] * dims[1])?;
        if self.slab.is_empty() {
            self.slab_start = self.next_slice;
        }
        self.slab.extend_from_slice(slice);
        self.next_slice += 1;

        let bz = self.layout.block_size()[2];
        let slab_full = self.next_slice % bz == 0 || self.next_slice == dims[2];
        if slab_full {
            let slab = std::mem::take(&mut self.slab);
            let min = [0, 0, self.slab_start];
            let max = [dims[0] - 1, dims[1] - 1, self.next_slice - 1];
            self.write_region_inner(min, max, &slab)?;
        }
        Ok(())
    }

    fn encode_and_write(&mut self, source: &Source<'_>, blocks: &VoxelBox) -> Result<()> {
        let indices = self.layout.block_indices(blocks);
        let level = self.layout.max_reflevel();

        // Blocks this write covers only partly, merged with what is stored
        let prior_valid = self.valid;
        let mut priors = Vec::with_capacity(indices.len());
        for &index in &indices {
            let bbox = self.layout.block_box(self.layout.block_coords(index), level)?;
            let merge = !source.covered.contains(&bbox)
                && prior_valid.is_some_and(|v| v.intersect(&bbox).is_some());
            priors.push(if merge {
                read_records(&mut self.files, index)?
            } else {
                None
            });
        }
        debug!(
            blocks = indices.len(),
            merged = priors.iter().filter(|p| p.is_some()).count(),
            "encoding blocks"
        );

        let layout = &self.layout;
        let compressor = &self.compressor;
        let missing = self.descriptor.missing_value;
        let pad_mode = self
            .shared
            .config
            .pad_boundaries
            .then_some(compressor.boundary_mode());
        let headers: Vec<_> = self.files.iter().map(|f| f.header().clone()).collect();
        let files = &mut self.files;
        let mut range = self.range;

        self.shared.pool.ordered_write(
            &indices,
            Scratch::default,
            |scratch, pos, &index| {
                let prior = priors[pos].as_deref().map(|records| (records, prior_valid));
                encode_block(layout, compressor, &headers, source, index, prior, missing, pad_mode, scratch)
            },
            |_, block: EncodedBlock| {
                for (file, record) in files.iter_mut().zip(&block.records) {
                    file.write_record(block.index, record)?;
                }
                if let Some(r) = block.range {
                    range = Some(range.map_or(r, |cur| cur.merge(&r)));
                }
                Ok(())
            },
        )?;
        self.range = range;
        Ok(())
    }

    /// Reduce metadata across participants and rewrite the file headers
    #[instrument(skip(self), fields(var = %self.descriptor.name, ts = self.timestep))]
    pub fn close(mut self) -> Result<()> {
        let result = self.finish();
        self.shared.errors.track(result)
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let result = self.finish_inner();
        self.shared.release_writer(&self.descriptor.name);
        result
    }

    fn finish_inner(&mut self) -> Result<()> {
        if !self.slab.is_empty() {
            let dims = self.layout.dims();
            let slab = std::mem::take(&mut self.slab);
            self.write_region_inner(
                [0, 0, self.slab_start],
                [dims[0] - 1, dims[1] - 1, self.next_slice - 1],
                &slab,
            )?;
        }

        let mut mins = [EMPTY_MIN; 4];
        let mut maxs = [EMPTY_MAX; 4];
        if let Some(r) = self.range {
            mins[0] = r.min as f64;
            maxs[0] = r.max as f64;
        }
        if let Some(v) = self.valid {
            for i in 0..3 {
                mins[i + 1] = v.min[i] as f64;
                maxs[i + 1] = v.max[i] as f64;
            }
        }
        let collective = &self.shared.collective;
        collective.all_reduce_min(&mut mins)?;
        collective.all_reduce_max(&mut maxs)?;

        let range = (mins[0].is_finite() && maxs[0].is_finite())
            .then(|| ValueRange::new(mins[0] as f32, maxs[0] as f32));
        let valid = mins[1..]
            .iter()
            .chain(&maxs[1..])
            .all(|v| v.is_finite())
            .then(|| VoxelBox {
                min: [mins[1] as usize, mins[2] as usize, mins[3] as usize],
                max: [maxs[1] as usize, maxs[2] as usize, maxs[3] as usize],
            });

        for file in &mut self.files {
            let mut header = file.header().clone();
            header.set_data_range(range);
            header.set_valid_region(valid);
            file.rewrite_header(header)?;
            file.sync()?;
        }
        self.range = range;
        self.valid = valid;
        info!(
            var = %self.descriptor.name,
            timestep = self.timestep,
            rank = collective.rank(),
            "closed variable"
        );
        Ok(())
    }
}

impl Drop for VariableWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.finish() {
            warn!(var = %self.descriptor.name, timestep = self.timestep, %err, "failed to finalize writer");
            self.shared.errors.record(&err);
        }
    }
}

fn check_len(data: &[f32], expected: usize) -> Result<()> {
    if data.len() != expected {
        return Err(VdsError::InvalidDimensions(format!(
            "buffer holds {} values, region needs {}",
            data.len(),
            expected
        )));
    }
    Ok(())
}

/// Extract, mask, pad and decompose one block.
///
/// `prior` carries the stored records of the block and the valid region
/// they were written under; voxels of that region the source does not
/// cover keep their stored values and mask bits.
#[allow(clippy::too_many_arguments)]
fn encode_block(
    layout: &VolumeLayout,
    compressor: &BlockCompressor,
    headers: &[LodFileHeader],
    source: &Source<'_>,
    index: usize,
    prior: Option<(&[BlockRecord], Option<VoxelBox>)>,
    missing: Option<f32>,
    pad_mode: Option<BoundaryMode>,
    scratch: &mut Scratch,
) -> Result<EncodedBlock> {
    let bs = layout.block_size();
    let bbox = layout.block_box(layout.block_coords(index), layout.max_reflevel())?;
    let overlap = bbox.intersect(&source.covered).ok_or_else(|| {
        VdsError::InvalidData(format!("block {} does not meet the written region", index))
    })?;

    let (mut block, prior_mask, keep) = match prior {
        Some((records, prior_valid)) => {
            let finest = compressor.num_lods() - 1;
            match decode_block(compressor, Some(records), finest, 0, None, bs, scratch)? {
                Some(decoded) => (
                    decoded.values,
                    decoded.mask,
                    prior_valid.and_then(|v| v.intersect(&bbox)),
                ),
                None => (vec![0.0f32; layout.block_voxels()], None, None),
            }
        }
        None => (vec![0.0f32; layout.block_voxels()], None, None),
    };
    let local_index =
        |p: [usize; 3]| (p[0] - bbox.min[0]) + bs[0] * ((p[1] - bbox.min[1]) + bs[1] * (p[2] - bbox.min[2]));

    let mut mask = missing.map(|_| BlockMask::new(block.len()));
    if let (Some(keep), Some(old), Some(mask)) = (keep, prior_mask.as_ref(), mask.as_mut()) {
        for z in keep.min[2]..=keep.max[2] {
            for y in keep.min[1]..=keep.max[1] {
                for x in keep.min[0]..=keep.max[0] {
                    let i = local_index([x, y, z]);
                    if !overlap.contains_point([x, y, z]) && old.is_missing(i) {
                        mask.set(i);
                    }
                }
            }
        }
    }

    let mut range: Option<ValueRange> = None;
    for z in overlap.min[2]..=overlap.max[2] {
        for y in overlap.min[1]..=overlap.max[1] {
            for x in overlap.min[0]..=overlap.max[0] {
                let v = source.at([x, y, z]);
                let i = local_index([x, y, z]);
                if let (Some(sentinel), Some(mask)) = (missing, mask.as_mut()) {
                    if is_missing_value(v, sentinel) {
                        mask.set(i);
                        block[i] = 0.0;
                        continue;
                    }
                }
                block[i] = v;
                match range.as_mut() {
                    Some(r) => r.include(v),
                    None => range = Some(ValueRange::new(v, v)),
                }
            }
        }
    }

    // Only voxels outside both the new and the kept data are padded
    let written = keep.map_or(overlap, |k| k.union(&overlap));
    if let Some(mode) = pad_mode {
        if written != bbox {
            let local = VoxelBox {
                min: [
                    written.min[0] - bbox.min[0],
                    written.min[1] - bbox.min[1],
                    written.min[2] - bbox.min[2],
                ],
                max: [
                    written.max[0] - bbox.min[0],
                    written.max[1] - bbox.min[1],
                    written.max[2] - bbox.min[2],
                ],
            };
            pad_block(&mut block, bs, &local, mode);
        }
    }

    let dec = compressor.decompose(&block, scratch)?;
    let counts = compressor.lod_coeff_counts();
    let mut records = Vec::with_capacity(headers.len());
    for (lod, header) in headers.iter().enumerate() {
        let map = if header.map_stored {
            Some(dec.maps[lod].get_map()?)
        } else {
            None
        };
        let mask_bytes = if header.mask_len > 0 {
            mask.as_ref().map(|m| m.as_bytes().to_vec())
        } else {
            None
        };
        records.push(BlockRecord {
            coeffs: dec.slice(counts, lod).to_vec(),
            map,
            mask: mask_bytes,
        });
    }
    Ok(EncodedBlock {
        index,
        records,
        range,
    })
}
