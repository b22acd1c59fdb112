//! Volume layout: how a variable is divided into blocks at each refinement level

use crate::error::{Result, VdsError};
use crate::types::{VarType, VoxelBox};
use serde::{Deserialize, Serialize};

/// Block geometry of one variable in packed storage coordinates.
///
/// Refinement level `num_levels` is native resolution; each lower level
/// halves every active axis. The block grid is the same at every level, only
/// the block extents shrink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeLayout {
    dims: [usize; 3],
    block_size: [usize; 3],
    num_levels: usize,
}

impl VolumeLayout {
    pub fn new(dims: [usize; 3], block_size: [usize; 3], num_levels: usize) -> Result<Self> {
        if dims.iter().chain(block_size.iter()).any(|&d| d == 0) {
            return Err(VdsError::InvalidDimensions(format!(
                "zero extent in dims {:?} or block size {:?}",
                dims, block_size
            )));
        }
        for i in 0..3 {
            if block_size[i] > 1 && block_size[i] % (1 << num_levels) != 0 {
                return Err(VdsError::InvalidDimensions(format!(
                    "block size {:?} not divisible through {} levels",
                    block_size, num_levels
                )));
            }
        }
        Ok(Self {
            dims,
            block_size,
            num_levels,
        })
    }

    /// Layout of a variable of `var_type` in a volume of `volume_dims`
    pub fn for_variable(
        volume_dims: [usize; 3],
        block_size: [usize; 3],
        var_type: VarType,
        num_levels: usize,
    ) -> Result<Self> {
        Self::new(
            var_type.pack(volume_dims, 1),
            var_type.pack(block_size, 1),
            num_levels,
        )
    }

    /// Native dimensions
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn block_size(&self) -> [usize; 3] {
        self.block_size
    }

    /// Highest refinement level (native resolution)
    pub fn max_reflevel(&self) -> usize {
        self.num_levels
    }

    fn check_reflevel(&self, reflevel: usize) -> Result<usize> {
        if reflevel > self.num_levels {
            return Err(VdsError::OutOfBounds(format!(
                "refinement level {} > {}",
                reflevel, self.num_levels
            )));
        }
        Ok(self.num_levels - reflevel)
    }

    /// Dimensions at a refinement level
    pub fn dims_at(&self, reflevel: usize) -> Result<[usize; 3]> {
        let ld = self.check_reflevel(reflevel)?;
        Ok(self.dims.map(|d| ((d - 1) >> ld) + 1))
    }

    /// Block extents at a refinement level
    pub fn block_size_at(&self, reflevel: usize) -> Result<[usize; 3]> {
        let ld = self.check_reflevel(reflevel)?;
        Ok(self.block_size.map(|b| if b > 1 { b >> ld } else { 1 }))
    }

    /// Blocks along each axis (identical at every level)
    pub fn blocks_per_axis(&self) -> [usize; 3] {
        [
            self.dims[0].div_ceil(self.block_size[0]),
            self.dims[1].div_ceil(self.block_size[1]),
            self.dims[2].div_ceil(self.block_size[2]),
        ]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks_per_axis().iter().product()
    }

    /// Voxels in one native block
    pub fn block_voxels(&self) -> usize {
        self.block_size.iter().product()
    }

    /// Linear block index, x fastest
    pub fn block_index(&self, coords: [usize; 3]) -> usize {
        let nb = self.blocks_per_axis();
        coords[0] + nb[0] * (coords[1] + nb[1] * coords[2])
    }

    pub fn block_coords(&self, index: usize) -> [usize; 3] {
        let nb = self.blocks_per_axis();
        [index % nb[0], (index / nb[0]) % nb[1], index / (nb[0] * nb[1])]
    }

    /// Voxel box covered by a block at a refinement level, unclipped
    pub fn block_box(&self, coords: [usize; 3], reflevel: usize) -> Result<VoxelBox> {
        let bs = self.block_size_at(reflevel)?;
        let min = [coords[0] * bs[0], coords[1] * bs[1], coords[2] * bs[2]];
        Ok(VoxelBox {
            min,
            max: [min[0] + bs[0] - 1, min[1] + bs[1] - 1, min[2] + bs[2] - 1],
        })
    }

    /// Whole-volume box at a refinement level
    pub fn full_box(&self, reflevel: usize) -> Result<VoxelBox> {
        let d = self.dims_at(reflevel)?;
        Ok(VoxelBox {
            min: [0; 3],
            max: [d[0] - 1, d[1] - 1, d[2] - 1],
        })
    }

    /// Check that a voxel region lies inside the volume at `reflevel`
    pub fn validate_region(&self, min: [usize; 3], max: [usize; 3], reflevel: usize) -> Result<VoxelBox> {
        let region = VoxelBox::new(min, max)?;
        let full = self.full_box(reflevel)?;
        if !full.contains(&region) {
            return Err(VdsError::OutOfBounds(format!(
                "region {} outside volume {} at refinement level {}",
                region, full, reflevel
            )));
        }
        Ok(region)
    }

    /// Check that a block region lies inside the block grid
    pub fn validate_block_region(&self, bmin: [usize; 3], bmax: [usize; 3]) -> Result<VoxelBox> {
        let region = VoxelBox::new(bmin, bmax)?;
        let nb = self.blocks_per_axis();
        if (0..3).any(|i| bmax[i] >= nb[i]) {
            return Err(VdsError::OutOfBounds(format!(
                "block region {} outside block grid {:?}",
                region, nb
            )));
        }
        Ok(region)
    }

    /// Block coordinates touched by a voxel region at `reflevel`
    pub fn blocks_for_region(&self, region: &VoxelBox, reflevel: usize) -> Result<VoxelBox> {
        let bs = self.block_size_at(reflevel)?;
        Ok(VoxelBox {
            min: [region.min[0] / bs[0], region.min[1] / bs[1], region.min[2] / bs[2]],
            max: [region.max[0] / bs[0], region.max[1] / bs[1], region.max[2] / bs[2]],
        })
    }

    /// Linear indices of every block in a block box, ascending
    pub fn block_indices(&self, blocks: &VoxelBox) -> Vec<usize> {
        let mut out = Vec::with_capacity(blocks.num_voxels());
        for z in blocks.min[2]..=blocks.max[2] {
            for y in blocks.min[1]..=blocks.max[1] {
                for x in blocks.min[0]..=blocks.max[0] {
                    out.push(self.block_index([x, y, z]));
                }
            }
        }
        out
    }

    /// True when every native dimension is a whole number of blocks
    pub fn is_block_aligned(&self) -> bool {
        (0..3).all(|i| self.dims[i] % self.block_size[i] == 0)
    }

    pub fn summary(&self) -> String {
        let nb = self.blocks_per_axis();
        format!(
            "{} x {} x {} voxels, {} x {} x {} blocks of {} x {} x {}, {} refinement levels",
            self.dims[0],
            self.dims[1],
            self.dims[2],
            nb[0],
            nb[1],
            nb[2],
            self.block_size[0],
            self.block_size[1],
            self.block_size[2],
            self.num_levels + 1
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_layout() -> VolumeLayout {
        VolumeLayout::new([1000, 800, 500], [64, 64, 64], 3).unwrap()
    }

    #[test]
    fn test_block_count() {
        let layout = create_test_layout();
        assert_eq!(layout.blocks_per_axis(), [16, 13, 8]);
        assert_eq!(layout.num_blocks(), 16 * 13 * 8);
    }

    #[test]
    fn test_block_index_conversion() {
        let layout = create_test_layout();
        let coords = [5, 7, 3];
        let index = layout.block_index(coords);
        assert_eq!(index, 5 + 16 * (7 + 13 * 3));
        assert_eq!(layout.block_coords(index), coords);
    }

    #[test]
    fn test_refinement_levels() {
        let layout = create_test_layout();
        assert_eq!(layout.dims_at(3).unwrap(), [1000, 800, 500]);
        assert_eq!(layout.dims_at(2).unwrap(), [500, 400, 250]);
        assert_eq!(layout.dims_at(0).unwrap(), [125, 100, 63]);
        assert_eq!(layout.block_size_at(0).unwrap(), [8, 8, 8]);
        assert!(layout.dims_at(4).is_err());
    }

    #[test]
    fn test_packed_2d_layout() {
        let layout = VolumeLayout::for_variable([200, 100, 50], [64, 64, 64], VarType::Var2DXZ, 3).unwrap();
        assert_eq!(layout.dims(), [200, 50, 1]);
        assert_eq!(layout.block_size(), [64, 64, 1]);
        assert_eq!(layout.blocks_per_axis(), [4, 1, 1]);
        assert_eq!(layout.block_size_at(1).unwrap(), [16, 16, 1]);
        assert_eq!(layout.dims_at(1).unwrap(), [50, 13, 1]);
    }

    #[test]
    fn test_region_to_blocks() {
        let layout = create_test_layout();
        let region = layout.validate_region([60, 0, 130], [70, 63, 200], 3).unwrap();
        let blocks = layout.blocks_for_region(&region, 3).unwrap();
        assert_eq!(blocks.min, [0, 0, 2]);
        assert_eq!(blocks.max, [1, 0, 3]);
        assert_eq!(layout.block_indices(&blocks).len(), 4);
        assert!(layout.validate_region([0, 0, 0], [1000, 0, 0], 3).is_err());
        assert!(layout.validate_block_region([0, 0, 0], [16, 0, 0]).is_err());
    }

    #[test]
    fn test_block_box() {
        let layout = create_test_layout();
        let b = layout.block_box([15, 12, 7], 3).unwrap();
        assert_eq!(b.min, [960, 768, 448]);
        assert_eq!(b.max, [1023, 831, 511]);
        assert!(!layout.is_block_aligned());
    }
}
