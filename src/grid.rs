//! In-memory regions handed out by the region cache

use crate::error::{Result, VdsError};
use crate::mask::is_missing_value;
use crate::types::{ValueRange, VarType, VoxelBox};
use ndarray::{s, Array3};

/// A box of voxels of one variable at one refinement level.
///
/// Coordinates are packed storage coordinates of the variable type. The
/// array is indexed `[z, y, x]` so its logical order is x-fastest, matching
/// the buffers used by readers and writers.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    var_type: VarType,
    region: VoxelBox,
    data: Array3<f32>,
    pub missing_value: Option<f32>,
}

impl Grid {
    /// Wrap an x-fastest buffer covering `region`
    pub fn new(var_type: VarType, region: VoxelBox, data: Vec<f32>, missing_value: Option<f32>) -> Result<Self> {
        let [nx, ny, nz] = region.dims();
        let data = Array3::from_shape_vec((nz, ny, nx), data).map_err(|e| {
            VdsError::InvalidDimensions(format!("grid {} : {}", region, e))
        })?;
        Ok(Self {
            var_type,
            region,
            data,
            missing_value,
        })
    }

    /// Grid covering `region` with every voxel set to `value`
    pub fn filled(var_type: VarType, region: VoxelBox, value: f32) -> Self {
        let [nx, ny, nz] = region.dims();
        Self {
            var_type,
            region,
            data: Array3::from_elem((nz, ny, nx), value),
            missing_value: None,
        }
    }

    pub fn var_type(&self) -> VarType {
        self.var_type
    }

    pub fn region(&self) -> &VoxelBox {
        &self.region
    }

    /// Extent in voxels, x first
    pub fn dims(&self) -> [usize; 3] {
        self.region.dims()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    /// Value at absolute coordinates, `None` outside the grid
    pub fn get(&self, p: [usize; 3]) -> Option<f32> {
        if !self.region.contains_point(p) {
            return None;
        }
        let [x, y, z] = [0, 1, 2].map(|i| p[i] - self.region.min[i]);
        self.data.get((z, y, x)).copied()
    }

    pub fn set(&mut self, p: [usize; 3], value: f32) -> Result<()> {
        if !self.region.contains_point(p) {
            return Err(VdsError::OutOfBounds(format!("{:?} outside {}", p, self.region)));
        }
        let [x, y, z] = [0, 1, 2].map(|i| p[i] - self.region.min[i]);
        self.data[(z, y, x)] = value;
        Ok(())
    }

    pub fn contains(&self, region: &VoxelBox) -> bool {
        self.region.contains(region)
    }

    /// Copy of the sub-box `region`
    pub fn subgrid(&self, region: &VoxelBox) -> Result<Grid> {
        if !self.contains(region) {
            return Err(VdsError::OutOfBounds(format!(
                "{} not inside {}",
                region, self.region
            )));
        }
        let lo = [0, 1, 2].map(|i| region.min[i] - self.region.min[i]);
        let hi = [0, 1, 2].map(|i| region.max[i] - self.region.min[i]);
        let data = self
            .data
            .slice(s![lo[2]..=hi[2], lo[1]..=hi[1], lo[0]..=hi[0]])
            .to_owned();
        Ok(Self {
            var_type: self.var_type,
            region: *region,
            data,
            missing_value: self.missing_value,
        })
    }

    pub fn is_missing(&self, v: f32) -> bool {
        self.missing_value.is_some_and(|m| is_missing_value(v, m))
    }

    /// Range over non-missing finite voxels
    pub fn value_range(&self) -> Option<ValueRange> {
        let mut range: Option<ValueRange> = None;
        for &v in self.data.iter() {
            if !v.is_finite() || self.is_missing(v) {
                continue;
            }
            match range.as_mut() {
                Some(r) => r.include(v),
                None => range = Some(ValueRange::new(v, v)),
            }
        }
        range
    }

    /// Values in x-fastest order
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    /// Memory held by the voxel array
    pub fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(region: VoxelBox) -> Grid {
        let dims = region.dims();
        let mut data = Vec::with_capacity(region.num_voxels());
        for z in 0..dims[2] {
            for y in 0..dims[1] {
                for x in 0..dims[0] {
                    data.push((x + 10 * y + 100 * z) as f32);
                }
            }
        }
        Grid::new(VarType::Var3D, region, data, None).unwrap()
    }

    #[test]
    fn test_indexing_is_x_fastest() {
        let grid = ramp(VoxelBox::new([2, 2, 2], [5, 4, 3]).unwrap());
        assert_eq!(grid.dims(), [4, 3, 2]);
        assert_eq!(grid.get([2, 2, 2]), Some(0.0));
        assert_eq!(grid.get([5, 3, 3]), Some(113.0));
        assert_eq!(grid.get([6, 2, 2]), None);
        assert_eq!(grid.to_vec()[1], 1.0);
    }

    #[test]
    fn test_subgrid() {
        let grid = ramp(VoxelBox::new([0, 0, 0], [7, 7, 7]).unwrap());
        let sub = grid.subgrid(&VoxelBox::new([1, 2, 3], [2, 2, 4]).unwrap()).unwrap();
        assert_eq!(sub.to_vec(), vec![321.0, 322.0, 421.0, 422.0]);
        assert_eq!(sub.get([2, 2, 4]), Some(422.0));
        assert!(grid.subgrid(&VoxelBox::new([0, 0, 0], [8, 0, 0]).unwrap()).is_err());
    }

    #[test]
    fn test_shape_mismatch_and_range() {
        let region = VoxelBox::new([0, 0, 0], [1, 1, 0]).unwrap();
        assert!(Grid::new(VarType::Var2DXY, region, vec![0.0; 3], None).is_err());

        let grid = Grid::new(VarType::Var2DXY, region, vec![1.0, -9.0, 3.0, f32::NAN], Some(-9.0)).unwrap();
        assert_eq!(grid.value_range(), Some(ValueRange::new(1.0, 3.0)));
        assert_eq!(grid.size_bytes(), 16);
    }
}
