//! Core data types for WaveVDS

use crate::error::{Result, VdsError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Dimensionality of a variable
///
/// 2D variables live on one of the three axis-aligned planes of the volume
/// and are stored "packed": their two active axes become the first two
/// storage axes and the third storage axis has extent 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VarType {
    Var3D = 0,
    Var2DXY = 1,
    Var2DXZ = 2,
    Var2DYZ = 3,
}

impl VarType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(VarType::Var3D),
            1 => Some(VarType::Var2DXY),
            2 => Some(VarType::Var2DXZ),
            3 => Some(VarType::Var2DYZ),
            _ => None,
        }
    }

    /// Parse the short names used in dataset descriptions ("3D", "2DXY", ...)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "3D" => Some(VarType::Var3D),
            "2DXY" | "XY" => Some(VarType::Var2DXY),
            "2DXZ" | "XZ" => Some(VarType::Var2DXZ),
            "2DYZ" | "YZ" => Some(VarType::Var2DYZ),
            _ => None,
        }
    }

    pub fn is_3d(&self) -> bool {
        matches!(self, VarType::Var3D)
    }

    /// Volume axes (0 = x, 1 = y, 2 = z) that map onto storage axes 0 and 1
    /// (and 2 for 3D variables)
    pub fn active_axes(&self) -> &'static [usize] {
        match self {
            VarType::Var3D => &[0, 1, 2],
            VarType::Var2DXY => &[0, 1],
            VarType::Var2DXZ => &[0, 2],
            VarType::Var2DYZ => &[1, 2],
        }
    }

    /// Volume axis not represented by a 2D variable
    pub fn unused_axis(&self) -> Option<usize> {
        match self {
            VarType::Var3D => None,
            VarType::Var2DXY => Some(2),
            VarType::Var2DXZ => Some(1),
            VarType::Var2DYZ => Some(0),
        }
    }

    /// Map a triple in volume axis order to packed storage order.
    /// The unused storage axis receives `fill`.
    pub fn pack(&self, src: [usize; 3], fill: usize) -> [usize; 3] {
        let axes = self.active_axes();
        let mut dst = [fill; 3];
        for (i, &axis) in axes.iter().enumerate() {
            dst[i] = src[axis];
        }
        dst
    }

    /// Inverse of [`VarType::pack`]
    pub fn unpack(&self, src: [usize; 3], fill: usize) -> [usize; 3] {
        let axes = self.active_axes();
        let mut dst = [fill; 3];
        for (i, &axis) in axes.iter().enumerate() {
            dst[axis] = src[i];
        }
        dst
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VarType::Var3D => "3D",
            VarType::Var2DXY => "2DXY",
            VarType::Var2DXZ => "2DXZ",
            VarType::Var2DYZ => "2DYZ",
        };
        f.write_str(name)
    }
}

/// Inclusive voxel bounding box in storage coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoxelBox {
    pub min: [usize; 3],
    pub max: [usize; 3],
}

impl VoxelBox {
    /// Create a box, rejecting inverted bounds
    pub fn new(min: [usize; 3], max: [usize; 3]) -> Result<Self> {
        if (0..3).any(|i| min[i] > max[i]) {
            return Err(VdsError::InvalidDimensions(format!(
                "invalid region : {:?} {:?}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Extent along each axis in voxels
    pub fn dims(&self) -> [usize; 3] {
        [
            self.max[0] - self.min[0] + 1,
            self.max[1] - self.min[1] + 1,
            self.max[2] - self.min[2] + 1,
        ]
    }

    pub fn num_voxels(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn contains(&self, other: &VoxelBox) -> bool {
        (0..3).all(|i| self.min[i] <= other.min[i] && other.max[i] <= self.max[i])
    }

    pub fn contains_point(&self, p: [usize; 3]) -> bool {
        (0..3).all(|i| self.min[i] <= p[i] && p[i] <= self.max[i])
    }

    /// Smallest box enclosing both
    pub fn union(&self, other: &VoxelBox) -> VoxelBox {
        let mut out = *self;
        for i in 0..3 {
            out.min[i] = out.min[i].min(other.min[i]);
            out.max[i] = out.max[i].max(other.max[i]);
        }
        out
    }

    /// Overlap of both boxes, if any
    pub fn intersect(&self, other: &VoxelBox) -> Option<VoxelBox> {
        let mut out = *self;
        for i in 0..3 {
            out.min[i] = self.min[i].max(other.min[i]);
            out.max[i] = self.max[i].min(other.max[i]);
            if out.min[i] > out.max[i] {
                return None;
            }
        }
        Some(out)
    }

    /// Box coarsened by `levels` successive halvings
    pub fn coarsen(&self, levels: usize) -> VoxelBox {
        VoxelBox {
            min: self.min.map(|v| v >> levels),
            max: self.max.map(|v| v >> levels),
        }
    }
}

impl fmt::Display for VoxelBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({} {} {})-({} {} {})",
            self.min[0], self.min[1], self.min[2], self.max[0], self.max[1], self.max[2]
        )
    }
}

/// Value range of a variable
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f32,
    pub max: f32,
}

impl ValueRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }

    /// Grow the range to include `v`
    pub fn include(&mut self, v: f32) {
        if v < self.min {
            self.min = v;
        }
        if v > self.max {
            self.max = v;
        }
    }

    pub fn merge(&self, other: &ValueRange) -> ValueRange {
        ValueRange::new(self.min.min(other.min), self.max.max(other.max))
    }

    pub fn clamp(&self, v: f32) -> f32 {
        v.max(self.min).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_type_packing() {
        let dims = [100, 80, 60];
        assert_eq!(VarType::Var3D.pack(dims, 1), [100, 80, 60]);
        assert_eq!(VarType::Var2DXY.pack(dims, 1), [100, 80, 1]);
        assert_eq!(VarType::Var2DXZ.pack(dims, 1), [100, 60, 1]);
        assert_eq!(VarType::Var2DYZ.pack(dims, 1), [80, 60, 1]);

        assert_eq!(VarType::Var2DXZ.unpack([100, 60, 1], 0), [100, 0, 60]);
        assert_eq!(VarType::Var2DYZ.unused_axis(), Some(0));
        assert_eq!(VarType::from_name("2dxz"), Some(VarType::Var2DXZ));
        assert_eq!(VarType::from_u8(4), None);
    }

    #[test]
    fn test_voxel_box_ops() {
        let a = VoxelBox::new([0, 0, 0], [9, 9, 9]).unwrap();
        let b = VoxelBox::new([5, 5, 5], [14, 7, 20]).unwrap();
        assert_eq!(a.dims(), [10, 10, 10]);
        assert_eq!(a.union(&b), VoxelBox::new([0, 0, 0], [14, 9, 20]).unwrap());
        assert_eq!(
            a.intersect(&b),
            Some(VoxelBox::new([5, 5, 5], [9, 7, 9]).unwrap())
        );
        assert!(a.contains(&VoxelBox::new([1, 1, 1], [2, 2, 2]).unwrap()));
        assert!(!a.contains(&b));
        assert_eq!(b.coarsen(1).max, [7, 3, 10]);
        assert!(VoxelBox::new([3, 0, 0], [2, 0, 0]).is_err());
    }

    #[test]
    fn test_value_range() {
        let mut range = ValueRange::new(1.0, 1.0);
        range.include(-2.0);
        range.include(4.0);
        assert_eq!(range, ValueRange::new(-2.0, 4.0));
        assert_eq!(range.clamp(10.0), 4.0);
        assert!(range.is_valid());
        assert!(!ValueRange::new(f32::NAN, 0.0).is_valid());
    }
}
