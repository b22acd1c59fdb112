//! Missing-value masks stored alongside LOD 0 block records

use crate::error::{Result, VdsError};

/// Per-block bitmask, one bit per voxel, set where the value is missing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMask {
    bits: Vec<u8>,
    len: usize,
}

impl BlockMask {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; Self::byte_len(len)],
            len,
        }
    }

    /// Encoded size for a block of `len` voxels
    pub fn byte_len(len: usize) -> usize {
        len.div_ceil(8)
    }

    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        if bytes.len() != Self::byte_len(len) {
            return Err(VdsError::InvalidFormat(format!(
                "mask is {} bytes, expected {}",
                bytes.len(),
                Self::byte_len(len)
            )));
        }
        Ok(Self {
            bits: bytes.to_vec(),
            len,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set(&mut self, i: usize) {
        self.bits[i / 8] |= 1 << (i % 8);
    }

    pub fn is_missing(&self, i: usize) -> bool {
        self.bits[i / 8] & (1 << (i % 8)) != 0
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Mask at a coarser refinement: a voxel is missing when any of the
    /// voxels it was averaged from is missing.
    pub fn coarsen(&self, dims: [usize; 3], levels: usize) -> BlockMask {
        if levels == 0 {
            return self.clone();
        }
        let out_dims = dims.map(|d| if d > 1 { d >> levels } else { 1 });
        let mut out = BlockMask::new(out_dims.iter().product());
        for z in 0..dims[2] {
            for y in 0..dims[1] {
                for x in 0..dims[0] {
                    let i = x + dims[0] * (y + dims[1] * z);
                    if !self.is_missing(i) {
                        continue;
                    }
                    let c = [x, y, z].map(|v| v >> levels);
                    let c = [
                        c[0].min(out_dims[0] - 1),
                        c[1].min(out_dims[1] - 1),
                        c[2].min(out_dims[2] - 1),
                    ];
                    out.set(c[0] + out_dims[0] * (c[1] + out_dims[1] * c[2]));
                }
            }
        }
        out
    }
}

/// True when `v` counts as missing for a variable with sentinel `missing`
pub fn is_missing_value(v: f32, missing: f32) -> bool {
    v.is_nan() || v == missing
}
