//! Boundary padding of partially covered blocks

use crate::types::VoxelBox;
use crate::wavelet::BoundaryMode;

/// Fill every voxel of `block` outside `valid` by extending the valid
/// sub-box along each axis in turn (x, then y, then z).
///
/// `valid` is in block-local coordinates; `dims` are the block extents.
pub fn pad_block(block: &mut [f32], dims: [usize; 3], valid: &VoxelBox, mode: BoundaryMode) {
    let strides = [1, dims[0], dims[0] * dims[1]];
    // After padding an axis its full extent becomes valid for later axes
    let mut span = *valid;
    for axis in 0..3 {
        let lo = span.min[axis];
        let hi = span.max[axis];
        if lo == 0 && hi + 1 == dims[axis] {
            continue;
        }
        let n = hi - lo + 1;
        let (a, b) = match axis {
            0 => (1, 2),
            1 => (0, 2),
            _ => (0, 1),
        };
        for j in span.min[b]..=span.max[b] {
            for i in span.min[a]..=span.max[a] {
                let base = i * strides[a] + j * strides[b];
                for k in (0..lo).chain(hi + 1..dims[axis]) {
                    let src = lo + mode.reflect(k as isize - lo as isize, n);
                    block[base + k * strides[axis]] = block[base + src * strides[axis]];
                }
            }
        }
        span.min[axis] = 0;
        span.max[axis] = dims[axis] - 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symh_pads_line() {
        let mut block = vec![0.0, 1.0, 2.0, 3.0, -1.0, -1.0, -1.0, -1.0];
        let valid = VoxelBox::new([0, 0, 0], [3, 0, 0]).unwrap();
        pad_block(&mut block, [8, 1, 1], &valid, BoundaryMode::Symh);
        assert_eq!(block, vec![0.0, 1.0, 2.0, 3.0, 3.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_modes_on_both_sides() {
        let base = vec![-1.0, -1.0, 1.0, 2.0, 3.0, -1.0];
        let valid = VoxelBox::new([2, 0, 0], [4, 0, 0]).unwrap();
        let cases = [
            (BoundaryMode::Symw, vec![3.0, 2.0, 1.0, 2.0, 3.0, 2.0]),
            (BoundaryMode::Symh, vec![2.0, 1.0, 1.0, 2.0, 3.0, 3.0]),
            (BoundaryMode::Per, vec![2.0, 3.0, 1.0, 2.0, 3.0, 1.0]),
            (BoundaryMode::Sp0, vec![1.0, 1.0, 1.0, 2.0, 3.0, 3.0]),
        ];
        for (mode, expected) in cases {
            let mut block = base.clone();
            pad_block(&mut block, [6, 1, 1], &valid, mode);
            assert_eq!(block, expected, "{mode}");
        }
    }

    #[test]
    fn test_pads_corner_in_3d() {
        let dims = [4, 4, 4];
        let mut block = vec![f32::NAN; 64];
        for z in 0..2 {
            for y in 0..2 {
                for x in 0..2 {
                    block[x + 4 * (y + 4 * z)] = 7.0;
                }
            }
        }
        let valid = VoxelBox::new([0, 0, 0], [1, 1, 1]).unwrap();
        pad_block(&mut block, dims, &valid, BoundaryMode::Symh);
        assert!(block.iter().all(|&v| v == 7.0));
    }

    #[test]
    fn test_full_block_untouched() {
        let mut block: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let copy = block.clone();
        let valid = VoxelBox::new([0, 0, 0], [1, 1, 1]).unwrap();
        pad_block(&mut block, [2, 2, 2], &valid, BoundaryMode::Per);
        assert_eq!(block, copy);
    }
}
