//! Block compressor: wavelet decomposition split into LOD slices

use crate::error::{Result, VdsError};
use crate::sigmap::SignificanceMap;
use crate::types::ValueRange;
use crate::wavelet::{is_symmetric_compatible, BoundaryMode, Scratch, WaveletFamily, WaveletTransform};

/// Output of [`BlockCompressor::decompose`]
#[derive(Debug, Clone)]
pub struct Decomposition {
    /// Concatenated LOD slices, each in ascending position order
    pub coeffs: Vec<f32>,
    /// One map per LOD, describing the positions of its slice
    pub maps: Vec<SignificanceMap>,
}

impl Decomposition {
    /// Coefficient slice belonging to `lod`
    pub fn slice(&self, counts: &[usize], lod: usize) -> &[f32] {
        let start: usize = counts[..lod].iter().sum();
        &self.coeffs[start..start + counts[lod]]
    }
}

/// Forward/inverse block transform with compression-ratio bookkeeping.
///
/// Ratios are sorted largest first, so LOD 0 is the coarsest fidelity and
/// each following LOD adds the next most significant coefficients.
#[derive(Debug)]
pub struct BlockCompressor {
    transform: WaveletTransform,
    cratios: Vec<usize>,
    lod_counts: Vec<usize>,
    approx: Vec<usize>,
}

impl BlockCompressor {
    pub fn new(
        block_dims: [usize; 3],
        family: WaveletFamily,
        mode: BoundaryMode,
        cratios: &[usize],
        max_levels: Option<usize>,
    ) -> Result<Self> {
        let transform = WaveletTransform::new(block_dims, family, mode, max_levels)?;
        if cratios.is_empty() {
            return Err(VdsError::Configuration(
                "compression ratio schedule is empty".to_string(),
            ));
        }
        if cratios.contains(&0) {
            return Err(VdsError::Configuration(
                "compression ratios must be positive".to_string(),
            ));
        }
        let mut sorted = cratios.to_vec();
        sorted.sort_unstable_by(|a, b| b.cmp(a));

        let approx = transform.approx_positions();
        let ntotal = transform.len();
        let mut lod_counts = Vec::with_capacity(sorted.len());
        let mut accum = 0usize;
        for &ratio in &sorted {
            let n = ntotal / ratio;
            if n < approx.len() {
                return Err(VdsError::Configuration(format!(
                    "compression ratio {} too large for block {:?}: {} coefficients < minimum {}",
                    ratio,
                    block_dims,
                    n,
                    approx.len()
                )));
            }
            lod_counts.push(n - accum);
            accum = n;
        }

        Ok(Self {
            transform,
            cratios: sorted,
            lod_counts,
            approx,
        })
    }

    pub fn block_dims(&self) -> [usize; 3] {
        self.transform.dims()
    }

    pub fn wavelet(&self) -> WaveletFamily {
        self.transform.family()
    }

    pub fn boundary_mode(&self) -> BoundaryMode {
        self.transform.mode()
    }

    /// Ratios, largest first
    pub fn cratios(&self) -> &[usize] {
        &self.cratios
    }

    pub fn num_lods(&self) -> usize {
        self.cratios.len()
    }

    pub fn num_wave_coeffs(&self) -> usize {
        self.transform.len()
    }

    /// Fewest coefficients any LOD may carry: the coarsest approximation
    pub fn min_compression(&self) -> usize {
        self.approx.len()
    }

    pub fn num_levels(&self) -> usize {
        self.transform.levels()
    }

    /// Transform levels when every level halves cleanly, else 0
    pub fn num_transforms(&self) -> usize {
        if is_symmetric_compatible(self.wavelet(), self.boundary_mode()) {
            self.transform.levels()
        } else {
            0
        }
    }

    /// Coefficients carried by each LOD slice
    pub fn lod_coeff_counts(&self) -> &[usize] {
        &self.lod_counts
    }

    /// Encoded significance map size per LOD
    pub fn sigmap_sizes(&self) -> Vec<usize> {
        self.lod_counts
            .iter()
            .map(|&n| SignificanceMap::map_size(n, self.num_wave_coeffs()))
            .collect()
    }

    /// Whether the last LOD map must be persisted. A final ratio of 1
    /// retains every coefficient, so its map is the complement of the rest.
    pub fn final_map_stored(&self) -> bool {
        self.cratios.last().is_some_and(|&r| r != 1)
    }

    /// Actual compression ratio when reading through `lod`
    pub fn effective_ratio(&self, lod: usize) -> f64 {
        let kept: usize = self.lod_counts[..=lod.min(self.num_lods() - 1)].iter().sum();
        self.num_wave_coeffs() as f64 / kept as f64
    }

    /// Block extents after a read that stops `skip_levels` short
    pub fn block_dims_at(&self, skip_levels: usize) -> [usize; 3] {
        self.transform.extents_at(skip_levels)
    }

    /// Forward transform and LOD partition of one block
    pub fn decompose(&self, block: &[f32], scratch: &mut Scratch) -> Result<Decomposition> {
        if let Some(bad) = block.iter().position(|v| !v.is_finite()) {
            return Err(VdsError::InvalidData(format!(
                "non-finite value at block offset {}",
                bad
            )));
        }
        let mut dense = block.to_vec();
        self.transform.forward(&mut dense, scratch)?;

        let ntotal = dense.len();
        let mut is_approx = vec![false; ntotal];
        for &pos in &self.approx {
            is_approx[pos] = true;
        }
        let mut order: Vec<usize> = self.approx.clone();
        let mut details: Vec<usize> = (0..ntotal).filter(|&p| !is_approx[p]).collect();
        details.sort_by(|&a, &b| dense[b].abs().total_cmp(&dense[a].abs()).then(a.cmp(&b)));
        order.extend(details);

        let mut coeffs = Vec::with_capacity(self.lod_counts.iter().sum());
        let mut maps = Vec::with_capacity(self.num_lods());
        let mut start = 0;
        for &count in &self.lod_counts {
            let mut positions = order[start..start + count].to_vec();
            positions.sort_unstable();
            coeffs.extend(positions.iter().map(|&p| dense[p]));
            maps.push(SignificanceMap::from_positions(ntotal, positions)?);
            start += count;
        }
        Ok(Decomposition { coeffs, maps })
    }

    /// Map for the last LOD recovered from all earlier ones
    pub fn final_map(&self, prior: &[SignificanceMap]) -> Result<SignificanceMap> {
        let mut map = self.retained_positions(prior)?;
        map.invert();
        let expected = self.lod_counts[self.num_lods() - 1];
        if map.len() != expected {
            return Err(VdsError::InvalidData(format!(
                "recovered final map holds {} positions, expected {}",
                map.len(),
                expected
            )));
        }
        Ok(map)
    }

    /// Union of the given maps: every position retained through them
    pub fn retained_positions(&self, maps: &[SignificanceMap]) -> Result<SignificanceMap> {
        let mut union = SignificanceMap::new(self.num_wave_coeffs());
        for map in maps {
            union.append(map)?;
        }
        union.sort();
        Ok(union)
    }

    /// Inverse transform using coefficients of LODs `0..=lod`.
    ///
    /// `coeffs` holds the concatenated slices of those LODs and `maps` their
    /// significance maps. The result has extents `block_dims_at(skip_levels)`.
    pub fn reconstruct(
        &self,
        coeffs: &[f32],
        maps: &[SignificanceMap],
        lod: usize,
        skip_levels: usize,
        clamp: Option<ValueRange>,
        scratch: &mut Scratch,
    ) -> Result<Vec<f32>> {
        if lod >= self.num_lods() {
            return Err(VdsError::OutOfBounds(format!(
                "LOD {} not in [0, {})",
                lod,
                self.num_lods()
            )));
        }
        if maps.len() <= lod {
            return Err(VdsError::InvalidData(format!(
                "need {} significance maps, got {}",
                lod + 1,
                maps.len()
            )));
        }
        let needed: usize = self.lod_counts[..=lod].iter().sum();
        if coeffs.len() < needed {
            return Err(VdsError::InvalidData(format!(
                "need {} coefficients, got {}",
                needed,
                coeffs.len()
            )));
        }

        let mut dense = vec![0.0f32; self.num_wave_coeffs()];
        let mut offset = 0;
        for (i, map) in maps.iter().take(lod + 1).enumerate() {
            if map.len() != self.lod_counts[i] {
                return Err(VdsError::InvalidData(format!(
                    "map for LOD {} holds {} positions, expected {}",
                    i,
                    map.len(),
                    self.lod_counts[i]
                )));
            }
            for (pos, &c) in map.positions().zip(&coeffs[offset..offset + map.len()]) {
                dense[pos] = c;
            }
            offset += map.len();
        }

        self.transform.inverse(&mut dense, skip_levels, scratch)?;

        let mut out = if skip_levels == 0 {
            dense
        } else {
            let dims = self.block_dims();
            let e = self.block_dims_at(skip_levels);
            let mut corner = Vec::with_capacity(e.iter().product());
            for z in 0..e[2] {
                for y in 0..e[1] {
                    let base = dims[0] * (y + dims[1] * z);
                    corner.extend_from_slice(&dense[base..base + e[0]]);
                }
            }
            corner
        };
        if let Some(range) = clamp {
            for v in &mut out {
                *v = range.clamp(*v);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(n: usize, seed: u64) -> Vec<f32> {
        let mut state = seed;
        (0..n)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 33) as f32 / (1u64 << 31) as f32) * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn test_ratio_bookkeeping() {
        let cmp = BlockCompressor::new(
            [64, 64, 64],
            WaveletFamily::Bior33,
            BoundaryMode::Symh,
            &[1, 10, 100, 500],
            None,
        )
        .unwrap();
        assert_eq!(cmp.cratios(), &[500, 100, 10, 1]);
        assert_eq!(cmp.num_levels(), 3);
        assert_eq!(cmp.num_transforms(), 3);
        assert_eq!(cmp.min_compression(), 512);
        assert_eq!(cmp.num_wave_coeffs(), 262144);
        let counts = cmp.lod_coeff_counts();
        assert_eq!(counts[0], 524);
        assert_eq!(counts.iter().sum::<usize>(), 262144);
        assert!(!cmp.final_map_stored());
        assert!((cmp.effective_ratio(3) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ratio_bound_fails_at_configuration() {
        let err = BlockCompressor::new(
            [64, 64, 64],
            WaveletFamily::Bior33,
            BoundaryMode::Symh,
            &[1, 1000],
            None,
        )
        .unwrap_err();
        assert_eq!(err.code(), -1);
        assert!(BlockCompressor::new([8, 8, 8], WaveletFamily::Haar, BoundaryMode::Per, &[0], None).is_err());

        // repeated ratios yield an empty slice rather than an error
        let cmp = BlockCompressor::new([8, 8, 8], WaveletFamily::Haar, BoundaryMode::Per, &[4, 4], None)
            .unwrap();
        assert_eq!(cmp.lod_coeff_counts(), &[128, 0]);
    }

    #[test]
    fn test_incompatible_boundary_reports_no_transforms() {
        let cmp = BlockCompressor::new([32, 32, 32], WaveletFamily::Bior33, BoundaryMode::Symw, &[1], None)
            .unwrap();
        assert_eq!(cmp.num_transforms(), 0);
        assert_eq!(cmp.num_levels(), 2);
    }

    #[test]
    fn test_round_trip_finest_lod() {
        let cmp = BlockCompressor::new(
            [32, 32, 32],
            WaveletFamily::Bior44,
            BoundaryMode::Symw,
            &[1, 2, 4],
            None,
        )
        .unwrap();
        let block = noise(cmp.num_wave_coeffs(), 7);
        let mut scratch = Scratch::default();
        let dec = cmp.decompose(&block, &mut scratch).unwrap();
        let out = cmp
            .reconstruct(&dec.coeffs, &dec.maps, 2, 0, None, &mut scratch)
            .unwrap();
        for (a, b) in block.iter().zip(&out) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_maps_are_nested_and_disjoint() {
        let cmp = BlockCompressor::new(
            [16, 16, 16],
            WaveletFamily::Bior22,
            BoundaryMode::Symw,
            &[2, 4, 8],
            None,
        )
        .unwrap();
        let dec = cmp.decompose(&noise(4096, 3), &mut Scratch::default()).unwrap();
        assert!(cmp.final_map_stored());
        for lod in 1..cmp.num_lods() {
            let before = cmp.retained_positions(&dec.maps[..lod]).unwrap();
            let through = cmp.retained_positions(&dec.maps[..=lod]).unwrap();
            assert!(before.positions().all(|p| through.test(p)));
            assert_eq!(through.len(), 4096 / cmp.cratios()[lod]);
        }
        for pos in cmp.transform.approx_positions() {
            assert!(dec.maps[0].test(pos));
        }
        for (lod, map) in dec.maps.iter().enumerate() {
            assert_eq!(dec.slice(cmp.lod_coeff_counts(), lod).len(), map.len());
        }
    }

    #[test]
    fn test_error_decreases_with_lod() {
        let cmp = BlockCompressor::new(
            [16, 16, 16],
            WaveletFamily::Haar,
            BoundaryMode::Per,
            &[1, 8, 64],
            None,
        )
        .unwrap();
        let block: Vec<f32> = (0..4096)
            .map(|i| ((i % 16) as f32 * 0.3).sin() + ((i / 256) as f32 * 0.2).cos())
            .collect();
        let mut scratch = Scratch::default();
        let dec = cmp.decompose(&block, &mut scratch).unwrap();
        let mut last = f32::INFINITY;
        for lod in 0..3 {
            let out = cmp.reconstruct(&dec.coeffs, &dec.maps, lod, 0, None, &mut scratch).unwrap();
            let err: f32 = block.iter().zip(&out).map(|(a, b)| (a - b).powi(2)).sum();
            assert!(err <= last + 1e-3);
            last = err;
        }
        assert!(last < 1e-5);
    }

    #[test]
    fn test_final_map_recovered_from_complement() {
        let cmp = BlockCompressor::new([8, 8, 8], WaveletFamily::Haar, BoundaryMode::Per, &[1, 4], None)
            .unwrap();
        let dec = cmp.decompose(&noise(512, 11), &mut Scratch::default()).unwrap();
        let recovered = cmp.final_map(&dec.maps[..1]).unwrap();
        assert_eq!(recovered, dec.maps[1]);
    }

    #[test]
    fn test_rejects_non_finite_input() {
        let cmp = BlockCompressor::new([8, 8, 8], WaveletFamily::Haar, BoundaryMode::Per, &[1], None)
            .unwrap();
        let mut block = vec![0.0f32; 512];
        block[100] = f32::NAN;
        let err = cmp.decompose(&block, &mut Scratch::default()).unwrap_err();
        assert!(matches!(err, VdsError::InvalidData(_)));
    }

    #[test]
    fn test_constant_block_reconstruction_with_and_without_clamp() {
        let cmp = BlockCompressor::new([16, 16, 16], WaveletFamily::Bior33, BoundaryMode::Symh, &[1, 8], None)
            .unwrap();
        let block = vec![5.0f32; 4096];
        let mut scratch = Scratch::default();
        let dec = cmp.decompose(&block, &mut scratch).unwrap();
        assert_eq!(cmp.block_dims_at(1), [8, 8, 8]);

        for (lod, skip) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            let out = cmp.reconstruct(&dec.coeffs, &dec.maps, lod, skip, None, &mut scratch).unwrap();
            assert_eq!(out.len(), 4096 >> (3 * skip));
            let dev = out.iter().map(|v| (v - 5.0).abs()).fold(0.0, f32::max);
            assert!(dev < 1e-4, "lod {} skip {} deviates by {}", lod, skip, dev);
        }

        let out = cmp
            .reconstruct(&dec.coeffs, &dec.maps, 0, 1, Some(ValueRange::new(5.0, 5.0)), &mut scratch)
            .unwrap();
        assert_eq!(out.len(), 512);
        assert!(out.iter().all(|&v| v == 5.0));
    }
}
