//! Separable lifting wavelet transforms over 3D blocks
//!
//! Blocks are flat `f32` buffers in x-fastest order. One transform level
//! splits every active axis into a low band (first half) and a high band
//! (second half); further levels recurse on the low corner (Mallat layout).

use crate::error::{Result, VdsError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Symmetry class of a wavelet's filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symmetry {
    Any,
    WholePoint,
    HalfPoint,
}

/// Supported biorthogonal wavelet families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaveletFamily {
    /// Haar, also known as bior1.1
    Haar,
    /// CDF 5/3
    Bior22,
    /// CDF (3,3) spline
    Bior33,
    /// CDF 9/7
    Bior44,
}

impl WaveletFamily {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "haar" | "bior1.1" => Some(WaveletFamily::Haar),
            "bior2.2" => Some(WaveletFamily::Bior22),
            "bior3.3" => Some(WaveletFamily::Bior33),
            "bior4.4" => Some(WaveletFamily::Bior44),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WaveletFamily::Haar => "bior1.1",
            WaveletFamily::Bior22 => "bior2.2",
            WaveletFamily::Bior33 => "bior3.3",
            WaveletFamily::Bior44 => "bior4.4",
        }
    }

    /// Length of the longest analysis filter
    pub fn filter_length(&self) -> usize {
        match self {
            WaveletFamily::Haar => 2,
            WaveletFamily::Bior22 => 6,
            WaveletFamily::Bior33 => 8,
            WaveletFamily::Bior44 => 10,
        }
    }

    pub fn symmetry(&self) -> Symmetry {
        match self {
            WaveletFamily::Haar => Symmetry::Any,
            WaveletFamily::Bior22 | WaveletFamily::Bior44 => Symmetry::WholePoint,
            WaveletFamily::Bior33 => Symmetry::HalfPoint,
        }
    }

    fn steps(&self) -> Vec<Lift> {
        use Lift::{Predict, Update};
        match self {
            WaveletFamily::Haar => vec![Predict(vec![(0, -1.0)]), Update(vec![(0, 0.5)])],
            WaveletFamily::Bior22 => vec![
                Predict(vec![(0, -0.5), (1, -0.5)]),
                Update(vec![(-1, 0.25), (0, 0.25)]),
            ],
            WaveletFamily::Bior33 => vec![
                Update(vec![(-1, -1.0 / 3.0)]),
                Predict(vec![(0, -9.0 / 8.0), (1, -3.0 / 8.0)]),
                Update(vec![(-1, 3.0 / 36.0), (0, 16.0 / 36.0), (1, -3.0 / 36.0)]),
            ],
            WaveletFamily::Bior44 => {
                const ALPHA: f32 = -1.586_134_3;
                const BETA: f32 = -0.052_980_12;
                const GAMMA: f32 = 0.882_911_1;
                const DELTA: f32 = 0.443_506_85;
                vec![
                    Predict(vec![(0, ALPHA), (1, ALPHA)]),
                    Update(vec![(-1, BETA), (0, BETA)]),
                    Predict(vec![(0, GAMMA), (1, GAMMA)]),
                    Update(vec![(-1, DELTA), (0, DELTA)]),
                ]
            }
        }
    }
}

impl fmt::Display for WaveletFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How signals are extended past block edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoundaryMode {
    /// Symmetric, half-point: `... x1 x0 | x0 x1 ...`
    Symh,
    /// Symmetric, whole-point: `... x2 x1 | x0 x1 x2 ...`
    Symw,
    /// Periodic
    Per,
    /// Nearest value (zero-order hold)
    Sp0,
}

impl BoundaryMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "symh" => Some(BoundaryMode::Symh),
            "symw" => Some(BoundaryMode::Symw),
            "per" => Some(BoundaryMode::Per),
            "sp0" => Some(BoundaryMode::Sp0),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BoundaryMode::Symh => "symh",
            BoundaryMode::Symw => "symw",
            BoundaryMode::Per => "per",
            BoundaryMode::Sp0 => "sp0",
        }
    }

    /// Map a possibly out-of-range index onto `[0, n)`
    pub fn reflect(&self, k: isize, n: usize) -> usize {
        let n = n as isize;
        if n <= 1 {
            return 0;
        }
        let r = match self {
            BoundaryMode::Per => k.rem_euclid(n),
            BoundaryMode::Symw => {
                let period = 2 * n - 2;
                let m = k.rem_euclid(period);
                if m >= n {
                    period - m
                } else {
                    m
                }
            }
            BoundaryMode::Symh => {
                let period = 2 * n;
                let m = k.rem_euclid(period);
                if m >= n {
                    period - 1 - m
                } else {
                    m
                }
            }
            BoundaryMode::Sp0 => k.clamp(0, n - 1),
        };
        r as usize
    }
}

impl fmt::Display for BoundaryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// True when the boundary extension preserves the wavelet's symmetry, so
/// every level halves the coefficient count without edge artifacts.
pub fn is_symmetric_compatible(family: WaveletFamily, mode: BoundaryMode) -> bool {
    match (family.symmetry(), mode) {
        (_, BoundaryMode::Per) => true,
        (Symmetry::Any, _) => true,
        (Symmetry::WholePoint, BoundaryMode::Symw) => true,
        (Symmetry::HalfPoint, BoundaryMode::Symh) => true,
        _ => false,
    }
}

/// Number of transform levels supported along one axis of length `n`
pub fn axis_levels(n: usize, family: WaveletFamily) -> usize {
    if n <= 1 {
        return 0;
    }
    let support = family.filter_length() - 1;
    let mut by_filter = 0;
    while n >= support << (by_filter + 1) {
        by_filter += 1;
    }
    let by_divisibility = n.trailing_zeros() as usize;
    by_filter.min(by_divisibility)
}

enum Lift {
    /// `d[j] += sum(c * s[j + off])`
    Predict(Vec<(isize, f32)>),
    /// `s[j] += sum(c * d[j + off])`
    Update(Vec<(isize, f32)>),
}

/// Index into the even (`parity` 0) or odd (`parity` 1) subsequence of a
/// signal of length `2 * half`, extended past its edges.
fn sub_index(j: isize, parity: usize, half: usize, mode: BoundaryMode) -> usize {
    if j >= 0 && (j as usize) < half {
        return j as usize;
    }
    let n = 2 * half;
    let mut k = mode.reflect(2 * j + parity as isize, n);
    if k % 2 != parity {
        k = if k > 0 { k - 1 } else { k + 1 };
    }
    ((k - parity) / 2).min(half - 1)
}

fn apply(step: &Lift, s: &mut [f32], d: &mut [f32], sign: f32, mode: BoundaryMode) {
    let half = s.len();
    match step {
        Lift::Predict(taps) => {
            for j in 0..half {
                let mut acc = 0.0f32;
                for &(off, c) in taps {
                    acc += c * s[sub_index(j as isize + off, 0, half, mode)];
                }
                d[j] += sign * acc;
            }
        }
        Lift::Update(taps) => {
            for j in 0..half {
                let mut acc = 0.0f32;
                for &(off, c) in taps {
                    acc += c * d[sub_index(j as isize + off, 1, half, mode)];
                }
                s[j] += sign * acc;
            }
        }
    }
}

/// One-dimensional lifting scheme for a wavelet family
struct Lifting {
    steps: Vec<Lift>,
    low_scale: f32,
    high_scale: f32,
}

impl Lifting {
    fn new(family: WaveletFamily) -> Self {
        let steps = family.steps();
        // DC gain of the unnormalized low band
        let mut s = vec![1.0f32; 4];
        let mut d = vec![1.0f32; 4];
        for step in &steps {
            apply(step, &mut s, &mut d, 1.0, BoundaryMode::Per);
        }
        let gain = s[0];
        Self {
            steps,
            low_scale: std::f32::consts::SQRT_2 / gain,
            high_scale: gain / std::f32::consts::SQRT_2,
        }
    }

    fn forward(&self, line: &mut [f32], s: &mut Vec<f32>, d: &mut Vec<f32>, mode: BoundaryMode) {
        let half = line.len() / 2;
        s.clear();
        d.clear();
        s.extend(line.iter().step_by(2));
        d.extend(line.iter().skip(1).step_by(2));
        for step in &self.steps {
            apply(step, s, d, 1.0, mode);
        }
        for j in 0..half {
            line[j] = s[j] * self.low_scale;
            line[half + j] = d[j] * self.high_scale;
        }
    }

    fn inverse(&self, line: &mut [f32], s: &mut Vec<f32>, d: &mut Vec<f32>, mode: BoundaryMode) {
        let half = line.len() / 2;
        s.clear();
        d.clear();
        s.extend(line[..half].iter().map(|v| v / self.low_scale));
        d.extend(line[half..2 * half].iter().map(|v| v / self.high_scale));
        for step in self.steps.iter().rev() {
            apply(step, s, d, -1.0, mode);
        }
        for j in 0..half {
            line[2 * j] = s[j];
            line[2 * j + 1] = d[j];
        }
    }
}

/// Reusable per-thread buffers
#[derive(Debug, Default)]
pub struct Scratch {
    line: Vec<f32>,
    low: Vec<f32>,
    high: Vec<f32>,
}

/// Multi-level separable transform for a fixed block shape
pub struct WaveletTransform {
    family: WaveletFamily,
    mode: BoundaryMode,
    dims: [usize; 3],
    levels: usize,
    lifting: Lifting,
}

impl fmt::Debug for WaveletTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaveletTransform")
            .field("family", &self.family)
            .field("mode", &self.mode)
            .field("dims", &self.dims)
            .field("levels", &self.levels)
            .finish()
    }
}

impl WaveletTransform {
    /// Build a transform; `max_levels` caps the level count (used to keep 2D
    /// variables in step with 3D ones).
    pub fn new(
        dims: [usize; 3],
        family: WaveletFamily,
        mode: BoundaryMode,
        max_levels: Option<usize>,
    ) -> Result<Self> {
        if dims.iter().any(|&d| d == 0) {
            return Err(VdsError::InvalidDimensions(format!(
                "block dimensions must be non-zero: {:?}",
                dims
            )));
        }
        let levels = dims
            .iter()
            .filter(|&&n| n > 1)
            .map(|&n| axis_levels(n, family))
            .min()
            .unwrap_or(0);
        let levels = max_levels.map_or(levels, |cap| levels.min(cap));
        Ok(Self {
            family,
            mode,
            dims,
            levels,
            lifting: Lifting::new(family),
        })
    }

    pub fn family(&self) -> WaveletFamily {
        self.family
    }

    pub fn mode(&self) -> BoundaryMode {
        self.mode
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of axes with extent greater than one
    pub fn active_dims(&self) -> usize {
        self.dims.iter().filter(|&&n| n > 1).count()
    }

    /// Extents of the approximation corner after `level` transform levels
    pub fn extents_at(&self, level: usize) -> [usize; 3] {
        self.dims.map(|n| if n > 1 { n >> level } else { 1 })
    }

    /// Positions of the coarsest approximation coefficients, ascending
    pub fn approx_positions(&self) -> Vec<usize> {
        let e = self.extents_at(self.levels);
        let mut out = Vec::with_capacity(e.iter().product());
        for z in 0..e[2] {
            for y in 0..e[1] {
                for x in 0..e[0] {
                    out.push(x + self.dims[0] * (y + self.dims[1] * z));
                }
            }
        }
        out
    }

    /// In-place forward transform
    pub fn forward(&self, data: &mut [f32], scratch: &mut Scratch) -> Result<()> {
        self.check_len(data)?;
        for level in 0..self.levels {
            let extents = self.extents_at(level);
            for axis in 0..3 {
                if self.dims[axis] > 1 {
                    self.each_line(data, extents, axis, scratch, true);
                }
            }
        }
        Ok(())
    }

    /// In-place inverse transform, stopping `skip_levels` short of full
    /// resolution. With `skip_levels > 0` the valid output is the
    /// approximation corner `extents_at(skip_levels)`, rescaled to data units.
    pub fn inverse(&self, data: &mut [f32], skip_levels: usize, scratch: &mut Scratch) -> Result<()> {
        self.check_len(data)?;
        if skip_levels > self.levels {
            return Err(VdsError::OutOfBounds(format!(
                "cannot skip {} of {} transform levels",
                skip_levels, self.levels
            )));
        }
        for level in (skip_levels..self.levels).rev() {
            let extents = self.extents_at(level);
            for axis in (0..3).rev() {
                if self.dims[axis] > 1 {
                    self.each_line(data, extents, axis, scratch, false);
                }
            }
        }
        if skip_levels > 0 {
            let scale = std::f32::consts::SQRT_2.powi((self.active_dims() * skip_levels) as i32);
            let e = self.extents_at(skip_levels);
            for z in 0..e[2] {
                for y in 0..e[1] {
                    let base = self.dims[0] * (y + self.dims[1] * z);
                    for v in &mut data[base..base + e[0]] {
                        *v /= scale;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_len(&self, data: &[f32]) -> Result<()> {
        if data.len() != self.len() {
            return Err(VdsError::InvalidDimensions(format!(
                "block buffer has {} values, expected {}",
                data.len(),
                self.len()
            )));
        }
        Ok(())
    }

    fn each_line(
        &self,
        data: &mut [f32],
        extents: [usize; 3],
        axis: usize,
        scratch: &mut Scratch,
        forward: bool,
    ) {
        let strides = [1, self.dims[0], self.dims[0] * self.dims[1]];
        let (a, b) = match axis {
            0 => (1, 2),
            1 => (0, 2),
            _ => (0, 1),
        };
        let len = extents[axis];
        let Scratch { line, low, high } = scratch;
        for j in 0..extents[b] {
            for i in 0..extents[a] {
                let base = i * strides[a] + j * strides[b];
                line.clear();
                line.extend((0..len).map(|k| data[base + k * strides[axis]]));
                if forward {
                    self.lifting.forward(line, low, high, self.mode);
                } else {
                    self.lifting.inverse(line, low, high, self.mode);
                }
                for (k, v) in line.iter().enumerate() {
                    data[base + k * strides[axis]] = *v;
                }
            }
        }
    }
}
