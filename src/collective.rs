//! Reductions across cooperating writers

use crate::error::Result;

/// Communication seam used when several processes write disjoint parts of
/// the same variable. Each participant contributes its local values and
/// receives the element-wise reduction over all participants.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn all_reduce_min(&self, values: &mut [f64]) -> Result<()>;

    fn all_reduce_max(&self, values: &mut [f64]) -> Result<()>;
}

/// The only participant; reductions are identities
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_min(&self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn all_reduce_max(&self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }
}

/// Sentinels for participants with nothing to contribute
pub const EMPTY_MIN: f64 = f64::INFINITY;
pub const EMPTY_MAX: f64 = f64::NEG_INFINITY;
