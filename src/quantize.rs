//! Linear mapping of float grids into unsigned integer ranges

use crate::error::{Result, VdsError};
use crate::types::ValueRange;
use num_traits::{Bounded, NumCast, ToPrimitive, Unsigned};
use serde::{Deserialize, Serialize};

/// Target integer width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quantization {
    U8,
    U16,
}

/// Quantized voxels in x-fastest order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuantizedData {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl QuantizedData {
    pub fn len(&self) -> usize {
        match self {
            QuantizedData::U8(v) => v.len(),
            QuantizedData::U16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Map `range.min..=range.max` onto `0..=T::MAX`. Values outside the range
/// saturate; non-finite values and `skip` matches map to zero.
pub fn quantize<T>(values: &[f32], range: ValueRange, skip: impl Fn(f32) -> bool) -> Result<Vec<T>>
where
    T: Bounded + NumCast + ToPrimitive + Unsigned + Copy,
{
    if !range.is_valid() {
        return Err(VdsError::InvalidData(format!(
            "quantization range {:?}",
            range
        )));
    }
    let top = T::max_value().to_f64().unwrap_or(0.0);
    let (lo, hi) = (range.min as f64, range.max as f64);
    let scale = if hi > lo { top / (hi - lo) } else { 0.0 };

    Ok(values
        .iter()
        .map(|&v| {
            if !v.is_finite() || skip(v) {
                return T::zero();
            }
            let q = ((v as f64 - lo) * scale).round().clamp(0.0, top);
            <T as NumCast>::from(q).unwrap_or_else(T::zero)
        })
        .collect())
}

/// Quantize to the requested width
pub fn quantize_as(
    values: &[f32],
    range: ValueRange,
    width: Quantization,
    skip: impl Fn(f32) -> bool,
) -> Result<QuantizedData> {
    Ok(match width {
        Quantization::U8 => QuantizedData::U8(quantize(values, range, skip)?),
        Quantization::U16 => QuantizedData::U16(quantize(values, range, skip)?),
    })
}
