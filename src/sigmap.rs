//! Significance maps: which coefficient positions a LOD slice carries

use crate::error::{Result, VdsError};
use bytes::{Buf, BufMut};

/// Set of retained coefficient positions within a block of `num_coeffs`
/// coefficients.
///
/// Positions are kept as a list; `sort` must be called after `set`/`append`
/// before the map is encoded or tested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignificanceMap {
    num_coeffs: usize,
    positions: Vec<u32>,
    sorted: bool,
}

impl SignificanceMap {
    pub fn new(num_coeffs: usize) -> Self {
        Self {
            num_coeffs,
            positions: Vec::new(),
            sorted: true,
        }
    }

    /// Build a sorted map from arbitrary positions
    pub fn from_positions(num_coeffs: usize, positions: impl IntoIterator<Item = usize>) -> Result<Self> {
        let mut map = Self::new(num_coeffs);
        for pos in positions {
            map.set(pos)?;
        }
        map.sort();
        Ok(map)
    }

    pub fn num_coeffs(&self) -> usize {
        self.num_coeffs
    }

    /// Number of set positions
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.sorted = true;
    }

    pub fn set(&mut self, pos: usize) -> Result<()> {
        if pos >= self.num_coeffs {
            return Err(VdsError::OutOfBounds(format!(
                "coefficient position {} >= {}",
                pos, self.num_coeffs
            )));
        }
        if let Some(&last) = self.positions.last() {
            if last as usize >= pos {
                self.sorted = false;
            }
        }
        self.positions.push(pos as u32);
        Ok(())
    }

    pub fn test(&self, pos: usize) -> bool {
        if self.sorted {
            self.positions.binary_search(&(pos as u32)).is_ok()
        } else {
            self.positions.contains(&(pos as u32))
        }
    }

    /// Merge another map's positions into this one
    pub fn append(&mut self, other: &SignificanceMap) -> Result<()> {
        if other.num_coeffs != self.num_coeffs {
            return Err(VdsError::InvalidData(format!(
                "cannot merge maps over {} and {} coefficients",
                other.num_coeffs, self.num_coeffs
            )));
        }
        self.positions.extend_from_slice(&other.positions);
        self.sorted = false;
        Ok(())
    }

    /// Sort ascending and drop duplicates
    pub fn sort(&mut self) {
        if !self.sorted {
            self.positions.sort_unstable();
            self.positions.dedup();
            self.sorted = true;
        }
    }

    /// Complement over `[0, num_coeffs)`
    pub fn invert(&mut self) {
        self.sort();
        let mut out = Vec::with_capacity(self.num_coeffs - self.positions.len());
        let mut next = self.positions.iter().peekable();
        for pos in 0..self.num_coeffs as u32 {
            if next.peek() == Some(&&pos) {
                next.next();
            } else {
                out.push(pos);
            }
        }
        self.positions = out;
    }

    /// Positions in ascending order
    pub fn positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.positions.iter().map(|&p| p as usize)
    }

    fn uses_list(num_set: usize, num_coeffs: usize) -> bool {
        4 * num_set < num_coeffs.div_ceil(8)
    }

    /// Encoded size in bytes of a map with `num_set` of `num_coeffs` positions
    pub fn map_size(num_set: usize, num_coeffs: usize) -> usize {
        (4 * num_set).min(num_coeffs.div_ceil(8))
    }

    /// Encode the (sorted) map
    pub fn get_map(&self) -> Result<Vec<u8>> {
        if !self.sorted {
            return Err(VdsError::InvalidData(
                "significance map must be sorted before encoding".to_string(),
            ));
        }
        let size = Self::map_size(self.len(), self.num_coeffs);
        let mut buf = Vec::with_capacity(size);
        if Self::uses_list(self.len(), self.num_coeffs) {
            for &pos in &self.positions {
                buf.put_u32_le(pos);
            }
        } else {
            buf.resize(size, 0u8);
            for &pos in &self.positions {
                buf[pos as usize / 8] |= 1 << (pos % 8);
            }
        }
        Ok(buf)
    }

    /// Decode a map holding exactly `num_set` positions
    pub fn set_map(&mut self, mut encoded: &[u8], num_set: usize) -> Result<()> {
        let size = Self::map_size(num_set, self.num_coeffs);
        if encoded.len() != size {
            return Err(VdsError::InvalidFormat(format!(
                "significance map is {} bytes, expected {}",
                encoded.len(),
                size
            )));
        }
        self.positions.clear();
        self.positions.reserve(num_set);
        if Self::uses_list(num_set, self.num_coeffs) {
            while encoded.has_remaining() {
                let pos = encoded.get_u32_le();
                if pos as usize >= self.num_coeffs
                    || self.positions.last().is_some_and(|&last| last >= pos)
                {
                    return Err(VdsError::InvalidFormat(
                        "significance map positions out of order".to_string(),
                    ));
                }
                self.positions.push(pos);
            }
        } else {
            for (byte_idx, &byte) in encoded.iter().enumerate() {
                if byte == 0 {
                    continue;
                }
                for bit in 0..8 {
                    if byte & (1 << bit) != 0 {
                        let pos = byte_idx * 8 + bit;
                        if pos >= self.num_coeffs {
                            return Err(VdsError::InvalidFormat(
                                "significance map bit past end".to_string(),
                            ));
                        }
                        self.positions.push(pos as u32);
                    }
                }
            }
        }
        self.sorted = true;
        if self.positions.len() != num_set {
            return Err(VdsError::InvalidFormat(format!(
                "significance map holds {} positions, expected {}",
                self.positions.len(),
                num_set
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_map_uses_list() {
        let map = SignificanceMap::from_positions(4096, [900, 3, 17]).unwrap();
        let bytes = map.get_map().unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(SignificanceMap::map_size(3, 4096), 12);

        let mut decoded = SignificanceMap::new(4096);
        decoded.set_map(&bytes, 3).unwrap();
        assert_eq!(decoded.positions().collect::<Vec<_>>(), vec![3, 17, 900]);
        assert!(decoded.test(17));
        assert!(!decoded.test(18));
    }

    #[test]
    fn test_dense_map_uses_bitmap() {
        let map = SignificanceMap::from_positions(64, (0..64).step_by(2)).unwrap();
        let bytes = map.get_map().unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[0], 0b0101_0101);

        let mut decoded = SignificanceMap::new(64);
        decoded.set_map(&bytes, 32).unwrap();
        assert_eq!(decoded, map);
        assert!(decoded.set_map(&bytes, 31).is_err());
    }

    #[test]
    fn test_append_and_invert() {
        let mut a = SignificanceMap::from_positions(10, [1, 5]).unwrap();
        let b = SignificanceMap::from_positions(10, [5, 7]).unwrap();
        a.append(&b).unwrap();
        a.sort();
        assert_eq!(a.positions().collect::<Vec<_>>(), vec![1, 5, 7]);
        a.invert();
        assert_eq!(a.positions().collect::<Vec<_>>(), vec![0, 2, 3, 4, 6, 8, 9]);
        assert!(a.set(10).is_err());
        assert!(a.append(&SignificanceMap::new(11)).is_err());
    }

    #[test]
    fn test_unsorted_map_refuses_encoding() {
        let mut map = SignificanceMap::new(100);
        map.set(9).unwrap();
        map.set(2).unwrap();
        assert!(map.get_map().is_err());
        map.sort();
        assert!(map.get_map().is_ok());
    }

    #[test]
    fn test_list_decoding_rejects_disorder() {
        let mut bytes = Vec::new();
        bytes.put_u32_le(40);
        bytes.put_u32_le(8);
        let mut map = SignificanceMap::new(4096);
        assert!(map.set_map(&bytes, 2).is_err());
    }
}
