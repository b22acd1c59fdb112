//! Per-(variable, LOD) coefficient files
//!
//! Layout: magic `WVC\0`, little-endian u32 header length, bincode
//! [`LodFileHeader`], then one fixed-size record per block in linear block
//! order. Record: present flag, LOD coefficient slice (f32 LE), encoded
//! significance map (when stored), missing-value mask (LOD 0 only).

use crate::error::{Result, VdsError};
use crate::types::{ValueRange, VarType, VoxelBox};
use crate::wavelet::{BoundaryMode, WaveletFamily};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic number opening every LOD file
pub const LOD_MAGIC: &[u8; 4] = b"WVC\0";

/// Current LOD file format version
pub const LOD_FORMAT_VERSION: u32 = 1;

/// Fixed-size header of a LOD file. Every field has a fixed bincode
/// encoding so the header can be rewritten in place at close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LodFileHeader {
    pub version: u32,
    /// Compression-level index of this file
    pub lod: u32,
    pub cratio: u32,
    pub wavelet: WaveletFamily,
    pub boundary_mode: BoundaryMode,
    pub var_type: VarType,
    pub block_size: [u32; 3],
    /// Native packed dimensions
    pub dims: [u32; 3],
    /// Blocks per axis (`VolumeDimNbx`, `VolumeDimNby`, `VolumeDimNbz`)
    pub blocks: [u32; 3],
    /// Coefficients per block in this LOD's slice
    pub num_coeffs: u32,
    pub sigmap_len: u32,
    pub mask_len: u32,
    pub map_stored: bool,
    pub has_range: bool,
    pub data_min: f32,
    pub data_max: f32,
    pub has_valid_region: bool,
    pub valid_min: [u32; 3],
    pub valid_max: [u32; 3],
}

impl LodFileHeader {
    /// Record payload length in bytes (`CoeffDim`)
    pub fn coeff_dim(&self) -> usize {
        4 * self.num_coeffs as usize
            + if self.map_stored { self.sigmap_len as usize } else { 0 }
            + self.mask_len as usize
    }

    /// Record length including the present flag
    pub fn record_len(&self) -> usize {
        1 + self.coeff_dim()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.iter().map(|&b| b as usize).product()
    }

    pub fn data_range(&self) -> Option<ValueRange> {
        self.has_range
            .then(|| ValueRange::new(self.data_min, self.data_max))
    }

    pub fn set_data_range(&mut self, range: Option<ValueRange>) {
        match range {
            Some(r) => {
                self.has_range = true;
                self.data_min = r.min;
                self.data_max = r.max;
            }
            None => {
                self.has_range = false;
                self.data_min = 0.0;
                self.data_max = 0.0;
            }
        }
    }

    pub fn valid_region(&self) -> Option<VoxelBox> {
        self.has_valid_region.then(|| VoxelBox {
            min: self.valid_min.map(|v| v as usize),
            max: self.valid_max.map(|v| v as usize),
        })
    }

    pub fn set_valid_region(&mut self, region: Option<VoxelBox>) {
        match region {
            Some(r) => {
                self.has_valid_region = true;
                self.valid_min = r.min.map(|v| v as u32);
                self.valid_max = r.max.map(|v| v as u32);
            }
            None => {
                self.has_valid_region = false;
                self.valid_min = [0; 3];
                self.valid_max = [0; 3];
            }
        }
    }

    /// True when both headers describe the same geometry and codec
    pub fn same_layout(&self, other: &LodFileHeader) -> bool {
        self.version == other.version
            && self.lod == other.lod
            && self.cratio == other.cratio
            && self.wavelet == other.wavelet
            && self.boundary_mode == other.boundary_mode
            && self.var_type == other.var_type
            && self.block_size == other.block_size
            && self.dims == other.dims
            && self.blocks == other.blocks
            && self.num_coeffs == other.num_coeffs
            && self.sigmap_len == other.sigmap_len
            && self.mask_len == other.mask_len
            && self.map_stored == other.map_stored
    }
}

/// One block's payload within a LOD file
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    pub coeffs: Vec<f32>,
    pub map: Option<Vec<u8>>,
    pub mask: Option<Vec<u8>>,
}

impl BlockRecord {
    fn encode(&self, header: &LodFileHeader) -> Result<BytesMut> {
        if self.coeffs.len() != header.num_coeffs as usize {
            return Err(VdsError::InvalidData(format!(
                "record holds {} coefficients, file expects {}",
                self.coeffs.len(),
                header.num_coeffs
            )));
        }
        let mut buf = BytesMut::with_capacity(header.record_len());
        buf.put_u8(1);
        for &c in &self.coeffs {
            buf.put_f32_le(c);
        }
        if header.map_stored {
            match &self.map {
                Some(map) if map.len() == header.sigmap_len as usize => buf.put_slice(map),
                _ => {
                    return Err(VdsError::InvalidData(
                        "significance map missing or of wrong length".to_string(),
                    ))
                }
            }
        }
        if header.mask_len > 0 {
            match &self.mask {
                Some(mask) if mask.len() == header.mask_len as usize => buf.put_slice(mask),
                None => buf.put_bytes(0, header.mask_len as usize),
                _ => {
                    return Err(VdsError::InvalidData(
                        "missing-value mask of wrong length".to_string(),
                    ))
                }
            }
        }
        Ok(buf)
    }

    fn decode(mut bytes: &[u8], header: &LodFileHeader) -> Option<Self> {
        if bytes.get_u8() == 0 {
            return None;
        }
        let coeffs = (0..header.num_coeffs).map(|_| bytes.get_f32_le()).collect();
        let map = header.map_stored.then(|| {
            let map = bytes[..header.sigmap_len as usize].to_vec();
            bytes.advance(header.sigmap_len as usize);
            map
        });
        let mask = (header.mask_len > 0).then(|| bytes[..header.mask_len as usize].to_vec());
        Some(Self { coeffs, map, mask })
    }
}

/// Open LOD file with random access to its block records
#[derive(Debug)]
pub struct LodFile {
    path: PathBuf,
    file: File,
    header: LodFileHeader,
    header_len: usize,
}

impl LodFile {
    /// Create (or truncate) a file with every block absent
    pub fn create(path: impl AsRef<Path>, header: LodFileHeader) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoded = bincode::serialize(&header)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(LOD_MAGIC)?;
        file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        file.write_all(&encoded)?;
        let header_len = encoded.len();
        let data_offset = 8 + header_len;
        file.set_len((data_offset + header.num_blocks() * header.record_len()) as u64)?;
        Ok(Self {
            path,
            file,
            header,
            header_len,
        })
    }

    /// Open an existing file, read-only unless `writable`
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|e| VdsError::NotFound(format!("{}: {}", path.display(), e)))?;
        let mut prefix = [0u8; 8];
        file.read_exact(&mut prefix)?;
        if &prefix[..4] != LOD_MAGIC {
            return Err(VdsError::InvalidFormat(format!(
                "{} is not a LOD file",
                path.display()
            )));
        }
        let header_len = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
        let mut encoded = vec![0u8; header_len];
        file.read_exact(&mut encoded)?;
        let header: LodFileHeader = bincode::deserialize(&encoded)?;
        if header.version != LOD_FORMAT_VERSION {
            return Err(VdsError::UnsupportedVersion(header.version));
        }
        let expected = (8 + header_len + header.num_blocks() * header.record_len()) as u64;
        if file.metadata()?.len() < expected {
            return Err(VdsError::InvalidFormat(format!(
                "{} truncated: {} bytes, expected {}",
                path.display(),
                file.metadata()?.len(),
                expected
            )));
        }
        Ok(Self {
            path,
            file,
            header,
            header_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &LodFileHeader {
        &self.header
    }

    fn record_offset(&self, index: usize) -> Result<u64> {
        if index >= self.header.num_blocks() {
            return Err(VdsError::OutOfBounds(format!(
                "block {} >= {} in {}",
                index,
                self.header.num_blocks(),
                self.path.display()
            )));
        }
        Ok((8 + self.header_len + index * self.header.record_len()) as u64)
    }

    pub fn write_record(&mut self, index: usize, record: &BlockRecord) -> Result<()> {
        let offset = self.record_offset(index)?;
        let bytes = record.encode(&self.header)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }

    /// Read a block record, `None` when the block was never written
    pub fn read_record(&mut self, index: usize) -> Result<Option<BlockRecord>> {
        let offset = self.record_offset(index)?;
        let mut bytes = vec![0u8; self.header.record_len()];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut bytes)?;
        Ok(BlockRecord::decode(&bytes, &self.header))
    }

    /// Replace the header in place; only range and valid-region fields may
    /// change.
    pub fn rewrite_header(&mut self, header: LodFileHeader) -> Result<()> {
        if !self.header.same_layout(&header) {
            return Err(VdsError::InvalidData(format!(
                "header rewrite changes the layout of {}",
                self.path.display()
            )));
        }
        let encoded = bincode::serialize(&header)?;
        if encoded.len() != self.header_len {
            return Err(VdsError::InvalidFormat(format!(
                "header length changed from {} to {}",
                self.header_len,
                encoded.len()
            )));
        }
        self.file.seek(SeekFrom::Start(8))?;
        self.file.write_all(&encoded)?;
        self.file.flush()?;
        self.header = header;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn header(map_stored: bool, mask_len: u32) -> LodFileHeader {
        LodFileHeader {
            version: LOD_FORMAT_VERSION,
            lod: 0,
            cratio: 8,
            wavelet: WaveletFamily::Haar,
            boundary_mode: BoundaryMode::Per,
            var_type: VarType::Var3D,
            block_size: [8, 8, 8],
            dims: [20, 8, 8],
            blocks: [3, 1, 1],
            num_coeffs: 4,
            sigmap_len: 16,
            mask_len,
            map_stored,
            has_range: false,
            data_min: 0.0,
            data_max: 0.0,
            has_valid_region: false,
            valid_min: [0; 3],
            valid_max: [0; 3],
        }
    }

    #[test]
    fn test_write_and_read_records() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data/v/v.0000.nc0");
        let mut file = LodFile::create(&path, header(true, 64)).unwrap();

        let record = BlockRecord {
            coeffs: vec![1.0, -2.5, 3.0, 0.125],
            map: Some((0u8..16).collect()),
            mask: Some(vec![0xff; 64]),
        };
        file.write_record(2, &record).unwrap();
        assert_eq!(file.read_record(2).unwrap(), Some(record));
        assert_eq!(file.read_record(0).unwrap(), None);
        assert!(file.read_record(3).is_err());

        drop(file);
        let mut reopened = LodFile::open(&path, false).unwrap();
        assert_eq!(reopened.header().coeff_dim(), 16 + 16 + 64);
        assert!(reopened.read_record(2).unwrap().is_some());
    }

    #[test]
    fn test_record_without_map_or_mask() {
        let temp_dir = TempDir::new().unwrap();
        let mut file = LodFile::create(temp_dir.path().join("x.nc1"), header(false, 0)).unwrap();
        let record = BlockRecord {
            coeffs: vec![0.5; 4],
            map: None,
            mask: None,
        };
        file.write_record(0, &record).unwrap();
        assert_eq!(file.read_record(0).unwrap(), Some(record));

        let wrong = BlockRecord {
            coeffs: vec![0.5; 3],
            map: None,
            mask: None,
        };
        assert!(file.write_record(1, &wrong).is_err());
    }

    #[test]
    fn test_header_rewrite_keeps_length() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("x.nc0");
        let mut file = LodFile::create(&path, header(true, 0)).unwrap();

        let mut updated = file.header().clone();
        updated.set_data_range(Some(ValueRange::new(-1.0, 4.0)));
        updated.set_valid_region(Some(VoxelBox::new([0, 0, 0], [19, 7, 7]).unwrap()));
        file.rewrite_header(updated).unwrap();

        let mut other = file.header().clone();
        other.num_coeffs = 5;
        assert!(file.rewrite_header(other).is_err());

        drop(file);
        let reopened = LodFile::open(&path, false).unwrap();
        assert_eq!(reopened.header().data_range(), Some(ValueRange::new(-1.0, 4.0)));
        assert_eq!(
            reopened.header().valid_region().unwrap().max,
            [19, 7, 7]
        );
    }

    #[test]
    fn test_rejects_foreign_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("junk");
        std::fs::write(&path, b"NOTAFILEATALL").unwrap();
        assert!(matches!(
            LodFile::open(&path, false),
            Err(VdsError::InvalidFormat(_))
        ));
        assert!(matches!(
            LodFile::open(temp_dir.path().join("missing"), false),
            Err(VdsError::NotFound(_))
        ));
    }
}
