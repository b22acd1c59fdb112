//! Utility functions

use crate::error::{Result, VdsError};

/// Decode raw little-endian `f32` samples
pub fn f32_from_le_bytes(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(VdsError::InvalidFormat(
            "Byte length not aligned with f32 size".to_string(),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Encode `f32` samples as raw little-endian bytes
pub fn f32_to_le_bytes(data: &[f32]) -> Vec<u8> {
    data.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Parse an extent triple written as `NXxNYxNZ` or `NX,NY,NZ`
pub fn parse_triple(text: &str) -> Result<[usize; 3]> {
    let parts: Vec<&str> = text
        .split(|c| c == 'x' || c == 'X' || c == ',')
        .map(str::trim)
        .collect();
    if parts.len() != 3 {
        return Err(VdsError::InvalidDimensions(format!(
            "expected three extents, got {:?}",
            text
        )));
    }
    let mut out = [0; 3];
    for (slot, part) in out.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .map_err(|_| VdsError::InvalidDimensions(format!("bad extent {:?} in {:?}", part, text)))?;
    }
    Ok(out)
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_conversion() {
        let data = vec![1.0f32, -2.5, 3.25];
        let bytes = f32_to_le_bytes(&data);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(f32_from_le_bytes(&bytes).unwrap(), data);
        assert!(f32_from_le_bytes(&bytes[..5]).is_err());
    }

    #[test]
    fn test_parse_triple() {
        assert_eq!(parse_triple("200x100x50").unwrap(), [200, 100, 50]);
        assert_eq!(parse_triple("64, 64, 32").unwrap(), [64, 64, 32]);
        assert!(parse_triple("64x64").is_err());
        assert!(parse_triple("ax1x1").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }
}
