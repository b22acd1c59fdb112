//! Dataset description persisted as `metadata.json`

use crate::error::{Result, VdsError};
use crate::types::{ValueRange, VarType, VoxelBox};
use crate::wavelet::{BoundaryMode, WaveletFamily};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Name of the description file at the dataset root
pub const METADATA_FILE: &str = "metadata.json";

/// Dataset format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// A variable declared in the dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDescriptor {
    pub name: String,
    pub var_type: VarType,
    /// Sentinel marking missing voxels; NaN is treated as missing as well
    pub missing_value: Option<f32>,
}

impl VariableDescriptor {
    pub fn new(name: impl Into<String>, var_type: VarType) -> Self {
        Self {
            name: name.into(),
            var_type,
            missing_value: None,
        }
    }

    pub fn with_missing_value(mut self, value: f32) -> Self {
        self.missing_value = Some(value);
        self
    }
}

/// Per-timestep state of a variable as recorded in its file headers
#[derive(Debug, Clone, PartialEq)]
pub struct VariableInfo {
    pub name: String,
    pub var_type: VarType,
    pub timestep: usize,
    pub missing_value: Option<f32>,
    pub data_range: Option<ValueRange>,
    /// Native-resolution valid region, packed coordinates
    pub valid_region: Option<VoxelBox>,
    /// LOD files present on disk
    pub num_lods: usize,
}

/// Complete description of a dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub version: FormatVersion,

    /// Volume dimensions (x, y, z) at native resolution
    pub dims: [usize; 3],

    /// Block extents for 3D variables; 2D variables use the matching pair
    pub block_size: [usize; 3],

    pub wavelet: WaveletFamily,

    pub boundary_mode: BoundaryMode,

    /// Compression ratio per LOD, as given (sorted largest first on use)
    pub cratios: Vec<usize>,

    pub variables: Vec<VariableDescriptor>,

    pub num_timesteps: usize,

    pub created_at: DateTime<Utc>,

    pub modified_at: DateTime<Utc>,

    pub custom_metadata: HashMap<String, String>,
}

impl DatasetMetadata {
    pub fn new(dims: [usize; 3], block_size: [usize; 3]) -> Self {
        let now = Utc::now();
        Self {
            version: FormatVersion::default(),
            dims,
            block_size,
            wavelet: WaveletFamily::Bior33,
            boundary_mode: BoundaryMode::Symh,
            cratios: vec![1],
            variables: Vec::new(),
            num_timesteps: 1,
            created_at: now,
            modified_at: now,
            custom_metadata: HashMap::new(),
        }
    }

    pub fn with_wavelet(mut self, wavelet: WaveletFamily, mode: BoundaryMode) -> Self {
        self.wavelet = wavelet;
        self.boundary_mode = mode;
        self
    }

    pub fn with_cratios(mut self, cratios: Vec<usize>) -> Self {
        self.cratios = cratios;
        self
    }

    pub fn with_timesteps(mut self, num_timesteps: usize) -> Self {
        self.num_timesteps = num_timesteps;
        self
    }

    pub fn with_variable(mut self, var: VariableDescriptor) -> Result<Self> {
        self.add_variable(var)?;
        Ok(self)
    }

    pub fn add_variable(&mut self, var: VariableDescriptor) -> Result<()> {
        if self.variable(&var.name).is_some() {
            return Err(VdsError::Configuration(format!(
                "variable {} declared twice",
                var.name
            )));
        }
        self.variables.push(var);
        Ok(())
    }

    pub fn variable(&self, name: &str) -> Option<&VariableDescriptor> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Look up a variable, failing with `UnknownVariable`
    pub fn require_variable(&self, name: &str) -> Result<&VariableDescriptor> {
        self.variable(name)
            .ok_or_else(|| VdsError::UnknownVariable(name.to_string()))
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.variables.iter().map(|v| v.name.clone()).collect()
    }

    pub fn num_lods(&self) -> usize {
        self.cratios.len()
    }

    /// Ratio schedule for a variable type. 2D blocks hold fewer
    /// coefficients, so ratios scale by the 2/3 power.
    pub fn cratios_for(&self, var_type: VarType) -> Vec<usize> {
        if var_type.is_3d() {
            return self.cratios.clone();
        }
        self.cratios
            .iter()
            .map(|&c| ((c as f64).powf(2.0 / 3.0).round() as usize).max(1))
            .collect()
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom_metadata.insert(key.into(), value.into());
    }

    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.custom_metadata.get(key).map(|s| s.as_str())
    }

    /// Update modification timestamp
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    pub fn validate(&self) -> Result<()> {
        if !self.version.is_compatible(&FormatVersion::CURRENT) {
            return Err(VdsError::UnsupportedVersion(self.version.major as u32));
        }
        if self.dims.iter().any(|&d| d == 0) {
            return Err(VdsError::Configuration(format!(
                "volume dimensions must be non-zero: {:?}",
                self.dims
            )));
        }
        if self.block_size.iter().any(|&b| b < 2) {
            return Err(VdsError::Configuration(format!(
                "block extents must be at least 2: {:?}",
                self.block_size
            )));
        }
        if self.cratios.is_empty() || self.cratios.contains(&0) {
            return Err(VdsError::Configuration(format!(
                "invalid compression ratio schedule {:?}",
                self.cratios
            )));
        }
        if self.num_timesteps == 0 {
            return Err(VdsError::Configuration(
                "dataset needs at least one timestep".to_string(),
            ));
        }
        if self.variables.is_empty() {
            return Err(VdsError::Configuration(
                "dataset declares no variables".to_string(),
            ));
        }
        Ok(())
    }

    /// Read and validate `metadata.json` under `root`
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let path = root.as_ref().join(METADATA_FILE);
        let bytes = std::fs::read(&path).map_err(|e| {
            VdsError::NotFound(format!("{}: {}", path.display(), e))
        })?;
        let metadata: DatasetMetadata =
            serde_json::from_slice(&bytes).map_err(|e| VdsError::Metadata(e.to_string()))?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Write `metadata.json` under `root`, creating the directory
    pub fn save(&self, root: impl AsRef<Path>) -> Result<()> {
        self.validate()?;
        std::fs::create_dir_all(root.as_ref())?;
        let json =
            serde_json::to_vec_pretty(self).map_err(|e| VdsError::Metadata(e.to_string()))?;
        std::fs::write(root.as_ref().join(METADATA_FILE), json)?;
        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "{} x {} x {} volume, blocks {:?}, {} {}, ratios {:?}, {} variables, {} timesteps",
            self.dims[0],
            self.dims[1],
            self.dims[2],
            self.block_size,
            self.wavelet,
            self.boundary_mode,
            self.cratios,
            self.variables.len(),
            self.num_timesteps
        )
    }
}

/// Path of the file holding one LOD of a variable instance
pub fn lod_file_path(root: &Path, var: &str, timestep: usize, lod: usize) -> PathBuf {
    root.join("data")
        .join(var)
        .join(format!("{}.{:04}.nc{}", var, timestep, lod))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> DatasetMetadata {
        DatasetMetadata::new([200, 200, 200], [64, 64, 64])
            .with_cratios(vec![1, 10, 100, 500])
            .with_variable(VariableDescriptor::new("temp", VarType::Var3D))
            .unwrap()
            .with_variable(VariableDescriptor::new("hgt", VarType::Var2DXY).with_missing_value(-999.0))
            .unwrap()
    }

    #[test]
    fn test_version_compatibility() {
        let v1_0 = FormatVersion::new(1, 0);
        let v1_2 = FormatVersion::new(1, 2);
        let v2_0 = FormatVersion::new(2, 0);

        assert!(v1_0.is_compatible(&v1_2));
        assert!(!v1_0.is_compatible(&v2_0));
    }

    #[test]
    fn test_variables() {
        let mut metadata = sample();
        assert_eq!(metadata.variable_names(), vec!["temp", "hgt"]);
        assert_eq!(metadata.variable("hgt").unwrap().missing_value, Some(-999.0));
        assert!(metadata.add_variable(VariableDescriptor::new("temp", VarType::Var3D)).is_err());
        assert!(matches!(
            metadata.require_variable("nope"),
            Err(VdsError::UnknownVariable(_))
        ));

        metadata.add_metadata("project", "hurricane");
        assert_eq!(metadata.get_metadata("project"), Some("hurricane"));
    }

    #[test]
    fn test_2d_ratio_schedule() {
        let metadata = sample();
        assert_eq!(metadata.cratios_for(VarType::Var3D), vec![1, 10, 100, 500]);
        assert_eq!(metadata.cratios_for(VarType::Var2DXY), vec![1, 5, 22, 63]);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let metadata = sample();
        metadata.save(dir.path()).unwrap();
        let loaded = DatasetMetadata::load(dir.path()).unwrap();
        assert_eq!(loaded.dims, [200, 200, 200]);
        assert_eq!(loaded.variables, metadata.variables);
        assert_eq!(loaded.created_at, metadata.created_at);
    }

    #[test]
    fn test_validate() {
        assert!(DatasetMetadata::new([10, 10, 10], [8, 8, 8]).validate().is_err());
        let bad = sample().with_cratios(vec![]);
        assert!(bad.validate().is_err());
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_lod_file_path() {
        let path = lod_file_path(Path::new("/data/run"), "temp", 7, 2);
        assert_eq!(path, PathBuf::from("/data/run/data/temp/temp.0007.nc2"));
    }
}
