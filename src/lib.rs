//! WaveVDS - wavelet-compressed multiresolution volume data store
//!
//! Stores 3D and 2D scalar fields on a block grid. Each block is wavelet
//! transformed and its coefficients are split into progressively refined
//! levels of detail (LODs), one file per variable instance and LOD, so a
//! reader can trade accuracy for I/O by choosing the LOD and trade
//! resolution for I/O by choosing a coarser refinement level.
//!
//! # Features
//!
//! - Lifting wavelets (haar, bior2.2, bior3.3, bior4.4) with symmetric and periodic
//!   boundary extension
//! - Embedded LOD files addressed by block index, written and read in
//!   ascending block order by a worker pool
//! - Missing-value masks, valid-region tracking and recorded data ranges
//! - A region cache with LRU eviction, grid locking and derived variables
//!   computed by registered pipeline stages
//! - Async access through tokio
//!
//! # Example
//!
//! ```rust,ignore
//! use wavevds::{BlockStore, DatasetMetadata, StoreConfig, VarType, VariableDescriptor};
//!
//! # fn example() -> wavevds::Result<()> {
//! let metadata = DatasetMetadata::new([200, 200, 200], [64, 64, 64])
//!     .with_cratios(vec![1, 10, 100, 500])
//!     .with_variable(VariableDescriptor::new("temp", VarType::Var3D))?;
//! let store = BlockStore::create("/data/run1", metadata, StoreConfig::default())?;
//!
//! let mut writer = store.open_writer("temp", 0)?;
//! writer.write_region([0, 0, 0], [199, 199, 199], &vec![5.0; 200 * 200 * 200])?;
//! writer.close()?;
//!
//! // Coarsest LOD at half resolution
//! let mut reader = store.open_reader("temp", 0, store.max_reflevel() - 1, 0)?;
//! let data = reader.read_region([0, 0, 0], [99, 99, 99])?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod cache;
pub mod collective;
pub mod compression;
pub mod config;
pub mod error;
pub mod grid;
pub mod io;
pub mod layout;
pub mod mask;
pub mod metadata;
pub mod padding;
pub mod pipeline;
pub mod pool;
pub mod quantize;
pub mod reader;
pub mod sigmap;
pub mod store;
pub mod types;
pub mod utils;
pub mod wavelet;
pub mod writer;

// Re-exports
pub use access::{RegionRequest, VolumeDataAccess};
pub use cache::{CacheLookup, CacheStats, GridHandle, PendingRead, RegionCache};
pub use collective::{Collective, SingleProcess};
pub use compression::BlockCompressor;
pub use config::StoreConfig;
pub use error::{ErrorRegister, Result, VdsError};
pub use grid::Grid;
pub use layout::VolumeLayout;
pub use metadata::{DatasetMetadata, VariableDescriptor, VariableInfo};
pub use pipeline::{FnStage, PipelineRegistry, PipelineStage};
pub use quantize::{QuantizedData, Quantization};
pub use reader::VariableReader;
pub use sigmap::SignificanceMap;
pub use store::BlockStore;
pub use types::{ValueRange, VarType, VoxelBox};
pub use wavelet::{BoundaryMode, WaveletFamily};
pub use writer::VariableWriter;

/// Version of the WaveVDS implementation
pub const WAVEVDS_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!WAVEVDS_VERSION.is_empty());
    }
}
