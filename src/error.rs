//! Error types for WaveVDS operations

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for store, codec and cache operations
#[derive(Error, Debug)]
pub enum VdsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Metadata file and data file mismatch: {0}")]
    Mismatch(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Variable already open for writing: {0}")]
    AlreadyOpen(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Worker failure: {0}")]
    Worker(String),
}

impl VdsError {
    /// Negative status code for the error class.
    ///
    /// Configuration problems are `-1`, I/O and format problems `-2`,
    /// range violations `-3`, cache and pipeline failures `-4` and
    /// worker failures `-5`.
    pub fn code(&self) -> i32 {
        match self {
            VdsError::Configuration(_)
            | VdsError::Mismatch(_)
            | VdsError::Metadata(_)
            | VdsError::UnknownVariable(_)
            | VdsError::AlreadyOpen(_) => -1,
            VdsError::Io(_)
            | VdsError::InvalidFormat(_)
            | VdsError::UnsupportedVersion(_)
            | VdsError::Serialization(_)
            | VdsError::NotFound(_) => -2,
            VdsError::InvalidDimensions(_)
            | VdsError::OutOfBounds(_)
            | VdsError::InvalidData(_) => -3,
            VdsError::Cache(_) | VdsError::Pipeline(_) => -4,
            VdsError::Worker(_) => -5,
        }
    }
}

/// Specialized Result type for WaveVDS operations
pub type Result<T> = std::result::Result<T, VdsError>;

impl From<bincode::Error> for VdsError {
    fn from(err: bincode::Error) -> Self {
        VdsError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VdsError {
    fn from(err: serde_json::Error) -> Self {
        VdsError::Serialization(err.to_string())
    }
}

/// Descriptive message of the most recent failure seen by a context.
///
/// Cloning shares the register, so a store and the cache layered on top of
/// it report into the same place.
#[derive(Debug, Clone, Default)]
pub struct ErrorRegister {
    last: Arc<Mutex<Option<(i32, String)>>>,
}

impl ErrorRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error, replacing the previous message
    pub fn record(&self, err: &VdsError) {
        *self.last.lock() = Some((err.code(), err.to_string()));
    }

    /// Pass a result through, recording it if it failed
    pub fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ref err) = result {
            self.record(err);
        }
        result
    }

    /// Last recorded message, if any
    pub fn message(&self) -> Option<String> {
        self.last.lock().as_ref().map(|(_, msg)| msg.clone())
    }

    /// Last recorded status code, 0 when nothing failed
    pub fn code(&self) -> i32 {
        self.last.lock().as_ref().map(|(code, _)| *code).unwrap_or(0)
    }

    pub fn clear(&self) {
        *self.last.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative() {
        let errors = [
            VdsError::Configuration("x".into()),
            VdsError::InvalidFormat("x".into()),
            VdsError::OutOfBounds("x".into()),
            VdsError::Cache("x".into()),
            VdsError::Worker("x".into()),
        ];
        for err in &errors {
            assert!(err.code() < 0, "{err}");
        }
    }

    #[test]
    fn test_register_tracks_failures() {
        let register = ErrorRegister::new();
        assert_eq!(register.code(), 0);
        assert!(register.message().is_none());

        let ok: Result<u32> = register.track(Ok(3));
        assert_eq!(ok.unwrap(), 3);
        assert!(register.message().is_none());

        let shared = register.clone();
        let _ = shared.track::<()>(Err(VdsError::OutOfBounds("region".into())));
        assert_eq!(register.code(), -3);
        assert!(register.message().unwrap().contains("region"));

        register.clear();
        assert!(shared.message().is_none());
    }
}
