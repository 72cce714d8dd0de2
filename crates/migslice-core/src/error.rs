//! Error types for migslice

use thiserror::Error;

/// Main error type for migslice
#[derive(Error, Debug)]
pub enum MigError {
    /// Requested slice count has no entry in the device profile table
    #[error("Invalid slice count: {0} does not correspond to a profile on this device")]
    InvalidSliceCount(u32),

    /// The native layer has no capacity left for the requested profile
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Any other non-success result from the native layer
    #[error("Native operation failed: {0}")]
    Native(String),

    /// Allocator construction precondition violated
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Operation requires a live partition but got an empty one
    #[error("Invalid partition: {0}")]
    InvalidPartition(String),

    /// A blocking allocation gave up waiting for capacity
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Device index unknown to the native layer
    #[error("Device not found: {0}")]
    DeviceNotFound(u32),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigError {
    /// Whether this is one of the errors callers see as "allocation failed".
    ///
    /// Exhaustion and other native failures are distinct variants, but both
    /// mean the partition could not be created.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, MigError::ResourceExhausted(_) | MigError::Native(_))
    }
}

/// Result type for migslice operations
pub type MigResult<T> = Result<T, MigError>;

impl From<toml::de::Error> for MigError {
    fn from(err: toml::de::Error) -> Self {
        MigError::Config(format!("Failed to parse config: {}", err))
    }
}
