//! Error types shared across the fabric

use thiserror::Error;

/// How a caller should react to a failed operation.
///
/// Component error enums map every variant onto one of these so that
/// dispatch loops can decide between aborting, retrying and dropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Internal invariant violated; abort the surrounding operation
    Fatal,
    /// Resource exhaustion; retry elsewhere or apply backpressure
    Recoverable,
    /// Lookup miss on an id or key; log and drop the event
    Miss,
    /// The caller asked for something that can never succeed
    Invalid,
}

/// Implemented by every component error.
pub trait Classify {
    /// Category of this error
    fn class(&self) -> ErrorClass;

    /// True for resource exhaustion that may succeed on retry
    fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }
}

/// Process-level fabric error
#[derive(Error, Debug)]
pub enum FabricError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration parsed but is not usable
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Fingerprint text was not 64 hex digits
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),
}

/// Result type for fabric-level operations
pub type FabricResult<T> = Result<T, FabricError>;
