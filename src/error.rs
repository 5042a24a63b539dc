use std::fmt;
use std::io;

/// Unified error type for the coordination services.
///
/// Each variant represents a category of failure. Clearance contention is a
/// distinct variant because callers must treat it as a retryable
/// infrastructure condition rather than a domain error.
#[derive(Debug)]
pub enum CadForgeError {
    /// Errors from the underlying table store
    Database(String),

    /// Advisory clearance could not be obtained or managed
    Clearance(String),

    /// Errors in attribute-index maintenance or locator parsing
    Index(String),

    /// Errors in batch pod orchestration and tracking
    Batch(String),

    /// Errors related to configuration
    Config(String),

    /// Errors from outbound HTTP calls (health probes)
    Http(String),

    /// Errors related to serialization/deserialization
    Serialization(String),

    /// Errors related to IO operations
    Io(io::Error),

    /// Other errors that don't fit into the above categories
    Other(String),
}

impl fmt::Display for CadForgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database(msg) => write!(f, "Database error: {}", msg),
            Self::Clearance(msg) => write!(f, "Clearance error: {}", msg),
            Self::Index(msg) => write!(f, "Index error: {}", msg),
            Self::Batch(msg) => write!(f, "Batch error: {}", msg),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Http(msg) => write!(f, "HTTP error: {}", msg),
            Self::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for CadForgeError {}

impl From<io::Error> for CadForgeError {
    fn from(error: io::Error) -> Self {
        CadForgeError::Io(error)
    }
}

impl From<serde_json::Error> for CadForgeError {
    fn from(error: serde_json::Error) -> Self {
        CadForgeError::Serialization(error.to_string())
    }
}

impl From<sled::Error> for CadForgeError {
    fn from(error: sled::Error) -> Self {
        CadForgeError::Database(error.to_string())
    }
}

impl From<reqwest::Error> for CadForgeError {
    fn from(error: reqwest::Error) -> Self {
        CadForgeError::Http(error.to_string())
    }
}

/// Result type alias for operations that can result in a CadForgeError
pub type CadForgeResult<T> = Result<T, CadForgeError>;
