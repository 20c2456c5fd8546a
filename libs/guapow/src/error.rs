//! Error types for the optimizer core.
//!
//! One enum covers the whole crate. Only [`OptError::Authorization`] and
//! [`OptError::MalformedRequest`] reject a request at the edge; everything
//! else is logged per sub-operation and the session keeps going.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("request not authorized: {0}")]
    Authorization(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("profile resolution failed: {0}")]
    Resolution(String),

    #[error("system operation failed: {0}")]
    System(String),

    #[error("applier failed for pid {pid}: {reason}")]
    Applier { pid: u32, reason: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("decryption failed")]
    Decrypt,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type that uses OptError
pub type Result<T> = std::result::Result<T, OptError>;
