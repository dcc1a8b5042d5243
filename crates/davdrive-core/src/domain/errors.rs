//! Domain error types

use thiserror::Error;

/// Errors raised by domain-level validation and state handling
#[derive(Debug, Error)]
pub enum DomainError {
    /// A path failed validation
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// An identifier failed validation
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A checksum string could not be parsed
    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    /// A capability value could not be interpreted
    #[error("invalid capability: {0}")]
    InvalidCapability(String),
}
