//! Error types shared across the blockio crates.

use thiserror::Error;

/// Common result type for blockio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for blockio
#[derive(Debug, Error)]
pub enum Error {
    /// Write attempted against a snapshot or a read-only image
    #[error("image is read-only")]
    ReadOnly,

    /// Object, image, snapshot or pool does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Image or snapshot name is already taken
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed argument or operation not applicable to this image
    #[error("invalid: {0}")]
    Invalid(String),

    /// Operation requires a feature the image does not have
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Persisted header carries incompatible feature bits we do not know
    #[error("image uses unsupported incompatible features: {0:#x}")]
    IncompatibleFeatures(u64),

    /// Resource is held by another client or still referenced
    #[error("busy: {0}")]
    Busy(String),

    /// Remote peer did not respond within the deadline
    #[error("request timed out")]
    Timeout,

    /// Internal "try again" for interrupted long-running operations
    #[error("operation interrupted: restart required")]
    Restart,

    /// Optimistic metadata update lost a race and must be retried
    #[error("metadata changed underneath the operation")]
    Stale,

    /// Persisted metadata failed validation
    #[error("corrupt metadata: {0}")]
    Corrupt(String),

    /// Lock could not be acquired without blocking
    #[error("would block on lock")]
    WouldBlock,

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Object store failure that has no more precise mapping
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[must_use]
    pub fn is_restart(&self) -> bool {
        matches!(self, Self::Restart)
    }

    /// Errors that the invoke-async-request envelope retries against the
    /// remote lock owner.
    #[must_use]
    pub fn is_retryable_remote(&self) -> bool {
        matches!(self, Self::Timeout | Self::Restart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_predicate() {
        assert!(Error::not_found("img").is_not_found());
        assert!(!Error::ReadOnly.is_not_found());
    }

    #[test]
    fn test_remote_retry_classification() {
        assert!(Error::Timeout.is_retryable_remote());
        assert!(Error::Restart.is_retryable_remote());
        assert!(!Error::Busy("held".into()).is_retryable_remote());
    }
}
