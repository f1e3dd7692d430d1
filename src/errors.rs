//! Serengeti Error Handling
//!
//! One error enum covers the whole crate. The propagation policy follows the
//! subsystem contracts:
//! - parse errors are recoverable and surface in-band as `{error, executed: false}`
//! - catalog conflicts and not-found conditions never change state
//! - replication errors are swallowed after metric recording (best effort)
//! - the persistence scheduler treats every error as local and non-fatal
//! - the query executor aborts the current plan on any internal error

use thiserror::Error;

/// Result alias used throughout the crate.
pub type SerengetiResult<T> = Result<T, SerengetiError>;

/// Core error type for all Serengeti subsystems.
#[derive(Debug, Error)]
pub enum SerengetiError {
    /// SQL statement could not be parsed. Always recoverable.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// An object already exists (create-existing and friends). No state change.
    #[error("{0}")]
    CatalogConflict(String),

    /// The requested object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Underlying filesystem I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure for meta files, rows, or wire messages.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A peer was unreachable or replied with garbage. Never aborts local work.
    #[error("network error: {0}")]
    Network(String),

    /// The query memory pool could not satisfy an allocation even after spilling.
    #[error("out of memory: requested {requested} bytes, {available} available")]
    MemoryExhausted { requested: usize, available: usize },

    /// On-disk data failed validation (bad magic, CRC mismatch, truncation).
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// The operation was cancelled by shutdown or a query timeout.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Invariant violation that should not happen in a healthy process.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SerengetiError {
    /// Shorthand for a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        SerengetiError::Parse {
            message: message.into(),
        }
    }

    /// True when the error is safe to report to the SQL caller without
    /// terminating anything beyond the current statement.
    pub fn is_statement_local(&self) -> bool {
        matches!(
            self,
            SerengetiError::Parse { .. }
                | SerengetiError::CatalogConflict(_)
                | SerengetiError::NotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_are_statement_local() {
        assert!(SerengetiError::parse("bad token").is_statement_local());
        assert!(SerengetiError::CatalogConflict("db exists".into()).is_statement_local());
        assert!(!SerengetiError::Internal("broken".into()).is_statement_local());
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> SerengetiResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(SerengetiError::Io(_))));
    }
}
