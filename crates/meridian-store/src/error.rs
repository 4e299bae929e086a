//! Store error types.
//!
//! Contention inside the index is retried internally and never surfaced;
//! logical misses (duplicate insert, delete of an absent key, seek miss)
//! come back as `bool`/`Option` returns. Only resource, format, shutdown,
//! and I/O conditions reach this enum.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at the store boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied encode buffer was shorter than required.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    NotEnoughSpace {
        /// Bytes the operation needed.
        needed: usize,
        /// Bytes the buffer offered.
        available: usize,
    },

    /// An on-disk artifact (or a configured file format) was not usable.
    #[error("invalid file format: {reason}")]
    InvalidFileFormat {
        /// What was wrong with the file or format.
        reason: String,
    },

    /// The store was closed while the operation was in flight. Callers may
    /// treat this as benign cancellation.
    #[error("store is shut down")]
    Shutdown,

    /// I/O error at the persistence boundary.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: io::Error,
    },

    /// An error propagated from a visitor callback.
    #[error("{reason}")]
    Callback {
        /// The callback's message.
        reason: String,
    },
}

impl Error {
    /// Creates a buffer-too-small error.
    pub fn not_enough_space(needed: usize, available: usize) -> Self {
        Self::NotEnoughSpace { needed, available }
    }

    /// Creates an invalid-file-format error.
    pub fn invalid_file_format(reason: impl Into<String>) -> Self {
        Self::InvalidFileFormat {
            reason: reason.into(),
        }
    }

    /// Creates a callback error for aborting a visitor from user code.
    pub fn callback(reason: impl Into<String>) -> Self {
        Self::Callback {
            reason: reason.into(),
        }
    }

    /// True if this is the benign close-during-operation signal.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidFileFormat {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_enough_space(4, 2);
        assert_eq!(err.to_string(), "buffer too small: need 4 bytes, have 2");

        let err = Error::invalid_file_format("bad manifest");
        assert!(err.to_string().contains("bad manifest"));
    }

    #[test]
    fn test_shutdown_classification() {
        assert!(Error::Shutdown.is_shutdown());
        assert!(!Error::callback("boom").is_shutdown());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing shard");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { .. }));
    }
}
