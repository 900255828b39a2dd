//! Crate-wide error type for the pyramid engine.
//!
//! The taxonomy distinguishes configuration failures (raised before any I/O),
//! per-item failures (logged and skipped by the traversals, never surfaced
//! here), the cooperative [`Error::Aborted`] outcome, and integrity-limit
//! escalations from the checksum scans.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while building or verifying a tile pyramid.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error while reading or writing the tile store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration problem detected during task validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A FITS file could not be parsed or encoded.
    #[error("FITS error in {path}: {reason}")]
    Fits { path: PathBuf, reason: String },

    /// A visual tile could not be decoded or encoded.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// A provenance record could not be parsed or serialized.
    #[error("Provenance record error: {0}")]
    Record(#[from] serde_json::Error),

    /// The properties metadata file is malformed.
    #[error("Properties file error: {0}")]
    Properties(String),

    /// Two stores cannot be merged because their structure disagrees.
    #[error("Incompatible stores: {0}")]
    IncompatibleStores(String),

    /// The operation was cancelled through the cooperative abort flag.
    ///
    /// This is an expected, routine outcome and is deliberately a distinct
    /// variant rather than a failure wrapped in a message.
    #[error("Operation aborted")]
    Aborted,

    /// A stored check code no longer matches the tile tree.
    #[error("Check code mismatch for {encoding}: stored {stored}, computed {computed}")]
    CheckCodeMismatch {
        encoding: &'static str,
        stored: u32,
        computed: u32,
    },

    /// An integrity scan exceeded a configured tolerance.
    #[error("Integrity limit exceeded: {kind} count {count} > tolerance {tolerance}")]
    IntegrityLimit {
        /// Which counter crossed its threshold ("corrupt" or "untested").
        kind: &'static str,
        count: u64,
        tolerance: u64,
    },
}

impl Error {
    /// Shorthand for a FITS error at a given path.
    pub fn fits(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Fits {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this is the cooperative-abort outcome.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_distinguished_from_failure() {
        let abort = Error::Aborted;
        assert!(abort.is_abort());

        let config = Error::Config("missing output root".to_string());
        assert!(!config.is_abort());
    }

    #[test]
    fn test_display_carries_cause() {
        let err = Error::Config("leaf order not set and not derivable".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: leaf order not set and not derivable"
        );

        let err = Error::IntegrityLimit {
            kind: "corrupt",
            count: 12,
            tolerance: 10,
        };
        assert!(err.to_string().contains("corrupt"));
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
