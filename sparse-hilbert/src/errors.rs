//! Error types for index construction, persistence and search.

use std::io;
use thiserror::Error;

/// Errors that can occur while building, persisting or querying a spatial
/// index.
///
/// The variants are deliberately coarse but distinct: callers can tell a
/// damaged or truncated index file (rebuild it) apart from an ordinary I/O
/// failure (retry or surface it) and from a configuration mistake (fix the
/// code).
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The input ended before a complete value could be read.
    #[error("index data truncated while reading {0}")]
    Truncated(String),

    /// The index file declares a format version this build does not know.
    #[error("unsupported index format version {0}")]
    UnsupportedVersion(u16),

    /// The index file is structurally invalid (bad flags, negative counts,
    /// non-monotonic position table).
    #[error("corrupt index data: {0}")]
    Corrupt(String),

    /// Invalid configuration or arguments, detected before any I/O.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A byte position does not fit the selected position encoding width.
    /// The writer picks the width from the largest position present, so this
    /// is a defensive check only.
    #[error("byte position {0} does not fit the selected position width")]
    PositionOverflow(u64),
}

/// Result type for spatial index operations.
pub type IndexResult<T> = Result<T, IndexError>;

impl IndexError {
    /// Maps an unexpected EOF from `read_exact` to [`IndexError::Truncated`],
    /// leaving other I/O errors untouched.
    pub(crate) fn truncated_from(e: io::Error, what: &str) -> IndexError {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            IndexError::Truncated(what.to_string())
        } else {
            IndexError::Io(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_from_eof() {
        let e = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        match IndexError::truncated_from(e, "header") {
            IndexError::Truncated(what) => assert_eq!(what, "header"),
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_from_other_io() {
        let e = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            IndexError::truncated_from(e, "header"),
            IndexError::Io(_)
        ));
    }

    #[test]
    fn test_display() {
        let e = IndexError::UnsupportedVersion(7);
        assert_eq!(e.to_string(), "unsupported index format version 7");
    }
}
