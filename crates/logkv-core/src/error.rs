//! Error types for LogKV operations
//!
//! All engine errors are represented by the LogKvError enum. I/O failures
//! carry the path they happened on whenever one is known.

use std::path::{Path, PathBuf};

/// LogKV error types with detailed context
#[derive(Debug, Clone, thiserror::Error)]
pub enum LogKvError {
    /// Lookup miss: no cached or durable record for the requested key
    #[error("record not found")]
    NotFound,

    /// Malformed identifier (wrong length or bad hex)
    #[error("invalid identifier: {reason}")]
    InvalidIdentifier {
        /// What was wrong with the input
        reason: String,
    },

    /// A record header declares more bytes than remain in the stream
    #[error("truncated record at offset {offset}: expected {expected} bytes, only {available} available")]
    Truncated {
        /// Offset of the record's length header
        offset: u64,
        /// Bytes the header promised
        expected: u64,
        /// Bytes actually read before end of stream
        available: u64,
    },

    /// A record header is structurally impossible (e.g. absurd length)
    #[error("corrupt record at offset {offset}: {reason}")]
    CorruptRecord {
        /// Offset of the record's length header
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind:?})", fmt_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// The engine has begun closing and no longer accepts writes
    #[error("engine is closed")]
    Closed,

    /// Payload exceeds the configured maximum
    #[error("record too large: {size} bytes exceeds limit of {max} bytes")]
    OversizedRecord {
        /// Size of the rejected payload
        size: u64,
        /// Configured maximum
        max: u64,
    },

    /// Configuration failed validation
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// An index snapshot could not be decoded
    #[error("snapshot corrupted: {0}")]
    SnapshotCorrupted(String),
}

fn fmt_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" in {}", p.display()),
        None => String::new(),
    }
}

impl LogKvError {
    /// Build an `Io` error annotated with the file it happened on.
    pub fn io_at(path: &Path, err: std::io::Error, context: &str) -> Self {
        LogKvError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", context, err),
        }
    }

    /// True for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LogKvError::NotFound)
    }
}

/// Convert std::io::Error to LogKvError::Io
impl From<std::io::Error> for LogKvError {
    fn from(err: std::io::Error) -> Self {
        LogKvError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for LogKV operations
pub type LogKvResult<T> = Result<T, LogKvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LogKvError::Truncated { offset: 1024, expected: 300, available: 12 };
        let display = err.to_string();
        assert!(display.contains("offset 1024"));
        assert!(display.contains("300"));
        assert!(display.contains("12"));
    }

    #[test]
    fn test_io_display_with_and_without_path() {
        let err = LogKvError::io_at(
            Path::new("/tmp/data.log"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            "Failed to open log file",
        );
        let display = err.to_string();
        assert!(display.contains("/tmp/data.log"));
        assert!(display.contains("Failed to open log file"));

        let bare: LogKvError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(bare.to_string().starts_with("I/O error: boom"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: LogKvError = io_err.into();

        match err {
            LogKvError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_not_found_helper() {
        assert!(LogKvError::NotFound.is_not_found());
        assert!(!LogKvError::Closed.is_not_found());
    }
}
