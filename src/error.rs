//! Error types for transfers and configuration.
//!
//! Every transfer failure is local to one session. Only a failure of the
//! listening socket is fatal to the server, and that surfaces as a plain
//! `std::io::Error` from the admission loop.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while sending or receiving a single file.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Local input file is missing or not a regular file.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Could not open a connection to the server.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The stream ended before a length-derived read completed.
    #[error("stream ended after {received} of {expected} bytes")]
    TruncatedStream { expected: usize, received: usize },

    /// Header decoded but exceeds a configured limit.
    #[error("header rejected: {0}")]
    HeaderRejected(String),

    /// Declared name has no usable final path component.
    #[error("invalid file name {0:?}")]
    InvalidName(String),

    /// Destination file could not be created or written.
    #[error("filesystem error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Any other I/O failure on the connection or the local file.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransferError {
    /// True for failures that happen before the frame header is complete.
    pub fn is_header_error(&self) -> bool {
        matches!(
            self,
            TransferError::TruncatedStream { .. }
                | TransferError::HeaderRejected(_)
                | TransferError::InvalidName(_)
        )
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_display() {
        let err = TransferError::TruncatedStream {
            expected: 8,
            received: 3,
        };
        assert_eq!(err.to_string(), "stream ended after 3 of 8 bytes");
        assert!(err.is_header_error());
    }

    #[test]
    fn test_filesystem_is_not_header_error() {
        let err = TransferError::Filesystem {
            path: PathBuf::from("uploads/a.bin"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!err.is_header_error());
        assert!(err.to_string().contains("uploads/a.bin"));
    }
}
