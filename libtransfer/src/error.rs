use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("path is neither a file nor a directory: {}", .0.display())]
    UnsupportedPath(PathBuf),

    #[error("malformed archive {key}: {reason}")]
    MalformedArchive { key: String, reason: String },

    #[error("blob not found: {0}")]
    NotFound(String),

    // Blob store unreachable or rejected the request.
    #[error("{operation} failed for {key}: {message}")]
    Transport {
        operation: &'static str,
        key: String,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("archive worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TransferError {
    /// Only transport failures are worth another attempt; archive shape and
    /// local filesystem problems will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Transport { .. })
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
