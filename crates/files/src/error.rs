use std::io;

use thiserror::Error;

/// Errors produced by the file layer.
#[derive(Debug, Error)]
pub enum FileError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The first bytes of a file are not a valid header.
    #[error("bad file header: {0}")]
    BadHeader(String),

    /// File contents failed validation (checksum, ordering, truncation).
    #[error("file {file_id} is corrupt: {reason}")]
    Corrupt { file_id: u32, reason: String },

    /// No file with this id is part of the collection.
    #[error("unknown file id {0}")]
    UnknownFile(u32),
}

impl FileError {
    pub(crate) fn corrupt(file_id: u32, reason: impl Into<String>) -> Self {
        FileError::Corrupt {
            file_id,
            reason: reason.into(),
        }
    }
}
