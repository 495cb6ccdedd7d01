//! Transfer error types

use lakeref_core::StoreError;
use std::io;
use thiserror::Error;

/// Result type for export, import and optimize
pub type TransferResult<T> = std::result::Result<T, TransferError>;

/// Errors that can occur while moving a repository or rebuilding its metadata
#[derive(Debug, Error)]
pub enum TransferError {
    /// Manifest or record file written by an incompatible version
    #[error("unsupported archive format version {found} (supported: {supported})")]
    UnsupportedFormat { found: u32, supported: u32 },

    /// Archive contents disagree with the manifest or the target repository
    #[error("import integrity error: {0}")]
    ImportIntegrity(String),

    /// Optimizer could not process every segment
    #[error("commit graph integrity error: {0}")]
    GraphIntegrity(String),

    /// Required file missing from the archive
    #[error("missing file in archive: {0}")]
    MissingFile(String),

    /// Malformed record file
    #[error("invalid record file {file}: {reason}")]
    InvalidRecordFile { file: String, reason: String },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    pub fn import_integrity(msg: impl Into<String>) -> Self {
        Self::ImportIntegrity(msg.into())
    }

    pub fn graph_integrity(msg: impl Into<String>) -> Self {
        Self::GraphIntegrity(msg.into())
    }

    pub fn missing_file(name: impl Into<String>) -> Self {
        Self::MissingFile(name.into())
    }

    pub fn invalid_record_file(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRecordFile {
            file: file.into(),
            reason: reason.into(),
        }
    }

    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }

    pub fn compression(msg: impl Into<String>) -> Self {
        Self::Compression(msg.into())
    }

    /// Check if a retry against fresh repository state could succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, TransferError::Store(e) if e.is_retriable())
    }

    /// Check if the archive itself is unusable
    pub fn is_archive_problem(&self) -> bool {
        matches!(
            self,
            TransferError::UnsupportedFormat { .. }
                | TransferError::ImportIntegrity(_)
                | TransferError::MissingFile(_)
                | TransferError::InvalidRecordFile { .. }
                | TransferError::Archive(_)
                | TransferError::Compression(_)
        )
    }
}
