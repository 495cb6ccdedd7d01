//! Export manifest

use crate::error::{TransferError, TransferResult};
use lakeref_core::HeadsAndForks;
use serde::{Deserialize, Serialize};

/// File name of the manifest inside an archive
pub const EXPORT_META_FILE: &str = "export-meta.json";

/// Current archive format version
pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// A data file listed in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    pub name: String,
    pub records: u64,
}

/// Summary of a completed export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportMeta {
    pub format_version: u32,
    pub export_id: String,
    /// RFC 3339 timestamp
    pub created_at: String,
    pub tool_version: String,
    pub commit_count: u64,
    pub named_references_count: u64,
    pub commit_files: Vec<DataFile>,
    pub named_reference_files: Vec<DataFile>,
    pub heads_and_forks: HeadsAndForks,
}

impl ExportMeta {
    pub fn new(heads_and_forks: HeadsAndForks) -> Self {
        Self {
            format_version: EXPORT_FORMAT_VERSION,
            export_id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            commit_count: 0,
            named_references_count: 0,
            commit_files: Vec::new(),
            named_reference_files: Vec::new(),
            heads_and_forks,
        }
    }

    pub fn to_json(&self) -> TransferResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a manifest, rejecting other format versions
    pub fn from_json(data: &[u8]) -> TransferResult<Self> {
        // Check the version before the full schema so newer manifests fail cleanly.
        #[derive(Deserialize)]
        struct VersionHeader {
            format_version: u32,
        }
        let header: VersionHeader = serde_json::from_slice(data)?;
        if header.format_version != EXPORT_FORMAT_VERSION {
            return Err(TransferError::UnsupportedFormat {
                found: header.format_version,
                supported: EXPORT_FORMAT_VERSION,
            });
        }
        Ok(serde_json::from_slice(data)?)
    }

    /// Record counts declared by the data file lists
    pub fn declared_file_records(&self) -> (u64, u64) {
        (
            self.commit_files.iter().map(|f| f.records).sum(),
            self.named_reference_files.iter().map(|f| f.records).sum(),
        )
    }
}
