//! Lakeref Transfer Library
//!
//! Moves whole repositories between backends and rebuilds derived metadata:
//! - Length-framed record files and the export manifest
//! - Archive containers (directory, single-file tar.zst)
//! - Export and import with integrity checks
//! - Commit-log optimizer
//! - Snapshot comparison for round-trip verification

pub mod archive;
pub mod error;
pub mod export;
pub mod import;
pub mod meta;
pub mod optimize;
pub mod record;
pub mod verify;

pub use archive::{
    ArchiveSink, ArchiveSource, DirectoryArchive, TarZstReader, TarZstWriter,
    DEFAULT_COMPRESSION_LEVEL,
};
pub use error::{TransferError, TransferResult};
pub use export::{export_repository, ExportOptions, DEFAULT_RECORDS_PER_FILE};
pub use import::{import_repository, ImportOptions, ImportResult, DEFAULT_COMMIT_BATCH_SIZE};
pub use meta::{DataFile, ExportMeta, EXPORT_FORMAT_VERSION, EXPORT_META_FILE};
pub use optimize::{optimize_commit_log, OptimizeOptions, OptimizeResult, SegmentFailure};
pub use record::{CommitRecord, RecordKind, RecordReader, RecordWriter, RefRecord};
pub use verify::{RepositorySnapshot, SnapshotDiff};
