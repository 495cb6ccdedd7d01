//! Repository export
//!
//! Writes every commit (parents before children) and every named reference
//! into numbered record files, then the manifest. The sink is finished only
//! after the manifest is written, so an interrupted export never yields an
//! importable archive.

use crate::archive::ArchiveSink;
use crate::error::TransferResult;
use crate::meta::{DataFile, ExportMeta, EXPORT_META_FILE};
use crate::record::{encode_file, CommitRecord, Record, RefRecord};
use lakeref_core::{
    topological_order, CommitLogEntry, DatabaseAdapter, HeadsAndForks, NamedRefsParams,
    ReferenceInfo, StoreResult,
};

/// Default number of records per data file
pub const DEFAULT_RECORDS_PER_FILE: usize = 10_000;

/// Export configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    pub records_per_file: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            records_per_file: DEFAULT_RECORDS_PER_FILE,
        }
    }
}

impl ExportOptions {
    pub fn with_records_per_file(mut self, records_per_file: usize) -> Self {
        self.records_per_file = records_per_file.max(1);
        self
    }
}

/// Export the whole repository held by `adapter` into `sink`
pub fn export_repository<A: DatabaseAdapter + ?Sized>(
    adapter: &A,
    sink: &mut dyn ArchiveSink,
    options: &ExportOptions,
) -> TransferResult<ExportMeta> {
    let per_file = options.records_per_file.max(1);

    let entries: Vec<CommitLogEntry> = adapter
        .scan_all_commit_log_entries()?
        .collect::<StoreResult<_>>()?;
    let heads_and_forks = HeadsAndForks::compute(entries.iter().cloned().map(Ok))?;
    let ordered = topological_order(entries)?;
    tracing::debug!(
        "exporting {} commits ({} heads, {} fork points)",
        ordered.len(),
        heads_and_forks.heads.len(),
        heads_and_forks.fork_points.len()
    );

    let mut meta = ExportMeta::new(heads_and_forks);

    let commit_records: Vec<CommitRecord> = ordered.iter().map(CommitRecord::from).collect();
    meta.commit_files = write_chunks(sink, &commit_records, per_file)?;
    meta.commit_count = commit_records.len() as u64;

    let refs: Vec<ReferenceInfo> = adapter
        .named_refs(&NamedRefsParams::default())?
        .collect::<StoreResult<_>>()?;
    let ref_records: Vec<RefRecord> = refs.iter().map(RefRecord::from).collect();
    meta.named_reference_files = write_chunks(sink, &ref_records, per_file)?;
    meta.named_references_count = ref_records.len() as u64;

    sink.write_file(EXPORT_META_FILE, &meta.to_json()?)?;
    sink.finish()?;

    tracing::info!(
        "exported {} commits and {} references (export {})",
        meta.commit_count,
        meta.named_references_count,
        meta.export_id
    );
    Ok(meta)
}

fn write_chunks<T: Record>(
    sink: &mut dyn ArchiveSink,
    records: &[T],
    per_file: usize,
) -> TransferResult<Vec<DataFile>> {
    let mut files = Vec::new();
    for (index, chunk) in records.chunks(per_file).enumerate() {
        let name = T::KIND.file_name(index + 1);
        sink.write_file(&name, &encode_file(chunk)?)?;
        tracing::debug!("wrote {} ({} records)", name, chunk.len());
        files.push(DataFile {
            name,
            records: chunk.len() as u64,
        });
    }
    Ok(files)
}
