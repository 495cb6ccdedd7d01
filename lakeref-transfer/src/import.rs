//! Repository import
//!
//! Order of operations:
//! 1. read and version-check the manifest
//! 2. count the records of every declared file against the manifest
//! 3. make sure the target holds no history (root-pointing references, such
//!    as a freshly initialized default branch, are removed)
//! 4. replay commits in batches, checking hash, parents and sequence numbers
//! 5. replay references
//! 6. compare counts and fork structure with the manifest
//!
//! Nothing is written before step 3 succeeds. A failure later leaves a
//! partially imported repository that has to be erased.

use crate::archive::ArchiveSource;
use crate::error::{TransferError, TransferResult};
use crate::meta::{DataFile, ExportMeta, EXPORT_META_FILE};
use crate::record::{CommitRecord, RecordKind, RecordReader, RefRecord};
use lakeref_core::{
    CommitLogEntry, DatabaseAdapter, Hash, HeadsAndForks, NamedRefsParams, ReferenceInfo,
    StoreResult,
};
use std::collections::HashMap;

/// Default number of commits written per backend call
pub const DEFAULT_COMMIT_BATCH_SIZE: usize = 100;

/// Import configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    pub commit_batch_size: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            commit_batch_size: DEFAULT_COMMIT_BATCH_SIZE,
        }
    }
}

impl ImportOptions {
    pub fn with_commit_batch_size(mut self, commit_batch_size: usize) -> Self {
        self.commit_batch_size = commit_batch_size.max(1);
        self
    }
}

/// Summary of a completed import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportResult {
    pub export_meta: ExportMeta,
    pub imported_commit_count: u64,
    pub imported_reference_count: u64,
    pub heads_and_forks: HeadsAndForks,
}

/// Import the archive in `source` into `adapter`
pub fn import_repository<A: DatabaseAdapter + ?Sized>(
    adapter: &A,
    source: &dyn ArchiveSource,
    options: &ImportOptions,
) -> TransferResult<ImportResult> {
    let meta = ExportMeta::from_json(&source.read_file(EXPORT_META_FILE)?)?;
    tracing::info!(
        "importing export {} ({} commits, {} references)",
        meta.export_id,
        meta.commit_count,
        meta.named_references_count
    );

    validate_counts(source, &meta)?;
    prepare_target(adapter)?;

    let imported_commit_count = replay_commits(adapter, source, &meta.commit_files, options)?;
    let imported_reference_count = replay_references(adapter, source, &meta.named_reference_files)?;

    if imported_commit_count != meta.commit_count {
        return Err(TransferError::import_integrity(format!(
            "imported {} commits, manifest declares {}",
            imported_commit_count, meta.commit_count
        )));
    }
    if imported_reference_count != meta.named_references_count {
        return Err(TransferError::import_integrity(format!(
            "imported {} references, manifest declares {}",
            imported_reference_count, meta.named_references_count
        )));
    }

    let heads_and_forks = HeadsAndForks::of_adapter(adapter)?;
    if heads_and_forks != meta.heads_and_forks {
        return Err(TransferError::import_integrity(
            "imported heads and fork points differ from the manifest",
        ));
    }

    tracing::info!(
        "imported {} commits and {} references",
        imported_commit_count,
        imported_reference_count
    );
    Ok(ImportResult {
        export_meta: meta,
        imported_commit_count,
        imported_reference_count,
        heads_and_forks,
    })
}

fn validate_counts(source: &dyn ArchiveSource, meta: &ExportMeta) -> TransferResult<()> {
    let (commits, refs) = meta.declared_file_records();
    if commits != meta.commit_count || refs != meta.named_references_count {
        return Err(TransferError::import_integrity(format!(
            "manifest file lists declare {} commits and {} references, totals say {} and {}",
            commits, refs, meta.commit_count, meta.named_references_count
        )));
    }

    let declared = meta
        .commit_files
        .iter()
        .map(|f| (f, RecordKind::Commit))
        .chain(
            meta.named_reference_files
                .iter()
                .map(|f| (f, RecordKind::NamedReference)),
        );
    for (file, kind) in declared {
        if !source.contains(&file.name) {
            return Err(TransferError::import_integrity(format!(
                "data file {} listed in the manifest is missing",
                file.name
            )));
        }
        let reader = RecordReader::open(source.open_file(&file.name)?, &file.name, kind)?;
        let actual = reader.count_frames()?;
        if actual != file.records {
            return Err(TransferError::import_integrity(format!(
                "{} holds {} records, manifest declares {}",
                file.name, actual, file.records
            )));
        }
    }
    Ok(())
}

fn prepare_target<A: DatabaseAdapter + ?Sized>(adapter: &A) -> TransferResult<()> {
    if adapter.scan_all_commit_log_entries()?.next().is_some() {
        return Err(TransferError::import_integrity(
            "target repository already contains commits",
        ));
    }
    let root = adapter.no_ancestor_hash();
    let refs: Vec<ReferenceInfo> = adapter
        .named_refs(&NamedRefsParams::default())?
        .collect::<StoreResult<_>>()?;
    for info in refs {
        if info.hash != root {
            return Err(TransferError::import_integrity(format!(
                "target repository already contains reference {}",
                info.named_ref
            )));
        }
        adapter.delete(&info.named_ref, Some(root))?;
        tracing::debug!("removed empty {} from import target", info.named_ref);
    }
    Ok(())
}

fn replay_commits<A: DatabaseAdapter + ?Sized>(
    adapter: &A,
    source: &dyn ArchiveSource,
    files: &[DataFile],
    options: &ImportOptions,
) -> TransferResult<u64> {
    let batch_size = options.commit_batch_size.max(1);
    // commit_seq of every replayed commit, for parent and sequence checks
    let mut seqs: HashMap<Hash, u64> = HashMap::new();
    let mut batch: Vec<CommitLogEntry> = Vec::with_capacity(batch_size);
    let mut count = 0u64;

    for file in files {
        let reader = RecordReader::open(source.open_file(&file.name)?, &file.name, RecordKind::Commit)?;
        for record in reader.records::<CommitRecord>() {
            let entry = record?.into_entry();
            check_commit(&entry, &seqs)?;
            seqs.insert(entry.hash, entry.commit_seq);
            batch.push(entry);
            count += 1;

            if batch.len() >= batch_size {
                adapter.write_commits(&batch)?;
                tracing::debug!("replayed {} commits", count);
                batch.clear();
            }
        }
    }
    if !batch.is_empty() {
        adapter.write_commits(&batch)?;
    }
    Ok(count)
}

fn check_commit(entry: &CommitLogEntry, seqs: &HashMap<Hash, u64>) -> TransferResult<()> {
    if entry.recompute_hash()? != entry.hash {
        return Err(TransferError::import_integrity(format!(
            "commit {} does not match its content",
            entry.hash
        )));
    }
    if entry.parents.is_empty() {
        return Err(TransferError::import_integrity(format!(
            "commit {} has no parent",
            entry.hash
        )));
    }
    if seqs.contains_key(&entry.hash) {
        return Err(TransferError::import_integrity(format!(
            "commit {} appears twice",
            entry.hash
        )));
    }
    for parent in &entry.parents {
        if !parent.is_no_ancestor() && !seqs.contains_key(parent) {
            return Err(TransferError::import_integrity(format!(
                "commit {} precedes its parent {}",
                entry.hash, parent
            )));
        }
    }
    let parent = entry.parent();
    let expected_seq = if parent.is_no_ancestor() {
        1
    } else {
        seqs.get(&parent).map_or(0, |seq| seq + 1)
    };
    if entry.commit_seq != expected_seq {
        return Err(TransferError::import_integrity(format!(
            "commit {} has sequence {}, expected {}",
            entry.hash, entry.commit_seq, expected_seq
        )));
    }
    Ok(())
}

fn replay_references<A: DatabaseAdapter + ?Sized>(
    adapter: &A,
    source: &dyn ArchiveSource,
    files: &[DataFile],
) -> TransferResult<u64> {
    let mut count = 0u64;
    for file in files {
        let reader = RecordReader::open(
            source.open_file(&file.name)?,
            &file.name,
            RecordKind::NamedReference,
        )?;
        for record in reader.records::<RefRecord>() {
            let record = record?;
            if !record.hash.is_no_ancestor() && adapter.fetch_commit(&record.hash)?.is_none() {
                return Err(TransferError::import_integrity(format!(
                    "{} points at commit {} which is not in the archive",
                    record.named_ref, record.hash
                )));
            }
            adapter.create(&record.named_ref, record.hash)?;
            count += 1;
        }
    }
    Ok(count)
}
