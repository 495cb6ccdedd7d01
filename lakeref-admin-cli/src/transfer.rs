//! Export, import and optimize commands
//!
//! The transfer library is synchronous; each command runs as one blocking
//! task so the runtime stays responsive.

use anyhow::{anyhow, Result};
use lakeref_core::{DatabaseAdapter, HeadsAndForks, SqliteAdapter};
use lakeref_transfer::{
    export_repository, import_repository, optimize_commit_log, ArchiveSink, ArchiveSource,
    DirectoryArchive, ExportOptions, ImportOptions, OptimizeOptions, OptimizeResult,
    TarZstReader, TarZstWriter, DEFAULT_COMPRESSION_LEVEL,
};
use std::path::PathBuf;
use std::time::Instant;
use tokio::task;

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("Blocking task failed: {:?}", e))?
}

pub async fn export(
    adapter: SqliteAdapter,
    output: PathBuf,
    tar_zst: bool,
    records_per_file: Option<usize>,
) -> Result<()> {
    let mut options = ExportOptions::default();
    if let Some(per_file) = records_per_file {
        options = options.with_records_per_file(per_file);
    }

    run_blocking(move || {
        let start = Instant::now();
        let mut sink: Box<dyn ArchiveSink> = if tar_zst {
            Box::new(TarZstWriter::create(&output, DEFAULT_COMPRESSION_LEVEL)?)
        } else {
            Box::new(DirectoryArchive::create(&output)?)
        };
        let meta = export_repository(&adapter, sink.as_mut(), &options)?;
        println!(
            "Exported {} commits and {} references to {} in {:.2}s",
            meta.commit_count,
            meta.named_references_count,
            output.display(),
            start.elapsed().as_secs_f64()
        );
        println!("Export id: {}", meta.export_id);
        Ok(())
    })
    .await
}

pub async fn import(
    adapter: SqliteAdapter,
    input: PathBuf,
    erase: bool,
    optimize: bool,
    batch_size: Option<usize>,
) -> Result<()> {
    let mut options = ImportOptions::default();
    if let Some(batch_size) = batch_size {
        options = options.with_commit_batch_size(batch_size);
    }

    run_blocking(move || {
        let start = Instant::now();
        let source: Box<dyn ArchiveSource> = if input.is_dir() {
            Box::new(DirectoryArchive::open(&input)?)
        } else {
            Box::new(TarZstReader::open(&input)?)
        };

        if erase {
            adapter.erase_repo()?;
            tracing::info!("erased repository before import");
        }

        let result = import_repository(&adapter, source.as_ref(), &options)?;
        println!(
            "Imported {} commits and {} references in {:.2}s",
            result.imported_commit_count,
            result.imported_reference_count,
            start.elapsed().as_secs_f64()
        );

        if optimize {
            let optimized =
                optimize_commit_log(&adapter, &result.heads_and_forks, &OptimizeOptions::default())?;
            print_optimize(&optimized, false);
        }
        Ok(())
    })
    .await
}

pub async fn optimize(adapter: SqliteAdapter, dry_run: bool) -> Result<()> {
    let options = OptimizeOptions::default().with_dry_run(dry_run);
    run_blocking(move || {
        let heads_and_forks = HeadsAndForks::of_adapter(&adapter)?;
        let result = optimize_commit_log(&adapter, &heads_and_forks, &options)?;
        print_optimize(&result, dry_run);
        Ok(())
    })
    .await
}

fn print_optimize(result: &OptimizeResult, dry_run: bool) {
    println!(
        "Optimized {} segments: {} commits walked, {} {}",
        result.segments,
        result.commits_walked,
        result.commits_rewritten,
        if dry_run { "would be rewritten" } else { "rewritten" }
    );
}
