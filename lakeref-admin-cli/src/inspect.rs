//! Read-only commands: verify, refs, log

use anyhow::{anyhow, bail, Result};
use lakeref_core::{check_graph, commit_log, DatabaseAdapter, NamedRefsParams, SqliteAdapter};
use tokio::task;

/// Verify repository integrity
pub async fn verify(adapter: SqliteAdapter, quiet: bool) -> Result<()> {
    let report = task::spawn_blocking(move || check_graph(&adapter))
        .await
        .map_err(|e| anyhow!("Verify task failed: {:?}", e))??;

    if !quiet {
        println!(
            "Checked {} commits and {} references",
            report.commits, report.references
        );
        for problem in &report.problems {
            eprintln!("  ERROR: {}", problem);
        }
    }

    if !report.is_healthy() {
        bail!("verification failed with {} problems", report.problems.len());
    }
    if !quiet {
        println!("Repository is consistent");
    }
    Ok(())
}

pub fn list_refs(adapter: &SqliteAdapter, prefix: Option<String>, json: bool) -> Result<()> {
    let mut params = NamedRefsParams::default();
    if let Some(prefix) = prefix {
        params = params.with_prefix(prefix);
    }

    let mut refs = Vec::new();
    for info in adapter.named_refs(&params)? {
        refs.push(info?);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&refs)?);
        return Ok(());
    }
    for info in &refs {
        let kind = if info.named_ref.is_branch() { "branch" } else { "tag" };
        println!("{:<6} {:<40} {}", kind, info.named_ref.name(), info.hash);
    }
    Ok(())
}

pub fn show_log(adapter: &SqliteAdapter, reference: &str, limit: usize) -> Result<()> {
    let head = adapter.named_ref(reference)?.hash;
    for entry in commit_log(adapter, head).take(limit) {
        let entry = entry?;
        let merge = if entry.is_merge() {
            format!(" (merge of {})", entry.additional_parents().len() + 1)
        } else {
            String::new()
        };
        println!(
            "{} #{} {} puts, {} deletes{}",
            entry.hash.short(),
            entry.commit_seq,
            entry.puts.len(),
            entry.deletes.len(),
            merge
        );
        println!("    {}", String::from_utf8_lossy(&entry.commit_meta));
    }
    Ok(())
}
