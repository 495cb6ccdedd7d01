//! Lakeref Administration CLI

mod inspect;
mod transfer;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lakeref_core::{AdapterConfig, DatabaseAdapter, SqliteAdapter};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "lakeref-admin")]
#[command(author = "Lakeref Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Lakeref repository administration, export and import tool")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new repository
    Init {
        #[arg(short, long)]
        repo: PathBuf,
        /// Name of the first branch (defaults to the configured one)
        #[arg(short, long)]
        branch: Option<String>,
        #[arg(long)]
        key_list_distance: Option<u32>,
        #[arg(long)]
        parents_per_commit: Option<usize>,
    },

    /// Export the repository into a directory or a .tar.zst file
    Export {
        #[arg(short, long)]
        repo: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Write a single compressed archive instead of a directory
        #[arg(long)]
        tar_zst: bool,
        #[arg(long)]
        records_per_file: Option<usize>,
    },

    /// Import an export into an empty repository
    Import {
        #[arg(short, long)]
        repo: PathBuf,
        /// Export directory or .tar.zst file
        #[arg(short, long)]
        input: PathBuf,
        /// Erase the repository before importing
        #[arg(long)]
        erase: bool,
        /// Skip rebuilding scan acceleration after the import
        #[arg(long)]
        no_optimize: bool,
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Rebuild scan acceleration for the whole commit log
    Optimize {
        #[arg(short, long)]
        repo: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },

    /// Check hashes, parent links and references
    Verify {
        #[arg(short, long)]
        repo: PathBuf,
        #[arg(short, long)]
        quiet: bool,
    },

    /// List named references
    Refs {
        #[arg(short, long)]
        repo: PathBuf,
        /// Only names starting with this prefix
        #[arg(short, long)]
        prefix: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Show the first-parent history of a reference
    Log {
        #[arg(short, long)]
        repo: PathBuf,
        reference: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

fn open_repo(repo: &Path) -> Result<SqliteAdapter> {
    Ok(SqliteAdapter::open_dir(repo)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Commands::Init {
            repo,
            branch,
            key_list_distance,
            parents_per_commit,
        } => {
            let mut config = AdapterConfig::load(&repo)?;
            if let Some(distance) = key_list_distance {
                config = config.with_key_list_distance(distance);
            }
            if let Some(parents) = parents_per_commit {
                config = config.with_parents_per_commit(parents);
            }
            config.save(&repo)?;

            let branch = branch.unwrap_or_else(|| config.default_branch.clone());
            let adapter = open_repo(&repo)?;
            adapter.initialize_repo(&branch)?;
            println!("Repository initialized at {} (branch {})", repo.display(), branch);
        }

        Commands::Export {
            repo,
            output,
            tar_zst,
            records_per_file,
        } => {
            let adapter = open_repo(&repo)?;
            transfer::export(adapter, output, tar_zst, records_per_file).await?;
        }

        Commands::Import {
            repo,
            input,
            erase,
            no_optimize,
            batch_size,
        } => {
            let adapter = open_repo(&repo)?;
            transfer::import(adapter, input, erase, !no_optimize, batch_size).await?;
        }

        Commands::Optimize { repo, dry_run } => {
            let adapter = open_repo(&repo)?;
            transfer::optimize(adapter, dry_run).await?;
        }

        Commands::Verify { repo, quiet } => {
            let adapter = open_repo(&repo)?;
            inspect::verify(adapter, quiet).await?;
        }

        Commands::Refs { repo, prefix, json } => {
            let adapter = open_repo(&repo)?;
            inspect::list_refs(&adapter, prefix, json)?;
        }

        Commands::Log {
            repo,
            reference,
            limit,
        } => {
            let adapter = open_repo(&repo)?;
            inspect::show_log(&adapter, &reference, limit)?;
        }
    }

    Ok(())
}
