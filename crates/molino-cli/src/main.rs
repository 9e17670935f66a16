use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use molino_storage::{DbMode, StorageConfig, TableCount, UnifiedDbManager};
use molino_sync::{SyncConfig, SyncManager, SyncOutcome};

#[derive(Debug, Parser)]
#[command(name = "molino-cli")]
#[command(about = "Gestión RRHH: hybrid database and sync tooling")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Connection and sync state overview
    Status,
    /// Show what a sync would do without writing
    Preview,
    /// Full bidirectional sync
    Sync {
        /// Ignore the last-sync watermark and rescan everything
        #[arg(long)]
        force: bool,
    },
    /// Cloud → local only
    Download {
        /// Comma-separated table subset
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
    },
    /// Local → cloud only
    Upload {
        /// Comma-separated table subset
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
    },
    /// Row counts per registry table
    Counts {
        #[arg(long, conflicts_with = "local")]
        cloud: bool,
        #[arg(long)]
        local: bool,
    },
}

fn table_filter(tables: Vec<String>) -> Option<Vec<String>> {
    if tables.is_empty() {
        None
    } else {
        Some(tables)
    }
}

fn print_outcome(outcome: &SyncOutcome) {
    println!(
        "run {}: {} (down {} / up {} / conflicts {}, {:.2}s)",
        outcome.run_id,
        if outcome.success { "ok" } else { "failed" },
        outcome.downloaded,
        outcome.uploaded,
        outcome.conflicts,
        outcome.duration_seconds
    );
    for error in &outcome.errors {
        eprintln!("  error: {error}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let db = Arc::new(UnifiedDbManager::connect(StorageConfig::from_env()).await?);

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Status => {
            let status = db.status().await;
            println!("current year: {}", status.current_year);
            println!("mode: {}", status.mode);
            match (&status.cloud_host, &status.cloud_ping) {
                (Some(host), Some(ping)) => println!("cloud: {host} (ping {ping})"),
                _ => println!("cloud: offline"),
            }
            println!("sqlite: {}/{}", status.sqlite_dir, status.sqlite_db_name);

            let sync = SyncManager::new(db.clone(), SyncConfig::from_env())?;
            let report = sync.status().await;
            println!(
                "last sync: {}",
                report
                    .last_sync
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            );
            println!(
                "pending: up {} / down {} / conflicts {}",
                report.pending_uploads, report.pending_downloads, report.conflicts
            );
            println!("synced: {}", if report.is_synced { "yes" } else { "no" });
        }
        Commands::Preview => {
            let mut sync = SyncManager::new(db.clone(), SyncConfig::from_env())?;
            let preview = sync.preview().await;
            println!("would download: {}", preview.will_download);
            println!("would upload: {}", preview.will_upload);
            println!("potential conflicts: {}", preview.potential_conflicts);
            println!(
                "tables affected: {}",
                if preview.tables_affected.is_empty() {
                    "none".to_string()
                } else {
                    preview.tables_affected.join(", ")
                }
            );
        }
        Commands::Sync { force } => {
            let mut sync = SyncManager::new(db.clone(), SyncConfig::from_env())?;
            let outcome = sync.full_sync(force).await?;
            print_outcome(&outcome);
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Commands::Download { tables } => {
            let mut sync = SyncManager::new(db.clone(), SyncConfig::from_env())?;
            let outcome = sync.sync_download(table_filter(tables).as_deref()).await?;
            print_outcome(&outcome);
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Commands::Upload { tables } => {
            let mut sync = SyncManager::new(db.clone(), SyncConfig::from_env())?;
            let outcome = sync.sync_upload(table_filter(tables).as_deref()).await?;
            print_outcome(&outcome);
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Commands::Counts { cloud, local } => {
            let mode = if cloud {
                DbMode::Cloud
            } else if local {
                DbMode::Local
            } else {
                DbMode::Auto
            };
            for (table, count) in db.table_counts(mode).await {
                match count {
                    TableCount::Rows(n) => println!("{table}: {n}"),
                    TableCount::Error(err) => println!("{table}: error: {err}"),
                }
            }
        }
    }

    db.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_and_download_args_parse() {
        let cli = Cli::try_parse_from(["molino-cli", "sync", "--force"]).expect("parse");
        assert!(matches!(cli.command, Some(Commands::Sync { force: true })));

        let cli = Cli::try_parse_from(["molino-cli", "download", "--tables", "saldos,menu"])
            .expect("parse");
        match cli.command {
            Some(Commands::Download { tables }) => {
                assert_eq!(tables, vec!["saldos".to_string(), "menu".to_string()]);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(Cli::try_parse_from(["molino-cli", "counts", "--cloud", "--local"]).is_err());
    }
}
