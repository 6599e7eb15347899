use std::path::PathBuf;

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};

use braid_core::ids::SessionId;
use braid_core::RetentionPolicy;
use braid_store::{CheckpointStore, FileStore};
use braid_telemetry::{init_telemetry, TelemetryConfig};

/// Inspect and maintain a braid session store on disk.
#[derive(Parser)]
#[command(name = "braid", version, about)]
struct Cli {
    /// Store directory (defaults to ~/.braid)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List session ids in the store
    Sessions,
    /// Show the latest snapshot of a session
    Show { session_id: String },
    /// List a session's checkpoints, newest first
    Checkpoints {
        session_id: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Apply a retention policy to a session's checkpoints
    Prune {
        session_id: String,
        /// Keep only the newest checkpoint
        #[arg(long, conflicts_with_all = ["keep_last", "max_age_hours"])]
        latest_only: bool,
        /// Keep the newest N checkpoints
        #[arg(long, conflicts_with = "max_age_hours")]
        keep_last: Option<usize>,
        /// Keep checkpoints newer than this many hours
        #[arg(long)]
        max_age_hours: Option<i64>,
    },
    /// Drop snapshots and checkpoints older than a cutoff, store-wide
    Gc {
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
    },
    /// Delete sessions with no recent activity
    Inactive {
        #[arg(long, default_value_t = 720)]
        threshold_hours: i64,
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig::default());

    let cli = Cli::parse();
    let root = cli
        .store
        .unwrap_or_else(|| dirs_home().join(".braid"));
    let store = FileStore::open(&root)
        .with_context(|| format!("opening store at {}", root.display()))?;
    tracing::info!(path = %root.display(), "store ready");

    match cli.command {
        Command::Sessions => {
            for id in store.list_session_ids().await? {
                println!("{id}");
            }
        }
        Command::Show { session_id } => {
            let session_id = SessionId::from_raw(&session_id);
            let snapshot = store.load_snapshot(&session_id).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Checkpoints { session_id, limit } => {
            let session_id = SessionId::from_raw(&session_id);
            for entry in store.list_checkpoints(&session_id, limit).await? {
                println!(
                    "{}  {}  step={} source={} message_index={}",
                    entry.checkpoint_id,
                    entry.created_at.to_rfc3339(),
                    entry.step,
                    entry.source,
                    entry.message_index
                );
            }
        }
        Command::Prune {
            session_id,
            latest_only,
            keep_last,
            max_age_hours,
        } => {
            let policy = if latest_only {
                RetentionPolicy::LatestOnly
            } else if let Some(n) = keep_last {
                RetentionPolicy::LastN(n)
            } else if let Some(hours) = max_age_hours {
                RetentionPolicy::TimeBased(Duration::hours(hours))
            } else {
                anyhow::bail!(
                    "choose a policy: --latest-only, --keep-last N, or --max-age-hours H"
                );
            };
            let session_id = SessionId::from_raw(&session_id);
            let deleted = store.prune_checkpoints(&session_id, &policy).await?;
            println!("deleted {deleted} checkpoint(s)");
        }
        Command::Gc { older_than_days } => {
            let cutoff = Utc::now() - Duration::days(older_than_days);
            let removed = store.delete_older_than(cutoff).await?;
            println!("removed {removed} record(s)");
        }
        Command::Inactive {
            threshold_hours,
            dry_run,
        } => {
            let affected = store
                .delete_inactive_sessions(Duration::hours(threshold_hours), dry_run)
                .await?;
            if dry_run {
                println!("{affected} inactive session(s) would be deleted");
            } else {
                println!("deleted {affected} inactive session(s)");
            }
        }
    }

    Ok(())
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
