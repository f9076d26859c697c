//! # Lake Harness CLI (`lake`)
//!
//! The `lake` binary initializes the database, runs collectors defined in
//! configuration, and shows collector state and subtask history.
//!
//! ## Usage
//!
//! ```bash
//! lake --config ./config/lake.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lake init` | Create the SQLite database and framework tables |
//! | `lake collect <name>` | Run the declarative collector `[collectors.<name>]` |
//! | `lake states` | List incremental collector states |
//! | `lake history` | List recorded subtask outcomes |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};

use lake_harness::cancel::RunRegistry;
use lake_harness::config;
use lake_harness::core::models::SyncPolicy;
use lake_harness::core::store::Store;
use lake_harness::declarative::DeclarativeCollect;
use lake_harness::logging;
use lake_harness::migrate;
use lake_harness::progress::ProgressMode;
use lake_harness::sqlite_store::SqliteStore;
use lake_harness::subtask::{run_scope, SubTask, TaskContext};

/// Lake Harness CLI: collect DevOps API data into SQLite.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/lake.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lake",
    about = "Lake Harness: collect, extract and convert DevOps API data",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lake.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the framework tables. Running it
    /// again is safe.
    Init,

    /// Run a declarative collector.
    ///
    /// Incremental by default: only records edited since the last successful
    /// run are fetched.
    Collect {
        /// Collector name, as in `[collectors.<name>]`.
        name: String,

        /// Ignore stored state and recollect everything.
        #[arg(long)]
        full: bool,

        /// Only collect records edited after this date (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        time_after: Option<String>,

        /// Progress output on stderr: `off`, `human` or `json`.
        /// Defaults to `human` on a terminal.
        #[arg(long)]
        progress: Option<ProgressMode>,
    },

    /// List collector states.
    States,

    /// List recorded subtask outcomes.
    History {
        /// Only show subtasks of this run.
        #[arg(long)]
        run: Option<String>,
    },
}

fn parse_time_after(value: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}': expected YYYY-MM-DD or RFC 3339", value))?;
    match date.and_hms_opt(0, 0, 0) {
        Some(midnight) => Ok(midnight.and_utc()),
        None => bail!("invalid date '{}'", value),
    }
}

fn format_ts(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Collect {
            name,
            full,
            time_after,
            progress,
        } => {
            let Some(collector) = cfg.collectors.get(&name).cloned() else {
                bail!(
                    "no collector named '{}' in {} (known: {})",
                    name,
                    cli.config.display(),
                    cfg.collectors.keys().cloned().collect::<Vec<_>>().join(", ")
                );
            };
            let time_after = time_after.as_deref().map(parse_time_after).transpose()?;
            let policy = (full || time_after.is_some()).then_some(SyncPolicy {
                full_sync: full,
                time_after,
            });

            let plugin = collector.plugin.clone();
            let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&cfg).await?);
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let ctx = TaskContext::new(plugin, store, Arc::new(cfg))
                .with_progress(Arc::from(progress.reporter()));

            let registry = Arc::new(RunRegistry::new());
            let run_id = ctx.run_id.clone();
            let ctx = ctx.with_cancel(registry.register(&run_id));
            let interrupt = {
                let registry = registry.clone();
                let run_id = run_id.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        eprintln!("Interrupted; cancelling run {}.", run_id);
                        registry.cancel(&run_id);
                    }
                })
            };

            let subtask = DeclarativeCollect::new(name.clone(), collector, policy);
            let scope = subtask.scope()?;
            let subtasks: Vec<Arc<dyn SubTask>> = vec![Arc::new(subtask)];
            let result = run_scope(&ctx, &scope, &subtasks).await;
            interrupt.abort();
            registry.remove(&run_id);

            match result {
                Ok(_) => println!("Collected '{}' (run {}).", name, run_id),
                Err(e) => bail!("collector '{}' failed (run {}): {}", name, run_id, e),
            }
        }
        Commands::States => {
            let store = SqliteStore::open(&cfg).await?;
            let states = store.list_collector_states().await?;
            if states.is_empty() {
                println!("No collector states.");
            }
            for state in states {
                println!(
                    "{}  {}  {}  latest_success_start={}  time_after={}",
                    state.plugin,
                    state.raw_table,
                    state.params,
                    format_ts(state.latest_success_start),
                    format_ts(state.time_after)
                );
            }
        }
        Commands::History { run } => {
            let store = SqliteStore::open(&cfg).await?;
            let statuses = store.list_subtask_statuses(run.as_deref()).await?;
            if statuses.is_empty() {
                println!("No subtask history.");
            }
            for status in statuses {
                println!(
                    "{}  {}  {}/{}  {}  {}  {}{}",
                    status.began_at.to_rfc3339(),
                    status.run_id,
                    status.plugin,
                    status.subtask,
                    status.stage,
                    status.params,
                    status.outcome,
                    status
                        .message
                        .map(|m| format!("  {}", m))
                        .unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_after_accepts_dates_and_timestamps() {
        assert_eq!(
            parse_time_after("2024-03-01").unwrap().to_rfc3339(),
            "2024-03-01T00:00:00+00:00"
        );
        assert_eq!(
            parse_time_after("2024-03-01T12:30:00Z").unwrap().to_rfc3339(),
            "2024-03-01T12:30:00+00:00"
        );
        assert!(parse_time_after("yesterday").is_err());
    }
}
