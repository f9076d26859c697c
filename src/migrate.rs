use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the framework tables in the configured database.
///
/// Raw and row tables are created on demand by the stages that write them.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_framework_tables(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Idempotent schema creation for collector state and subtask history.
pub async fn create_framework_tables(pool: &SqlitePool) -> Result<()> {
    // One row per (raw table, fingerprint)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _collector_latest_state (
            raw_data_table TEXT NOT NULL,
            raw_data_params TEXT NOT NULL,
            plugin TEXT NOT NULL,
            latest_success_start INTEGER,
            time_after INTEGER,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (raw_data_table, raw_data_params)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _subtask_states (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            plugin TEXT NOT NULL,
            subtask TEXT NOT NULL,
            stage TEXT NOT NULL,
            params TEXT NOT NULL,
            status TEXT NOT NULL,
            message TEXT,
            began_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_subtask_states_run_id ON _subtask_states(run_id)")
        .execute(pool)
        .await?;

    Ok(())
}
