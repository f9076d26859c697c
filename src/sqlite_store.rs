//! SQLite-backed [`Store`] implementation.
//!
//! Raw tables hold one API message per row, keyed by an autoincrement id.
//! Row tables (tool and domain layer) share one generic layout: the primary
//! key, the four lineage columns, and the JSON of the typed row in `data`.
//!
//! Cursors are keyset paginated (`WHERE id > ? ORDER BY id LIMIT ?`), so a
//! stream never holds a connection between pages and stays valid while the
//! consumer writes to other tables.
//!
//! Tables are created on demand by the stages writing them. Reads of a table
//! that does not exist yet see no rows, as a lookup into an empty table would.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool};

use lake_harness_core::models::{CollectorState, Lineage, NewRawRecord, RawRecord, SubtaskStatus};
use lake_harness_core::row::{RowFilter, StoredRow};
use lake_harness_core::store::Store;

use crate::config::Config;
use crate::{db, migrate};

/// Rows fetched per cursor round-trip.
const PAGE_SIZE: i64 = 500;

/// Rows per multi-row INSERT statement.
const INSERT_CHUNK: usize = 200;

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and create the framework tables.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::create_framework_tables(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Table names are interpolated into SQL, so only `[A-Za-z0-9_]` is allowed.
fn ident(name: &str) -> Result<&str> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("invalid table or field name: '{}'", name);
    }
    Ok(name)
}

async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

fn ts_to_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|t| t.timestamp_millis())
}

fn millis_to_ts(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

fn raw_from_row(row: &SqliteRow) -> RawRecord {
    let id: i64 = row.get("id");
    let created_at: i64 = row.get("created_at");
    RawRecord {
        id: id as u64,
        params: row.get("params"),
        data: row.get("data"),
        url: row.get("url"),
        input: row.get("input"),
        created_at: millis_to_ts(Some(created_at)).unwrap_or_default(),
    }
}

fn stored_from_row(table: &str, row: &SqliteRow) -> Result<StoredRow> {
    let id: String = row.get("id");
    let raw_id: i64 = row.get("_raw_data_id");
    let data: String = row.get("data");
    Ok(StoredRow {
        table: table.to_string(),
        lineage: Lineage {
            raw_table: row.get("_raw_data_table"),
            raw_params: row.get("_raw_data_params"),
            raw_id: raw_id as u64,
            remark: row.get("_raw_data_remark"),
        },
        data: serde_json::from_str(&data)
            .with_context(|| format!("corrupt JSON in {}.{}", table, id))?,
        id,
    })
}

fn state_from_row(row: &SqliteRow) -> CollectorState {
    CollectorState {
        plugin: row.get("plugin"),
        raw_table: row.get("raw_data_table"),
        params: row.get("raw_data_params"),
        latest_success_start: millis_to_ts(row.get("latest_success_start")),
        time_after: millis_to_ts(row.get("time_after")),
    }
}

fn status_from_row(row: &SqliteRow) -> Result<SubtaskStatus> {
    let stage: String = row.get("stage");
    let status: String = row.get("status");
    let began_at: i64 = row.get("began_at");
    let finished_at: i64 = row.get("finished_at");
    Ok(SubtaskStatus {
        run_id: row.get("run_id"),
        plugin: row.get("plugin"),
        subtask: row.get("subtask"),
        stage: stage.parse()?,
        params: row.get("params"),
        outcome: status.parse()?,
        message: row.get("message"),
        began_at: millis_to_ts(Some(began_at)).unwrap_or_default(),
        finished_at: millis_to_ts(Some(finished_at)).unwrap_or_default(),
    })
}

// Lineage filter as static SQL: a NULL bind disables its condition.
const FILTER_SQL: &str = "(?1 IS NULL OR _raw_data_table = ?1) AND (?2 IS NULL OR _raw_data_params = ?2) \
                          AND (?3 IS NULL OR _raw_data_id >= ?3)";

#[async_trait]
impl Store for SqliteStore {
    async fn ensure_raw_table(&self, table: &str) -> Result<()> {
        let t = ident(table)?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                params TEXT NOT NULL,
                data BLOB NOT NULL,
                url TEXT NOT NULL,
                input BLOB,
                created_at INTEGER NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{t}_params ON {t}(params, id)"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_raw(&self, table: &str, records: &[NewRawRecord]) -> Result<()> {
        let t = ident(table)?;
        if records.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for chunk in records.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("INSERT INTO {t} (params, data, url, input, created_at) "));
            qb.push_values(chunk, |mut b, record| {
                b.push_bind(&record.params)
                    .push_bind(&record.data)
                    .push_bind(&record.url)
                    .push_bind(&record.input)
                    .push_bind(now);
            });
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_raw(&self, table: &str, params: &str) -> Result<u64> {
        let t = ident(table)?;
        let result = sqlx::query(&format!("DELETE FROM {t} WHERE params = ?"))
            .bind(params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn raw_records_since<'a>(
        &'a self,
        table: &'a str,
        params: &'a str,
        since: Option<DateTime<Utc>>,
    ) -> BoxStream<'a, Result<RawRecord>> {
        let sql = match ident(table) {
            Ok(t) => format!(
                "SELECT id, params, data, url, input, created_at FROM {t} \
                 WHERE params = ?1 AND (?2 IS NULL OR created_at >= ?2) AND id > ?3 \
                 ORDER BY id LIMIT ?4"
            ),
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        let since = ts_to_millis(since);
        stream::try_unfold(Some(0i64), move |cursor| {
            let sql = sql.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok(None);
                };
                if after == 0 && !table_exists(&self.pool, table).await? {
                    return Ok(None);
                }
                let rows = sqlx::query(&sql)
                    .bind(params)
                    .bind(since)
                    .bind(after)
                    .bind(PAGE_SIZE)
                    .fetch_all(&self.pool)
                    .await?;
                let next = if (rows.len() as i64) < PAGE_SIZE {
                    None
                } else {
                    rows.last().map(|r| r.get::<i64, _>("id"))
                };
                let page: Vec<RawRecord> = rows.iter().map(raw_from_row).collect();
                Ok::<_, anyhow::Error>(Some((page, next)))
            }
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    async fn count_raw(&self, table: &str, params: &str) -> Result<u64> {
        let t = ident(table)?;
        if !table_exists(&self.pool, t).await? {
            return Ok(0);
        }
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {t} WHERE params = ?"))
            .bind(params)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn ensure_table(&self, table: &str) -> Result<()> {
        let t = ident(table)?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                id TEXT PRIMARY KEY,
                _raw_data_table TEXT NOT NULL DEFAULT '',
                _raw_data_params TEXT NOT NULL DEFAULT '',
                _raw_data_id INTEGER NOT NULL DEFAULT 0,
                _raw_data_remark TEXT,
                data TEXT NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{t}_raw_data_params ON {t}(_raw_data_params)"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_rows(&self, rows: &[StoredRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let mut start = 0;
        while start < rows.len() {
            // Contiguous rows of one table share a statement.
            let table = &rows[start].table;
            let end = rows[start..]
                .iter()
                .position(|r| &r.table != table)
                .map_or(rows.len(), |offset| start + offset)
                .min(start + INSERT_CHUNK);
            let t = ident(table)?;
            let batch = &rows[start..end];
            let encoded = batch
                .iter()
                .map(|r| serde_json::to_string(&r.data))
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "INSERT INTO {t} (id, _raw_data_table, _raw_data_params, _raw_data_id, _raw_data_remark, data) "
            ));
            qb.push_values(batch.iter().zip(encoded.iter()), |mut b, (row, data)| {
                b.push_bind(&row.id)
                    .push_bind(&row.lineage.raw_table)
                    .push_bind(&row.lineage.raw_params)
                    .push_bind(row.lineage.raw_id as i64)
                    .push_bind(&row.lineage.remark)
                    .push_bind(data);
            });
            qb.push(
                " ON CONFLICT(id) DO UPDATE SET \
                 _raw_data_table = excluded._raw_data_table, \
                 _raw_data_params = excluded._raw_data_params, \
                 _raw_data_id = excluded._raw_data_id, \
                 _raw_data_remark = excluded._raw_data_remark, \
                 data = excluded.data",
            );
            qb.build().execute(&mut *tx).await?;
            start = end;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_rows(&self, table: &str, filter: &RowFilter) -> Result<u64> {
        let t = ident(table)?;
        if !table_exists(&self.pool, t).await? {
            return Ok(0);
        }
        let result = sqlx::query(&format!("DELETE FROM {t} WHERE {FILTER_SQL}"))
            .bind(filter.raw_table.as_deref())
            .bind(filter.raw_params.as_deref())
            .bind(filter.min_raw_id.map(|id| id as i64))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn rows<'a>(
        &'a self,
        table: &'a str,
        filter: &'a RowFilter,
    ) -> BoxStream<'a, Result<StoredRow>> {
        let sql = match ident(table) {
            Ok(t) => format!(
                "SELECT id, _raw_data_table, _raw_data_params, _raw_data_id, _raw_data_remark, data \
                 FROM {t} WHERE {FILTER_SQL} AND id > ?4 ORDER BY id LIMIT ?5"
            ),
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        stream::try_unfold(Some((true, String::new())), move |cursor| {
            let sql = sql.clone();
            async move {
                let Some((first, after)) = cursor else {
                    return Ok(None);
                };
                if first && !table_exists(&self.pool, table).await? {
                    return Ok(None);
                }
                let rows = sqlx::query(&sql)
                    .bind(filter.raw_table.as_deref())
                    .bind(filter.raw_params.as_deref())
                    .bind(filter.min_raw_id.map(|id| id as i64))
                    .bind(&after)
                    .bind(PAGE_SIZE)
                    .fetch_all(&self.pool)
                    .await?;
                let next = if (rows.len() as i64) < PAGE_SIZE {
                    None
                } else {
                    rows.last().map(|r| (false, r.get::<String, _>("id")))
                };
                let page = rows
                    .iter()
                    .map(|r| stored_from_row(table, r))
                    .collect::<Result<Vec<_>>>()?;
                Ok::<_, anyhow::Error>(Some((page, next)))
            }
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    async fn find_row(&self, table: &str, field: &str, value: &str) -> Result<Option<StoredRow>> {
        let t = ident(table)?;
        let f = ident(field)?;
        if !table_exists(&self.pool, t).await? {
            return Ok(None);
        }
        let row = sqlx::query(&format!(
            "SELECT id, _raw_data_table, _raw_data_params, _raw_data_id, _raw_data_remark, data \
             FROM {t} WHERE CAST(json_extract(data, '$.{f}') AS TEXT) = ? ORDER BY id LIMIT 1"
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| stored_from_row(table, &r)).transpose()
    }

    async fn get_row(&self, table: &str, id: &str) -> Result<Option<StoredRow>> {
        let t = ident(table)?;
        if !table_exists(&self.pool, t).await? {
            return Ok(None);
        }
        let row = sqlx::query(&format!(
            "SELECT id, _raw_data_table, _raw_data_params, _raw_data_id, _raw_data_remark, data \
             FROM {t} WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| stored_from_row(table, &r)).transpose()
    }

    async fn count_rows(&self, table: &str, filter: &RowFilter) -> Result<u64> {
        let t = ident(table)?;
        if !table_exists(&self.pool, t).await? {
            return Ok(0);
        }
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {t} WHERE {FILTER_SQL}"))
            .bind(filter.raw_table.as_deref())
            .bind(filter.raw_params.as_deref())
            .bind(filter.min_raw_id.map(|id| id as i64))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn get_collector_state(
        &self,
        raw_table: &str,
        params: &str,
    ) -> Result<Option<CollectorState>> {
        let row = sqlx::query(
            "SELECT plugin, raw_data_table, raw_data_params, latest_success_start, time_after \
             FROM _collector_latest_state WHERE raw_data_table = ? AND raw_data_params = ?",
        )
        .bind(raw_table)
        .bind(params)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(state_from_row))
    }

    async fn put_collector_state(&self, state: &CollectorState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO _collector_latest_state
                (raw_data_table, raw_data_params, plugin, latest_success_start, time_after, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(raw_data_table, raw_data_params) DO UPDATE SET
                plugin = excluded.plugin,
                latest_success_start = excluded.latest_success_start,
                time_after = excluded.time_after,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.raw_table)
        .bind(&state.params)
        .bind(&state.plugin)
        .bind(ts_to_millis(state.latest_success_start))
        .bind(ts_to_millis(state.time_after))
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_collector_states(&self) -> Result<Vec<CollectorState>> {
        let rows = sqlx::query(
            "SELECT plugin, raw_data_table, raw_data_params, latest_success_start, time_after \
             FROM _collector_latest_state ORDER BY raw_data_table, raw_data_params",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(state_from_row).collect())
    }

    async fn record_subtask_status(&self, status: &SubtaskStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO _subtask_states
                (run_id, plugin, subtask, stage, params, status, message, began_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&status.run_id)
        .bind(&status.plugin)
        .bind(&status.subtask)
        .bind(status.stage.as_str())
        .bind(&status.params)
        .bind(status.outcome.as_str())
        .bind(&status.message)
        .bind(status.began_at.timestamp_millis())
        .bind(status.finished_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_subtask_statuses(&self, run_id: Option<&str>) -> Result<Vec<SubtaskStatus>> {
        let rows = sqlx::query(
            "SELECT run_id, plugin, subtask, stage, params, status, message, began_at, finished_at \
             FROM _subtask_states WHERE (?1 IS NULL OR run_id = ?1) ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(status_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_validated() {
        assert!(ident("_raw_zentao_story").is_ok());
        assert!(ident("issues").is_ok());
        assert!(ident("").is_err());
        assert!(ident("issues; DROP TABLE x").is_err());
        assert!(ident("a-b").is_err());
    }

    #[test]
    fn timestamps_round_trip_through_millis() {
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis());
        assert_eq!(millis_to_ts(ts_to_millis(now)), now);
        assert_eq!(millis_to_ts(None), None);
    }
}
