//! Storage abstraction for Lake Harness.
//!
//! The [`Store`] trait defines every persistence operation the pipeline
//! stages need: raw tables, row tables (tool and domain layer), collector
//! state, and subtask status. Backends are pluggable; the runtime crate ships
//! a SQLite store and this crate an in-memory one for tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::models::{CollectorState, NewRawRecord, RawRecord, SubtaskStatus};
use crate::row::{RowFilter, StoredRow};

/// Abstract storage backend for Lake Harness.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_raw_table`](Store::ensure_raw_table) | Create a `_raw_*` table if missing |
/// | [`insert_raw`](Store::insert_raw) | Append raw records |
/// | [`delete_raw`](Store::delete_raw) | Delete raw records of one fingerprint |
/// | [`raw_records`](Store::raw_records) | Stream raw records of one fingerprint in id order |
/// | [`raw_records_since`](Store::raw_records_since) | Same, limited to records created since a time |
/// | [`ensure_table`](Store::ensure_table) | Create a row table if missing |
/// | [`upsert_rows`](Store::upsert_rows) | Insert or replace rows by primary key |
/// | [`delete_rows`](Store::delete_rows) | Delete rows matching a lineage filter |
/// | [`rows`](Store::rows) | Stream rows matching a lineage filter |
/// | [`find_row`](Store::find_row) | Look up one row by a JSON field |
/// | [`get_collector_state`](Store::get_collector_state) | Load incremental state |
/// | [`record_subtask_status`](Store::record_subtask_status) | Persist a subtask outcome |
#[async_trait]
pub trait Store: Send + Sync {
    async fn ensure_raw_table(&self, table: &str) -> Result<()>;

    /// Append raw records, assigning increasing ids.
    async fn insert_raw(&self, table: &str, records: &[NewRawRecord]) -> Result<()>;

    /// Delete every raw record with the given fingerprint. Returns the count.
    async fn delete_raw(&self, table: &str, params: &str) -> Result<u64>;

    /// Forward-only cursor over the raw records of one fingerprint, by id.
    fn raw_records<'a>(&'a self, table: &'a str, params: &'a str) -> BoxStream<'a, Result<RawRecord>> {
        self.raw_records_since(table, params, None)
    }

    /// Like [`raw_records`](Store::raw_records), skipping records created
    /// before `since`. A missing table yields nothing.
    fn raw_records_since<'a>(
        &'a self,
        table: &'a str,
        params: &'a str,
        since: Option<DateTime<Utc>>,
    ) -> BoxStream<'a, Result<RawRecord>>;

    async fn count_raw(&self, table: &str, params: &str) -> Result<u64>;

    async fn ensure_table(&self, table: &str) -> Result<()>;

    /// Insert rows, replacing any existing row with the same `(table, id)`.
    async fn upsert_rows(&self, rows: &[StoredRow]) -> Result<()>;

    async fn delete_rows(&self, table: &str, filter: &RowFilter) -> Result<u64>;

    /// Forward-only cursor over matching rows, ordered by primary key.
    fn rows<'a>(&'a self, table: &'a str, filter: &'a RowFilter)
        -> BoxStream<'a, Result<StoredRow>>;

    /// First row whose top-level JSON `field` equals `value` (numbers compared
    /// by their decimal form). A table that does not exist yet holds no rows.
    async fn find_row(&self, table: &str, field: &str, value: &str) -> Result<Option<StoredRow>>;

    async fn get_row(&self, table: &str, id: &str) -> Result<Option<StoredRow>>;

    async fn count_rows(&self, table: &str, filter: &RowFilter) -> Result<u64>;

    async fn get_collector_state(
        &self,
        raw_table: &str,
        params: &str,
    ) -> Result<Option<CollectorState>>;

    /// Insert or replace the state keyed by `(raw_table, params)`.
    async fn put_collector_state(&self, state: &CollectorState) -> Result<()>;

    async fn list_collector_states(&self) -> Result<Vec<CollectorState>>;

    async fn record_subtask_status(&self, status: &SubtaskStatus) -> Result<()>;

    /// Statuses in recording order, optionally restricted to one run.
    async fn list_subtask_statuses(&self, run_id: Option<&str>) -> Result<Vec<SubtaskStatus>>;
}
