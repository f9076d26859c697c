//! In-memory [`Store`] implementation for testing.
//!
//! Uses `HashMap` and `BTreeMap` behind `std::sync::RwLock` for thread
//! safety. Tables are created on first write; reading a missing table yields
//! nothing. Streams iterate over a snapshot taken when the stream is created.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};

use crate::models::{CollectorState, NewRawRecord, RawRecord, SubtaskStatus};
use crate::row::{RowFilter, StoredRow};

use super::Store;

#[derive(Default)]
struct RawTable {
    next_id: u64,
    records: Vec<RawRecord>,
}

/// In-memory store for tests and dry runs.
pub struct InMemoryStore {
    raw: RwLock<HashMap<String, RawTable>>,
    rows: RwLock<HashMap<String, BTreeMap<String, StoredRow>>>,
    states: RwLock<BTreeMap<(String, String), CollectorState>>,
    statuses: RwLock<Vec<SubtaskStatus>>,
    upsert_calls: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            raw: RwLock::new(HashMap::new()),
            rows: RwLock::new(HashMap::new()),
            states: RwLock::new(BTreeMap::new()),
            statuses: RwLock::new(Vec::new()),
            upsert_calls: AtomicUsize::new(0),
        }
    }

    /// Number of [`Store::upsert_rows`] calls so far.
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ensure_raw_table(&self, table: &str) -> Result<()> {
        let mut raw = self.raw.write().unwrap();
        raw.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn insert_raw(&self, table: &str, records: &[NewRawRecord]) -> Result<()> {
        let mut raw = self.raw.write().unwrap();
        let stored = raw.entry(table.to_string()).or_default();
        for record in records {
            stored.next_id += 1;
            stored.records.push(RawRecord {
                id: stored.next_id,
                params: record.params.clone(),
                data: record.data.clone(),
                url: record.url.clone(),
                input: record.input.clone(),
                created_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn delete_raw(&self, table: &str, params: &str) -> Result<u64> {
        let mut raw = self.raw.write().unwrap();
        let Some(stored) = raw.get_mut(table) else {
            return Ok(0);
        };
        let before = stored.records.len();
        stored.records.retain(|r| r.params != params);
        Ok((before - stored.records.len()) as u64)
    }

    fn raw_records_since<'a>(
        &'a self,
        table: &'a str,
        params: &'a str,
        since: Option<DateTime<Utc>>,
    ) -> BoxStream<'a, Result<RawRecord>> {
        let snapshot: Vec<RawRecord> = self
            .raw
            .read()
            .unwrap()
            .get(table)
            .map(|t| {
                t.records
                    .iter()
                    .filter(|r| r.params == params)
                    .filter(|r| since.map_or(true, |since| r.created_at >= since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        stream::iter(snapshot.into_iter().map(Ok)).boxed()
    }

    async fn count_raw(&self, table: &str, params: &str) -> Result<u64> {
        let raw = self.raw.read().unwrap();
        Ok(raw
            .get(table)
            .map(|t| t.records.iter().filter(|r| r.params == params).count())
            .unwrap_or(0) as u64)
    }

    async fn ensure_table(&self, table: &str) -> Result<()> {
        let mut rows = self.rows.write().unwrap();
        rows.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn upsert_rows(&self, rows: &[StoredRow]) -> Result<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.rows.write().unwrap();
        for row in rows {
            tables
                .entry(row.table.clone())
                .or_default()
                .insert(row.id.clone(), row.clone());
        }
        Ok(())
    }

    async fn delete_rows(&self, table: &str, filter: &RowFilter) -> Result<u64> {
        let mut tables = self.rows.write().unwrap();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|_, row| !filter.matches(&row.lineage));
        Ok((before - rows.len()) as u64)
    }

    fn rows<'a>(
        &'a self,
        table: &'a str,
        filter: &'a RowFilter,
    ) -> BoxStream<'a, Result<StoredRow>> {
        let snapshot: Vec<StoredRow> = self
            .rows
            .read()
            .unwrap()
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| filter.matches(&row.lineage))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        stream::iter(snapshot.into_iter().map(Ok)).boxed()
    }

    async fn find_row(&self, table: &str, field: &str, value: &str) -> Result<Option<StoredRow>> {
        let tables = self.rows.read().unwrap();
        Ok(tables.get(table).and_then(|rows| {
            rows.values()
                .find(|row| row.field_str(field).as_deref() == Some(value))
                .cloned()
        }))
    }

    async fn get_row(&self, table: &str, id: &str) -> Result<Option<StoredRow>> {
        let tables = self.rows.read().unwrap();
        Ok(tables.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    async fn count_rows(&self, table: &str, filter: &RowFilter) -> Result<u64> {
        let tables = self.rows.read().unwrap();
        Ok(tables
            .get(table)
            .map(|rows| rows.values().filter(|r| filter.matches(&r.lineage)).count())
            .unwrap_or(0) as u64)
    }

    async fn get_collector_state(
        &self,
        raw_table: &str,
        params: &str,
    ) -> Result<Option<CollectorState>> {
        let states = self.states.read().unwrap();
        Ok(states
            .get(&(raw_table.to_string(), params.to_string()))
            .cloned())
    }

    async fn put_collector_state(&self, state: &CollectorState) -> Result<()> {
        let mut states = self.states.write().unwrap();
        states.insert(
            (state.raw_table.clone(), state.params.clone()),
            state.clone(),
        );
        Ok(())
    }

    async fn list_collector_states(&self) -> Result<Vec<CollectorState>> {
        let states = self.states.read().unwrap();
        Ok(states.values().cloned().collect())
    }

    async fn record_subtask_status(&self, status: &SubtaskStatus) -> Result<()> {
        self.statuses.write().unwrap().push(status.clone());
        Ok(())
    }

    async fn list_subtask_statuses(&self, run_id: Option<&str>) -> Result<Vec<SubtaskStatus>> {
        let statuses = self.statuses.read().unwrap();
        Ok(statuses
            .iter()
            .filter(|s| run_id.map_or(true, |id| s.run_id == id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Lineage;
    use futures::TryStreamExt;
    use serde_json::json;

    fn raw(params: &str, body: &str) -> NewRawRecord {
        NewRawRecord {
            params: params.into(),
            data: body.as_bytes().to_vec(),
            url: "http://example.test".into(),
            input: None,
        }
    }

    fn row(id: &str, params: &str) -> StoredRow {
        StoredRow {
            table: "_tool_items".into(),
            id: id.into(),
            lineage: Lineage {
                raw_table: "_raw_items".into(),
                raw_params: params.into(),
                raw_id: 1,
                remark: None,
            },
            data: json!({"id": id, "number": 7}),
        }
    }

    #[tokio::test]
    async fn raw_records_are_partitioned_by_params() {
        let store = InMemoryStore::new();
        store
            .insert_raw("_raw_items", &[raw("a", "1"), raw("b", "2"), raw("a", "3")])
            .await
            .unwrap();

        let a: Vec<RawRecord> = store.raw_records("_raw_items", "a").try_collect().await.unwrap();
        assert_eq!(a.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);

        assert_eq!(store.delete_raw("_raw_items", "a").await.unwrap(), 2);
        assert_eq!(store.count_raw("_raw_items", "a").await.unwrap(), 0);
        assert_eq!(store.count_raw("_raw_items", "b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn raw_records_since_skips_older_records() {
        let store = InMemoryStore::new();
        store.insert_raw("_raw_items", &[raw("a", "1")]).await.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let cut = Utc::now();
        store.insert_raw("_raw_items", &[raw("a", "2")]).await.unwrap();

        let newer: Vec<RawRecord> = store
            .raw_records_since("_raw_items", "a", Some(cut))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(newer.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2]);
        assert!(store
            .raw_records_since("_missing", "a", Some(cut))
            .try_collect::<Vec<_>>()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_by_id_and_delete_respects_filter() {
        let store = InMemoryStore::new();
        store.upsert_rows(&[row("1", "a"), row("2", "b")]).await.unwrap();
        store.upsert_rows(&[row("1", "a")]).await.unwrap();
        assert_eq!(store.count_rows("_tool_items", &RowFilter::default()).await.unwrap(), 2);
        assert_eq!(store.upsert_calls(), 2);

        let deleted = store
            .delete_rows("_tool_items", &RowFilter::by_params("a"))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_row("_tool_items", "2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn find_row_matches_numeric_fields() {
        let store = InMemoryStore::new();
        store.upsert_rows(&[row("x", "a")]).await.unwrap();
        let found = store.find_row("_tool_items", "number", "7").await.unwrap();
        assert_eq!(found.map(|r| r.id).as_deref(), Some("x"));
        assert!(store.find_row("_tool_items", "number", "8").await.unwrap().is_none());
        assert!(store.find_row("_missing", "number", "7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn collector_state_is_keyed_by_table_and_params() {
        let store = InMemoryStore::new();
        let mut state = CollectorState {
            plugin: "zentao".into(),
            raw_table: "_raw_zentao_stories".into(),
            params: "p".into(),
            latest_success_start: None,
            time_after: None,
        };
        store.put_collector_state(&state).await.unwrap();
        state.latest_success_start = Some(Utc::now());
        store.put_collector_state(&state).await.unwrap();

        let states = store.list_collector_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(
            store
                .get_collector_state("_raw_zentao_stories", "p")
                .await
                .unwrap(),
            Some(state)
        );
    }
}
