//! Batched row writers.
//!
//! A [`BatchSave`] buffers rows of one table and upserts them in fixed-size
//! batches. Before its first write it deletes the rows left by a previous run
//! of the same scope, so a stage always replaces its output instead of
//! appending to it. [`BatchSaveDivider`] keeps one writer per destination
//! table for stages that emit several row kinds.
//!
//! Incremental stages use [`BatchSave::append`] and
//! [`BatchSaveDivider::append`], which upsert without clearing anything.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use lake_harness_core::domain::DomainRow;
use lake_harness_core::row::{RowFilter, StoredRow};
use lake_harness_core::store::Store;

use crate::error::{PipelineError, Result};

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Buffered writer for one table.
pub struct BatchSave {
    store: Arc<dyn Store>,
    table: String,
    size: usize,
    /// Rows of the previous run to replace; `None` appends.
    scope: Option<RowFilter>,
    cleared: bool,
    buffer: Vec<StoredRow>,
    /// Buffer position of each primary key, for last-wins de-duplication.
    positions: HashMap<String, usize>,
    flushes: usize,
    written: u64,
}

impl BatchSave {
    pub fn new(store: Arc<dyn Store>, table: impl Into<String>, size: usize, scope: RowFilter) -> Result<Self> {
        Self::with_scope(store, table.into(), size, Some(scope))
    }

    /// Writer that upserts into `table` and never deletes.
    pub fn append(store: Arc<dyn Store>, table: impl Into<String>, size: usize) -> Result<Self> {
        Self::with_scope(store, table.into(), size, None)
    }

    fn with_scope(store: Arc<dyn Store>, table: String, size: usize, scope: Option<RowFilter>) -> Result<Self> {
        if size == 0 {
            return Err(PipelineError::invalid("batch size must be > 0"));
        }
        Ok(Self {
            store,
            table,
            size,
            scope,
            cleared: false,
            buffer: Vec::with_capacity(size),
            positions: HashMap::new(),
            flushes: 0,
            written: 0,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Buffer a row, flushing when the batch is full.
    pub async fn add(&mut self, row: StoredRow) -> Result<()> {
        if row.table != self.table {
            return Err(PipelineError::invalid(format!(
                "row of table '{}' added to writer of '{}'",
                row.table, self.table
            )));
        }
        if !self.cleared {
            self.clear_scope().await?;
        }
        match self.positions.entry(row.id.clone()) {
            Entry::Occupied(slot) => self.buffer[*slot.get()] = row,
            Entry::Vacant(slot) => {
                slot.insert(self.buffer.len());
                self.buffer.push(row);
            }
        }
        if self.buffer.len() >= self.size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write out buffered rows.
    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.store.upsert_rows(&self.buffer).await?;
        self.flushes += 1;
        self.written += self.buffer.len() as u64;
        debug!(table = %self.table, rows = self.buffer.len(), "flushed batch");
        self.buffer.clear();
        self.positions.clear();
        Ok(())
    }

    /// Flush what is left and consume the writer.
    pub async fn close(mut self) -> Result<u64> {
        self.flush().await?;
        Ok(self.written)
    }

    /// Number of batches written so far.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    async fn clear_scope(&mut self) -> Result<()> {
        self.store.ensure_table(&self.table).await?;
        if let Some(scope) = &self.scope {
            let deleted = self.store.delete_rows(&self.table, scope).await?;
            debug!(table = %self.table, deleted, "cleared rows of previous run");
        }
        self.cleared = true;
        Ok(())
    }
}

impl Drop for BatchSave {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            warn!(
                table = %self.table,
                rows = self.buffer.len(),
                "batch writer dropped with unflushed rows"
            );
        }
    }
}

/// One [`BatchSave`] per destination table, created on first use.
pub struct BatchSaveDivider {
    store: Arc<dyn Store>,
    size: usize,
    scope: Option<RowFilter>,
    writers: BTreeMap<String, BatchSave>,
}

impl BatchSaveDivider {
    /// Writers created by the divider replace rows matching `scope`.
    pub fn new(store: Arc<dyn Store>, size: usize, scope: RowFilter) -> Result<Self> {
        Self::with_scope(store, size, Some(scope))
    }

    /// Divider whose writers only upsert.
    pub fn append(store: Arc<dyn Store>, size: usize) -> Result<Self> {
        Self::with_scope(store, size, None)
    }

    fn with_scope(store: Arc<dyn Store>, size: usize, scope: Option<RowFilter>) -> Result<Self> {
        if size == 0 {
            return Err(PipelineError::invalid("batch size must be > 0"));
        }
        Ok(Self {
            store,
            size,
            scope,
            writers: BTreeMap::new(),
        })
    }

    /// Writer of `table`.
    pub fn for_table(&mut self, table: &str) -> Result<&mut BatchSave> {
        if !self.writers.contains_key(table) {
            let writer = BatchSave::with_scope(self.store.clone(), table.to_string(), self.size, self.scope.clone())?;
            self.writers.insert(table.to_string(), writer);
        }
        self.writers
            .get_mut(table)
            .ok_or_else(|| PipelineError::invalid(format!("no writer for table '{}'", table)))
    }

    pub async fn add(&mut self, row: StoredRow) -> Result<()> {
        let table = row.table.clone();
        self.for_table(&table)?.add(row).await
    }

    pub async fn add_domain(&mut self, row: &DomainRow) -> Result<()> {
        self.add(row.to_stored()?).await
    }

    /// Clear `table` for the scope even if no row is written to it. Only
    /// creates the table when appending.
    pub async fn touch(&mut self, table: &str) -> Result<()> {
        let writer = self.for_table(table)?;
        if !writer.cleared {
            writer.clear_scope().await?;
        }
        Ok(())
    }

    /// Close every writer. Returns rows written per table.
    pub async fn close(self) -> Result<BTreeMap<String, u64>> {
        let mut written = BTreeMap::new();
        let mut errors = Vec::new();
        for (table, writer) in self.writers {
            match writer.close().await {
                Ok(n) => {
                    written.insert(table, n);
                }
                Err(e) => errors.push(e),
            }
        }
        PipelineError::from_list(errors)?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lake_harness_core::models::Lineage;
    use lake_harness_core::store::memory::InMemoryStore;
    use serde_json::json;

    fn row(table: &str, id: &str, params: &str, title: &str) -> StoredRow {
        StoredRow {
            table: table.into(),
            id: id.into(),
            lineage: Lineage {
                raw_table: "_raw_x".into(),
                raw_params: params.into(),
                raw_id: 1,
                remark: None,
            },
            data: json!({"id": id, "title": title}),
        }
    }

    #[tokio::test]
    async fn duplicate_keys_keep_the_last_row() {
        let store = Arc::new(InMemoryStore::new());
        let mut batch = BatchSave::new(store.clone(), "t", 10, RowFilter::by_params("p")).unwrap();
        batch.add(row("t", "1", "p", "first")).await.unwrap();
        batch.add(row("t", "1", "p", "second")).await.unwrap();
        batch.add(row("t", "2", "p", "other")).await.unwrap();
        assert_eq!(batch.close().await.unwrap(), 2);

        let stored = store.get_row("t", "1").await.unwrap().unwrap();
        assert_eq!(stored.data["title"], "second");
    }

    #[tokio::test]
    async fn rows_of_other_scopes_survive() {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_rows(&[row("t", "a", "other", "keep"), row("t", "b", "p", "old")])
            .await
            .unwrap();

        let mut batch = BatchSave::new(store.clone(), "t", 10, RowFilter::by_params("p")).unwrap();
        batch.add(row("t", "c", "p", "new")).await.unwrap();
        batch.close().await.unwrap();

        assert!(store.get_row("t", "a").await.unwrap().is_some());
        assert!(store.get_row("t", "b").await.unwrap().is_none());
        assert!(store.get_row("t", "c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn wrong_table_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let mut batch = BatchSave::new(store, "t", 10, RowFilter::by_params("p")).unwrap();
        assert!(batch.add(row("u", "1", "p", "x")).await.is_err());
    }

    #[tokio::test]
    async fn divider_routes_by_table() {
        let store = Arc::new(InMemoryStore::new());
        let mut divider = BatchSaveDivider::new(store.clone(), 2, RowFilter::by_params("p")).unwrap();
        for i in 0..3 {
            divider.add(row("a", &i.to_string(), "p", "x")).await.unwrap();
        }
        divider.add(row("b", "0", "p", "y")).await.unwrap();
        let written = divider.close().await.unwrap();
        assert_eq!(written["a"], 3);
        assert_eq!(written["b"], 1);
        assert_eq!(store.count_rows("a", &RowFilter::default()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn append_mode_keeps_rows_of_the_same_scope() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_rows(&[row("t", "old", "p", "kept")]).await.unwrap();

        let mut batch = BatchSave::append(store.clone(), "t", 10).unwrap();
        batch.add(row("t", "new", "p", "added")).await.unwrap();
        batch.close().await.unwrap();

        assert!(store.get_row("t", "old").await.unwrap().is_some());
        assert!(store.get_row("t", "new").await.unwrap().is_some());
    }
}
