//! Input iterators.
//!
//! A collector with an input iterator issues one logical request (possibly
//! many pages) per input. Inputs are JSON values exposed to URL templates as
//! `{{Input.<Field>}}`.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lake_harness_core::row::{RowFilter, StoredRow};
use lake_harness_core::store::Store;

use crate::error::{PipelineError, Result};

#[async_trait]
pub trait InputIterator: Send {
    /// Next input, or `None` once exhausted.
    async fn fetch(&mut self) -> Result<Option<Value>>;

    /// Release resources held by the iterator.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Iterates over a fixed list of inputs.
pub struct VecIterator {
    items: VecDeque<Value>,
}

impl VecIterator {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items: items.into(),
        }
    }

    /// Serialize typed inputs.
    pub fn from_serializable<T: Serialize>(items: &[T]) -> Result<Self> {
        let items = items
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self::new(items))
    }
}

#[async_trait]
impl InputIterator for VecIterator {
    async fn fetch(&mut self) -> Result<Option<Value>> {
        Ok(self.items.pop_front())
    }
}

pub type RowMapper = dyn Fn(&StoredRow) -> Result<Option<Value>> + Send + Sync;

/// Streams inputs from rows of a store table, typically the tool-layer rows
/// of a previous collection (collect the comments of every issue).
///
/// Rows are read by a background task through a bounded channel, so only a
/// window of the table is held in memory.
pub struct StoreRowIterator {
    rx: mpsc::Receiver<Result<Value>>,
    reader: JoinHandle<()>,
}

impl StoreRowIterator {
    /// `map` turns a row into an input; returning `None` skips the row.
    pub fn new(
        store: Arc<dyn Store>,
        table: impl Into<String>,
        filter: RowFilter,
        map: impl Fn(&StoredRow) -> Result<Option<Value>> + Send + Sync + 'static,
    ) -> Self {
        let table = table.into();
        let (tx, rx) = mpsc::channel(100);
        let reader = tokio::spawn(async move {
            let mut rows = store.rows(&table, &filter);
            while let Some(row) = rows.next().await {
                let item = match row {
                    Ok(row) => match map(&row) {
                        Ok(Some(value)) => Ok(value),
                        Ok(None) => continue,
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(PipelineError::Store(e)),
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        Self { rx, reader }
    }
}

#[async_trait]
impl InputIterator for StoreRowIterator {
    async fn fetch(&mut self) -> Result<Option<Value>> {
        self.rx.recv().await.transpose()
    }

    async fn close(&mut self) -> Result<()> {
        self.reader.abort();
        Ok(())
    }
}

impl Drop for StoreRowIterator {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lake_harness_core::models::Lineage;
    use lake_harness_core::store::memory::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn vec_iterator_yields_in_order() {
        let mut it = VecIterator::new(vec![json!({"Id": 1}), json!({"Id": 2})]);
        assert_eq!(it.fetch().await.unwrap(), Some(json!({"Id": 1})));
        assert_eq!(it.fetch().await.unwrap(), Some(json!({"Id": 2})));
        assert_eq!(it.fetch().await.unwrap(), None);
    }

    #[tokio::test]
    async fn store_iterator_maps_and_filters_rows() {
        let store = Arc::new(InMemoryStore::new());
        let rows: Vec<StoredRow> = (1..=3)
            .map(|i| StoredRow {
                table: "_tool_issues".into(),
                id: format!("{i}"),
                lineage: Lineage {
                    raw_params: "p".into(),
                    ..Default::default()
                },
                data: json!({"number": i, "closed": i == 2}),
            })
            .collect();
        store.upsert_rows(&rows).await.unwrap();

        let mut it = StoreRowIterator::new(
            store,
            "_tool_issues",
            RowFilter::by_params("p"),
            |row| {
                if row.data["closed"] == true {
                    return Ok(None);
                }
                Ok(Some(json!({"Number": row.data["number"]})))
            },
        );
        let mut seen = Vec::new();
        while let Some(input) = it.fetch().await.unwrap() {
            seen.push(input["Number"].as_u64().unwrap());
        }
        it.close().await.unwrap();
        assert_eq!(seen, vec![1, 3]);
    }
}
