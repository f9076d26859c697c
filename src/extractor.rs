//! Raw record extraction.
//!
//! An [`ApiExtractor`] streams the raw records of one fingerprint in id order
//! and hands each to an extract function producing tool-layer rows. Every
//! output row inherits the lineage of its raw record; the extract function may
//! set a remark. Destination tables are cleared for the fingerprint before the
//! first row is written, and the first error aborts the run.
//!
//! An incremental extraction reads only the raw records created since a point
//! in time and upserts their rows next to the existing ones.
//! [`StatefulApiExtractor`] picks the mode from the state of the previous
//! extraction, the same way collectors do.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use lake_harness_core::fingerprint::Fingerprint;
use lake_harness_core::models::{Lineage, RawRecord, SyncPolicy};
use lake_harness_core::row::{Row, RowFilter, StoredRow};
use lake_harness_core::store::Store;

use crate::batch::{BatchSaveDivider, DEFAULT_BATCH_SIZE};
use crate::collector_state::{CollectorStateManager, SyncMode};
use crate::error::{PipelineError, Result};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};

pub type ExtractFn = dyn Fn(&RawRecord) -> Result<Vec<StoredRow>> + Send + Sync;

/// Convert typed rows into stored rows.
pub fn to_stored<R: Row>(rows: Vec<R>) -> Result<Vec<StoredRow>> {
    rows.iter()
        .map(|row| StoredRow::from_row(row).map_err(PipelineError::Store))
        .collect()
}

pub struct ApiExtractorArgs {
    /// Full raw table name, e.g. `_raw_zentao_api_bugs`.
    pub raw_table: String,
    pub params: Value,
    /// Destination tables; all are cleared even when nothing is extracted.
    pub tables: Vec<String>,
    pub batch_size: usize,
    pub extract: Arc<ExtractFn>,
    /// Only extract raw records created at or after `since`, keeping
    /// existing rows.
    pub incremental: bool,
    pub since: Option<DateTime<Utc>>,
}

impl ApiExtractorArgs {
    pub fn new(
        raw_table: impl Into<String>,
        params: impl Serialize,
        extract: impl Fn(&RawRecord) -> Result<Vec<StoredRow>> + Send + Sync + 'static,
    ) -> Result<Self> {
        Ok(Self {
            raw_table: raw_table.into(),
            params: serde_json::to_value(params)?,
            tables: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            extract: Arc::new(extract),
            incremental: false,
            since: None,
        })
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.tables.push(table.into());
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self
    }

    /// Key of the extraction state: raw table and destination tables.
    pub fn state_key(&self) -> String {
        format!("{}>{}", self.raw_table, self.tables.join(","))
    }
}

/// Counts of one extraction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub records: u64,
    pub rows: u64,
}

pub struct ApiExtractor {
    store: Arc<dyn Store>,
    args: ApiExtractorArgs,
    fingerprint: Fingerprint,
    name: String,
    progress: Arc<dyn ProgressReporter>,
}

impl ApiExtractor {
    pub fn new(args: ApiExtractorArgs, store: Arc<dyn Store>) -> Result<Self> {
        let fingerprint = Fingerprint::from_params(&args.params)
            .map_err(|e| PipelineError::invalid(e.to_string()))?;
        if args.raw_table.is_empty() {
            return Err(PipelineError::invalid("raw table must not be empty"));
        }
        let name = format!("extract {}", args.raw_table);
        Ok(Self {
            store,
            args,
            fingerprint,
            name,
            progress: Arc::new(NoProgress),
        })
    }

    /// Report record counts under `name`.
    pub fn with_progress(mut self, name: impl Into<String>, progress: Arc<dyn ProgressReporter>) -> Self {
        self.name = name.into();
        self.progress = progress;
        self
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub async fn execute(self) -> Result<ExtractSummary> {
        let raw_table = self.args.raw_table.as_str();
        let params = self.fingerprint.as_str();
        let since = self.args.since.filter(|_| self.args.incremental);

        let mut divider = match since {
            Some(_) => BatchSaveDivider::append(self.store.clone(), self.args.batch_size)?,
            None => {
                let scope = RowFilter::by_params(params).with_raw_table(raw_table);
                BatchSaveDivider::new(self.store.clone(), self.args.batch_size, scope)?
            }
        };
        for table in &self.args.tables {
            divider.touch(table).await?;
        }

        let total = match since {
            Some(_) => None,
            None => Some(self.store.count_raw(raw_table, params).await?),
        };
        info!(table = raw_table, fingerprint = params, ?total, ?since, "extracting");

        let mut summary = ExtractSummary::default();
        let mut records = self.store.raw_records_since(raw_table, params, since);
        while let Some(record) = records.try_next().await? {
            let lineage = Lineage::from_raw(raw_table, &record);
            for mut row in (self.args.extract)(&record)? {
                let remark = row.lineage.remark.take();
                row.set_lineage(Lineage {
                    remark,
                    ..lineage.clone()
                });
                divider.add(row).await?;
                summary.rows += 1;
            }
            summary.records += 1;
            if summary.records % self.args.batch_size as u64 == 0 {
                self.progress.report(ProgressEvent::Progress {
                    subtask: self.name.clone(),
                    n: summary.records,
                    total,
                });
            }
        }
        drop(records);
        divider.close().await?;

        self.progress.report(ProgressEvent::Progress {
            subtask: self.name.clone(),
            n: summary.records,
            total: total.or(Some(summary.records)),
        });
        info!(
            table = raw_table,
            records = summary.records,
            rows = summary.rows,
            "extracted"
        );
        Ok(summary)
    }
}

/// An [`ApiExtractor`] whose mode comes from the state of its previous run.
///
/// A run after a successful extraction only reads raw records collected
/// since that extraction started. A full-sync policy, or a `time_after`
/// earlier than the one last used, extracts everything again.
pub struct StatefulApiExtractor {
    extractor: ApiExtractor,
    state: CollectorStateManager,
}

impl StatefulApiExtractor {
    pub async fn new(
        args: ApiExtractorArgs,
        store: Arc<dyn Store>,
        plugin: &str,
        policy: Option<&SyncPolicy>,
    ) -> Result<Self> {
        let fingerprint = Fingerprint::from_params(&args.params)
            .map_err(|e| PipelineError::invalid(e.to_string()))?;
        let state =
            CollectorStateManager::load(store.clone(), plugin, &args.state_key(), &fingerprint, policy).await?;
        let args = args.incremental(state.is_incremental()).since(state.since());
        let extractor = ApiExtractor::new(args, store)?;
        Ok(Self { extractor, state })
    }

    pub fn with_progress(mut self, name: impl Into<String>, progress: Arc<dyn ProgressReporter>) -> Self {
        self.extractor = self.extractor.with_progress(name, progress);
        self
    }

    pub fn mode(&self) -> SyncMode {
        self.state.mode()
    }

    pub async fn execute(self) -> Result<ExtractSummary> {
        let summary = self.extractor.execute().await?;
        self.state.close().await?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lake_harness_core::models::NewRawRecord;
    use lake_harness_core::store::memory::InMemoryStore;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct ToolBug {
        id: u64,
        title: String,
        #[serde(flatten)]
        lineage: Lineage,
    }

    impl Row for ToolBug {
        const TABLE: &'static str = "_tool_bugs";

        fn primary_key(&self) -> String {
            self.id.to_string()
        }

        fn lineage(&self) -> &Lineage {
            &self.lineage
        }

        fn lineage_mut(&mut self) -> &mut Lineage {
            &mut self.lineage
        }
    }

    async fn seed(store: &InMemoryStore, params: &str, bodies: &[Value]) {
        let records: Vec<NewRawRecord> = bodies
            .iter()
            .map(|b| NewRawRecord {
                params: params.into(),
                data: serde_json::to_vec(b).unwrap(),
                url: "http://x/bugs".into(),
                input: None,
            })
            .collect();
        store.insert_raw("_raw_bugs", &records).await.unwrap();
    }

    fn extract_bug(record: &RawRecord) -> Result<Vec<StoredRow>> {
        let body: Value = record.decode()?;
        let mut bug = ToolBug {
            id: body["id"].as_u64().unwrap_or_default(),
            title: body["title"].as_str().unwrap_or_default().to_string(),
            ..Default::default()
        };
        if body["closed"] == true {
            bug.lineage.remark = Some("closed".into());
        }
        to_stored(vec![bug])
    }

    #[tokio::test]
    async fn rows_inherit_lineage_and_remark() {
        let store = Arc::new(InMemoryStore::new());
        let params = json!({"ConnectionId": 1, "ProductId": 2});
        let fp = Fingerprint::from_params(&params).unwrap();
        seed(
            &store,
            fp.as_str(),
            &[json!({"id": 7, "title": "a"}), json!({"id": 8, "title": "b", "closed": true})],
        )
        .await;

        let args = ApiExtractorArgs::new("_raw_bugs", &params, extract_bug)
            .unwrap()
            .table(ToolBug::TABLE);
        let summary = ApiExtractor::new(args, store.clone()).unwrap().execute().await.unwrap();
        assert_eq!(summary, ExtractSummary { records: 2, rows: 2 });

        let first: ToolBug = store.get_row("_tool_bugs", "7").await.unwrap().unwrap().decode().unwrap();
        assert_eq!(first.lineage.raw_table, "_raw_bugs");
        assert_eq!(first.lineage.raw_params, fp.as_str());
        assert_eq!(first.lineage.raw_id, 1);
        assert_eq!(first.lineage.remark, None);

        let second = store.get_row("_tool_bugs", "8").await.unwrap().unwrap();
        assert_eq!(second.lineage.raw_id, 2);
        assert_eq!(second.lineage.remark.as_deref(), Some("closed"));
        assert_eq!(second.data["_raw_data_remark"], "closed");
    }

    #[tokio::test]
    async fn first_error_aborts() {
        let store = Arc::new(InMemoryStore::new());
        let params = json!({"ConnectionId": 1});
        let fp = Fingerprint::from_params(&params).unwrap();
        seed(&store, fp.as_str(), &[json!({"id": 1}), json!("not an object"), json!({"id": 3})]).await;

        let args = ApiExtractorArgs::new("_raw_bugs", &params, |record: &RawRecord| {
            let body: Value = record.decode()?;
            if !body.is_object() {
                return Err(PipelineError::malformed(format!("record {} is not an object", record.id)));
            }
            Ok(Vec::new())
        })
        .unwrap();
        let err = ApiExtractor::new(args, store).unwrap().execute().await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedPayload(_)));
    }

    #[tokio::test]
    async fn incremental_runs_only_extract_new_records() {
        let store = Arc::new(InMemoryStore::new());
        let params = json!({"ConnectionId": 1, "ProductId": 2});
        let fp = Fingerprint::from_params(&params).unwrap();
        seed(&store, fp.as_str(), &[json!({"id": 1, "title": "a"}), json!({"id": 2, "title": "b"})]).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let args = || {
            ApiExtractorArgs::new("_raw_bugs", &params, extract_bug)
                .unwrap()
                .table(ToolBug::TABLE)
        };
        let first = StatefulApiExtractor::new(args(), store.clone(), "zentao", None).await.unwrap();
        assert!(!first.mode().incremental);
        assert_eq!(first.execute().await.unwrap().records, 2);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        seed(&store, fp.as_str(), &[json!({"id": 2, "title": "b2"})]).await;

        let second = StatefulApiExtractor::new(args(), store.clone(), "zentao", None).await.unwrap();
        assert!(second.mode().incremental);
        assert_eq!(second.execute().await.unwrap(), ExtractSummary { records: 1, rows: 1 });

        assert_eq!(store.count_rows("_tool_bugs", &RowFilter::default()).await.unwrap(), 2);
        let edited = store.get_row("_tool_bugs", "2").await.unwrap().unwrap();
        assert_eq!(edited.data["title"], "b2");
        assert_eq!(edited.lineage.raw_id, 3);
        assert!(store.get_row("_tool_bugs", "1").await.unwrap().is_some());

        let full = SyncPolicy {
            full_sync: true,
            time_after: None,
        };
        let third = StatefulApiExtractor::new(args(), store.clone(), "zentao", Some(&full))
            .await
            .unwrap();
        assert!(!third.mode().incremental);
        assert_eq!(third.execute().await.unwrap().records, 3);
    }
}
