//! Tool-layer to domain-layer conversion.
//!
//! A [`DataConverter`] streams the tool-layer rows of one fingerprint through
//! a forward-only cursor and maps each to zero or more [`DomainRow`]s. Output
//! rows inherit the lineage of their input row and are written through a
//! table-keyed [`BatchSaveDivider`], which clears the destination tables for
//! the fingerprint first.
//!
//! Foreign keys are resolved with a [`KeyLookup`]; a key that cannot be found
//! resolves to an empty string instead of failing the conversion.
//!
//! An incremental conversion only reads rows extracted from raw records
//! created since a point in time, and upserts without clearing.
//! [`StatefulDataConverter`] picks the mode from the previous conversion.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use lake_harness_core::domain::DomainRow;
use lake_harness_core::fingerprint::Fingerprint;
use lake_harness_core::models::SyncPolicy;
use lake_harness_core::row::{RowFilter, StoredRow};
use lake_harness_core::store::Store;

use crate::batch::{BatchSaveDivider, DEFAULT_BATCH_SIZE};
use crate::collector_state::{CollectorStateManager, SyncMode};
use crate::error::{PipelineError, Result};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};

/// Cached lookups of rows by a JSON field.
pub struct KeyLookup {
    store: Arc<dyn Store>,
    cache: HashMap<(String, String, String), Option<StoredRow>>,
}

impl KeyLookup {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: HashMap::new(),
        }
    }

    /// Row of `table` whose `field` equals `value`.
    pub async fn find(&mut self, table: &str, field: &str, value: &str) -> Result<Option<&StoredRow>> {
        let key = (table.to_string(), field.to_string(), value.to_string());
        if !self.cache.contains_key(&key) {
            let found = self.store.find_row(table, field, value).await?;
            if found.is_none() {
                debug!(table, field, value, "foreign key not found");
            }
            self.cache.insert(key.clone(), found);
        }
        Ok(self.cache.get(&key).and_then(Option::as_ref))
    }

    /// Primary key of the row of `table` whose `field` equals `value`, or an
    /// empty string when there is none.
    pub async fn resolve(&mut self, table: &str, field: &str, value: &str) -> Result<String> {
        Ok(self
            .find(table, field, value)
            .await?
            .map(|row| row.id.clone())
            .unwrap_or_default())
    }

    /// Like [`resolve`](Self::resolve), reading `target` of the found row.
    pub async fn resolve_field(
        &mut self,
        table: &str,
        field: &str,
        value: &str,
        target: &str,
    ) -> Result<String> {
        Ok(self
            .find(table, field, value)
            .await?
            .and_then(|row| row.field_str(target))
            .unwrap_or_default())
    }
}

/// Maps one tool-layer row to domain rows.
#[async_trait]
pub trait Convert: Send {
    async fn convert(&mut self, row: &StoredRow, keys: &mut KeyLookup) -> Result<Vec<DomainRow>>;
}

/// [`Convert`] for functions that need no lookups.
pub struct FnConvert<F>(pub F);

#[async_trait]
impl<F> Convert for FnConvert<F>
where
    F: Fn(&StoredRow) -> Result<Vec<DomainRow>> + Send + Sync,
{
    async fn convert(&mut self, row: &StoredRow, _keys: &mut KeyLookup) -> Result<Vec<DomainRow>> {
        (self.0)(row)
    }
}

pub struct DataConverterArgs {
    /// Tool-layer table read as input.
    pub input_table: String,
    /// Raw table the input rows were extracted from.
    pub raw_table: String,
    pub params: Value,
    /// Destination tables; all are cleared even when nothing is converted.
    pub tables: Vec<String>,
    pub batch_size: usize,
    /// Only convert rows of raw records created at or after `since`.
    pub incremental: bool,
    pub since: Option<DateTime<Utc>>,
}

impl DataConverterArgs {
    pub fn new(
        input_table: impl Into<String>,
        raw_table: impl Into<String>,
        params: impl Serialize,
    ) -> Result<Self> {
        Ok(Self {
            input_table: input_table.into(),
            raw_table: raw_table.into(),
            params: serde_json::to_value(params)?,
            tables: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
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

    /// Key of the conversion state: input table and destination tables.
    pub fn state_key(&self) -> String {
        format!("{}>{}", self.input_table, self.tables.join(","))
    }
}

pub struct DataConverter<C: Convert> {
    store: Arc<dyn Store>,
    args: DataConverterArgs,
    fingerprint: Fingerprint,
    convert: C,
    name: String,
    progress: Arc<dyn ProgressReporter>,
}

impl<C: Convert> DataConverter<C> {
    pub fn new(args: DataConverterArgs, convert: C, store: Arc<dyn Store>) -> Result<Self> {
        let fingerprint = Fingerprint::from_params(&args.params)
            .map_err(|e| PipelineError::invalid(e.to_string()))?;
        let name = format!("convert {}", args.input_table);
        Ok(Self {
            store,
            args,
            fingerprint,
            convert,
            name,
            progress: Arc::new(NoProgress),
        })
    }

    pub fn with_progress(mut self, name: impl Into<String>, progress: Arc<dyn ProgressReporter>) -> Self {
        self.name = name.into();
        self.progress = progress;
        self
    }

    /// Returns the number of domain rows written.
    pub async fn execute(mut self) -> Result<u64> {
        let mut scope = RowFilter::by_params(self.fingerprint.as_str()).with_raw_table(self.args.raw_table.as_str());
        let since = self.args.since.filter(|_| self.args.incremental);

        let mut divider = match since {
            Some(since) => {
                let first = first_new_raw_id(self.store.as_ref(), &self.args.raw_table, self.fingerprint.as_str(), since);
                let Some(min_raw_id) = first.await? else {
                    info!(table = %self.args.input_table, %since, "nothing collected since last conversion");
                    return Ok(0);
                };
                scope = scope.with_min_raw_id(min_raw_id);
                BatchSaveDivider::append(self.store.clone(), self.args.batch_size)?
            }
            None => BatchSaveDivider::new(self.store.clone(), self.args.batch_size, scope.clone())?,
        };
        for table in &self.args.tables {
            divider.touch(table).await?;
        }

        let total = self.store.count_rows(&self.args.input_table, &scope).await?;
        info!(
            table = %self.args.input_table,
            fingerprint = %self.fingerprint,
            total,
            ?since,
            "converting"
        );

        let mut keys = KeyLookup::new(self.store.clone());
        let mut converted = 0u64;
        let mut seen = 0u64;
        let store = self.store.clone();
        let mut rows = store.rows(&self.args.input_table, &scope);
        while let Some(row) = rows.try_next().await? {
            for mut out in self.convert.convert(&row, &mut keys).await? {
                *out.lineage_mut() = row.lineage.clone();
                divider.add_domain(&out).await?;
                converted += 1;
            }
            seen += 1;
            if seen % self.args.batch_size as u64 == 0 {
                self.progress.report(ProgressEvent::Progress {
                    subtask: self.name.clone(),
                    n: seen,
                    total: Some(total),
                });
            }
        }
        drop(rows);
        divider.close().await?;

        self.progress.report(ProgressEvent::Progress {
            subtask: self.name.clone(),
            n: seen,
            total: Some(total),
        });
        info!(table = %self.args.input_table, rows = seen, converted, "converted");
        Ok(converted)
    }
}

/// Lowest raw id collected since `since`, or `None` when nothing new was
/// collected.
async fn first_new_raw_id(
    store: &dyn Store,
    raw_table: &str,
    params: &str,
    since: DateTime<Utc>,
) -> Result<Option<u64>> {
    let mut records = store.raw_records_since(raw_table, params, Some(since));
    Ok(records.try_next().await?.map(|record| record.id))
}

/// A [`DataConverter`] whose mode comes from the state of its previous run.
///
/// After a successful conversion, the next run only converts rows extracted
/// from raw records collected since that conversion started.
pub struct StatefulDataConverter<C: Convert> {
    converter: DataConverter<C>,
    state: CollectorStateManager,
}

impl<C: Convert> StatefulDataConverter<C> {
    pub async fn new(
        args: DataConverterArgs,
        convert: C,
        store: Arc<dyn Store>,
        plugin: &str,
        policy: Option<&SyncPolicy>,
    ) -> Result<Self> {
        let fingerprint = Fingerprint::from_params(&args.params)
            .map_err(|e| PipelineError::invalid(e.to_string()))?;
        let state =
            CollectorStateManager::load(store.clone(), plugin, &args.state_key(), &fingerprint, policy).await?;
        let args = args.incremental(state.is_incremental()).since(state.since());
        let converter = DataConverter::new(args, convert, store)?;
        Ok(Self { converter, state })
    }

    pub fn with_progress(mut self, name: impl Into<String>, progress: Arc<dyn ProgressReporter>) -> Self {
        self.converter = self.converter.with_progress(name, progress);
        self
    }

    pub fn mode(&self) -> SyncMode {
        self.state.mode()
    }

    pub async fn execute(self) -> Result<u64> {
        let converted = self.converter.execute().await?;
        self.state.close().await?;
        Ok(converted)
    }
}
