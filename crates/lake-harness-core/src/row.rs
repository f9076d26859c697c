//! Typed rows and the generic stored-row envelope.
//!
//! Tool-layer and domain-layer rows are plain serde structs implementing
//! [`Row`]. Stores persist them generically as a [`StoredRow`]: primary key,
//! lineage columns, and the JSON form of the whole typed row.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Lineage;

/// A typed row stored in a named table.
pub trait Row: Serialize + DeserializeOwned + Send + Sync {
    /// Destination table name.
    const TABLE: &'static str;

    /// Primary key, unique within [`TABLE`](Self::TABLE).
    fn primary_key(&self) -> String;

    fn lineage(&self) -> &Lineage;

    fn lineage_mut(&mut self) -> &mut Lineage;
}

/// Selects rows by their lineage columns. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFilter {
    pub raw_table: Option<String>,
    pub raw_params: Option<String>,
    /// Only rows extracted from raw records with at least this id.
    pub min_raw_id: Option<u64>,
}

impl RowFilter {
    /// Match every row whose lineage carries the given fingerprint.
    pub fn by_params(params: impl Into<String>) -> Self {
        Self {
            raw_table: None,
            raw_params: Some(params.into()),
            min_raw_id: None,
        }
    }

    pub fn with_raw_table(mut self, table: impl Into<String>) -> Self {
        self.raw_table = Some(table.into());
        self
    }

    pub fn with_min_raw_id(mut self, id: u64) -> Self {
        self.min_raw_id = Some(id);
        self
    }

    pub fn matches(&self, lineage: &Lineage) -> bool {
        self.raw_table
            .as_deref()
            .map_or(true, |t| t == lineage.raw_table)
            && self
                .raw_params
                .as_deref()
                .map_or(true, |p| p == lineage.raw_params)
            && self.min_raw_id.map_or(true, |min| lineage.raw_id >= min)
    }
}

/// Type-erased row as persisted by a [`Store`](crate::store::Store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub table: String,
    pub id: String,
    pub lineage: Lineage,
    /// JSON object of the full typed row, lineage keys included.
    pub data: Value,
}

impl StoredRow {
    pub fn from_row<R: Row>(row: &R) -> Result<Self> {
        let data = serde_json::to_value(row)
            .with_context(|| format!("failed to serialize row for table '{}'", R::TABLE))?;
        Ok(Self {
            table: R::TABLE.to_string(),
            id: row.primary_key(),
            lineage: row.lineage().clone(),
            data,
        })
    }

    /// Decode the row back into its typed form.
    pub fn decode<R: Row>(&self) -> Result<R> {
        serde_json::from_value(self.data.clone())
            .with_context(|| format!("failed to decode row '{}' of table '{}'", self.id, self.table))
    }

    /// Replace the lineage, keeping the embedded JSON in sync.
    pub fn set_lineage(&mut self, lineage: Lineage) {
        if let Value::Object(map) = &mut self.data {
            map.insert("_raw_data_table".into(), Value::from(lineage.raw_table.clone()));
            map.insert("_raw_data_params".into(), Value::from(lineage.raw_params.clone()));
            map.insert("_raw_data_id".into(), Value::from(lineage.raw_id));
            map.insert(
                "_raw_data_remark".into(),
                lineage.remark.clone().map_or(Value::Null, Value::from),
            );
        }
        self.lineage = lineage;
    }

    /// Read a top-level field of the row as a string, numbers included.
    pub fn field_str(&self, field: &str) -> Option<String> {
        match self.data.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}
