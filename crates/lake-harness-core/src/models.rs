//! Core data models used throughout Lake Harness.
//!
//! These types describe the raw payloads collected from external APIs, the
//! provenance every derived row carries, and the bookkeeping rows the
//! framework persists between runs (collector state, subtask status).

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Provenance columns carried by every tool-layer and domain-layer row.
///
/// Serialized with the `_raw_data_*` column names so a row's JSON form and
/// its table columns agree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    #[serde(rename = "_raw_data_table", default)]
    pub raw_table: String,
    #[serde(rename = "_raw_data_params", default)]
    pub raw_params: String,
    #[serde(rename = "_raw_data_id", default)]
    pub raw_id: u64,
    #[serde(rename = "_raw_data_remark", default)]
    pub remark: Option<String>,
}

impl Lineage {
    /// Lineage pointing at a single raw record.
    pub fn from_raw(table: &str, record: &RawRecord) -> Self {
        Self {
            raw_table: table.to_string(),
            raw_params: record.params.clone(),
            raw_id: record.id,
            remark: None,
        }
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = Some(remark.into());
        self
    }
}

/// An immutable raw API message as persisted in a `_raw_*` table.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub id: u64,
    /// Scope fingerprint of the run that collected this record.
    pub params: String,
    /// Opaque payload, normally one JSON message.
    pub data: Vec<u8>,
    pub url: String,
    /// JSON of the request context (iterator input) that produced this record.
    pub input: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl RawRecord {
    /// Decode the payload as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.data)
    }

    /// Decode the originating request context, if one was recorded.
    pub fn decode_input<T: DeserializeOwned>(&self) -> serde_json::Result<Option<T>> {
        match &self.input {
            Some(bytes) => serde_json::from_slice(bytes).map(Some),
            None => Ok(None),
        }
    }
}

/// A raw record before the store has assigned its id and timestamp.
#[derive(Debug, Clone)]
pub struct NewRawRecord {
    pub params: String,
    pub data: Vec<u8>,
    pub url: String,
    pub input: Option<Vec<u8>>,
}

/// Persisted incremental-collection state for one collector and scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectorState {
    pub plugin: String,
    pub raw_table: String,
    pub params: String,
    /// Start time of the latest successful run.
    pub latest_success_start: Option<DateTime<Utc>>,
    /// The `time_after` policy in effect for that run.
    pub time_after: Option<DateTime<Utc>>,
}

/// Per-run collection policy supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SyncPolicy {
    /// Ignore stored state and recollect everything.
    #[serde(default)]
    pub full_sync: bool,
    /// Only collect records created or edited after this instant.
    #[serde(default)]
    pub time_after: Option<DateTime<Utc>>,
}

/// Pipeline stage a subtask belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Collect,
    Extract,
    Convert,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Collect => "collect",
            Stage::Extract => "extract",
            Stage::Convert => "convert",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "collect" => Ok(Stage::Collect),
            "extract" => Ok(Stage::Extract),
            "convert" => Ok(Stage::Convert),
            other => bail!("unknown stage: '{}'", other),
        }
    }
}

/// Terminal status of a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskOutcome {
    Succeeded,
    Failed,
    Cancelled,
    /// Not executed because an upstream subtask of the same scope failed.
    Skipped,
}

impl SubtaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskOutcome::Succeeded => "succeeded",
            SubtaskOutcome::Failed => "failed",
            SubtaskOutcome::Cancelled => "cancelled",
            SubtaskOutcome::Skipped => "skipped",
        }
    }
}

impl fmt::Display for SubtaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubtaskOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "succeeded" => Ok(SubtaskOutcome::Succeeded),
            "failed" => Ok(SubtaskOutcome::Failed),
            "cancelled" => Ok(SubtaskOutcome::Cancelled),
            "skipped" => Ok(SubtaskOutcome::Skipped),
            other => bail!("unknown subtask outcome: '{}'", other),
        }
    }
}

/// Recorded result of one subtask execution, kept for manual retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtaskStatus {
    pub run_id: String,
    pub plugin: String,
    pub subtask: String,
    pub stage: Stage,
    /// Scope fingerprint the subtask ran against.
    pub params: String,
    pub outcome: SubtaskOutcome,
    pub message: Option<String>,
    pub began_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lineage_serializes_with_column_names() {
        let lineage = Lineage {
            raw_table: "_raw_zentao_story".into(),
            raw_params: r#"{"ConnectionId":1}"#.into(),
            raw_id: 7,
            remark: None,
        };
        let value = serde_json::to_value(&lineage).unwrap();
        assert_eq!(value["_raw_data_table"], "_raw_zentao_story");
        assert_eq!(value["_raw_data_id"], 7);
        assert!(value["_raw_data_remark"].is_null());
    }

    #[test]
    fn raw_record_decodes_payload_and_input() {
        let record = RawRecord {
            id: 1,
            params: "{}".into(),
            data: br#"{"id": 42}"#.to_vec(),
            url: "http://example.test/issues".into(),
            input: Some(br#"{"Id": 3}"#.to_vec()),
            created_at: Utc::now(),
        };
        let body: serde_json::Value = record.decode().unwrap();
        assert_eq!(body["id"], 42);
        let input: Option<serde_json::Value> = record.decode_input().unwrap();
        assert_eq!(input.unwrap()["Id"], 3);
    }

    #[test]
    fn outcome_round_trips_through_str() {
        for outcome in [
            SubtaskOutcome::Succeeded,
            SubtaskOutcome::Failed,
            SubtaskOutcome::Cancelled,
            SubtaskOutcome::Skipped,
        ] {
            assert_eq!(outcome.as_str().parse::<SubtaskOutcome>().unwrap(), outcome);
        }
        assert!("exploded".parse::<SubtaskOutcome>().is_err());
    }
}
