//! Incremental collection state.
//!
//! [`CollectorStateManager`] loads the persisted [`CollectorState`] of one
//! collector and scope, decides whether the coming run is incremental, and
//! saves the new state once the run succeeded. [`StatefulApiCollector`] wires
//! it around an [`ApiCollector`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use lake_harness_core::fingerprint::Fingerprint;
use lake_harness_core::models::{CollectorState, SyncPolicy};
use lake_harness_core::store::Store;

use crate::api_client::AsyncApiClient;
use crate::collector::{ApiCollector, ApiCollectorArgs};
use crate::error::{PipelineError, Result};

/// Collection mode chosen for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMode {
    pub incremental: bool,
    /// Lower bound passed to the request builders.
    pub since: Option<DateTime<Utc>>,
}

/// Decide the collection mode from the previous state and the run policy.
///
/// Without a policy the run is incremental from the last successful start.
/// A run with no previous success, a full-sync policy, or a `time_after`
/// reaching further back than the one previously used collects everything
/// since `time_after`.
pub fn calculate_mode(previous: Option<&CollectorState>, policy: Option<&SyncPolicy>) -> SyncMode {
    let latest = previous.and_then(|s| s.latest_success_start);
    let Some(policy) = policy else {
        return SyncMode {
            incremental: latest.is_some(),
            since: latest,
        };
    };
    let full = SyncMode {
        incremental: false,
        since: policy.time_after,
    };
    if latest.is_none() || policy.full_sync {
        return full;
    }
    let stored_after = previous.and_then(|s| s.time_after);
    if let (Some(wanted), Some(stored)) = (policy.time_after, stored_after) {
        if wanted < stored {
            return full;
        }
    }
    SyncMode {
        incremental: true,
        since: latest,
    }
}

/// Loads and saves the state of one `(raw table, fingerprint)` pair.
pub struct CollectorStateManager {
    store: Arc<dyn Store>,
    plugin: String,
    raw_table: String,
    params: String,
    time_after: Option<DateTime<Utc>>,
    mode: SyncMode,
    run_start: DateTime<Utc>,
}

impl CollectorStateManager {
    /// Load the previous state and compute the mode of the run starting now.
    pub async fn load(
        store: Arc<dyn Store>,
        plugin: &str,
        raw_table: &str,
        fingerprint: &Fingerprint,
        policy: Option<&SyncPolicy>,
    ) -> Result<Self> {
        let run_start = Utc::now();
        let previous = store
            .get_collector_state(raw_table, fingerprint.as_str())
            .await?;
        let mode = calculate_mode(previous.as_ref(), policy);
        Ok(Self {
            store,
            plugin: plugin.to_string(),
            raw_table: raw_table.to_string(),
            params: fingerprint.to_string(),
            time_after: policy.and_then(|p| p.time_after),
            mode,
            run_start,
        })
    }

    /// Force a full run for a source that cannot be queried incrementally.
    /// The lower bound stays at the policy's `time_after`.
    pub fn without_incremental(mut self) -> Self {
        self.mode = SyncMode {
            incremental: false,
            since: self.time_after,
        };
        self
    }

    pub fn is_incremental(&self) -> bool {
        self.mode.incremental
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.mode.since
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Persist the state of a successful run, stamped with its start time.
    pub async fn close(self) -> Result<CollectorState> {
        let state = CollectorState {
            plugin: self.plugin,
            raw_table: self.raw_table,
            params: self.params,
            latest_success_start: Some(self.run_start),
            time_after: self.time_after,
        };
        self.store.put_collector_state(&state).await?;
        Ok(state)
    }
}

/// An [`ApiCollector`] whose mode comes from persisted state.
///
/// `incremental` and `since` of the given arguments are overwritten by the
/// computed mode, which is always full when the arguments do not support
/// incremental collection. State is only written after a successful run.
pub struct StatefulApiCollector {
    collector: ApiCollector,
    state: CollectorStateManager,
}

impl StatefulApiCollector {
    pub async fn new(
        args: ApiCollectorArgs,
        client: AsyncApiClient,
        store: Arc<dyn Store>,
        policy: Option<&SyncPolicy>,
    ) -> Result<Self> {
        let fingerprint = Fingerprint::from_params(&args.params)
            .map_err(|e| PipelineError::invalid(e.to_string()))?;
        let state = CollectorStateManager::load(
            store.clone(),
            &args.plugin,
            &args.raw_table(),
            &fingerprint,
            policy,
        )
        .await?;
        let state = if args.supports_incremental {
            state
        } else {
            state.without_incremental()
        };
        let args = args
            .incremental(state.is_incremental())
            .since(state.since());
        let collector = ApiCollector::new(args, client, store)?;
        Ok(Self { collector, state })
    }

    pub fn mode(&self) -> SyncMode {
        self.state.mode()
    }

    pub async fn execute(self) -> Result<u64> {
        let mode = self.state.mode();
        let raw_table = self.collector.raw_table().to_string();
        let collected = self.collector.execute().await?;
        let state = self.state.close().await?;
        info!(
            table = %raw_table,
            incremental = mode.incremental,
            latest_success_start = ?state.latest_success_start,
            "saved collector state"
        );
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lake_harness_core::store::memory::InMemoryStore;
    use serde_json::json;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn state(latest: Option<DateTime<Utc>>, after: Option<DateTime<Utc>>) -> CollectorState {
        CollectorState {
            plugin: "zentao".into(),
            raw_table: "_raw_zentao_api_bugs".into(),
            params: "{}".into(),
            latest_success_start: latest,
            time_after: after,
        }
    }

    #[test]
    fn first_run_without_policy_is_full() {
        let mode = calculate_mode(None, None);
        assert!(!mode.incremental);
        assert_eq!(mode.since, None);
    }

    #[test]
    fn prior_success_without_policy_is_incremental() {
        let prev = state(Some(ts(10)), None);
        let mode = calculate_mode(Some(&prev), None);
        assert!(mode.incremental);
        assert_eq!(mode.since, Some(ts(10)));
    }

    #[test]
    fn full_sync_policy_forces_full_collection() {
        let prev = state(Some(ts(10)), None);
        let policy = SyncPolicy {
            full_sync: true,
            time_after: Some(ts(2)),
        };
        let mode = calculate_mode(Some(&prev), Some(&policy));
        assert!(!mode.incremental);
        assert_eq!(mode.since, Some(ts(2)));
    }

    #[test]
    fn earlier_time_after_forces_full_collection() {
        let prev = state(Some(ts(10)), Some(ts(5)));
        let earlier = SyncPolicy {
            full_sync: false,
            time_after: Some(ts(3)),
        };
        assert_eq!(
            calculate_mode(Some(&prev), Some(&earlier)),
            SyncMode {
                incremental: false,
                since: Some(ts(3))
            }
        );

        let later = SyncPolicy {
            full_sync: false,
            time_after: Some(ts(7)),
        };
        assert_eq!(
            calculate_mode(Some(&prev), Some(&later)),
            SyncMode {
                incremental: true,
                since: Some(ts(10))
            }
        );
    }

    #[test]
    fn policy_without_prior_success_is_full() {
        let policy = SyncPolicy {
            full_sync: false,
            time_after: Some(ts(4)),
        };
        let mode = calculate_mode(Some(&state(None, None)), Some(&policy));
        assert!(!mode.incremental);
        assert_eq!(mode.since, Some(ts(4)));
    }

    #[tokio::test]
    async fn close_saves_run_start() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let fp = Fingerprint::from_params(&json!({"ConnectionId": 1, "ProjectId": 5})).unwrap();
        let before = Utc::now();
        let manager = CollectorStateManager::load(store.clone(), "zentao", "_raw_zentao_api_bugs", &fp, None)
            .await
            .unwrap();
        assert!(!manager.is_incremental());
        let saved = manager.close().await.unwrap();

        let loaded = store
            .get_collector_state("_raw_zentao_api_bugs", fp.as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, saved);
        assert!(loaded.latest_success_start.unwrap() >= before);

        let next = CollectorStateManager::load(store, "zentao", "_raw_zentao_api_bugs", &fp, None)
            .await
            .unwrap();
        assert!(next.is_incremental());
        assert_eq!(next.since(), loaded.latest_success_start);
    }

    #[tokio::test]
    async fn sources_without_incremental_support_always_run_full() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let fp = Fingerprint::from_params(&json!({"ConnectionId": 1})).unwrap();
        CollectorStateManager::load(store.clone(), "zentao", "_raw_zentao_api_users", &fp, None)
            .await
            .unwrap()
            .close()
            .await
            .unwrap();

        let policy = SyncPolicy {
            full_sync: false,
            time_after: Some(ts(4)),
        };
        let manager = CollectorStateManager::load(store, "zentao", "_raw_zentao_api_users", &fp, Some(&policy))
            .await
            .unwrap();
        assert!(manager.is_incremental());
        let manager = manager.without_incremental();
        assert_eq!(
            manager.mode(),
            SyncMode {
                incremental: false,
                since: Some(ts(4))
            }
        );
    }
}
