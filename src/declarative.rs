//! Collectors defined in configuration.
//!
//! A `[collectors.<name>]` table describes a JSON-over-HTTP listing:
//!
//! ```toml
//! [collectors.issues]
//! endpoint = "https://tracker.example.com/api/"
//! url_template = "projects/{{Params.ProjectId}}/issues"
//! connection_id = 1
//! scope = { ProjectId = 5 }
//! page_size = 100
//! items_pointer = "/data"
//! total_pointer = "/total"
//! since_param = "updated_after"
//! token = "..."
//! ```
//!
//! The scope map plus `ConnectionId` forms the fingerprint. Pages are
//! requested with `page_param`/`size_param`; with `total_pointer` the page
//! count is read from the first response, otherwise pages are fetched until
//! one comes back empty. In incremental mode `since_param` carries the last
//! successful run start as RFC 3339; a collector without one always
//! recollects its whole scope.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::{Map, Value};

use lake_harness_core::models::{Stage, SyncPolicy};
use lake_harness_core::store::Store;

use crate::api_client::{ApiClient, ApiResponse, AsyncApiClient, BearerToken};
use crate::cancel::CancelToken;
use crate::collector::{parse_json_array, parse_json_pointer, ApiCollectorArgs, RequestData};
use crate::collector_state::StatefulApiCollector;
use crate::config::{ApiConfig, CollectorConfig};
use crate::error::{PipelineError, Result};
use crate::progress::ProgressEvent;
use crate::rate_limit::RateLimitCalculator;
use crate::subtask::{Scope, SubTask, TaskContext};

/// Scope options of a declarative collector: its `scope` map plus
/// `ConnectionId`.
pub fn scope_params(config: &CollectorConfig) -> Value {
    let mut params: Map<String, Value> = config
        .scope
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    params.insert("ConnectionId".into(), Value::from(config.connection_id));
    Value::Object(params)
}

/// Pages needed for `total` items at `page_size` per page.
fn pages_for(total: u64, page_size: usize) -> usize {
    if page_size == 0 {
        return 1;
    }
    total.div_ceil(page_size as u64) as usize
}

fn read_total(response: &ApiResponse, pointer: &str) -> Result<u64> {
    let body = response.json::<Value>()?;
    match body.pointer(pointer) {
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| PipelineError::malformed(format!("{}: total '{}' is not a count", response.url, n))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| PipelineError::malformed(format!("{}: total '{}' is not a count", response.url, s))),
        _ => Err(PipelineError::malformed(format!(
            "{}: no total at '{}'",
            response.url, pointer
        ))),
    }
}

/// Build the HTTP client of a declarative collector.
pub async fn api_client(
    config: &CollectorConfig,
    api: &ApiConfig,
    workers: Option<usize>,
    cancel: CancelToken,
) -> Result<AsyncApiClient> {
    let mut builder = ApiClient::builder(config.endpoint.as_str()).api_config(api);
    for (name, value) in &config.headers {
        builder = builder.header(name, value)?;
    }
    if let Some(token) = &config.token {
        builder = builder.auth(BearerToken(token.clone()));
    }
    let calculator = RateLimitCalculator::from_config(api);
    AsyncApiClient::new(builder.build()?, &calculator, workers, cancel).await
}

/// Collector arguments for a declarative collector named `name`.
pub fn collector_args(name: &str, config: &CollectorConfig) -> Result<ApiCollectorArgs> {
    let mut args = ApiCollectorArgs::new(
        config.plugin.as_str(),
        format!("{}_{}", config.plugin, config.table_name(name)),
        scope_params(config),
        config.url_template.as_str(),
    )?
    .page_size(config.page_size)
    .supports_incremental(config.since_param.is_some());

    if let Some(lanes) = config.concurrency {
        args = args.concurrency(lanes);
    }

    let items = config.items_pointer.clone();
    args = if items.is_empty() {
        args.response_parser(parse_json_array)
    } else {
        args.response_parser(move |response| parse_json_pointer(response, &items))
    };

    if config.page_size > 0 {
        if let Some(pointer) = config.total_pointer.clone() {
            let page_size = config.page_size;
            args = args.total_pages(move |response, _| {
                Ok(pages_for(read_total(response, &pointer)?, page_size))
            });
        }
    }

    let page_param = config.page_param.clone();
    let size_param = config.size_param.clone();
    let since_param = config.since_param.clone();
    args = args.query(move |data: &RequestData| {
        let mut query = Vec::new();
        if let Some(pager) = data.pager {
            query.push((page_param.clone(), pager.page.to_string()));
            query.push((size_param.clone(), pager.size.to_string()));
        }
        if let (Some(param), Some(since)) = (&since_param, data.since) {
            query.push((param.clone(), since.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        Ok(query)
    });
    Ok(args)
}

/// Build a ready-to-run stateful collector.
pub async fn build_collector(
    name: &str,
    config: &CollectorConfig,
    api: &ApiConfig,
    workers: Option<usize>,
    store: Arc<dyn Store>,
    policy: Option<&SyncPolicy>,
    cancel: CancelToken,
) -> Result<StatefulApiCollector> {
    let client = api_client(config, api, workers, cancel).await?;
    let args = collector_args(name, config)?;
    StatefulApiCollector::new(args, client, store, policy).await
}

/// The collect subtask of a declarative collector.
pub struct DeclarativeCollect {
    name: String,
    config: CollectorConfig,
    policy: Option<SyncPolicy>,
}

impl DeclarativeCollect {
    pub fn new(name: impl Into<String>, config: CollectorConfig, policy: Option<SyncPolicy>) -> Self {
        Self {
            name: name.into(),
            config,
            policy,
        }
    }

    /// The scope this collector runs against.
    pub fn scope(&self) -> Result<Scope> {
        Scope::new(scope_params(&self.config))
    }
}

#[async_trait]
impl SubTask for DeclarativeCollect {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self) -> Stage {
        Stage::Collect
    }

    async fn execute(&self, ctx: &TaskContext, _scope: &Scope) -> Result<()> {
        let collector = build_collector(
            &self.name,
            &self.config,
            &ctx.config.api,
            ctx.config.pipeline.workers,
            ctx.store.clone(),
            self.policy.as_ref(),
            ctx.cancel.clone(),
        )
        .await?;
        let collected = collector.execute().await?;
        ctx.progress.report(ProgressEvent::Progress {
            subtask: self.name.clone(),
            n: collected,
            total: Some(collected),
        });
        Ok(())
    }
}
