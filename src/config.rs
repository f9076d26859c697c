//! TOML configuration.
//!
//! The configuration is composed of independently constructed sections.
//! Every section except `[db]` has defaults, so a minimal file only names the
//! database path.
//!
//! ```toml
//! [db]
//! path = "./data/lake.sqlite"
//!
//! [api]
//! requests_per_hour = 18000
//! rate_limit_header = "X-RateLimit-Limit"
//!
//! [collectors.issues]
//! endpoint = "https://tracker.example.com/api/"
//! url_template = "projects/{{Params.ProjectId}}/issues"
//! scope = { ProjectId = 5 }
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub collectors: BTreeMap<String, CollectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Pool size; extractors and converters read and write concurrently.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits on a locked database.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_secs() -> u64 {
    10
}

/// What to do when the API answers 404 for one item.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotFoundPolicy {
    #[default]
    Skip,
    Fail,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Static request budget used when no header-derived rate is available.
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Response header carrying the request budget, e.g. `X-RateLimit-Limit`.
    #[serde(default)]
    pub rate_limit_header: Option<String>,
    /// Window the header budget applies to.
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub not_found: NotFoundPolicy,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            requests_per_hour: default_requests_per_hour(),
            timeout_secs: default_timeout_secs(),
            rate_limit_header: None,
            rate_limit_window_secs: default_rate_limit_window_secs(),
            proxy: None,
            not_found: NotFoundPolicy::Skip,
        }
    }
}

fn default_requests_per_hour() -> u64 {
    18000
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_rate_limit_window_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Overrides the worker count derived from the rate budget.
    #[serde(default)]
    pub workers: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: None,
        }
    }
}

fn default_batch_size() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A collector defined entirely in configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Base URL all requests are relative to.
    pub endpoint: String,
    /// Handlebars template of the request path, e.g. `projects/{{Params.ProjectId}}/issues`.
    pub url_template: String,
    /// Plugin name used in raw table names and collector state.
    #[serde(default = "default_plugin")]
    pub plugin: String,
    /// Raw table suffix; defaults to the collector name.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default = "default_connection_id")]
    pub connection_id: u64,
    /// Scope options, merged with `ConnectionId` into the fingerprint.
    #[serde(default)]
    pub scope: BTreeMap<String, serde_json::Value>,
    /// Items per page; `0` disables pagination.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    #[serde(default = "default_size_param")]
    pub size_param: String,
    /// JSON pointer to the item array in a response; empty means the body itself.
    #[serde(default)]
    pub items_pointer: String,
    /// JSON pointer to the total item count, enabling determined pagination.
    #[serde(default)]
    pub total_pointer: Option<String>,
    /// Query parameter carrying the incremental lower bound.
    #[serde(default)]
    pub since_param: Option<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Static request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Bearer token sent as `Authorization`.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_plugin() -> String {
    "declarative".to_string()
}
fn default_connection_id() -> u64 {
    1
}
fn default_page_size() -> usize {
    100
}
fn default_page_param() -> String {
    "page".to_string()
}
fn default_size_param() -> String {
    "limit".to_string()
}

impl CollectorConfig {
    /// Raw table suffix for collector `name`.
    pub fn table_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.table.as_deref().unwrap_or(name)
    }
}

impl Config {
    /// Configuration with every default and the given database path.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
                max_connections: default_max_connections(),
                busy_timeout_secs: default_busy_timeout_secs(),
            },
            api: ApiConfig::default(),
            pipeline: PipelineConfig::default(),
            logging: LoggingConfig::default(),
            collectors: BTreeMap::new(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.api.requests_per_hour == 0 {
        anyhow::bail!("api.requests_per_hour must be > 0");
    }

    if config.api.rate_limit_window_secs == 0 {
        anyhow::bail!("api.rate_limit_window_secs must be > 0");
    }

    if config.pipeline.batch_size == 0 {
        anyhow::bail!("pipeline.batch_size must be > 0");
    }

    if config.pipeline.workers == Some(0) {
        anyhow::bail!("pipeline.workers must be > 0 when set");
    }

    for (name, collector) in &config.collectors {
        if collector.endpoint.trim().is_empty() {
            anyhow::bail!("collectors.{}.endpoint must not be empty", name);
        }
        if collector.concurrency == Some(0) {
            anyhow::bail!("collectors.{}.concurrency must be > 0 when set", name);
        }
        let table = collector.table_name(name);
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            anyhow::bail!(
                "collectors.{}: table name '{}' may only contain letters, digits and '_'",
                name,
                table
            );
        }
    }

    Ok(())
}
