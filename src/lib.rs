//! # Lake Harness
//!
//! A multi-connector ETL pipeline engine for DevOps APIs.
//!
//! Lake Harness collects raw JSON from project-tracking and CI APIs, extracts
//! it into typed per-connector (tool-layer) rows, and converts those into a
//! shared domain schema. Every stage is idempotent per scope: it clears its
//! own output for the scope fingerprint before writing.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌───────────┐   ┌───────────┐
//! │  Input    │──▶│ Collector │──▶│ Extractor │──▶│ Converter │
//! │ iterator  │   │ (_raw_*)  │   │ (_tool_*) │   │ (domain)  │
//! └───────────┘   └─────┬─────┘   └───────────┘   └───────────┘
//!                       │
//!                 ┌─────▼─────┐
//!                 │ Scheduler │  bounded workers + rate pacing
//!                 └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! lake init                          # create database
//! lake collect issues                # run a declarative collector
//! lake collect issues --full         # ignore incremental state
//! lake states                        # show collector states
//! lake history                       # show subtask outcomes
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Pipeline error taxonomy |
//! | [`scheduler`] | Bounded, rate-paced worker pool |
//! | [`rate_limit`] | Request budget calculation |
//! | [`api_client`] | HTTP client, authentication, response classification |
//! | [`collector`] | Paginated raw data collection |
//! | [`collector_state`] | Incremental collection state |
//! | [`declarative`] | Collectors defined in configuration |
//! | [`iterator`] | Collector input iterators |
//! | [`extractor`] | Raw records to tool-layer rows |
//! | [`converter`] | Tool-layer rows to domain rows |
//! | [`batch`] | Batched, scope-replacing row writers |
//! | [`subtask`] | Subtask runner and task context |
//! | [`cancel`] | Run cancellation |
//! | [`progress`] | Progress reporting |
//! | [`sqlite_store`] | SQLite storage backend |
//! | [`db`] | Database connection |
//! | [`migrate`] | Framework tables |
//! | [`logging`] | Tracing subscriber setup |

pub mod api_client;
pub mod batch;
pub mod cancel;
pub mod collector;
pub mod collector_state;
pub mod config;
pub mod converter;
pub mod db;
pub mod declarative;
pub mod error;
pub mod extractor;
pub mod iterator;
pub mod logging;
pub mod migrate;
pub mod progress;
pub mod rate_limit;
pub mod scheduler;
pub mod sqlite_store;
pub mod subtask;

pub use lake_harness_core as core;
pub use lake_harness_core::{Fingerprint, Lineage, RawRecord, Row, RowFilter, StoredRow};
