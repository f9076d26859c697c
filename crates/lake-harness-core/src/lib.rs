//! # Lake Harness Core
//!
//! Runtime-free logic shared by every Lake Harness pipeline stage: data
//! models and lineage, scope fingerprints, the stored-row envelope, the
//! cross-connector domain schema, deterministic domain ids, tree
//! flattening, and the [`store::Store`] abstraction.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies.

pub mod didgen;
pub mod domain;
pub mod fingerprint;
pub mod models;
pub mod row;
pub mod store;
pub mod tree;

pub use fingerprint::Fingerprint;
pub use models::{Lineage, RawRecord};
pub use row::{Row, RowFilter, StoredRow};
