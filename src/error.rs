//! Error taxonomy of the pipeline engine.
//!
//! Engine APIs (scheduler, API client, collectors, extractor, converter,
//! batch writer) return [`Result<T>`](Result). The storage and CLI layers use
//! `anyhow`; their errors are wrapped as [`PipelineError::Store`].

use lake_harness_core::models::Stage;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Unified pipeline error type.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Network failure talking to the upstream API. Not retried here.
    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Credentials rejected (HTTP 401). Fatal for the whole run.
    #[error("unauthorized: {url}")]
    Unauthorized { url: String },

    #[error("HTTP {status} from {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },

    /// HTTP 404 with the `fail` not-found policy.
    #[error("not found: {url}")]
    NotFound { url: String },

    /// A payload did not have the expected shape.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cancelled")]
    Cancelled,

    /// A scheduled task panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Every error captured by a scheduler run.
    #[error("{} task(s) failed: {}", .0.len(), join_messages(.0))]
    Aggregate(Vec<PipelineError>),

    #[error("{stage} subtask failed for {fingerprint}: {source}")]
    Subtask {
        stage: Stage,
        fingerprint: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn malformed(message: impl std::fmt::Display) -> Self {
        Self::MalformedPayload(message.to_string())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Collapse a list of captured errors: none is `Ok`, one is itself.
    pub fn from_list(mut errors: Vec<PipelineError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate(errors)),
        }
    }

    /// True when this error, or any error it aggregates, is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Aggregate(errors) => errors.iter().any(|e| e.is_cancelled()),
            Self::Subtask { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedPayload(err.to_string())
    }
}

fn join_messages(errors: &[PipelineError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
