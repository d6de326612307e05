//! Error kinds shared across every flowctl crate.
//!
//! Connector-internal failures are mapped onto these variants at the
//! connector boundary; anything truly unclassified is carried in `Other`.

use thiserror::Error;

/// A single error enum covering every failure class a stage can produce.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("tap source missing: {0}")]
    TapSourceMissing(String),

    #[error("unrecoverable tap error: {0}")]
    UnrecoverableTap(String),

    #[error("unrecoverable sink error: {0}")]
    UnrecoverableSink(String),

    #[error("data mode conflict: {0}")]
    DataModeConflict(String),

    #[error("schema mode conflict: {0}")]
    SchemaModeConflict(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("REST request error ({status}): {message}")]
    RestRequest { status: u16, message: String },

    #[error("REST rate limit hit (status {status}), retries exhausted")]
    RestRateLimit { status: u16 },

    #[error("REST retryable error (status {status}): {message}")]
    RestRetryable { status: u16, message: String },

    #[error("LLM client fetch failed: {0}")]
    Fetch(String),

    #[error("replayable SQL error: {0}")]
    ReplayableSql(String),

    #[error("{0}")]
    UserGenerated(String),

    #[error("failed at '{stage}': {source}")]
    FlowRun {
        stage: String,
        #[source]
        source: Box<FlowError>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    /// Wraps `self` as a scheduler-boundary error naming the failing stage,
    /// matching the source's `FlowRunError` wrapper.
    pub fn into_flow_run(self, stage: impl Into<String>) -> FlowError {
        FlowError::FlowRun {
            stage: stage.into(),
            source: Box::new(self),
        }
    }

    /// True for the SQL-engine error classes the LLM SQL generator is
    /// permitted to re-prompt against (parser/syntax/binder/catalog).
    pub fn is_replayable(&self) -> bool {
        match self {
            FlowError::ReplayableSql(_) => true,
            FlowError::Other(e) => {
                let msg = e.to_string().to_lowercase();
                ["parser error", "syntax error", "binder error", "catalog error"]
                    .iter()
                    .any(|marker| msg.contains(marker))
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
