use thiserror::Error;

use crate::models::RegionKind;

/// A record whose coordinates cannot be placed on the map. Dropped and counted as filtered.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("record {id} has no latitude/longitude")]
    MissingCoordinate { id: i64 },

    #[error("record {id} latitude {value} outside [-90, 90]")]
    LatitudeOutOfRange { id: i64, value: f64 },

    #[error("record {id} longitude {value} outside [-180, 180]")]
    LongitudeOutOfRange { id: i64, value: f64 },
}

/// A row that cannot be turned into a classified record. Dropped with a warning.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("row {} could not be decoded: {message}", id.map(|v| v.to_string()).unwrap_or_else(|| "<no id>".to_string()))]
    Decode { id: Option<i64>, message: String },

    #[error("record {id} has unparseable timestamp {value:?}")]
    Timestamp { id: i64, value: String },
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExtractionError {
    #[error("origin request timed out: {0}")]
    Timeout(String),

    #[error("origin unreachable: {0}")]
    Transport(String),

    #[error("origin returned server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("origin rejected request with {status}: {body}")]
    Client { status: u16, body: String },

    #[error("origin response could not be decoded: {0}")]
    Decode(String),

    #[error("origin returned ids not above cursor {cursor} (page max {page_max})")]
    NonMonotonic { cursor: i64, page_max: i64 },

    #[error("extraction cancelled after {pages} pages")]
    Cancelled { pages: usize },

    #[error("giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ExtractionError>,
    },
}

impl ExtractionError {
    /// Timeouts, connection failures and 5xx are worth another attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExtractionError::Timeout(_)
                | ExtractionError::Transport(_)
                | ExtractionError::Server { .. }
        )
    }

    pub fn from_status(status: u16, body: String) -> Self {
        if status >= 500 {
            ExtractionError::Server { status, body }
        } else {
            ExtractionError::Client { status, body }
        }
    }
}

impl From<reqwest::Error> for ExtractionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExtractionError::Timeout(err.to_string())
        } else if err.is_decode() {
            ExtractionError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ExtractionError::from_status(status.as_u16(), err.to_string())
        } else {
            ExtractionError::Transport(err.to_string())
        }
    }
}

/// Destination store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Error)]
pub enum AssignmentError {
    #[error("{kind} {id} has unusable geometry: {message}")]
    InvalidGeometry {
        kind: RegionKind,
        id: i64,
        message: String,
    },

    #[error("region assignment store access failed: {0}")]
    Store(#[from] StoreError),
}

/// Failures that end a run as FAILED.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("transform stage failed: {0}")]
    Transform(String),

    #[error("load failed: {0}")]
    Load(StoreError),

    #[error("ledger access failed: {0}")]
    Ledger(StoreError),

    #[error("cancelled during {stage}")]
    Cancelled { stage: &'static str },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{0}")]
    Constraint(&'static str),
}
