use chrono::NaiveDate;
use thiserror::Error;

use crate::state::RunStateKind;

/// Per-entity problems with snapshot data. The entity is skipped for the run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("missing required field '{field}'")]
    MissingField { field: &'static str },

    #[error("counter '{field}' is negative ({value})")]
    NegativeCounter { field: &'static str, value: i64 },

    #[error("duplicate snapshot for {date}")]
    DuplicateDate { date: NaiveDate },

    #[error("history out of order: {previous} followed by {next}")]
    Unsorted { previous: NaiveDate, next: NaiveDate },

    #[error("snapshot dated {date} is after observation date {observation_date}")]
    FutureObservation {
        date: NaiveDate,
        observation_date: NaiveDate,
    },

    #[error("history gap: expected {expected}, found {found}")]
    NonContiguous { expected: NaiveDate, found: NaiveDate },

    #[error("latest snapshot is {last}, no observation on {observation_date}")]
    StaleHistory {
        last: NaiveDate,
        observation_date: NaiveDate,
    },

    #[error("classifier returned invalid probability {0}")]
    InvalidProbability(f64),
}

impl DataError {
    pub fn kind(&self) -> &'static str {
        match self {
            DataError::MissingField { .. } => "missing_field",
            DataError::NegativeCounter { .. } => "negative_counter",
            DataError::DuplicateDate { .. } => "duplicate_date",
            DataError::Unsorted { .. } => "unsorted_history",
            DataError::FutureObservation { .. } => "future_observation",
            DataError::NonContiguous { .. } => "non_contiguous_history",
            DataError::StaleHistory { .. } => "stale_history",
            DataError::InvalidProbability(_) => "invalid_probability",
        }
    }
}

/// Mismatch between the feature vector and the loaded model artifact. Always fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("artifact expects features {expected:?}, pipeline produces {found:?}")]
    FeatureMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("feature vector has {actual} values, artifact expects {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("invalid model artifact: {0}")]
    InvalidArtifact(String),
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to read model artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("scores for {date} already exist")]
    Conflict { date: NaiveDate },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ingestion source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Schema,
    Infrastructure,
    Conflict,
}

/// Systemic failures. Any of these aborts the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },

    #[error("observation date {date} was already processed")]
    AlreadyProcessed { date: NaiveDate },

    #[error("another run holds the claim for {date}")]
    RunInProgress { date: NaiveDate },

    #[error("invalid run state transition {from:?} -> {to:?}")]
    InvalidTransition { from: RunStateKind, to: RunStateKind },

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl PipelineError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Schema(_) => FailureClass::Schema,
            Self::Store(StoreError::Conflict { .. })
            | Self::AlreadyProcessed { .. }
            | Self::RunInProgress { .. } => FailureClass::Conflict,
            Self::Store(_)
            | Self::Source(_)
            | Self::Timeout { .. }
            | Self::InvalidTransition { .. }
            | Self::Worker(_) => FailureClass::Infrastructure,
        }
    }
}
