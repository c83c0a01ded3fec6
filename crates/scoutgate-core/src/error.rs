use std::fmt::{Display, Formatter};

use serde::Serialize;
use thiserror::Error;

use crate::data_source::SourceError;
use crate::domain::{CycleId, Symbol};
use crate::ProviderId;

/// Validation and contract errors exposed by `scoutgate-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("symbol cannot be empty")]
    EmptySymbol,
    #[error("symbol length {len} is outside {min}..={max}")]
    SymbolLength { len: usize, min: usize, max: usize },
    #[error("symbol separator '{ch}' at index {index} must sit between two alphanumerics")]
    SymbolMisplacedSeparator { ch: char, index: usize },
    #[error("symbol contains invalid character '{ch}' at index {index}")]
    SymbolInvalidChar { ch: char, index: usize },

    #[error("invalid timeframe '{value}', expected one of 1h, 4h, 1d")]
    InvalidTimeframe { value: String },
    #[error("invalid provider id '{value}', expected lowercase [a-z0-9_-]")]
    InvalidProviderId { value: String },
    #[error("invalid signal '{value}', expected one of long, short, hold")]
    InvalidSignal { value: String },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },

    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
    #[error("field '{field}' must be non-negative")]
    NegativeValue { field: &'static str },
    #[error("field '{field}' must be within [0, 1]")]
    OutOfUnitRange { field: &'static str },

    #[error("ohlcv high must be >= low")]
    InvalidPointRange,
    #[error("ohlcv open/close must be within high/low range")]
    InvalidPointBounds,

    #[error("config '{field}' must be greater than zero")]
    ZeroConfigValue { field: &'static str },
    #[error("config '{field}' is invalid: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

/// Pipeline stage names used in failure reports and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scan,
    Fetch,
    Enrich,
    Gate,
    Reserve,
    Decide,
    Persist,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Fetch => "fetch",
            Self::Enrich => "enrich",
            Self::Gate => "gate",
            Self::Reserve => "reserve",
            Self::Decide => "decide",
            Self::Persist => "persist",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed provider attempt inside an aggregated fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderAttempt {
    pub provider: ProviderId,
    pub code: &'static str,
    pub message: String,
}

impl ProviderAttempt {
    pub fn new(provider: ProviderId, error: &SourceError) -> Self {
        Self {
            provider,
            code: error.code(),
            message: error.message().to_owned(),
        }
    }
}

/// Pipeline-level failures.
///
/// Provider timeouts and invalid payloads surface as [`SourceError`] kinds and
/// are normally absorbed by provider fallback; only exhaustion escapes as
/// [`PipelineError::AllSourcesFailed`]. Dedup denial is not an error and is
/// reported through `ReservationOutcome::Denied`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    #[error("all sources failed for {scope} ({} attempt(s))", .attempts.len())]
    AllSourcesFailed {
        scope: String,
        attempts: Vec<ProviderAttempt>,
    },

    #[error("persistent store unavailable: {message}")]
    PersistentStoreUnavailable { message: String },

    #[error("stage '{stage}' failed{}: {message}", .instrument.as_ref().map(|s| format!(" for {s}")).unwrap_or_default())]
    StageFailed {
        stage: Stage,
        instrument: Option<Symbol>,
        message: String,
    },

    #[error("cycle {cycle_id} is already running")]
    CycleAlreadyRunning { cycle_id: CycleId },

    #[error(transparent)]
    Provider(#[from] SourceError),
}

impl PipelineError {
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::PersistentStoreUnavailable {
            message: message.into(),
        }
    }

    pub fn stage(stage: Stage, instrument: Option<Symbol>, message: impl Into<String>) -> Self {
        Self::StageFailed {
            stage,
            instrument,
            message: message.into(),
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::AllSourcesFailed { .. } => "pipeline.all_sources_failed",
            Self::PersistentStoreUnavailable { .. } => "pipeline.store_unavailable",
            Self::StageFailed { .. } => "pipeline.stage_failed",
            Self::CycleAlreadyRunning { .. } => "pipeline.cycle_already_running",
            Self::Provider(error) => error.code(),
        }
    }
}

impl From<scoutgate_store::StoreError> for PipelineError {
    fn from(error: scoutgate_store::StoreError) -> Self {
        Self::store_unavailable(error.to_string())
    }
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Store(#[from] scoutgate_store::StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}
