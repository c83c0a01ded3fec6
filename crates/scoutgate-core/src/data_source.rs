//! Provider contract and request/response types.
//!
//! Every upstream market-data provider implements [`MarketDataSource`]. The
//! pipeline treats providers as capability-equivalent and interchangeable;
//! preference order and per-provider limits live in
//! [`ProviderPolicy`](crate::ProviderPolicy).
//!
//! | Operation | Request | Response |
//! |-----------|---------|----------|
//! | `fetch_series` | [`SeriesRequest`] | `Vec<OhlcvPoint>` |
//! | `fetch_snapshot` | [`SnapshotRequest`] | `Vec<Instrument>` |

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use crate::{Instrument, OhlcvPoint, ProviderId, Symbol, Timeframe, ValidationError};

/// Candle request for one instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRequest {
    pub instrument: Symbol,
    pub timeframe: Timeframe,
    pub since_days: u32,
}

impl SeriesRequest {
    pub fn new(
        instrument: Symbol,
        timeframe: Timeframe,
        since_days: u32,
    ) -> Result<Self, ValidationError> {
        if since_days == 0 {
            return Err(ValidationError::ZeroConfigValue {
                field: "since_days",
            });
        }
        Ok(Self {
            instrument,
            timeframe,
            since_days,
        })
    }
}

/// Market snapshot request. `None` asks for the provider's whole universe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotRequest {
    pub instruments: Option<Vec<Symbol>>,
}

impl SnapshotRequest {
    pub fn whole_market() -> Self {
        Self { instruments: None }
    }

    pub fn only(instruments: Vec<Symbol>) -> Self {
        Self {
            instruments: Some(instruments),
        }
    }
}

/// Provider-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    /// The provider did not answer within its timeout.
    Timeout,
    /// Malformed payload or fewer points than required.
    InvalidData,
    Unavailable,
    RateLimited,
    Internal,
}

/// Structured provider error used by aggregator fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    kind: SourceErrorKind,
    message: String,
    retryable: bool,
}

impl SourceError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Timeout,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::InvalidData,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Unavailable,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::RateLimited,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Internal,
            message: message.into(),
            retryable: false,
        }
    }

    pub const fn kind(&self) -> SourceErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            SourceErrorKind::Timeout => "provider.timeout",
            SourceErrorKind::InvalidData => "provider.invalid_data",
            SourceErrorKind::Unavailable => "provider.unavailable",
            SourceErrorKind::RateLimited => "provider.rate_limited",
            SourceErrorKind::Internal => "provider.internal",
        }
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message)
    }
}

impl std::error::Error for SourceError {}

impl From<ValidationError> for SourceError {
    fn from(error: ValidationError) -> Self {
        Self::invalid_data(error.to_string())
    }
}

pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SourceError>> + Send + 'a>>;

/// Contract implemented by every market-data provider.
pub trait MarketDataSource: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Candles for one instrument, oldest first.
    fn fetch_series<'a>(&'a self, req: SeriesRequest) -> SourceFuture<'a, Vec<OhlcvPoint>>;

    /// Current stats for the requested instruments (or the whole market).
    fn fetch_snapshot<'a>(&'a self, req: SnapshotRequest) -> SourceFuture<'a, Vec<Instrument>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_retryable_and_invalid_data_is_not() {
        assert!(SourceError::timeout("slow").retryable());
        assert!(!SourceError::invalid_data("short").retryable());
    }

    #[test]
    fn validation_errors_become_invalid_data() {
        let error = SourceError::from(ValidationError::InvalidPointRange);
        assert_eq!(error.kind(), SourceErrorKind::InvalidData);
        assert_eq!(error.code(), "provider.invalid_data");
    }

    #[test]
    fn series_request_requires_history() {
        let symbol = Symbol::parse("ETHUSDT").expect("valid");
        assert!(SeriesRequest::new(symbol, Timeframe::OneDay, 0).is_err());
    }
}
