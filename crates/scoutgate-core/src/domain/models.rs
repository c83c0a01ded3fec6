use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ProviderId, Symbol, Timeframe, UtcDateTime, ValidationError};

/// Last-seen market statistics for an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStats {
    pub price: f64,
    pub volume_24h: f64,
    /// Percentage change over 24h, e.g. `-3.5` for a 3.5% drop.
    pub change_24h_pct: f64,
    pub market_cap: Option<f64>,
}

impl MarketStats {
    pub fn new(
        price: f64,
        volume_24h: f64,
        change_24h_pct: f64,
        market_cap: Option<f64>,
    ) -> Result<Self, ValidationError> {
        validate_non_negative("price", price)?;
        validate_non_negative("volume_24h", volume_24h)?;
        validate_finite("change_24h_pct", change_24h_pct)?;
        if let Some(market_cap) = market_cap {
            validate_non_negative("market_cap", market_cap)?;
        }

        Ok(Self {
            price,
            volume_24h,
            change_24h_pct,
            market_cap,
        })
    }

    /// Stats for an instrument nobody has priced yet (manual overrides).
    pub const fn unknown() -> Self {
        Self {
            price: 0.0,
            volume_24h: 0.0,
            change_24h_pct: 0.0,
            market_cap: None,
        }
    }
}

/// A scanned market candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: Symbol,
    pub stats: MarketStats,
}

impl Instrument {
    pub fn new(symbol: Symbol, stats: MarketStats) -> Self {
        Self { symbol, stats }
    }

    pub fn unpriced(symbol: Symbol) -> Self {
        Self::new(symbol, MarketStats::unknown())
    }
}

/// One OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvPoint {
    pub ts: UtcDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl OhlcvPoint {
    pub fn new(
        ts: UtcDateTime,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, ValidationError> {
        validate_non_negative("open", open)?;
        validate_non_negative("high", high)?;
        validate_non_negative("low", low)?;
        validate_non_negative("close", close)?;
        validate_non_negative("volume", volume)?;

        if high < low {
            return Err(ValidationError::InvalidPointRange);
        }
        if open < low || open > high || close < low || close > high {
            return Err(ValidationError::InvalidPointBounds);
        }

        Ok(Self {
            ts,
            open,
            high,
            low,
            close,
            volume,
        })
    }

    /// Re-run constructor validation on a point received from an upstream source.
    pub fn validate(&self) -> Result<(), ValidationError> {
        Self::new(
            self.ts,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        )
        .map(|_| ())
    }
}

/// Where a series came from and who agreed with it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    pub source: ProviderId,
    pub fetched_at: UtcDateTime,
    pub confirmed_by: Vec<ProviderId>,
    pub disputed_by: Vec<ProviderId>,
}

/// Validated, time-ordered candles for one instrument and timeframe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub instrument: Symbol,
    pub timeframe: Timeframe,
    pub points: Vec<OhlcvPoint>,
    pub provenance: Provenance,
    pub validation_confidence: f64,
}

impl Series {
    pub fn last_close(&self) -> Option<f64> {
        self.points.last().map(|point| point.close)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Identifier of one orchestrator cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CycleId(Uuid);

impl CycleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    pub const fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CycleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

pub(crate) fn validate_finite(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteValue { field });
    }
    Ok(())
}

pub(crate) fn validate_non_negative(
    field: &'static str,
    value: f64,
) -> Result<(), ValidationError> {
    validate_finite(field, value)?;
    if value < 0.0 {
        return Err(ValidationError::NegativeValue { field });
    }
    Ok(())
}

pub(crate) fn validate_unit(field: &'static str, value: f64) -> Result<(), ValidationError> {
    validate_finite(field, value)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ValidationError::OutOfUnitRange { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> UtcDateTime {
        UtcDateTime::parse("2024-05-01T00:00:00Z").expect("valid timestamp")
    }

    #[test]
    fn point_rejects_inverted_range() {
        let err = OhlcvPoint::new(ts(), 10.0, 9.0, 11.0, 10.0, 1.0).expect_err("must fail");
        assert_eq!(err, ValidationError::InvalidPointRange);
    }

    #[test]
    fn point_rejects_close_outside_range() {
        let err = OhlcvPoint::new(ts(), 10.0, 12.0, 9.0, 13.0, 1.0).expect_err("must fail");
        assert_eq!(err, ValidationError::InvalidPointBounds);
    }

    #[test]
    fn stats_reject_nan_volume() {
        let err = MarketStats::new(1.0, f64::NAN, 0.0, None).expect_err("must fail");
        assert_eq!(err, ValidationError::NonFiniteValue { field: "volume_24h" });
    }

    #[test]
    fn stats_allow_negative_change() {
        let stats = MarketStats::new(1.0, 10.0, -7.5, Some(1_000.0)).expect("valid stats");
        assert_eq!(stats.change_24h_pct, -7.5);
    }
}
