//! Enrichment and strategic stages.
//!
//! Both are external collaborators of the pipeline. The orchestrator only
//! relies on the two traits; [`MomentumEnricher`] and [`RiskBandStrategist`]
//! are small reference implementations used by the CLI and the tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    AnalysisResult, CycleId, GatedAnalysis, Instrument, Series, Signal, UtcDateTime,
    ValidationError,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StageError {
    #[error("not enough candles: have {have}, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Rejected(String),
}

pub type StageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StageError>> + Send + 'a>>;

/// Turns a validated series into a scored analysis. Must not block on I/O.
pub trait Enricher: Send + Sync {
    fn enrich(&self, instrument: &Instrument, series: &Series) -> Result<AnalysisResult, StageError>;
}

/// Input of the strategic stage for one escalated instrument.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub cycle_id: CycleId,
    pub gated: GatedAnalysis,
    pub series: Arc<Series>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategicOutput {
    pub signal: Signal,
    pub confidence: f64,
    pub sizing: Value,
}

pub trait StrategicStage: Send + Sync {
    fn decide(&self, request: DecisionRequest) -> StageFuture<'_, StrategicOutput>;
}

/// Signal from the close-to-close move over `lookback` candles; risk/reward
/// from the distance to the high and low of the same window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumEnricher {
    pub lookback: usize,
    /// Minimum absolute move, in percent, for a directional signal.
    pub signal_threshold_pct: f64,
}

impl Default for MomentumEnricher {
    fn default() -> Self {
        Self {
            lookback: 14,
            signal_threshold_pct: 1.0,
        }
    }
}

impl Enricher for MomentumEnricher {
    fn enrich(&self, instrument: &Instrument, series: &Series) -> Result<AnalysisResult, StageError> {
        let need = self.lookback.max(1) + 1;
        if series.len() < need {
            return Err(StageError::InsufficientData {
                have: series.len(),
                need,
            });
        }

        let window = &series.points[series.len() - need..];
        let first = window[0].close;
        let last = window[window.len() - 1].close;
        if first <= 0.0 {
            return Err(StageError::Rejected(format!("non-positive close {first}")));
        }
        let change_pct = (last - first) / first * 100.0;
        let high = window.iter().map(|point| point.high).fold(f64::MIN, f64::max);
        let low = window.iter().map(|point| point.low).fold(f64::MAX, f64::min);

        let signal = if change_pct >= self.signal_threshold_pct {
            Signal::Long
        } else if change_pct <= -self.signal_threshold_pct {
            Signal::Short
        } else {
            Signal::Hold
        };

        let upside = (high - last).max(0.0);
        let downside = (last - low).max(0.0);
        let risk_reward = match signal {
            Signal::Long => ratio(upside, downside),
            Signal::Short => ratio(downside, upside),
            Signal::Hold => ratio(upside, downside).max(ratio(downside, upside)),
        };

        // Strength of the move, discounted when providers disagreed.
        let strength = (change_pct.abs() / (self.signal_threshold_pct * 5.0)).min(1.0);
        let raw = 0.35 + 0.6 * strength;
        let confidence = (raw * (0.5 + 0.5 * series.validation_confidence)).clamp(0.0, 1.0);

        let indicators = json!({
            "lookback": self.lookback,
            "change_pct": change_pct,
            "window_high": high,
            "window_low": low,
            "last_close": last,
            "validation_confidence": series.validation_confidence,
            "market_change_24h_pct": instrument.stats.change_24h_pct,
        });

        Ok(AnalysisResult::new(
            instrument.symbol.clone(),
            signal,
            confidence,
            risk_reward,
            indicators,
            UtcDateTime::now(),
        )?)
    }
}

fn ratio(reward: f64, risk: f64) -> f64 {
    if risk <= f64::EPSILON {
        return if reward > 0.0 { 10.0 } else { 0.0 };
    }
    (reward / risk).min(10.0)
}

/// Fixed-fraction position sizing around a percentage stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskBandStrategist {
    pub account_equity: f64,
    /// Share of equity risked per decision.
    pub risk_per_decision: f64,
    pub stop_pct: f64,
    /// Take-profit distances as multiples of the stop distance.
    pub take_profit_multiples: Vec<f64>,
}

impl Default for RiskBandStrategist {
    fn default() -> Self {
        Self {
            account_equity: 10_000.0,
            risk_per_decision: 0.01,
            stop_pct: 0.02,
            take_profit_multiples: vec![1.5, 3.0],
        }
    }
}

impl RiskBandStrategist {
    fn sizing(&self, signal: Signal, entry: f64) -> Value {
        let stop_distance = entry * self.stop_pct;
        let direction = match signal {
            Signal::Long => 1.0,
            Signal::Short => -1.0,
            Signal::Hold => {
                return json!({
                    "action": "watch",
                    "entry": entry,
                    "position_size": 0.0,
                });
            }
        };

        let stop_loss = entry - direction * stop_distance;
        let take_profits = self
            .take_profit_multiples
            .iter()
            .map(|multiple| entry + direction * stop_distance * multiple)
            .collect::<Vec<_>>();
        let position_size = if stop_distance > 0.0 {
            self.account_equity * self.risk_per_decision / stop_distance
        } else {
            0.0
        };

        json!({
            "action": signal.as_str(),
            "entry": entry,
            "stop_loss": stop_loss,
            "take_profits": take_profits,
            "position_size": position_size,
            "risk_amount": self.account_equity * self.risk_per_decision,
        })
    }
}

impl StrategicStage for RiskBandStrategist {
    fn decide(&self, request: DecisionRequest) -> StageFuture<'_, StrategicOutput> {
        Box::pin(async move {
            let entry = request.series.last_close().ok_or(StageError::InsufficientData {
                have: 0,
                need: 1,
            })?;
            let analysis = &request.gated.analysis;
            let mut sizing = self.sizing(analysis.signal, entry);
            if let Value::Object(fields) = &mut sizing {
                fields.insert(
                    "escalation_path".to_owned(),
                    json!(request.gated.verdict.path.map(|path| path.as_str())),
                );
            }

            Ok(StrategicOutput {
                signal: analysis.signal,
                confidence: analysis.confidence,
                sizing,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        EscalationPath, EscalationVerdict, MarketStats, OhlcvPoint, Provenance, ProviderId, Symbol,
        Timeframe,
    };

    fn series(closes: &[f64]) -> Series {
        let points = closes
            .iter()
            .enumerate()
            .map(|(index, close)| {
                OhlcvPoint::new(
                    UtcDateTime::from_unix_millis(index as i64 * 3_600_000),
                    *close,
                    close * 1.01,
                    close * 0.99,
                    *close,
                    1_000.0,
                )
                .expect("valid point")
            })
            .collect();
        Series {
            instrument: Symbol::parse("BTCUSDT").expect("valid"),
            timeframe: Timeframe::OneHour,
            points,
            provenance: Provenance {
                source: ProviderId::parse("alpha").expect("valid"),
                fetched_at: UtcDateTime::from_unix_millis(0),
                confirmed_by: Vec::new(),
                disputed_by: Vec::new(),
            },
            validation_confidence: 1.0,
        }
    }

    fn instrument() -> Instrument {
        Instrument::new(
            Symbol::parse("BTCUSDT").expect("valid"),
            MarketStats::new(100.0, 1e6, 2.0, None).expect("valid stats"),
        )
    }

    #[test]
    fn rising_closes_give_long_signal() {
        let closes = (0..20).map(|step| 100.0 + step as f64).collect::<Vec<_>>();
        let analysis = MomentumEnricher::default()
            .enrich(&instrument(), &series(&closes))
            .expect("enriched");

        assert_eq!(analysis.signal, Signal::Long);
        assert!(analysis.confidence > 0.5);
        assert!(analysis.indicators["change_pct"].as_f64().expect("number") > 1.0);
    }

    #[test]
    fn short_history_is_rejected() {
        let error = MomentumEnricher::default()
            .enrich(&instrument(), &series(&[100.0; 5]))
            .expect_err("too short");
        assert_eq!(error, StageError::InsufficientData { have: 5, need: 15 });
    }

    #[tokio::test]
    async fn long_sizing_places_stop_below_entry() {
        let series = Arc::new(series(&[100.0; 20]));
        let analysis = AnalysisResult::new(
            Symbol::parse("BTCUSDT").expect("valid"),
            Signal::Long,
            0.8,
            2.5,
            Value::Null,
            UtcDateTime::from_unix_millis(0),
        )
        .expect("valid analysis");
        let request = DecisionRequest {
            cycle_id: CycleId::new(),
            gated: GatedAnalysis {
                analysis,
                verdict: EscalationVerdict {
                    admit: true,
                    path: Some(EscalationPath::A),
                    matched: vec![EscalationPath::A, EscalationPath::B],
                    evaluated_at: UtcDateTime::from_unix_millis(0),
                },
            },
            series,
        };

        let output = RiskBandStrategist::default()
            .decide(request)
            .await
            .expect("decided");

        assert_eq!(output.signal, Signal::Long);
        assert_eq!(output.sizing["stop_loss"].as_f64(), Some(98.0));
        assert_eq!(output.sizing["escalation_path"], json!("A"));
        assert_eq!(output.sizing["take_profits"][1].as_f64(), Some(106.0));
    }
}
