//! Escalation gate.
//!
//! A pure function deciding whether an analysis is worth the strategic stage.
//! Three independent paths can admit it:
//!
//! | Path | Condition |
//! |------|-----------|
//! | A | signal is directional and `confidence_threshold <= confidence < override_threshold` |
//! | B | `risk_reward >= rr_threshold` |
//! | C | signal is directional and `confidence >= override_threshold` |
//!
//! Admission is the OR of the three, which equals
//! `(directional && confidence >= confidence_threshold) || rr >= rr_threshold ||
//! (directional && confidence >= override_threshold)`. Path A stops where the
//! override band starts, so a conviction high enough for C is tagged C rather
//! than A. The reported path is the first match in A, B, C order; every
//! matching path is kept in `matched`.

use serde::{Deserialize, Serialize};

use crate::{AnalysisResult, EscalationPath, EscalationVerdict, UtcDateTime, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationThresholds {
    pub confidence_threshold: f64,
    pub rr_threshold: f64,
    pub override_threshold: f64,
}

impl Default for EscalationThresholds {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.70,
            rr_threshold: 2.0,
            override_threshold: 0.95,
        }
    }
}

impl EscalationThresholds {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("gate.confidence_threshold", self.confidence_threshold),
            ("gate.rr_threshold", self.rr_threshold),
            ("gate.override_threshold", self.override_threshold),
        ] {
            if !value.is_finite() {
                return Err(ValidationError::NonFiniteValue { field });
            }
            if value < 0.0 {
                return Err(ValidationError::NegativeValue { field });
            }
        }
        Ok(())
    }
}

/// Paths admitting `result`, in A, B, C order.
pub fn matching_paths(result: &AnalysisResult, thresholds: &EscalationThresholds) -> Vec<EscalationPath> {
    let directional = result.signal.is_directional();
    EscalationPath::ALL
        .into_iter()
        .filter(|path| match path {
            EscalationPath::A => {
                directional
                    && result.confidence >= thresholds.confidence_threshold
                    && result.confidence < thresholds.override_threshold
            }
            EscalationPath::B => result.risk_reward >= thresholds.rr_threshold,
            EscalationPath::C => directional && result.confidence >= thresholds.override_threshold,
        })
        .collect()
}

/// Deterministic verdict; `at` is only stamped on the result.
pub fn evaluate(
    result: &AnalysisResult,
    thresholds: &EscalationThresholds,
    at: UtcDateTime,
) -> EscalationVerdict {
    let matched = matching_paths(result, thresholds);
    EscalationVerdict {
        admit: !matched.is_empty(),
        path: matched.first().copied(),
        matched,
        evaluated_at: at,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::{Signal, Symbol};

    fn analysis(signal: Signal, confidence: f64, risk_reward: f64) -> AnalysisResult {
        AnalysisResult::new(
            Symbol::parse("BTCUSDT").expect("valid"),
            signal,
            confidence,
            risk_reward,
            Value::Null,
            UtcDateTime::from_unix_millis(0),
        )
        .expect("valid analysis")
    }

    #[test]
    fn override_band_is_tagged_c_not_a() {
        let verdict = evaluate(
            &analysis(Signal::Short, 0.97, 0.5),
            &EscalationThresholds::default(),
            UtcDateTime::from_unix_millis(0),
        );

        assert!(verdict.admit);
        assert_eq!(verdict.path, Some(EscalationPath::C));
        assert_eq!(verdict.matched, vec![EscalationPath::C]);
    }

    #[test]
    fn risk_reward_outranks_override_in_reported_tag() {
        let verdict = evaluate(
            &analysis(Signal::Long, 0.99, 3.0),
            &EscalationThresholds::default(),
            UtcDateTime::from_unix_millis(0),
        );

        assert_eq!(verdict.path, Some(EscalationPath::B));
        assert_eq!(verdict.matched, vec![EscalationPath::B, EscalationPath::C]);
    }

    #[test]
    fn hold_never_matches_directional_paths() {
        let paths = matching_paths(&analysis(Signal::Hold, 1.0, 0.0), &EscalationThresholds::default());
        assert!(paths.is_empty());
    }

    #[test]
    fn thresholds_reject_negative_values() {
        let thresholds = EscalationThresholds {
            rr_threshold: -1.0,
            ..EscalationThresholds::default()
        };
        assert_eq!(
            thresholds.validate(),
            Err(ValidationError::NegativeValue {
                field: "gate.rr_threshold"
            })
        );
    }
}
