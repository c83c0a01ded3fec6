use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::models::{validate_non_negative, validate_unit};
use crate::{CycleId, Symbol, UtcDateTime, ValidationError};

/// Directional output of enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Long,
    Short,
    Hold,
}

impl Signal {
    pub const ALL: [Self; 3] = [Self::Long, Self::Short, Self::Hold];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
            Self::Hold => "hold",
        }
    }

    pub const fn is_directional(self) -> bool {
        !matches!(self, Self::Hold)
    }
}

impl Display for Signal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "long" => Ok(Self::Long),
            "short" => Ok(Self::Short),
            "hold" => Ok(Self::Hold),
            other => Err(ValidationError::InvalidSignal {
                value: other.to_owned(),
            }),
        }
    }
}

/// Output of one enrichment call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub instrument: Symbol,
    pub signal: Signal,
    pub confidence: f64,
    pub risk_reward: f64,
    /// Indicator values, opaque to the pipeline.
    pub indicators: Value,
    pub produced_at: UtcDateTime,
}

impl AnalysisResult {
    pub fn new(
        instrument: Symbol,
        signal: Signal,
        confidence: f64,
        risk_reward: f64,
        indicators: Value,
        produced_at: UtcDateTime,
    ) -> Result<Self, ValidationError> {
        validate_unit("confidence", confidence)?;
        validate_non_negative("risk_reward", risk_reward)?;

        Ok(Self {
            instrument,
            signal,
            confidence,
            risk_reward,
            indicators,
            produced_at,
        })
    }
}

/// Admission rule of the escalation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EscalationPath {
    /// Directional conviction.
    A,
    /// Opportunity quality (risk/reward).
    B,
    /// High-confidence override.
    C,
}

impl EscalationPath {
    pub const ALL: [Self; 3] = [Self::A, Self::B, Self::C];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        }
    }

    pub const fn describe(self) -> &'static str {
        match self {
            Self::A => "directional conviction",
            Self::B => "risk/reward quality",
            Self::C => "confidence override",
        }
    }
}

impl Display for EscalationPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate decision attached to an analysis for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationVerdict {
    pub admit: bool,
    /// First matching path in A, B, C order.
    pub path: Option<EscalationPath>,
    /// Every path that matched.
    pub matched: Vec<EscalationPath>,
    pub evaluated_at: UtcDateTime,
}

/// An analysis together with its gate verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatedAnalysis {
    pub analysis: AnalysisResult,
    pub verdict: EscalationVerdict,
}

/// Final strategic recommendation, persisted once per (instrument, cycle).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub instrument: Symbol,
    pub cycle_id: CycleId,
    pub signal: Signal,
    pub confidence: f64,
    /// Entry/stop/size fields owned by the strategic stage.
    pub sizing: Value,
    pub created_at: UtcDateTime,
}

impl Decision {
    pub fn new(
        instrument: Symbol,
        cycle_id: CycleId,
        signal: Signal,
        confidence: f64,
        sizing: Value,
        created_at: UtcDateTime,
    ) -> Result<Self, ValidationError> {
        validate_unit("confidence", confidence)?;
        Ok(Self {
            instrument,
            cycle_id,
            signal,
            confidence,
            sizing,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_rejects_confidence_above_one() {
        let err = AnalysisResult::new(
            Symbol::parse("BTCUSDT").expect("valid"),
            Signal::Long,
            1.2,
            2.0,
            Value::Null,
            UtcDateTime::now(),
        )
        .expect_err("must fail");
        assert_eq!(err, ValidationError::OutOfUnitRange { field: "confidence" });
    }

    #[test]
    fn analysis_rejects_negative_risk_reward() {
        let err = AnalysisResult::new(
            Symbol::parse("BTCUSDT").expect("valid"),
            Signal::Hold,
            0.5,
            -0.1,
            Value::Null,
            UtcDateTime::now(),
        )
        .expect_err("must fail");
        assert_eq!(err, ValidationError::NegativeValue { field: "risk_reward" });
    }

    #[test]
    fn signal_parses_case_insensitively() {
        assert_eq!("SHORT".parse::<Signal>().expect("valid"), Signal::Short);
        assert!("sideways".parse::<Signal>().is_err());
    }
}
