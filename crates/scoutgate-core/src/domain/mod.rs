//! Domain models for the scan → enrich → gate → decide pipeline.
//!
//! This module contains the canonical types that flow between components:
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Symbol`] | Normalized instrument ticker |
//! | [`Timeframe`] | Candle width (1h, 4h, 1d) |
//! | [`UtcDateTime`] | UTC timestamp wrapper |
//! | [`Instrument`] | Scanned candidate with [`MarketStats`] |
//! | [`Series`] | Validated OHLCV candles with [`Provenance`] |
//! | [`AnalysisResult`] | Signal, confidence, risk/reward, indicator payload |
//! | [`EscalationVerdict`] | Gate outcome and the path that admitted it |
//! | [`Decision`] | Strategic output persisted once per cycle |
//!
//! # Validation
//!
//! Constructors validate their inputs: candles keep `low <= open/close <= high`,
//! confidences stay in `[0, 1]`, risk/reward is non-negative, and every float
//! must be finite.

mod analysis;
mod models;
mod symbol;
mod timeframe;
mod timestamp;

pub use analysis::{
    AnalysisResult, Decision, EscalationPath, EscalationVerdict, GatedAnalysis, Signal,
};
pub use models::{CycleId, Instrument, MarketStats, OhlcvPoint, Provenance, Series};
pub use symbol::Symbol;
pub use timeframe::Timeframe;
pub use timestamp::UtcDateTime;
