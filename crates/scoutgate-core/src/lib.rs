//! # Scoutgate Core
//!
//! Coordination layer of a market-analysis pipeline that periodically scans a
//! market, enriches the promising instruments, and escalates only the best of
//! them to an expensive strategic stage.
//!
//! ## Overview
//!
//! ```text
//!  scheduler ──► orchestrator ──► scanner ──► aggregator ──► providers
//!                    │                            │
//!                    │                            └──► smart cache
//!                    ├──► enricher ──► gate ──► dedup ──► strategist ──► decision sink
//!                    │                            │
//!                    │                            └──► reservation store (DuckDB)
//!                    └──► event bus ──► subscribers
//! ```
//!
//! - **Smart cache** with per-tier TTL, LRU bounds and labelled stale reads
//! - **Multi-source aggregation** with fan-out, fallback, cross-validation and
//!   per-provider circuit breakers and request budgets
//! - **Anti-duplicate coordination** with atomic, restart-safe reservations
//! - **Escalation gate** with three independent admission paths
//! - **Orchestrator** with a bounded worker pool, single-flight cycles and a
//!   typed event bus
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`aggregator`] | Provider fan-out, fallback, in-flight coalescing |
//! | [`cache`] | Multi-tier TTL cache |
//! | [`circuit_breaker`] | Per-provider circuit breaker |
//! | [`clock`] | Wall-clock abstraction for windows and tests |
//! | [`config`] | Pipeline configuration and serde helpers |
//! | [`data_source`] | Provider trait and request types |
//! | [`dedup`] | Reservation coordinator |
//! | [`domain`] | Domain models |
//! | [`error`] | Error taxonomy |
//! | [`events`] | Typed event bus |
//! | [`gate`] | Escalation rules |
//! | [`health`] | Component health and alerts |
//! | [`orchestrator`] | Cycle state machine and workers |
//! | [`persistence`] | Async store seams over `scoutgate-store` |
//! | [`provider_policy`] | Per-provider limits and trust |
//! | [`retry`] | Backoff for idempotent writes |
//! | [`scanner`] | Market scan and candidate ranking |
//! | [`scheduler`] | Periodic cycle and health loop |
//! | [`simulated`] | Deterministic in-process provider |
//! | [`source`] | Provider identifiers |
//! | [`stages`] | Enrichment and strategic stage seams |
//! | [`throttling`] | Request budgets |
//! | [`validation`] | Cross-source series validation |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use scoutgate_core::{
//!     cache::SmartCache, aggregator::MarketDataAggregator, dedup::DedupCoordinator,
//!     orchestrator::Orchestrator, persistence::InMemoryPersistence, simulated::SimulatedSource,
//!     PipelineConfig, ProviderId,
//! };
//!
//! let config = PipelineConfig::default();
//! let aggregator = Arc::new(
//!     MarketDataAggregator::new(config.aggregator.clone(), SmartCache::new(config.cache.clone()))
//!         .with_provider(Arc::new(SimulatedSource::new(ProviderId::parse("sim-a")?))),
//! );
//! let store = Arc::new(InMemoryPersistence::new());
//! let dedup = Arc::new(DedupCoordinator::new(store.clone(), config.dedup));
//! let orchestrator = Orchestrator::builder(aggregator, dedup, store)
//!     .with_pipeline_config(&config)
//!     .build()?;
//!
//! let report = orchestrator.trigger_manual_cycle(None).await?;
//! println!("{} decision(s)", report.decisions);
//! ```

pub mod aggregator;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod data_source;
pub mod dedup;
pub mod domain;
pub mod error;
pub mod events;
pub mod gate;
pub mod health;
pub mod orchestrator;
pub mod persistence;
pub mod provider_policy;
pub mod retry;
pub mod scanner;
pub mod scheduler;
pub mod simulated;
pub mod source;
pub mod stages;
pub mod throttling;
pub mod validation;

pub use config::PipelineConfig;
pub use domain::{
    AnalysisResult, CycleId, Decision, EscalationPath, EscalationVerdict, GatedAnalysis,
    Instrument, MarketStats, OhlcvPoint, Provenance, Series, Signal, Symbol, Timeframe,
    UtcDateTime,
};
pub use error::{CoreError, PipelineError, ProviderAttempt, Stage, ValidationError};
pub use scoutgate_store::resolve_scoutgate_home;
pub use source::ProviderId;
