//! Shared fixtures for behaviour tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use scoutgate_core::aggregator::{AggregatorConfig, MarketDataAggregator};
use scoutgate_core::cache::{CacheConfig, SmartCache};
use scoutgate_core::clock::ManualClock;
use scoutgate_core::data_source::{
    MarketDataSource, SeriesRequest, SnapshotRequest, SourceFuture,
};
use scoutgate_core::dedup::{DedupConfig, DedupCoordinator};
use scoutgate_core::orchestrator::{Orchestrator, OrchestratorConfig};
use scoutgate_core::persistence::InMemoryPersistence;
use scoutgate_core::retry::RetryConfig;
use scoutgate_core::scanner::ScanFilter;
use scoutgate_core::simulated::SimulatedSource;
use scoutgate_core::stages::{Enricher, StageError};
use scoutgate_core::{
    AnalysisResult, Instrument, OhlcvPoint, ProviderId, Series, Signal, Symbol, UtcDateTime,
};
use serde_json::Value;

pub fn symbol(raw: &str) -> Symbol {
    Symbol::parse(raw).expect("valid symbol")
}

pub fn source(name: &str) -> SimulatedSource {
    SimulatedSource::new(ProviderId::parse(name).expect("valid provider id"))
}

/// Provider whose calls never complete.
#[derive(Debug, Clone)]
pub struct StalledSource {
    id: ProviderId,
}

impl StalledSource {
    pub fn new(name: &str) -> Self {
        Self {
            id: ProviderId::parse(name).expect("valid provider id"),
        }
    }
}

impl MarketDataSource for StalledSource {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    fn fetch_series<'a>(&'a self, _req: SeriesRequest) -> SourceFuture<'a, Vec<OhlcvPoint>> {
        Box::pin(futures::future::pending())
    }

    fn fetch_snapshot<'a>(&'a self, _req: SnapshotRequest) -> SourceFuture<'a, Vec<Instrument>> {
        Box::pin(futures::future::pending())
    }
}

/// Enricher returning a fixed (signal, confidence, risk/reward) per symbol.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEnricher {
    scripted: HashMap<Symbol, (Signal, f64, f64)>,
    fallback: Option<(Signal, f64, f64)>,
}

impl ScriptedEnricher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, raw: &str, signal: Signal, confidence: f64, risk_reward: f64) -> Self {
        self.scripted
            .insert(symbol(raw), (signal, confidence, risk_reward));
        self
    }

    /// Score for every symbol without a script.
    pub fn otherwise(mut self, signal: Signal, confidence: f64, risk_reward: f64) -> Self {
        self.fallback = Some((signal, confidence, risk_reward));
        self
    }
}

impl Enricher for ScriptedEnricher {
    fn enrich(&self, instrument: &Instrument, _series: &Series) -> Result<AnalysisResult, StageError> {
        let (signal, confidence, risk_reward) = self
            .scripted
            .get(&instrument.symbol)
            .copied()
            .or(self.fallback)
            .unwrap_or((Signal::Hold, 0.5, 1.0));
        Ok(AnalysisResult::new(
            instrument.symbol.clone(),
            signal,
            confidence,
            risk_reward,
            Value::Null,
            UtcDateTime::now(),
        )?)
    }
}

/// Orchestrator over simulated providers and in-memory persistence.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub sources: Vec<SimulatedSource>,
    pub persistence: Arc<InMemoryPersistence>,
    pub clock: ManualClock,
}

pub struct HarnessBuilder {
    sources: Vec<SimulatedSource>,
    leading: Vec<Arc<dyn MarketDataSource>>,
    enricher: ScriptedEnricher,
    config: OrchestratorConfig,
    filter: ScanFilter,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            sources: vec![source("sim-a"), source("sim-b")],
            leading: Vec::new(),
            enricher: ScriptedEnricher::new(),
            config: OrchestratorConfig {
                pool_size: 4,
                worker_timeout: Duration::from_secs(5),
                retry: RetryConfig::fixed(Duration::from_millis(5), 2),
                ..OrchestratorConfig::default()
            },
            filter: ScanFilter {
                min_market_cap: 0.0,
                min_volume_24h: 0.0,
                min_abs_change_pct: 0.0,
                ..ScanFilter::default()
            },
        }
    }

    pub fn with_sources(mut self, sources: Vec<SimulatedSource>) -> Self {
        self.sources = sources;
        self
    }

    /// Put `provider` ahead of the simulated sources.
    pub fn with_leading_provider(mut self, provider: Arc<dyn MarketDataSource>) -> Self {
        self.leading.push(provider);
        self
    }

    pub fn with_enricher(mut self, enricher: ScriptedEnricher) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Harness {
        let mut aggregator = MarketDataAggregator::new(
            AggregatorConfig::default(),
            SmartCache::new(CacheConfig::default()),
        );
        for provider in self.leading {
            aggregator = aggregator.with_provider(provider);
        }
        for source in &self.sources {
            aggregator = aggregator.with_provider(Arc::new(source.clone()));
        }

        let clock = ManualClock::new(UtcDateTime::now());
        let persistence = Arc::new(InMemoryPersistence::new());
        let dedup = Arc::new(DedupCoordinator::with_clock(
            persistence.clone(),
            DedupConfig::default(),
            Arc::new(clock.clone()),
        ));
        let orchestrator = Orchestrator::builder(Arc::new(aggregator), dedup, persistence.clone())
            .with_config(self.config)
            .with_scan_filter(self.filter)
            .with_enricher(Arc::new(self.enricher))
            .build()
            .expect("valid orchestrator");

        Harness {
            orchestrator,
            sources: self.sources,
            persistence,
            clock,
        }
    }
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}
