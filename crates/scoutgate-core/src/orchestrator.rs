//! Cycle orchestration: scan → enrich → gate → reserve → decide.
//!
//! ```text
//! Idle ─► Scanning ─► Enriching ─► Gating ─► Deciding ─► Completed
//!             │            (any state)
//!             └──────────────► Failed { component, error }
//! ```
//!
//! Only one cycle runs at a time. Enrichment and decision workers run under a
//! shared semaphore of `pool_size` permits; a worker failure is reported once
//! as a `StageFailed` event and never cancels its siblings.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::aggregator::{elapsed_ms, MarketDataAggregator};
use crate::cache::{CachePayload, SmartCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{duration_secs, PipelineConfig};
use crate::dedup::{DedupCoordinator, ReservationOutcome};
use crate::events::{EventBus, EventPayload};
use crate::gate::{self, EscalationThresholds};
use crate::health::{HealthReport, HealthSnapshot};
use crate::persistence::DecisionSink;
use crate::retry::RetryConfig;
use crate::scanner::{MarketScanner, ScanFilter};
use crate::stages::{
    DecisionRequest, Enricher, MomentumEnricher, RiskBandStrategist, StrategicStage,
};
use crate::{
    AnalysisResult, CycleId, Decision, EscalationPath, GatedAnalysis, Instrument, PipelineError,
    Series, Stage, Symbol, UtcDateTime, ValidationError,
};

const COMPONENT: &str = "orchestrator";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub pool_size: usize,
    #[serde(rename = "worker_timeout_secs", with = "duration_secs")]
    pub worker_timeout: Duration,
    /// Analyze an expired cached series when every provider fails.
    pub allow_stale: bool,
    /// Release the reservation when the decision cannot be made or stored.
    pub release_on_failure: bool,
    pub retry: RetryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            worker_timeout: Duration::from_secs(120),
            allow_stale: true,
            release_on_failure: false,
            retry: RetryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.pool_size == 0 {
            return Err(ValidationError::ZeroConfigValue {
                field: "orchestrator.pool_size",
            });
        }
        if self.worker_timeout.is_zero() {
            return Err(ValidationError::ZeroConfigValue {
                field: "orchestrator.worker_timeout_secs",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CycleState {
    #[default]
    Idle,
    Scanning,
    Enriching,
    Gating,
    Deciding,
    Completed,
    Failed {
        component: String,
        error: String,
    },
}

impl CycleState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Enriching => "enriching",
            Self::Gating => "gating",
            Self::Deciding => "deciding",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

impl Display for CycleState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    Skipped,
}

/// Where one instrument ended up in a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstrumentOutcome {
    pub instrument: Symbol,
    pub status: OutcomeStatus,
    pub stage_reached: Stage,
    pub path: Option<EscalationPath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl InstrumentOutcome {
    fn new(instrument: Symbol, status: OutcomeStatus, stage_reached: Stage) -> Self {
        Self {
            instrument,
            status,
            stage_reached,
            path: None,
            detail: None,
        }
    }

    fn with_path(mut self, path: Option<EscalationPath>) -> Self {
        self.path = path;
        self
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub instrument: Option<Symbol>,
    pub message: String,
}

impl StageFailure {
    fn new(stage: Stage, instrument: Option<Symbol>, message: impl Into<String>) -> Self {
        Self {
            stage,
            instrument,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle_id: CycleId,
    pub trigger: CycleTrigger,
    pub state: CycleState,
    pub started_at: UtcDateTime,
    pub finished_at: UtcDateTime,
    pub duration_ms: u64,
    pub candidates: usize,
    pub analyzed: usize,
    pub escalated: usize,
    pub deduplicated: usize,
    pub decisions: usize,
    pub skipped: usize,
    pub failures: Vec<StageFailure>,
    pub outcomes: Vec<InstrumentOutcome>,
}

impl CycleReport {
    pub fn outcome(&self, instrument: &Symbol) -> Option<&InstrumentOutcome> {
        self.outcomes
            .iter()
            .find(|outcome| &outcome.instrument == instrument)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, CycleState::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct OrchestratorMetrics {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub rejected_cycles: u64,
    pub opportunities_processed: u64,
    pub analyses_completed: u64,
    pub escalations: u64,
    pub deduplicated: u64,
    pub decisions: u64,
    pub stage_failures: u64,
    pub last_cycle_ms: u64,
}

impl OrchestratorMetrics {
    /// Share of processed opportunities that produced an analysis.
    pub fn analysis_success_rate(&self) -> Option<f64> {
        (self.opportunities_processed > 0)
            .then(|| self.analyses_completed as f64 / self.opportunities_processed as f64)
    }

    fn absorb(&mut self, report: &CycleReport) {
        self.total_cycles += 1;
        if report.is_failed() {
            self.failed_cycles += 1;
        } else {
            self.successful_cycles += 1;
        }
        let processed = report.candidates.saturating_sub(report.skipped_before_fetch());
        self.opportunities_processed += processed as u64;
        self.analyses_completed += report.analyzed as u64;
        self.escalations += report.escalated as u64;
        self.deduplicated += report.deduplicated as u64;
        self.decisions += report.decisions as u64;
        self.stage_failures += report.failures.len() as u64;
        self.last_cycle_ms = report.duration_ms;
    }
}

impl CycleReport {
    fn skipped_before_fetch(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| {
                outcome.status == OutcomeStatus::Skipped && outcome.stage_reached == Stage::Fetch
            })
            .count()
    }
}

/// Result of one enrichment worker.
enum Enriched {
    Analyzed {
        analysis: AnalysisResult,
        series: Arc<Series>,
    },
    Drained,
}

/// Result of one decision worker.
enum Decided {
    Recorded,
    Deduplicated,
    Drained,
}

struct OrchestratorInner {
    config: OrchestratorConfig,
    scan_filter: ScanFilter,
    thresholds: EscalationThresholds,
    aggregator: Arc<MarketDataAggregator>,
    scanner: MarketScanner,
    dedup: Arc<DedupCoordinator>,
    decisions: Arc<dyn DecisionSink>,
    enricher: Arc<dyn Enricher>,
    strategist: Arc<dyn StrategicStage>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    draining: AtomicBool,
    current_cycle: Mutex<Option<CycleId>>,
    state: Mutex<CycleState>,
    metrics: Mutex<OrchestratorMetrics>,
    sweeper: tokio::sync::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    scan_filter: ScanFilter,
    thresholds: EscalationThresholds,
    aggregator: Arc<MarketDataAggregator>,
    dedup: Arc<DedupCoordinator>,
    decisions: Arc<dyn DecisionSink>,
    enricher: Arc<dyn Enricher>,
    strategist: Arc<dyn StrategicStage>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl OrchestratorBuilder {
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Take the orchestrator, scanner and gate sections of `config`.
    pub fn with_pipeline_config(mut self, config: &PipelineConfig) -> Self {
        self.config = config.orchestrator.clone();
        self.scan_filter = config.scanner.clone();
        self.thresholds = config.gate;
        self
    }

    pub fn with_scan_filter(mut self, filter: ScanFilter) -> Self {
        self.scan_filter = filter;
        self
    }

    pub fn with_thresholds(mut self, thresholds: EscalationThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn with_strategist(mut self, strategist: Arc<dyn StrategicStage>) -> Self {
        self.strategist = strategist;
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Orchestrator, ValidationError> {
        self.config.validate()?;
        self.scan_filter.validate()?;
        self.thresholds.validate()?;

        Ok(Orchestrator {
            inner: Arc::new(OrchestratorInner {
                scanner: MarketScanner::new(Arc::clone(&self.aggregator))
                    .with_allow_stale(self.config.allow_stale),
                config: self.config,
                scan_filter: self.scan_filter,
                thresholds: self.thresholds,
                aggregator: self.aggregator,
                dedup: self.dedup,
                decisions: self.decisions,
                enricher: self.enricher,
                strategist: self.strategist,
                bus: self.bus,
                clock: self.clock,
                running: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                current_cycle: Mutex::new(None),
                state: Mutex::new(CycleState::Idle),
                metrics: Mutex::new(OrchestratorMetrics::default()),
                sweeper: tokio::sync::Mutex::new(None),
            }),
        })
    }
}

/// Cloneable handle to the pipeline.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

/// Clears the single-flight flag even when the cycle future is dropped.
struct RunningGuard<'a> {
    inner: &'a OrchestratorInner,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self
            .inner
            .current_cycle
            .lock()
            .expect("cycle lock is not poisoned") = None;
        self.inner.running.store(false, Ordering::Release);
    }
}

impl Orchestrator {
    pub fn builder(
        aggregator: Arc<MarketDataAggregator>,
        dedup: Arc<DedupCoordinator>,
        decisions: Arc<dyn DecisionSink>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config: OrchestratorConfig::default(),
            scan_filter: ScanFilter::default(),
            thresholds: EscalationThresholds::default(),
            aggregator,
            dedup,
            decisions,
            enricher: Arc::new(MomentumEnricher::default()),
            strategist: Arc::new(RiskBandStrategist::default()),
            bus: EventBus::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Rehydrate dedup state and start the cache sweeper. The sweeper starts
    /// even when rehydration fails, so the caller may continue degraded.
    pub async fn start(&self) -> Result<usize, PipelineError> {
        {
            let mut sweeper = self.inner.sweeper.lock().await;
            if sweeper.is_none() {
                let (sender, receiver) = watch::channel(false);
                let handle = self.inner.aggregator.cache().spawn_sweeper(receiver).await;
                *sweeper = Some((sender, handle));
            }
        }
        self.inner.dedup.rehydrate().await
    }

    /// Stop the cache sweeper started by [`start`](Self::start).
    pub async fn shutdown(&self) {
        let sweeper = self.inner.sweeper.lock().await.take();
        if let Some((sender, handle)) = sweeper {
            let _ = sender.send(true);
            if let Err(error) = handle.await {
                warn!(error = %error, "cache sweeper ended abnormally");
            }
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, PipelineError> {
        self.run(CycleTrigger::Scheduled, None).await
    }

    /// Run a cycle now. With `instruments`, the scan is replaced by that list.
    pub async fn trigger_manual_cycle(
        &self,
        instruments: Option<Vec<Symbol>>,
    ) -> Result<CycleReport, PipelineError> {
        self.run(CycleTrigger::Manual, instruments).await
    }

    /// Stop dispatching new workers. Workers already running finish or time out.
    pub fn request_drain(&self) {
        if !self.inner.draining.swap(true, Ordering::SeqCst) {
            info!("drain requested, no new workers will start");
        }
    }

    /// Accept new workers again after a drain.
    pub fn resume(&self) {
        self.inner.draining.store(false, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> CycleState {
        self.inner.state.lock().expect("state lock is not poisoned").clone()
    }

    pub fn metrics(&self) -> OrchestratorMetrics {
        self.inner
            .metrics
            .lock()
            .expect("metrics lock is not poisoned")
            .clone()
    }

    pub async fn health(&self) -> HealthReport {
        let snapshot = HealthSnapshot {
            state: self.state(),
            metrics: self.metrics(),
            cache: self.inner.aggregator.cache().stats().await,
            providers: self.inner.aggregator.provider_health(),
            dedup: self.inner.dedup.stats(),
            events: self.inner.bus.stats(),
            scanner: self.inner.scanner.metrics(),
        };
        HealthReport::assess(snapshot, self.inner.clock.now())
    }

    /// [`health`](Self::health), publishing one `PerformanceAlert` per alert.
    /// Expired dedup reservations are purged first.
    pub async fn check_health(&self) -> HealthReport {
        if let Err(error) = self.inner.dedup.purge_expired().await {
            warn!(error = %error, "expired reservations not purged");
        }
        let report = self.health().await;
        for alert in &report.alerts {
            warn!(kind = ?alert.kind, component = alert.component, "{}", alert.message);
            self.inner
                .bus
                .emit(COMPONENT, None, EventPayload::PerformanceAlert(alert.clone()));
        }
        report
    }

    /// Drop cached data for `instrument` and announce it on the bus.
    pub async fn invalidate_instrument(&self, instrument: &Symbol) -> usize {
        let removed = self.inner.aggregator.invalidate_instrument(instrument).await;
        debug!(instrument = %instrument, removed, "instrument cache invalidated");
        self.inner.bus.emit(
            COMPONENT,
            None,
            EventPayload::CacheInvalidated {
                instrument: instrument.clone(),
                removed,
            },
        );
        removed
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn dedup(&self) -> &Arc<DedupCoordinator> {
        &self.inner.dedup
    }

    pub fn cache(&self) -> &SmartCache<CachePayload> {
        self.inner.aggregator.cache()
    }

    pub fn aggregator(&self) -> &Arc<MarketDataAggregator> {
        &self.inner.aggregator
    }

    async fn run(
        &self,
        trigger: CycleTrigger,
        instruments: Option<Vec<Symbol>>,
    ) -> Result<CycleReport, PipelineError> {
        let cycle_id = CycleId::new();
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let running = self
                .inner
                .current_cycle
                .lock()
                .expect("cycle lock is not poisoned")
                .unwrap_or(cycle_id);
            self.inner
                .metrics
                .lock()
                .expect("metrics lock is not poisoned")
                .rejected_cycles += 1;
            warn!(cycle_id = %running, "cycle rejected, another one is running");
            return Err(PipelineError::CycleAlreadyRunning { cycle_id: running });
        }
        *self
            .inner
            .current_cycle
            .lock()
            .expect("cycle lock is not poisoned") = Some(cycle_id);
        let _guard = RunningGuard { inner: &self.inner };

        let report = CycleRun::new(Arc::clone(&self.inner), cycle_id, trigger)
            .execute(instruments)
            .await;

        self.inner
            .metrics
            .lock()
            .expect("metrics lock is not poisoned")
            .absorb(&report);
        self.inner.bus.emit(
            COMPONENT,
            Some(cycle_id),
            EventPayload::CycleCompleted(Box::new(report.clone())),
        );
        Ok(report)
    }
}

/// State of one cycle while it runs.
struct CycleRun {
    inner: Arc<OrchestratorInner>,
    cycle_id: CycleId,
    trigger: CycleTrigger,
    started: Instant,
    started_at: UtcDateTime,
    permits: Arc<Semaphore>,
    /// Candidate order, used to sort outcomes.
    order: Vec<Symbol>,
    failures: Vec<StageFailure>,
    outcomes: Vec<InstrumentOutcome>,
}

impl CycleRun {
    fn new(inner: Arc<OrchestratorInner>, cycle_id: CycleId, trigger: CycleTrigger) -> Self {
        let permits = Arc::new(Semaphore::new(inner.config.pool_size));
        let started_at = inner.clock.now();
        Self {
            inner,
            cycle_id,
            trigger,
            started: Instant::now(),
            started_at,
            permits,
            order: Vec::new(),
            failures: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    async fn execute(mut self, overrides: Option<Vec<Symbol>>) -> CycleReport {
        info!(cycle_id = %self.cycle_id, trigger = ?self.trigger, "cycle started");

        self.set_state(CycleState::Scanning);
        let candidates = match self.candidates(overrides).await {
            Ok(candidates) => candidates,
            Err(error) => {
                self.fail(StageFailure::new(Stage::Scan, None, error.to_string()));
                let state = CycleState::Failed {
                    component: "scanner".to_owned(),
                    error: error.to_string(),
                };
                return self.finish(state, 0);
            }
        };
        let candidate_count = candidates.len();
        self.order = candidates
            .iter()
            .map(|instrument| instrument.symbol.clone())
            .collect();

        self.set_state(CycleState::Enriching);
        let analyzed = self.enrich_all(candidates).await;

        self.set_state(CycleState::Gating);
        let escalated = self.gate_all(analyzed);

        self.set_state(CycleState::Deciding);
        self.decide_all(escalated).await;

        self.finish(CycleState::Completed, candidate_count)
    }

    async fn candidates(&self, overrides: Option<Vec<Symbol>>) -> Result<Vec<Instrument>, PipelineError> {
        let (instruments, from_cache) = match overrides {
            Some(symbols) => {
                let mut seen = HashSet::new();
                let instruments = symbols
                    .into_iter()
                    .filter(|symbol| seen.insert(symbol.clone()))
                    .map(Instrument::unpriced)
                    .collect::<Vec<_>>();
                (instruments, false)
            }
            None => {
                let report = self.inner.scanner.scan(&self.inner.scan_filter).await?;
                (report.instruments, report.from_cache)
            }
        };

        self.inner.bus.emit(
            "scanner",
            Some(self.cycle_id),
            EventPayload::OpportunitiesFound {
                instruments: instruments
                    .iter()
                    .map(|instrument| instrument.symbol.clone())
                    .collect(),
                from_cache,
            },
        );
        Ok(instruments)
    }

    async fn enrich_all(&mut self, candidates: Vec<Instrument>) -> Vec<(AnalysisResult, Arc<Series>)> {
        let mut workers = JoinSet::new();
        for instrument in candidates {
            let inner = Arc::clone(&self.inner);
            let permits = Arc::clone(&self.permits);
            let cycle_id = self.cycle_id;
            workers.spawn(async move {
                let symbol = instrument.symbol.clone();
                let _permit = permits.acquire_owned().await;
                if inner.draining.load(Ordering::SeqCst) {
                    return (symbol, Ok(Enriched::Drained));
                }
                let timeout = inner.config.worker_timeout;
                let work = AssertUnwindSafe(enrich_one(&inner, cycle_id, &instrument)).catch_unwind();
                let result = match tokio::time::timeout(timeout, work).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(StageFailure::new(
                        Stage::Enrich,
                        Some(symbol.clone()),
                        "worker panicked",
                    )),
                    Err(_) => Err(StageFailure::new(
                        Stage::Enrich,
                        Some(symbol.clone()),
                        format!("worker timed out after {}ms", timeout.as_millis()),
                    )),
                };
                (symbol, result)
            });
        }

        let mut analyzed = Vec::new();
        while let Some(joined) = workers.join_next().await {
            let (symbol, result) = match joined {
                Ok(joined) => joined,
                Err(error) => {
                    warn!(cycle_id = %self.cycle_id, error = %error, "enrichment task aborted");
                    continue;
                }
            };
            match result {
                Ok(Enriched::Analyzed { analysis, series }) => analyzed.push((analysis, series)),
                Ok(Enriched::Drained) => self.outcomes.push(
                    InstrumentOutcome::new(symbol, OutcomeStatus::Skipped, Stage::Fetch)
                        .with_detail("drained"),
                ),
                Err(failure) => {
                    self.outcomes.push(
                        InstrumentOutcome::new(symbol, OutcomeStatus::Failed, failure.stage)
                            .with_detail(failure.message.clone()),
                    );
                    self.fail(failure);
                }
            }
        }

        // Gate in scan order so reports and events do not depend on task timing.
        analyzed.sort_by_key(|(analysis, _)| self.position(&analysis.instrument));
        analyzed
    }

    fn gate_all(&mut self, analyzed: Vec<(AnalysisResult, Arc<Series>)>) -> Vec<(GatedAnalysis, Arc<Series>)> {
        let mut escalated = Vec::new();
        for (analysis, series) in analyzed {
            let verdict = gate::evaluate(&analysis, &self.inner.thresholds, self.inner.clock.now());
            debug!(
                instrument = %analysis.instrument,
                admit = verdict.admit,
                path = ?verdict.path,
                "gate evaluated"
            );
            if !verdict.admit {
                self.outcomes.push(InstrumentOutcome::new(
                    analysis.instrument.clone(),
                    OutcomeStatus::Completed,
                    Stage::Gate,
                ));
                continue;
            }

            let gated = GatedAnalysis { analysis, verdict };
            self.inner.bus.emit(
                "gate",
                Some(self.cycle_id),
                EventPayload::Escalated(gated.clone()),
            );
            escalated.push((gated, series));
        }
        escalated
    }

    async fn decide_all(&mut self, escalated: Vec<(GatedAnalysis, Arc<Series>)>) {
        let mut workers = JoinSet::new();
        for (gated, series) in escalated {
            let inner = Arc::clone(&self.inner);
            let permits = Arc::clone(&self.permits);
            let cycle_id = self.cycle_id;
            workers.spawn(async move {
                let symbol = gated.analysis.instrument.clone();
                let path = gated.verdict.path;
                let _permit = permits.acquire_owned().await;
                if inner.draining.load(Ordering::SeqCst) {
                    return (symbol, path, Ok(Decided::Drained));
                }
                let work = AssertUnwindSafe(decide_one(&inner, cycle_id, gated, series)).catch_unwind();
                let result = match work.await {
                    Ok(result) => result,
                    Err(_) => Err(StageFailure::new(
                        Stage::Decide,
                        Some(symbol.clone()),
                        "worker panicked",
                    )),
                };
                (symbol, path, result)
            });
        }

        let mut finished = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(done) => finished.push(done),
                Err(error) => {
                    warn!(cycle_id = %self.cycle_id, error = %error, "decision task aborted");
                }
            }
        }

        for (symbol, path, result) in finished {
            let outcome = match result {
                Ok(Decided::Recorded) => {
                    InstrumentOutcome::new(symbol, OutcomeStatus::Completed, Stage::Persist)
                }
                Ok(Decided::Deduplicated) => {
                    InstrumentOutcome::new(symbol, OutcomeStatus::Skipped, Stage::Reserve)
                        .with_detail("deduplicated")
                }
                Ok(Decided::Drained) => {
                    InstrumentOutcome::new(symbol, OutcomeStatus::Skipped, Stage::Reserve)
                        .with_detail("drained")
                }
                Err(failure) => {
                    let outcome = InstrumentOutcome::new(symbol, OutcomeStatus::Failed, failure.stage)
                        .with_detail(failure.message.clone());
                    self.fail(failure);
                    outcome
                }
            };
            self.outcomes.push(outcome.with_path(path));
        }
    }

    /// Log and publish one failure. Every failure passes here exactly once.
    fn fail(&mut self, failure: StageFailure) {
        warn!(
            cycle_id = %self.cycle_id,
            stage = %failure.stage,
            instrument = failure.instrument.as_ref().map(Symbol::as_str).unwrap_or("-"),
            error = %failure.message,
            "stage failed"
        );
        self.inner.bus.emit(
            COMPONENT,
            Some(self.cycle_id),
            EventPayload::StageFailed {
                stage: failure.stage,
                instrument: failure.instrument.clone(),
                error: failure.message.clone(),
            },
        );
        self.failures.push(failure);
    }

    fn set_state(&self, state: CycleState) {
        debug!(cycle_id = %self.cycle_id, state = state.name(), "cycle state");
        *self.inner.state.lock().expect("state lock is not poisoned") = state;
    }

    fn position(&self, instrument: &Symbol) -> usize {
        self.order
            .iter()
            .position(|symbol| symbol == instrument)
            .unwrap_or(usize::MAX)
    }

    fn finish(mut self, state: CycleState, candidates: usize) -> CycleReport {
        self.set_state(state.clone());
        let mut outcomes = std::mem::take(&mut self.outcomes);
        outcomes.sort_by_key(|outcome| self.position(&outcome.instrument));
        self.outcomes = outcomes;
        let count = |status: OutcomeStatus, detail: Option<&str>| {
            self.outcomes
                .iter()
                .filter(|outcome| {
                    outcome.status == status
                        && detail.map_or(true, |detail| outcome.detail.as_deref() == Some(detail))
                })
                .count()
        };

        let escalated = self
            .outcomes
            .iter()
            .filter(|outcome| outcome.path.is_some())
            .count();
        let analyzed = self
            .outcomes
            .iter()
            .filter(|outcome| {
                !matches!(outcome.stage_reached, Stage::Scan | Stage::Fetch | Stage::Enrich)
            })
            .count();
        let deduplicated = count(OutcomeStatus::Skipped, Some("deduplicated"));
        let skipped = count(OutcomeStatus::Skipped, None);
        let decisions = self
            .outcomes
            .iter()
            .filter(|outcome| {
                outcome.status == OutcomeStatus::Completed && outcome.stage_reached == Stage::Persist
            })
            .count();
        let duration_ms = elapsed_ms(self.started);

        info!(
            cycle_id = %self.cycle_id,
            state = state.name(),
            candidates,
            analyzed,
            escalated,
            decisions,
            failures = self.failures.len(),
            elapsed_ms = duration_ms,
            "cycle finished"
        );

        CycleReport {
            cycle_id: self.cycle_id,
            trigger: self.trigger,
            state,
            started_at: self.started_at,
            finished_at: self.inner.clock.now(),
            duration_ms,
            candidates,
            analyzed,
            escalated,
            deduplicated,
            decisions,
            skipped,
            failures: self.failures,
            outcomes: self.outcomes,
        }
    }
}

async fn enrich_one(
    inner: &OrchestratorInner,
    cycle_id: CycleId,
    instrument: &Instrument,
) -> Result<Enriched, StageFailure> {
    let symbol = &instrument.symbol;
    let timeframe = inner.aggregator.config().timeframe;
    let fetched = inner
        .aggregator
        .fetch_series_or_stale(symbol, timeframe, inner.config.allow_stale)
        .await
        .map_err(|error| StageFailure::new(Stage::Fetch, Some(symbol.clone()), error.to_string()))?;

    let analysis = inner
        .enricher
        .enrich(instrument, &fetched.series)
        .map_err(|error| StageFailure::new(Stage::Enrich, Some(symbol.clone()), error.to_string()))?;

    inner.bus.emit(
        "enricher",
        Some(cycle_id),
        EventPayload::AnalysisCompleted {
            analysis: analysis.clone(),
            stale_series: fetched.stale,
        },
    );
    Ok(Enriched::Analyzed {
        analysis,
        series: fetched.series,
    })
}

async fn decide_one(
    inner: &OrchestratorInner,
    cycle_id: CycleId,
    gated: GatedAnalysis,
    series: Arc<Series>,
) -> Result<Decided, StageFailure> {
    let symbol = gated.analysis.instrument.clone();
    let timeout = inner.config.worker_timeout;
    let reserved = tokio::time::timeout(timeout, inner.dedup.reserve(&symbol))
        .await
        .map_err(|_| {
            StageFailure::new(
                Stage::Reserve,
                Some(symbol.clone()),
                format!("reservation timed out after {}ms", timeout.as_millis()),
            )
        })?;
    let reservation = match reserved {
        ReservationOutcome::Granted { reservation, durable } => {
            debug!(instrument = %symbol, durable, "reservation granted");
            reservation
        }
        ReservationOutcome::Denied(existing) => {
            debug!(
                instrument = %symbol,
                window_end = %existing.window_end,
                "instrument already reserved"
            );
            return Ok(Decided::Deduplicated);
        }
    };

    let result = match tokio::time::timeout(timeout, decide_granted(inner, cycle_id, gated, series)).await {
        Ok(result) => result,
        Err(_) => Err(StageFailure::new(
            Stage::Decide,
            Some(symbol.clone()),
            format!("worker timed out after {}ms", timeout.as_millis()),
        )),
    };

    if result.is_err() && inner.config.release_on_failure {
        let released = inner.dedup.release(reservation.token).await;
        debug!(instrument = %symbol, released, "reservation released after failure");
    }
    result
}

async fn decide_granted(
    inner: &OrchestratorInner,
    cycle_id: CycleId,
    gated: GatedAnalysis,
    series: Arc<Series>,
) -> Result<Decided, StageFailure> {
    let symbol = gated.analysis.instrument.clone();
    let output = inner
        .strategist
        .decide(DecisionRequest {
            cycle_id,
            gated,
            series,
        })
        .await
        .map_err(|error| StageFailure::new(Stage::Decide, Some(symbol.clone()), error.to_string()))?;

    let decision = Decision::new(
        symbol.clone(),
        cycle_id,
        output.signal,
        output.confidence,
        output.sizing,
        inner.clock.now(),
    )
    .map_err(|error| StageFailure::new(Stage::Decide, Some(symbol.clone()), error.to_string()))?;

    let newly_persisted = inner
        .config
        .retry
        .run("record_decision", || inner.decisions.record_decision(&decision))
        .await
        .map_err(|error| StageFailure::new(Stage::Persist, Some(symbol.clone()), error.to_string()))?;

    info!(
        cycle_id = %cycle_id,
        instrument = %symbol,
        signal = %decision.signal,
        newly_persisted,
        "decision made"
    );
    inner.bus.emit(
        "strategist",
        Some(cycle_id),
        EventPayload::DecisionMade {
            decision: decision.clone(),
            newly_persisted,
        },
    );
    Ok(Decided::Recorded)
}
