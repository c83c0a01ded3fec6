//! Market scan: snapshot → dedupe → filter → rank → truncate.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregator::{elapsed_ms, MarketDataAggregator};
use crate::cache::{CachePayload, CacheTier};
use crate::data_source::SnapshotRequest;
use crate::{Instrument, PipelineError, ProviderId, Symbol, ValidationError};

const SNAPSHOT_KEY: &str = "market:snapshot";

/// Ordering applied to filtered candidates, always descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankKey {
    #[default]
    Volume,
    MarketCap,
    AbsChange,
    /// Blend of normalized absolute change and volume.
    Trending,
}

impl RankKey {
    fn score(self, instrument: &Instrument) -> f64 {
        let stats = &instrument.stats;
        match self {
            Self::Volume => stats.volume_24h,
            Self::MarketCap => stats.market_cap.unwrap_or(0.0),
            Self::AbsChange => stats.change_24h_pct.abs(),
            Self::Trending => {
                let momentum = (stats.change_24h_pct.abs() / 10.0).min(1.0);
                let activity = (stats.volume_24h / 10_000_000.0).min(1.0);
                0.5 * momentum + 0.5 * activity
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanFilter {
    /// Instruments without a reported market cap fail when this is above zero.
    pub min_market_cap: f64,
    pub min_volume_24h: f64,
    pub min_abs_change_pct: f64,
    pub max_candidates: usize,
    pub rank_by: RankKey,
    /// Tradable symbols; `None` admits everything.
    pub allowed_symbols: Option<BTreeSet<Symbol>>,
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self {
            min_market_cap: 1_000_000.0,
            min_volume_24h: 10_000.0,
            min_abs_change_pct: 1.0,
            max_candidates: 30,
            rank_by: RankKey::Volume,
            allowed_symbols: None,
        }
    }
}

impl ScanFilter {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("scanner.min_market_cap", self.min_market_cap),
            ("scanner.min_volume_24h", self.min_volume_24h),
            ("scanner.min_abs_change_pct", self.min_abs_change_pct),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ValidationError::InvalidConfig {
                    field,
                    reason: String::from("must be a non-negative number"),
                });
            }
        }
        if self.max_candidates == 0 {
            return Err(ValidationError::ZeroConfigValue {
                field: "scanner.max_candidates",
            });
        }
        Ok(())
    }

    pub fn admits(&self, instrument: &Instrument) -> bool {
        let stats = &instrument.stats;
        let cap_ok = match stats.market_cap {
            Some(cap) => cap >= self.min_market_cap,
            None => self.min_market_cap <= 0.0,
        };
        let allowed = self
            .allowed_symbols
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&instrument.symbol));

        cap_ok
            && allowed
            && stats.volume_24h >= self.min_volume_24h
            && stats.change_24h_pct.abs() >= self.min_abs_change_pct
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub instruments: Vec<Instrument>,
    pub from_cache: bool,
    /// Served from an expired snapshot because every provider failed.
    pub stale: bool,
    /// Provider that served the snapshot, `None` on a cache hit.
    pub source: Option<ProviderId>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ScannerMetrics {
    pub total_scans: u64,
    pub cache_hits: u64,
    pub stale_scans: u64,
    pub candidates_found: u64,
    pub last_scan_ms: u64,
}

#[derive(Debug, Default)]
struct ScannerCounters {
    total_scans: AtomicU64,
    cache_hits: AtomicU64,
    stale_scans: AtomicU64,
    candidates_found: AtomicU64,
    last_scan_ms: AtomicU64,
}

pub struct MarketScanner {
    aggregator: Arc<MarketDataAggregator>,
    allow_stale: bool,
    counters: ScannerCounters,
}

impl MarketScanner {
    pub fn new(aggregator: Arc<MarketDataAggregator>) -> Self {
        Self {
            aggregator,
            allow_stale: false,
            counters: ScannerCounters::default(),
        }
    }

    /// Scan an expired cached snapshot when no provider answers.
    pub fn with_allow_stale(mut self, allow_stale: bool) -> Self {
        self.allow_stale = allow_stale;
        self
    }

    /// Candidates for this cycle, ranked and truncated. Identical snapshots and
    /// filters always produce the same list.
    pub async fn scan(&self, filter: &ScanFilter) -> Result<ScanReport, PipelineError> {
        let started = Instant::now();
        self.counters.total_scans.fetch_add(1, Ordering::Relaxed);

        let cache = self.aggregator.cache();
        let cached = cache
            .get(SNAPSHOT_KEY, CacheTier::Market)
            .await
            .fresh()
            .and_then(CachePayload::into_snapshot);

        let mut stale = false;
        let (snapshot, source) = match cached {
            Some(snapshot) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(size = snapshot.len(), "market snapshot cache hit");
                (snapshot, None)
            }
            None => match self
                .aggregator
                .fetch_snapshot(SnapshotRequest::whole_market())
                .await
            {
                Ok(routed) => {
                    let snapshot = Arc::new(routed.data);
                    cache
                        .put(SNAPSHOT_KEY, CacheTier::Market, CachePayload::Snapshot(Arc::clone(&snapshot)))
                        .await;
                    (snapshot, Some(routed.selected_source))
                }
                Err(error @ PipelineError::AllSourcesFailed { .. }) if self.allow_stale => {
                    let expired = cache
                        .get(SNAPSHOT_KEY, CacheTier::Market)
                        .await
                        .any()
                        .and_then(CachePayload::into_snapshot);
                    let Some(snapshot) = expired else {
                        return Err(error);
                    };
                    warn!(error = %error, "all providers failed, scanning stale snapshot");
                    self.counters.stale_scans.fetch_add(1, Ordering::Relaxed);
                    stale = true;
                    (snapshot, None)
                }
                Err(error) => return Err(error),
            },
        };

        let instruments = select_candidates(&snapshot, filter);
        let elapsed = elapsed_ms(started);
        self.counters
            .candidates_found
            .fetch_add(instruments.len() as u64, Ordering::Relaxed);
        self.counters.last_scan_ms.store(elapsed, Ordering::Relaxed);

        info!(
            universe = snapshot.len(),
            candidates = instruments.len(),
            from_cache = source.is_none(),
            elapsed_ms = elapsed,
            "market scan finished"
        );

        Ok(ScanReport {
            from_cache: source.is_none(),
            stale,
            instruments,
            source,
            elapsed_ms: elapsed,
        })
    }

    pub fn metrics(&self) -> ScannerMetrics {
        ScannerMetrics {
            total_scans: self.counters.total_scans.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            stale_scans: self.counters.stale_scans.load(Ordering::Relaxed),
            candidates_found: self.counters.candidates_found.load(Ordering::Relaxed),
            last_scan_ms: self.counters.last_scan_ms.load(Ordering::Relaxed),
        }
    }
}

/// Dedupe (first occurrence wins), filter, rank and truncate.
pub fn select_candidates(snapshot: &[Instrument], filter: &ScanFilter) -> Vec<Instrument> {
    let mut seen = HashSet::new();
    let mut candidates = snapshot
        .iter()
        .filter(|instrument| seen.insert(instrument.symbol.clone()))
        .filter(|instrument| filter.admits(instrument))
        .cloned()
        .collect::<Vec<_>>();

    candidates.sort_by(|left, right| {
        filter
            .rank_by
            .score(right)
            .partial_cmp(&filter.rank_by.score(left))
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| left.symbol.cmp(&right.symbol))
    });
    candidates.truncate(filter.max_candidates);
    candidates
}
