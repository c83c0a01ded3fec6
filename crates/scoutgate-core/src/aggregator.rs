//! Multi-provider fetch with fallback, cross-validation, and caching.
//!
//! Providers are kept in preference order and queried in waves of
//! `fan_out` concurrent calls. The first wave that yields at least one
//! acceptable result ends the fetch; its results are cross-validated and the
//! best-supported series is cached in the series tier.
//!
//! ```text
//! fetch_series ──► cache (fresh?) ──► in-flight lock ──► cache re-check
//!                                                          │
//!                    wave 1: [p0, p1]  ── join_all ──► accepted? ──► cross_validate ──► cache
//!                    wave 2: [p2, p3]  ◄── none accepted
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CachePayload, CacheTier, SmartCache};
use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
use crate::config::duration_secs;
use crate::data_source::{MarketDataSource, SeriesRequest, SnapshotRequest, SourceError, SourceErrorKind};
use crate::error::ProviderAttempt;
use crate::provider_policy::ProviderPolicy;
use crate::throttling::{BudgetSnapshot, RequestBudget};
use crate::validation::{cross_validate, Candidate};
use crate::{
    Instrument, OhlcvPoint, PipelineError, Provenance, ProviderId, Series, Symbol, Timeframe,
    UtcDateTime, ValidationError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Providers queried concurrently per wave.
    pub fan_out: usize,
    #[serde(rename = "provider_timeout_secs", with = "duration_secs")]
    pub provider_timeout: Duration,
    pub min_points: usize,
    /// Largest mean relative close difference still counted as agreement.
    pub max_deviation: f64,
    pub since_days: u32,
    pub timeframe: Timeframe,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            fan_out: 2,
            provider_timeout: Duration::from_secs(10),
            min_points: 20,
            max_deviation: 0.02,
            since_days: 30,
            timeframe: Timeframe::FourHours,
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.fan_out == 0 {
            return Err(ValidationError::ZeroConfigValue {
                field: "aggregator.fan_out",
            });
        }
        if self.provider_timeout.is_zero() {
            return Err(ValidationError::ZeroConfigValue {
                field: "aggregator.provider_timeout_secs",
            });
        }
        if self.since_days == 0 {
            return Err(ValidationError::ZeroConfigValue {
                field: "aggregator.since_days",
            });
        }
        if !self.max_deviation.is_finite() || self.max_deviation < 0.0 {
            return Err(ValidationError::InvalidConfig {
                field: "aggregator.max_deviation",
                reason: String::from("must be a non-negative number"),
            });
        }
        Ok(())
    }
}

/// Successful sequential-fallback call.
#[derive(Debug, Clone)]
pub struct RouteSuccess<T> {
    pub data: T,
    pub selected_source: ProviderId,
    pub source_chain: Vec<ProviderId>,
    pub warnings: Vec<String>,
    pub latency_ms: u64,
}

/// Series plus whether it came from an expired cache entry.
#[derive(Debug, Clone)]
pub struct SeriesFetch {
    pub series: Arc<Series>,
    pub stale: bool,
}

/// Provider status for health reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub provider: ProviderId,
    pub circuit: BreakerSnapshot,
    pub budget: BudgetSnapshot,
}

impl ProviderHealth {
    pub fn is_open(&self) -> bool {
        self.circuit.state == CircuitState::Open
    }
}

struct ProviderSlot {
    source: Arc<dyn MarketDataSource>,
    policy: ProviderPolicy,
    breaker: CircuitBreaker,
    budget: RequestBudget,
}

impl ProviderSlot {
    fn id(&self) -> ProviderId {
        self.source.id()
    }

    /// Only transport-level failures count against the circuit.
    fn record(&self, result: &Result<Vec<OhlcvPoint>, SourceError>) {
        match result {
            Ok(_) => self.breaker.record_success(),
            Err(error) if error.kind() == SourceErrorKind::InvalidData => {}
            Err(_) => self.breaker.record_failure(),
        }
    }
}

pub fn series_key(instrument: &Symbol, timeframe: Timeframe) -> String {
    format!("series:{instrument}:{timeframe}")
}

pub fn price_key(instrument: &Symbol) -> String {
    format!("price:{instrument}")
}

/// Shared, process-wide data access layer.
pub struct MarketDataAggregator {
    providers: Vec<ProviderSlot>,
    cache: SmartCache<CachePayload>,
    config: AggregatorConfig,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MarketDataAggregator {
    pub fn new(config: AggregatorConfig, cache: SmartCache<CachePayload>) -> Self {
        Self {
            providers: Vec::new(),
            cache,
            config,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Append a provider with default limits. Call order is preference order.
    pub fn with_provider(self, source: Arc<dyn MarketDataSource>) -> Self {
        let policy = ProviderPolicy::default_for(source.id());
        self.with_provider_policy(source, policy)
    }

    pub fn with_provider_policy(
        mut self,
        source: Arc<dyn MarketDataSource>,
        policy: ProviderPolicy,
    ) -> Self {
        self.providers.push(ProviderSlot {
            breaker: CircuitBreaker::new(policy.breaker),
            budget: RequestBudget::from_policy(&policy),
            source,
            policy,
        });
        self
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn cache(&self) -> &SmartCache<CachePayload> {
        &self.cache
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers.iter().map(ProviderSlot::id).collect()
    }

    /// Validated series for `instrument`, served from cache within the TTL.
    pub async fn fetch_series(
        &self,
        instrument: &Symbol,
        timeframe: Timeframe,
    ) -> Result<Arc<Series>, PipelineError> {
        let key = series_key(instrument, timeframe);
        if let Some(series) = self.fresh_series(&key).await {
            debug!(instrument = %instrument, "series cache hit");
            return Ok(series);
        }

        let gate = self.inflight_gate(&key);
        let result = {
            let _guard = gate.lock().await;
            // Another worker may have filled the cache while we waited.
            match self.fresh_series(&key).await {
                Some(series) => Ok(series),
                None => self.fetch_from_providers(instrument, timeframe, &key).await,
            }
        };
        self.release_inflight(&key, gate);
        result
    }

    /// Last cached series regardless of age.
    pub async fn stale_series(&self, instrument: &Symbol, timeframe: Timeframe) -> Option<Arc<Series>> {
        self.cache
            .get(&series_key(instrument, timeframe), CacheTier::Series)
            .await
            .any()
            .and_then(CachePayload::into_series)
    }

    /// [`fetch_series`](Self::fetch_series), falling back to a stale cache
    /// entry when every provider failed and `allow_stale` is set.
    pub async fn fetch_series_or_stale(
        &self,
        instrument: &Symbol,
        timeframe: Timeframe,
        allow_stale: bool,
    ) -> Result<SeriesFetch, PipelineError> {
        match self.fetch_series(instrument, timeframe).await {
            Ok(series) => Ok(SeriesFetch {
                series,
                stale: false,
            }),
            Err(error @ PipelineError::AllSourcesFailed { .. }) if allow_stale => {
                match self.stale_series(instrument, timeframe).await {
                    Some(series) => {
                        warn!(
                            instrument = %instrument,
                            error = %error,
                            "all providers failed, serving stale series"
                        );
                        Ok(SeriesFetch {
                            series,
                            stale: true,
                        })
                    }
                    None => Err(error),
                }
            }
            Err(error) => Err(error),
        }
    }

    /// Market snapshot from the first provider that answers, in preference order.
    pub async fn fetch_snapshot(
        &self,
        request: SnapshotRequest,
    ) -> Result<RouteSuccess<Vec<Instrument>>, PipelineError> {
        let started = Instant::now();
        let mut source_chain = Vec::with_capacity(self.providers.len());
        let mut attempts = Vec::new();

        for slot in &self.providers {
            let provider = slot.id();
            source_chain.push(provider.clone());
            if !slot.breaker.allow_request() {
                attempts.push(ProviderAttempt::new(
                    provider,
                    &SourceError::unavailable("circuit open"),
                ));
                continue;
            }

            let timeout = self.timeout_for(slot);
            let call = async {
                slot.budget.acquire().await;
                slot.source.fetch_snapshot(request.clone()).await
            };
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(timeout_error(timeout)),
            };

            match result {
                Ok(data) => {
                    slot.breaker.record_success();
                    let mut warnings = Vec::new();
                    if !attempts.is_empty() {
                        warnings.push(format!(
                            "snapshot fallback succeeded with '{}' after {} failed attempt(s)",
                            provider,
                            attempts.len()
                        ));
                    }
                    return Ok(RouteSuccess {
                        data,
                        selected_source: provider,
                        source_chain,
                        warnings,
                        latency_ms: elapsed_ms(started),
                    });
                }
                Err(error) => {
                    if error.kind() != SourceErrorKind::InvalidData {
                        slot.breaker.record_failure();
                    }
                    warn!(provider = %provider, error = %error, "snapshot provider failed");
                    attempts.push(ProviderAttempt::new(provider, &error));
                }
            }
        }

        Err(PipelineError::AllSourcesFailed {
            scope: String::from("market snapshot"),
            attempts,
        })
    }

    /// Latest traded price, served from the price tier when fresh.
    pub async fn latest_price(&self, instrument: &Symbol) -> Result<f64, PipelineError> {
        let key = price_key(instrument);
        if let Some(price) = self
            .cache
            .get(&key, CacheTier::Price)
            .await
            .fresh()
            .and_then(|payload| payload.as_price())
        {
            return Ok(price);
        }

        let routed = self
            .fetch_snapshot(SnapshotRequest::only(vec![instrument.clone()]))
            .await?;
        let price = routed
            .data
            .iter()
            .find(|candidate| &candidate.symbol == instrument)
            .map(|candidate| candidate.stats.price)
            .ok_or_else(|| {
                PipelineError::from(SourceError::invalid_data(format!(
                    "'{}' returned no price for {instrument}",
                    routed.selected_source
                )))
            })?;

        self.cache.put(key, CacheTier::Price, CachePayload::Price(price)).await;
        Ok(price)
    }

    /// Drop every cached series and price of `instrument`.
    pub async fn invalidate_instrument(&self, instrument: &Symbol) -> usize {
        let prefix = format!("series:{instrument}:");
        let mut removed = self.cache.invalidate_prefix(CacheTier::Series, &prefix).await;
        if self.cache.invalidate(&price_key(instrument)).await {
            removed += 1;
        }
        removed
    }

    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.providers
            .iter()
            .map(|slot| ProviderHealth {
                provider: slot.id(),
                circuit: slot.breaker.snapshot(),
                budget: slot.budget.snapshot(),
            })
            .collect()
    }

    async fn fresh_series(&self, key: &str) -> Option<Arc<Series>> {
        self.cache
            .get(key, CacheTier::Series)
            .await
            .fresh()
            .and_then(CachePayload::into_series)
    }

    async fn fetch_from_providers(
        &self,
        instrument: &Symbol,
        timeframe: Timeframe,
        key: &str,
    ) -> Result<Arc<Series>, PipelineError> {
        let request = SeriesRequest::new(instrument.clone(), timeframe, self.config.since_days)
            .map_err(SourceError::from)?;
        let fan_out = self.config.fan_out.max(1);
        let mut attempts = Vec::new();
        let mut accepted = Vec::new();

        for (wave, slots) in self.providers.chunks(fan_out).enumerate() {
            let mut calls = Vec::with_capacity(slots.len());
            for (offset, slot) in slots.iter().enumerate() {
                if !slot.breaker.allow_request() {
                    attempts.push(ProviderAttempt::new(
                        slot.id(),
                        &SourceError::unavailable("circuit open"),
                    ));
                    continue;
                }
                let preference = wave * fan_out + offset;
                calls.push(self.call_series(slot, preference, request.clone()));
            }

            for (slot, preference, result) in join_all(calls).await {
                slot.record(&result);
                match result {
                    Ok(points) => accepted.push(Candidate {
                        provider: slot.id(),
                        preference,
                        reliability: slot.policy.reliability,
                        points,
                    }),
                    Err(error) => {
                        warn!(
                            instrument = %instrument,
                            provider = %slot.id(),
                            error = %error,
                            "series provider failed"
                        );
                        attempts.push(ProviderAttempt::new(slot.id(), &error));
                    }
                }
            }

            if !accepted.is_empty() {
                break;
            }
        }

        let Some(outcome) = cross_validate(&accepted, self.config.max_deviation) else {
            return Err(PipelineError::AllSourcesFailed {
                scope: format!("series {instrument} {timeframe}"),
                attempts,
            });
        };

        if outcome.has_disagreement() {
            warn!(
                instrument = %instrument,
                disputed_by = ?outcome.disputed_by.iter().map(ProviderId::as_str).collect::<Vec<_>>(),
                confidence = outcome.confidence,
                "providers disagree on series"
            );
        }

        let selected = accepted.swap_remove(outcome.selected);
        let series = Arc::new(Series {
            instrument: instrument.clone(),
            timeframe,
            points: selected.points,
            provenance: Provenance {
                source: selected.provider,
                fetched_at: UtcDateTime::now(),
                confirmed_by: outcome.confirmed_by,
                disputed_by: outcome.disputed_by,
            },
            validation_confidence: outcome.confidence,
        });

        if let Some(close) = series.last_close() {
            self.cache
                .put(price_key(instrument), CacheTier::Price, CachePayload::Price(close))
                .await;
        }
        self.cache
            .put(key, CacheTier::Series, CachePayload::Series(Arc::clone(&series)))
            .await;
        Ok(series)
    }

    async fn call_series<'a>(
        &'a self,
        slot: &'a ProviderSlot,
        preference: usize,
        request: SeriesRequest,
    ) -> (&'a ProviderSlot, usize, Result<Vec<OhlcvPoint>, SourceError>) {
        let timeout = self.timeout_for(slot);
        let call = async {
            slot.budget.acquire().await;
            slot.source.fetch_series(request).await
        };
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result.and_then(|points| self.accept_points(points)),
            Err(_) => Err(timeout_error(timeout)),
        };
        (slot, preference, result)
    }

    fn accept_points(&self, mut points: Vec<OhlcvPoint>) -> Result<Vec<OhlcvPoint>, SourceError> {
        if points.len() < self.config.min_points {
            return Err(SourceError::invalid_data(format!(
                "{} point(s), need at least {}",
                points.len(),
                self.config.min_points
            )));
        }
        for point in &points {
            point.validate()?;
        }
        points.sort_by_key(|point| point.ts);
        Ok(points)
    }

    fn timeout_for(&self, slot: &ProviderSlot) -> Duration {
        slot.policy
            .request_timeout
            .unwrap_or(self.config.provider_timeout)
    }

    fn inflight_gate(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self
            .inflight
            .lock()
            .expect("inflight lock is not poisoned");
        Arc::clone(inflight.entry(key.to_owned()).or_default())
    }

    fn release_inflight(&self, key: &str, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = self
            .inflight
            .lock()
            .expect("inflight lock is not poisoned");
        // The map and `gate` are the last two holders.
        if Arc::strong_count(&gate) == 2 {
            inflight.remove(key);
        }
    }
}

fn timeout_error(timeout: Duration) -> SourceError {
    SourceError::timeout(format!("no answer within {} ms", timeout.as_millis()))
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::simulated::SimulatedSource;

    fn symbol(value: &str) -> Symbol {
        Symbol::parse(value).expect("valid symbol")
    }

    fn source(name: &str) -> SimulatedSource {
        SimulatedSource::new(ProviderId::parse(name).expect("valid provider"))
    }

    fn aggregator(sources: Vec<SimulatedSource>) -> MarketDataAggregator {
        let config = AggregatorConfig {
            min_points: 10,
            since_days: 5,
            ..AggregatorConfig::default()
        };
        sources.into_iter().fold(
            MarketDataAggregator::new(config, SmartCache::new(CacheConfig::default())),
            |aggregator, source| aggregator.with_provider(Arc::new(source)),
        )
    }

    #[tokio::test]
    async fn second_fetch_is_served_from_cache() {
        let source = source("alpha");
        let aggregator = aggregator(vec![source.clone()]);
        let btc = symbol("BTCUSDT");

        let first = aggregator
            .fetch_series(&btc, Timeframe::FourHours)
            .await
            .expect("series");
        let second = aggregator
            .fetch_series(&btc, Timeframe::FourHours)
            .await
            .expect("series");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.series_calls(), 1);
        assert_eq!(aggregator.latest_price(&btc).await.ok(), first.last_close());
    }

    #[tokio::test]
    async fn short_series_is_rejected_as_invalid_data() {
        let source = source("alpha").with_points(3);
        let aggregator = aggregator(vec![source]);

        let error = aggregator
            .fetch_series(&symbol("ETHUSDT"), Timeframe::OneHour)
            .await
            .expect_err("too few points");

        let PipelineError::AllSourcesFailed { attempts, .. } = error else {
            panic!("expected AllSourcesFailed");
        };
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].code, "provider.invalid_data");
    }

    #[tokio::test]
    async fn invalidate_instrument_drops_series_and_price() {
        let aggregator = aggregator(vec![source("alpha")]);
        let sol = symbol("SOLUSDT");
        aggregator
            .fetch_series(&sol, Timeframe::OneDay)
            .await
            .expect("series");

        assert_eq!(aggregator.invalidate_instrument(&sol).await, 2);
        assert!(aggregator.stale_series(&sol, Timeframe::OneDay).await.is_none());
    }

    #[test]
    fn config_rejects_zero_fan_out() {
        let config = AggregatorConfig {
            fan_out: 0,
            ..AggregatorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
