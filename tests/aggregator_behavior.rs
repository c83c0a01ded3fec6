//! Behaviour tests for the multi-source aggregator and the market scanner.

mod common;

use std::sync::Arc;
use std::time::Duration;

use scoutgate_core::aggregator::{AggregatorConfig, MarketDataAggregator};
use scoutgate_core::cache::{CacheConfig, SmartCache, TierPolicy};
use scoutgate_core::scanner::{MarketScanner, ScanFilter};
use scoutgate_core::simulated::SimulatedSource;
use scoutgate_core::validation::SINGLE_SOURCE_CONFIDENCE;
use scoutgate_core::{PipelineError, Timeframe};

use common::{source, symbol, StalledSource};

fn aggregator_with(
    sources: &[SimulatedSource],
    config: AggregatorConfig,
    cache: CacheConfig,
) -> Arc<MarketDataAggregator> {
    let aggregator = sources.iter().fold(
        MarketDataAggregator::new(config, SmartCache::new(cache)),
        |aggregator, source| aggregator.with_provider(Arc::new(source.clone())),
    );
    Arc::new(aggregator)
}

fn aggregator(sources: &[SimulatedSource]) -> Arc<MarketDataAggregator> {
    aggregator_with(sources, AggregatorConfig::default(), CacheConfig::default())
}

fn open_filter() -> ScanFilter {
    ScanFilter {
        min_market_cap: 0.0,
        min_volume_24h: 0.0,
        min_abs_change_pct: 0.0,
        ..ScanFilter::default()
    }
}

// =============================================================================
// Aggregator: Fallback
// =============================================================================

#[tokio::test]
async fn when_one_provider_fails_aggregator_serves_the_other() {
    // Given: Two providers, the first one down
    let alpha = source("sim-a");
    let beta = source("sim-b");
    alpha.set_down(true);
    let aggregator = aggregator(&[alpha, beta]);

    // When: A series is requested
    let series = aggregator
        .fetch_series(&symbol("BTCUSDT"), Timeframe::FourHours)
        .await
        .expect("one provider is enough");

    // Then: It comes from the healthy provider with single-source confidence
    assert_eq!(series.provenance.source.as_str(), "sim-b");
    assert_eq!(series.validation_confidence, SINGLE_SOURCE_CONFIDENCE);
    assert!(series.provenance.confirmed_by.is_empty());
}

#[tokio::test]
async fn when_every_provider_fails_aggregator_reports_all_attempts() {
    // Given: Two providers that both refuse the instrument
    let target = symbol("ETHUSDT");
    let aggregator = aggregator(&[
        source("sim-a").with_outage(target.clone()),
        source("sim-b").with_outage(target.clone()),
    ]);

    // When: The series is requested
    let error = aggregator
        .fetch_series(&target, Timeframe::FourHours)
        .await
        .expect_err("nobody serves it");

    // Then: The error lists one attempt per provider
    let PipelineError::AllSourcesFailed { attempts, .. } = error else {
        panic!("expected AllSourcesFailed, got {error:?}");
    };
    let providers = attempts
        .iter()
        .map(|attempt| attempt.provider.as_str())
        .collect::<Vec<_>>();
    assert_eq!(providers, vec!["sim-a", "sim-b"]);
}

#[tokio::test]
async fn when_first_wave_fails_aggregator_tries_the_next_wave() {
    // Given: One provider per wave and the first one down
    let first = source("sim-a");
    let second = source("sim-b");
    first.set_down(true);
    let config = AggregatorConfig {
        fan_out: 1,
        ..AggregatorConfig::default()
    };
    let aggregator = aggregator_with(&[first.clone(), second.clone()], config, CacheConfig::default());

    // When: A series is requested
    let series = aggregator
        .fetch_series(&symbol("SOLUSDT"), Timeframe::OneHour)
        .await
        .expect("second wave answers");

    // Then: Both providers were asked, in order
    assert_eq!(series.provenance.source.as_str(), "sim-b");
    assert_eq!(first.series_calls(), 1);
    assert_eq!(second.series_calls(), 1);
}

#[tokio::test]
async fn when_first_provider_returns_too_few_points_the_next_provider_serves() {
    // Given: A first provider with a short history and a healthy second one
    let short = source("sim-a").with_points(5);
    let full = source("sim-b");
    let config = AggregatorConfig {
        fan_out: 1,
        ..AggregatorConfig::default()
    };
    let aggregator = aggregator_with(&[short.clone(), full.clone()], config, CacheConfig::default());

    // When: A series is requested
    let series = aggregator
        .fetch_series(&symbol("AVAXUSDT"), Timeframe::FourHours)
        .await
        .expect("second provider has enough history");

    // Then: The short series is skipped and the second provider's is returned
    assert_eq!(series.provenance.source.as_str(), "sim-b");
    assert!(series.len() >= AggregatorConfig::default().min_points);
    assert_eq!(short.series_calls(), 1);
    assert_eq!(full.series_calls(), 1);

    // And: A data-quality rejection does not count against the short provider's circuit
    let health = aggregator.provider_health();
    assert!(health.iter().all(|provider| !provider.is_open()));
}

#[tokio::test(start_paused = true)]
async fn when_a_provider_never_answers_the_fetch_moves_on_after_the_provider_timeout() {
    // Given: A stalled first provider and a two-second provider timeout
    let config = AggregatorConfig {
        fan_out: 1,
        provider_timeout: Duration::from_secs(2),
        ..AggregatorConfig::default()
    };
    let aggregator = Arc::new(
        MarketDataAggregator::new(config, SmartCache::new(CacheConfig::default()))
            .with_provider(Arc::new(StalledSource::new("sim-stalled")))
            .with_provider(Arc::new(source("sim-b"))),
    );
    let started = tokio::time::Instant::now();

    // When: A series is requested
    let series = aggregator
        .fetch_series(&symbol("DOTUSDT"), Timeframe::FourHours)
        .await
        .expect("fallback provider answers");

    // Then: The second provider serves it once the timeout has elapsed
    let waited = started.elapsed();
    assert_eq!(series.provenance.source.as_str(), "sim-b");
    assert!(waited >= Duration::from_secs(2), "waited {waited:?}");
    assert!(waited < Duration::from_secs(3), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn when_the_only_provider_never_answers_the_fetch_fails_with_a_timeout() {
    // Given: A single stalled provider
    let config = AggregatorConfig {
        provider_timeout: Duration::from_secs(2),
        ..AggregatorConfig::default()
    };
    let aggregator = MarketDataAggregator::new(config, SmartCache::new(CacheConfig::default()))
        .with_provider(Arc::new(StalledSource::new("sim-stalled")));
    let started = tokio::time::Instant::now();

    // When: A series is requested
    let error = aggregator
        .fetch_series(&symbol("DOTUSDT"), Timeframe::FourHours)
        .await
        .expect_err("nobody answers");

    // Then: The attempt is recorded as a timeout after the configured limit
    assert!(started.elapsed() < Duration::from_secs(3));
    let PipelineError::AllSourcesFailed { attempts, .. } = error else {
        panic!("expected AllSourcesFailed, got {error:?}");
    };
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].code, "provider.timeout");
}

#[tokio::test]
async fn when_ticker_carries_a_multiplier_prefix_it_is_fetched_like_any_other() {
    // Given: Tickers that start with digits
    let aggregator = aggregator(&[source("sim-a"), source("sim-b")]);

    for raw in ["1INCHUSDT", "1000PEPEUSDT"] {
        // When: Their series are requested
        let series = aggregator
            .fetch_series(&symbol(raw), Timeframe::OneHour)
            .await
            .expect("series");

        // Then: They are served and keyed by the ticker as given
        assert_eq!(series.instrument.as_str(), raw);
    }
}

// =============================================================================
// Aggregator: Cross-Validation
// =============================================================================

#[tokio::test]
async fn when_providers_agree_series_is_fully_confirmed() {
    // Given: Two providers on the same market seed
    let aggregator = aggregator(&[source("sim-a"), source("sim-b")]);

    // When: A series is fetched
    let series = aggregator
        .fetch_series(&symbol("BTCUSDT"), Timeframe::FourHours)
        .await
        .expect("series");

    // Then: Confidence is full and the second provider confirms the first
    assert_eq!(series.validation_confidence, 1.0);
    assert_eq!(series.provenance.confirmed_by.len(), 1);
    assert!(series.provenance.disputed_by.is_empty());
}

#[tokio::test]
async fn when_one_provider_disagrees_majority_wins_and_confidence_drops() {
    // Given: Three providers in one wave, one quoting prices 10% higher
    let config = AggregatorConfig {
        fan_out: 3,
        ..AggregatorConfig::default()
    };
    let aggregator = aggregator_with(
        &[
            source("sim-biased").with_price_bias(1.10),
            source("sim-a"),
            source("sim-b"),
        ],
        config,
        CacheConfig::default(),
    );

    // When: A series is fetched
    let series = aggregator
        .fetch_series(&symbol("ETHUSDT"), Timeframe::FourHours)
        .await
        .expect("series");

    // Then: An agreeing provider is selected and the outlier is disputed
    assert_ne!(series.provenance.source.as_str(), "sim-biased");
    let disputed = series
        .provenance
        .disputed_by
        .iter()
        .map(|provider| provider.as_str())
        .collect::<Vec<_>>();
    assert_eq!(disputed, vec!["sim-biased"]);
    assert!((series.validation_confidence - 2.0 / 3.0).abs() < 1e-9);
}

// =============================================================================
// Aggregator: Caching
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn when_workers_request_the_same_series_concurrently_providers_are_called_once() {
    // Given: A slow provider and eight concurrent requesters
    let slow = source("sim-a").with_latency(Duration::from_millis(100));
    let aggregator = aggregator(&[slow.clone()]);

    // When: They all ask for the same series
    let tasks = (0..8)
        .map(|_| {
            let aggregator = Arc::clone(&aggregator);
            tokio::spawn(async move {
                aggregator
                    .fetch_series(&symbol("BNBUSDT"), Timeframe::OneDay)
                    .await
            })
        })
        .collect::<Vec<_>>();
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.expect("task finished").expect("series"));
    }

    // Then: One upstream call served everybody the same series
    assert_eq!(slow.series_calls(), 1);
    assert!(results.iter().all(|series| Arc::ptr_eq(series, &results[0])));
}

#[tokio::test]
async fn when_cache_entry_expires_and_providers_fail_stale_series_is_served_on_request() {
    // Given: A short series TTL and one fetched series
    let provider = source("sim-a");
    let cache = CacheConfig {
        series: TierPolicy::new(Duration::from_millis(50), 10),
        ..CacheConfig::default()
    };
    let aggregator = aggregator_with(&[provider.clone()], AggregatorConfig::default(), cache);
    let target = symbol("ADAUSDT");
    let fresh = aggregator
        .fetch_series(&target, Timeframe::FourHours)
        .await
        .expect("series");

    // When: The entry expires and the provider goes down
    tokio::time::sleep(Duration::from_millis(120)).await;
    provider.set_down(true);
    let strict = aggregator
        .fetch_series_or_stale(&target, Timeframe::FourHours, false)
        .await;
    let lenient = aggregator
        .fetch_series_or_stale(&target, Timeframe::FourHours, true)
        .await
        .expect("stale series allowed");

    // Then: Only the lenient call succeeds, flagged stale
    assert!(matches!(strict, Err(PipelineError::AllSourcesFailed { .. })));
    assert!(lenient.stale);
    assert!(Arc::ptr_eq(&lenient.series, &fresh));
}

#[tokio::test]
async fn when_instrument_is_invalidated_next_fetch_goes_upstream() {
    // Given: A cached series
    let provider = source("sim-a");
    let aggregator = aggregator(&[provider.clone()]);
    let target = symbol("LINKUSDT");
    aggregator
        .fetch_series(&target, Timeframe::FourHours)
        .await
        .expect("series");

    // When: The instrument is invalidated and fetched again
    aggregator.invalidate_instrument(&target).await;
    aggregator
        .fetch_series(&target, Timeframe::FourHours)
        .await
        .expect("series");

    // Then: The provider was called twice
    assert_eq!(provider.series_calls(), 2);
}

// =============================================================================
// Scanner
// =============================================================================

#[tokio::test]
async fn when_market_is_scanned_twice_second_scan_uses_cached_snapshot() {
    // Given: A scanner over one provider
    let provider = source("sim-a");
    let scanner = MarketScanner::new(aggregator(&[provider.clone()]));
    let filter = open_filter();

    // When: It scans twice in a row
    let first = scanner.scan(&filter).await.expect("scan");
    let second = scanner.scan(&filter).await.expect("scan");

    // Then: The snapshot was fetched once and the candidates match
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(provider.snapshot_calls(), 1);
    assert_eq!(first.instruments, second.instruments);
    assert_eq!(scanner.metrics().cache_hits, 1);
}

#[tokio::test]
async fn when_two_scanners_see_the_same_market_they_pick_the_same_candidates() {
    // Given: Two independent scanners over identically seeded providers
    let left = MarketScanner::new(aggregator(&[source("sim-a")]));
    let right = MarketScanner::new(aggregator(&[source("sim-b")]));
    let filter = ScanFilter {
        max_candidates: 5,
        ..open_filter()
    };

    // When: Both scan
    let left = left.scan(&filter).await.expect("scan");
    let right = right.scan(&filter).await.expect("scan");

    // Then: Candidate lists are identical and bounded
    let symbols = |report: &scoutgate_core::scanner::ScanReport| {
        report
            .instruments
            .iter()
            .map(|instrument| instrument.symbol.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(symbols(&left), symbols(&right));
    assert_eq!(left.instruments.len(), 5);
}

#[tokio::test]
async fn when_snapshot_expires_and_providers_fail_a_lenient_scanner_uses_the_stale_one() {
    // Given: A short market TTL and one completed scan
    let provider = source("sim-a");
    let cache = CacheConfig {
        market: TierPolicy::new(Duration::from_millis(50), 10),
        ..CacheConfig::default()
    };
    let aggregator = aggregator_with(&[provider.clone()], AggregatorConfig::default(), cache);
    let strict = MarketScanner::new(Arc::clone(&aggregator));
    let lenient = MarketScanner::new(Arc::clone(&aggregator)).with_allow_stale(true);
    let fresh = lenient.scan(&open_filter()).await.expect("scan");

    // When: The snapshot expires and the provider goes down
    tokio::time::sleep(Duration::from_millis(120)).await;
    provider.set_down(true);
    let strict_result = strict.scan(&open_filter()).await;
    let stale = lenient.scan(&open_filter()).await.expect("stale snapshot allowed");

    // Then: Only the lenient scanner answers, flagged stale, with the same candidates
    assert!(matches!(strict_result, Err(PipelineError::AllSourcesFailed { .. })));
    assert!(stale.stale);
    assert!(stale.from_cache);
    assert_eq!(stale.instruments, fresh.instruments);
    assert_eq!(lenient.metrics().stale_scans, 1);
}

#[tokio::test]
async fn when_every_snapshot_provider_is_down_scan_fails() {
    // Given: A scanner whose only provider is down
    let provider = source("sim-a");
    provider.set_down(true);
    let scanner = MarketScanner::new(aggregator(&[provider]));

    // When: It scans
    let result = scanner.scan(&open_filter()).await;

    // Then: The scan reports that every source failed
    assert!(matches!(result, Err(PipelineError::AllSourcesFailed { .. })));
}
