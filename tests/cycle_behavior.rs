//! Behaviour tests for full pipeline cycles: fault isolation, single-flight,
//! idempotent decisions, draining, event ordering and scheduling.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use scoutgate_core::events::{EventPayload, Topic};
use scoutgate_core::health::AlertKind;
use scoutgate_core::orchestrator::{CycleState, Orchestrator, OrchestratorConfig, OutcomeStatus};
use scoutgate_core::retry::RetryConfig;
use scoutgate_core::scheduler::{ManualTicks, Scheduler, SchedulerConfig};
use scoutgate_core::{EscalationPath, PipelineError, Signal, Stage, Symbol};

use common::{source, symbol, HarnessBuilder, ScriptedEnricher, StalledSource};

fn symbols(raw: &[&str]) -> Vec<Symbol> {
    raw.iter().map(|value| symbol(value)).collect()
}

/// Every candidate escalates through directional conviction.
fn confident() -> ScriptedEnricher {
    ScriptedEnricher::new().otherwise(Signal::Long, 0.85, 1.2)
}

/// Record every event topic seen by one subscription, in delivery order.
fn record_topics(orchestrator: &Orchestrator, topics: &[Topic]) -> Arc<Mutex<Vec<Topic>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    orchestrator.bus().subscribe_fn(topics, "recorder", move |event| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().expect("recorder lock").push(event.topic());
            Ok::<(), String>(())
        }
    });
    seen
}

async fn settle(orchestrator: &Orchestrator) {
    assert!(orchestrator.bus().wait_idle(Duration::from_secs(2)).await);
}

// =============================================================================
// Cycle: Fault Isolation
// =============================================================================

#[tokio::test]
async fn when_one_instrument_fails_to_fetch_the_others_still_reach_a_decision() {
    // Given: Both providers refuse ETHUSDT and every analysis escalates
    let eth = symbol("ETHUSDT");
    let harness = HarnessBuilder::new()
        .with_sources(vec![
            source("sim-a").with_outage(eth.clone()),
            source("sim-b").with_outage(eth.clone()),
        ])
        .with_enricher(confident())
        .build();
    let failures = record_topics(&harness.orchestrator, &[Topic::StageFailed]);

    // When: A cycle runs over three instruments
    let report = harness
        .orchestrator
        .trigger_manual_cycle(Some(symbols(&["BTCUSDT", "ETHUSDT", "SOLUSDT"])))
        .await
        .expect("cycle runs");
    settle(&harness.orchestrator).await;

    // Then: Exactly one failure is reported, for ETHUSDT at fetch
    assert_eq!(report.state, CycleState::Completed);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].stage, Stage::Fetch);
    assert_eq!(report.failures[0].instrument.as_ref(), Some(&eth));
    assert_eq!(failures.lock().expect("recorder lock").len(), 1);

    // And: The other two are decided and persisted
    assert_eq!(report.decisions, 2);
    for raw in ["BTCUSDT", "SOLUSDT"] {
        let outcome = report.outcome(&symbol(raw)).expect("outcome present");
        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert_eq!(outcome.stage_reached, Stage::Persist);
        assert_eq!(outcome.path, Some(EscalationPath::A));
        assert!(harness
            .persistence
            .decision_for(&symbol(raw), report.cycle_id)
            .is_some());
    }
    let eth_outcome = report.outcome(&eth).expect("outcome present");
    assert_eq!(eth_outcome.status, OutcomeStatus::Failed);
}

#[tokio::test]
async fn when_every_provider_is_down_the_cycle_fails_in_the_scanner() {
    // Given: Both providers are down
    let harness = HarnessBuilder::new().build();
    for source in &harness.sources {
        source.set_down(true);
    }

    // When: A scheduled cycle runs
    let report = harness.orchestrator.run_cycle().await.expect("cycle runs");

    // Then: The report names the scanner and nothing was analysed
    assert!(report.is_failed());
    assert!(matches!(
        &report.state,
        CycleState::Failed { component, .. } if component == "scanner"
    ));
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].stage, Stage::Scan);
    assert_eq!(report.candidates, 0);
    assert_eq!(harness.orchestrator.metrics().failed_cycles, 1);
}

// =============================================================================
// Cycle: Single Flight
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn when_a_cycle_is_running_a_second_trigger_is_rejected() {
    // Given: Slow providers and one cycle already in flight
    let harness = HarnessBuilder::new()
        .with_sources(vec![
            source("sim-a").with_latency(Duration::from_millis(300)),
            source("sim-b").with_latency(Duration::from_millis(300)),
        ])
        .build();
    let running = harness.orchestrator.clone();
    let first = tokio::spawn(async move {
        running
            .trigger_manual_cycle(Some(vec![symbol("BTCUSDT")]))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // When: Another cycle is triggered
    let second = harness.orchestrator.run_cycle().await;

    // Then: It is rejected with the running cycle's id
    let Err(PipelineError::CycleAlreadyRunning { cycle_id }) = second else {
        panic!("expected CycleAlreadyRunning, got {second:?}");
    };
    let first = first.await.expect("task finished").expect("first cycle runs");
    assert_eq!(cycle_id, first.cycle_id);
    assert_eq!(harness.orchestrator.metrics().rejected_cycles, 1);
    assert!(!harness.orchestrator.is_running());

    // And: Once the first finishes a new cycle is accepted
    assert!(harness
        .orchestrator
        .trigger_manual_cycle(Some(vec![symbol("BTCUSDT")]))
        .await
        .is_ok());
}

// =============================================================================
// Cycle: Idempotent Decisions
// =============================================================================

#[tokio::test]
async fn when_the_same_instruments_escalate_twice_within_the_window_only_one_decision_is_made() {
    // Given: Two instruments that always escalate
    let harness = HarnessBuilder::new().with_enricher(confident()).build();
    let targets = symbols(&["BTCUSDT", "ETHUSDT"]);

    // When: Two cycles run back to back
    let first = harness
        .orchestrator
        .trigger_manual_cycle(Some(targets.clone()))
        .await
        .expect("cycle runs");
    let second = harness
        .orchestrator
        .trigger_manual_cycle(Some(targets.clone()))
        .await
        .expect("cycle runs");

    // Then: The second cycle skips both as duplicates
    assert_eq!(first.decisions, 2);
    assert_eq!(second.decisions, 0);
    assert_eq!(second.deduplicated, 2);
    for target in &targets {
        let outcome = second.outcome(target).expect("outcome present");
        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert_eq!(outcome.stage_reached, Stage::Reserve);
        assert_eq!(outcome.detail.as_deref(), Some("deduplicated"));
    }
    assert_eq!(harness.persistence.decisions().len(), 2);
}

#[tokio::test]
async fn when_the_window_has_passed_the_instrument_is_decided_again() {
    // Given: One decided instrument
    let harness = HarnessBuilder::new().with_enricher(confident()).build();
    let targets = symbols(&["SOLUSDT"]);
    harness
        .orchestrator
        .trigger_manual_cycle(Some(targets.clone()))
        .await
        .expect("cycle runs");

    // When: The dedup window elapses and it escalates again
    harness.clock.advance(Duration::from_secs(4 * 3_600));
    let later = harness
        .orchestrator
        .trigger_manual_cycle(Some(targets))
        .await
        .expect("cycle runs");

    // Then: A second decision is recorded
    assert_eq!(later.decisions, 1);
    assert_eq!(harness.persistence.decisions().len(), 2);
}

#[tokio::test]
async fn when_the_gate_rejects_an_instrument_no_reservation_is_taken() {
    // Given: One instrument that escalates and one that does not
    let enricher = ScriptedEnricher::new()
        .with("BTCUSDT", Signal::Short, 0.97, 0.5)
        .with("ETHUSDT", Signal::Hold, 0.5, 1.0);
    let harness = HarnessBuilder::new().with_enricher(enricher).build();

    // When: A cycle runs over both
    let report = harness
        .orchestrator
        .trigger_manual_cycle(Some(symbols(&["BTCUSDT", "ETHUSDT"])))
        .await
        .expect("cycle runs");

    // Then: Only the escalated instrument holds a reservation
    assert_eq!(report.escalated, 1);
    assert_eq!(
        report.outcome(&symbol("BTCUSDT")).and_then(|outcome| outcome.path),
        Some(EscalationPath::C)
    );
    let rejected = report.outcome(&symbol("ETHUSDT")).expect("outcome present");
    assert_eq!(rejected.stage_reached, Stage::Gate);
    assert_eq!(rejected.path, None);
    let active = harness.orchestrator.dedup().active_reservations().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].instrument, symbol("BTCUSDT"));
}

// =============================================================================
// Cycle: Drain
// =============================================================================

#[tokio::test]
async fn when_drain_is_requested_no_new_workers_start_until_resumed() {
    // Given: A drained orchestrator
    let harness = HarnessBuilder::new().with_enricher(confident()).build();
    let targets = symbols(&["BTCUSDT", "ETHUSDT"]);
    harness.orchestrator.request_drain();

    // When: A cycle runs
    let drained = harness
        .orchestrator
        .trigger_manual_cycle(Some(targets.clone()))
        .await
        .expect("cycle runs");

    // Then: Every instrument is skipped and nothing is decided
    assert_eq!(drained.skipped, 2);
    assert_eq!(drained.decisions, 0);
    assert!(drained
        .outcomes
        .iter()
        .all(|outcome| outcome.detail.as_deref() == Some("drained")));
    assert!(harness.persistence.decisions().is_empty());

    // When: The orchestrator resumes
    harness.orchestrator.resume();
    let resumed = harness
        .orchestrator
        .trigger_manual_cycle(Some(targets))
        .await
        .expect("cycle runs");

    // Then: Work flows again
    assert!(!harness.orchestrator.is_draining());
    assert_eq!(resumed.decisions, 2);
}

// =============================================================================
// Cycle: Events
// =============================================================================

#[tokio::test]
async fn when_one_instrument_is_decided_events_arrive_in_pipeline_order() {
    // Given: A subscriber on every topic
    let harness = HarnessBuilder::new().with_enricher(confident()).build();
    let seen = record_topics(&harness.orchestrator, &Topic::ALL);

    // When: One instrument goes through the whole pipeline
    harness
        .orchestrator
        .trigger_manual_cycle(Some(vec![symbol("BTCUSDT")]))
        .await
        .expect("cycle runs");
    settle(&harness.orchestrator).await;

    // Then: The subscriber saw the stages in order
    assert_eq!(
        *seen.lock().expect("recorder lock"),
        vec![
            Topic::OpportunitiesFound,
            Topic::AnalysisCompleted,
            Topic::Escalated,
            Topic::DecisionMade,
            Topic::CycleCompleted,
        ]
    );
}

#[tokio::test]
async fn when_a_subscriber_fails_other_subscribers_and_the_cycle_are_unaffected() {
    // Given: One failing and one recording subscriber
    let harness = HarnessBuilder::new().with_enricher(confident()).build();
    harness
        .orchestrator
        .bus()
        .subscribe_fn(&[Topic::DecisionMade], "broken", |_event| async {
            Err::<(), String>(String::from("downstream unavailable"))
        });
    let seen = record_topics(&harness.orchestrator, &[Topic::DecisionMade]);

    // When: A cycle decides two instruments
    let report = harness
        .orchestrator
        .trigger_manual_cycle(Some(symbols(&["BTCUSDT", "ETHUSDT"])))
        .await
        .expect("cycle runs");
    settle(&harness.orchestrator).await;

    // Then: The cycle is unaffected and the healthy subscriber saw both decisions
    assert_eq!(report.decisions, 2);
    assert_eq!(seen.lock().expect("recorder lock").len(), 2);
    assert_eq!(harness.orchestrator.bus().stats().failed, 2);
}

#[tokio::test]
async fn when_an_instrument_is_invalidated_the_bus_announces_it() {
    // Given: A decided instrument with cached data
    let harness = HarnessBuilder::new().with_enricher(confident()).build();
    let btc = symbol("BTCUSDT");
    harness
        .orchestrator
        .trigger_manual_cycle(Some(vec![btc.clone()]))
        .await
        .expect("cycle runs");

    // When: Its cache entries are invalidated
    let removed = harness.orchestrator.invalidate_instrument(&btc).await;

    // Then: The event reports how many entries went away
    assert!(removed > 0);
    let last = harness.orchestrator.bus().recent_events(1);
    match &last[0].payload {
        EventPayload::CacheInvalidated {
            instrument,
            removed: announced,
        } => {
            assert_eq!(instrument, &btc);
            assert_eq!(*announced, removed);
        }
        other => panic!("expected CacheInvalidated, got {other:?}"),
    }
}

// =============================================================================
// Cycle: Timeouts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_a_provider_never_answers_the_worker_times_out_with_one_failure() {
    // Given: A single provider that never answers and a five-second worker timeout
    let harness = HarnessBuilder::new()
        .with_sources(Vec::new())
        .with_leading_provider(Arc::new(StalledSource::new("sim-stalled")))
        .with_enricher(confident())
        .build();
    let failures = record_topics(&harness.orchestrator, &[Topic::StageFailed]);
    let started = tokio::time::Instant::now();

    // When: A cycle runs over one instrument
    let report = harness
        .orchestrator
        .trigger_manual_cycle(Some(symbols(&["BTCUSDT"])))
        .await
        .expect("cycle runs");
    settle(&harness.orchestrator).await;

    // Then: The worker is cut off at its timeout and the failure is published once
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(report.state, CycleState::Completed);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].message.contains("timed out"));
    assert_eq!(failures.lock().expect("recorder lock").len(), 1);
    let outcome = report.outcome(&symbol("BTCUSDT")).expect("outcome present");
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(report.decisions, 0);
}

#[tokio::test(start_paused = true)]
async fn when_the_reservation_store_stalls_the_decide_worker_times_out_at_reserve() {
    // Given: A store that takes a minute per call and a five-second worker timeout
    let harness = HarnessBuilder::new().with_enricher(confident()).build();
    harness.persistence.set_latency(Duration::from_secs(60));
    let failures = record_topics(&harness.orchestrator, &[Topic::StageFailed]);
    let started = tokio::time::Instant::now();

    // When: An escalated instrument reaches the reservation step
    let report = harness
        .orchestrator
        .trigger_manual_cycle(Some(symbols(&["BTCUSDT"])))
        .await
        .expect("cycle runs");
    settle(&harness.orchestrator).await;

    // Then: The worker gives up at the reservation, well before the store answers
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].stage, Stage::Reserve);
    assert_eq!(failures.lock().expect("recorder lock").len(), 1);
    let outcome = report.outcome(&symbol("BTCUSDT")).expect("outcome present");
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.stage_reached, Stage::Reserve);
}

// =============================================================================
// Cycle: Persistence Outages
// =============================================================================

#[tokio::test]
async fn when_health_is_checked_after_the_window_expired_reservations_are_purged() {
    // Given: Two decided instruments holding reservations
    let harness = HarnessBuilder::new().with_enricher(confident()).build();
    let report = harness
        .orchestrator
        .trigger_manual_cycle(Some(symbols(&["BTCUSDT", "ETHUSDT"])))
        .await
        .expect("cycle runs");
    assert_eq!(report.decisions, 2);

    // When: The dedup window passes and the periodic health check runs
    harness.clock.advance(Duration::from_secs(4 * 3_600));
    harness.orchestrator.check_health().await;

    // Then: Both reservations were deleted
    let dedup = harness.orchestrator.dedup();
    assert_eq!(dedup.stats().purged, 2);
    assert!(dedup.active_reservations().await.is_empty());
}

#[tokio::test]
async fn when_the_store_stays_down_the_decision_fails_and_health_reports_degraded_dedup() {
    // Given: A store that is unavailable for the whole cycle
    let harness = HarnessBuilder::new().with_enricher(confident()).build();
    harness.persistence.set_available(false);
    let failures = record_topics(&harness.orchestrator, &[Topic::StageFailed]);

    // When: A cycle escalates one instrument
    let report = harness
        .orchestrator
        .trigger_manual_cycle(Some(vec![symbol("BTCUSDT")]))
        .await
        .expect("cycle runs");
    settle(&harness.orchestrator).await;

    // Then: The instrument fails at persist, reported once
    let outcome = report.outcome(&symbol("BTCUSDT")).expect("outcome present");
    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.stage_reached, Stage::Persist);
    assert_eq!(failures.lock().expect("recorder lock").len(), 1);

    // And: The health check raises a dedup alert on the bus
    let health = harness.orchestrator.check_health().await;
    assert!(health
        .alerts
        .iter()
        .any(|alert| alert.kind == AlertKind::DedupDegraded));
    settle(&harness.orchestrator).await;
    assert!(harness
        .orchestrator
        .bus()
        .recent_events(10)
        .iter()
        .any(|event| event.topic() == Topic::PerformanceAlert));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn when_the_store_recovers_during_retries_the_decision_is_persisted() {
    // Given: A store that is down when the cycle starts and retries spaced out
    let harness = HarnessBuilder::new()
        .with_enricher(confident())
        .with_config(OrchestratorConfig {
            pool_size: 2,
            worker_timeout: Duration::from_secs(5),
            retry: RetryConfig::fixed(Duration::from_millis(150), 3),
            ..OrchestratorConfig::default()
        })
        .build();
    harness.persistence.set_available(false);
    let store = Arc::clone(&harness.persistence);
    let recovery = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        store.set_available(true);
    });

    // When: A cycle escalates one instrument
    let report = harness
        .orchestrator
        .trigger_manual_cycle(Some(vec![symbol("ETHUSDT")]))
        .await
        .expect("cycle runs");
    recovery.await.expect("recovery task finished");

    // Then: A retry persisted the decision
    assert_eq!(report.decisions, 1);
    assert!(report.failures.is_empty());
    assert!(harness
        .persistence
        .decision_for(&symbol("ETHUSDT"), report.cycle_id)
        .is_some());
}

// =============================================================================
// Scheduler
// =============================================================================

#[tokio::test]
async fn when_manual_ticks_are_sent_the_scheduler_runs_one_cycle_per_tick() {
    // Given: A scheduler driven by manual ticks
    let harness = HarnessBuilder::new().build();
    let (ticks, source) = ManualTicks::channel();
    let handle = Scheduler::spawn(harness.orchestrator.clone(), source, SchedulerConfig::default());

    // When: Two ticks are sent and the tick source is closed
    assert!(ticks.tick().await);
    assert!(ticks.tick().await);
    drop(ticks);
    let summary = handle.join().await;

    // Then: Exactly two cycles ran
    assert_eq!(summary.cycles_run, 2);
    assert_eq!(summary.cycles_rejected, 0);
    assert_eq!(harness.orchestrator.metrics().total_cycles, 2);
}
