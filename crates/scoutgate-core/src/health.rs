//! Component health and alert rules.

use serde::Serialize;

use crate::aggregator::ProviderHealth;
use crate::cache::CacheStats;
use crate::dedup::DedupStats;
use crate::events::EventBusStats;
use crate::orchestrator::{CycleState, OrchestratorMetrics};
use crate::scanner::ScannerMetrics;
use crate::UtcDateTime;

/// Below this analysis success rate an alert is raised.
pub const MIN_SUCCESS_RATE: f64 = 0.80;
/// Above this handler failure rate an alert is raised.
pub const MAX_EVENT_FAILURE_RATE: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    pub component: &'static str,
    pub status: ComponentStatus,
    pub detail: String,
}

impl ComponentHealth {
    fn new(component: &'static str, status: ComponentStatus, detail: impl Into<String>) -> Self {
        Self {
            component,
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowSuccessRate,
    CircuitOpen,
    DedupDegraded,
    EventFailures,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthAlert {
    pub kind: AlertKind,
    pub component: &'static str,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

/// Raw counters gathered from every component.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: CycleState,
    pub metrics: OrchestratorMetrics,
    pub cache: CacheStats,
    pub providers: Vec<ProviderHealth>,
    pub dedup: DedupStats,
    pub events: EventBusStats,
    pub scanner: ScannerMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: ComponentStatus,
    pub checked_at: UtcDateTime,
    pub components: Vec<ComponentHealth>,
    pub alerts: Vec<HealthAlert>,
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,
}

impl HealthReport {
    pub fn assess(snapshot: HealthSnapshot, checked_at: UtcDateTime) -> Self {
        let mut components = Vec::with_capacity(6);
        let mut alerts = Vec::new();

        let metrics = &snapshot.metrics;
        let success_rate = metrics.analysis_success_rate();
        let orchestrator_status = match (&snapshot.state, success_rate) {
            (CycleState::Failed { .. }, _) => ComponentStatus::Unhealthy,
            (_, Some(rate)) if rate < MIN_SUCCESS_RATE => ComponentStatus::Degraded,
            _ => ComponentStatus::Healthy,
        };
        if let Some(rate) = success_rate.filter(|rate| *rate < MIN_SUCCESS_RATE) {
            alerts.push(HealthAlert {
                kind: AlertKind::LowSuccessRate,
                component: "orchestrator",
                message: format!(
                    "analysis success rate {:.0}% is below {:.0}%",
                    rate * 100.0,
                    MIN_SUCCESS_RATE * 100.0
                ),
                value: rate,
                threshold: MIN_SUCCESS_RATE,
            });
        }
        components.push(ComponentHealth::new(
            "orchestrator",
            orchestrator_status,
            format!(
                "state {}, {} cycle(s), {} failed",
                snapshot.state.name(),
                metrics.total_cycles,
                metrics.failed_cycles
            ),
        ));

        components.push(ComponentHealth::new(
            "cache",
            ComponentStatus::Healthy,
            format!(
                "{} entries, hit rate {:.0}%",
                snapshot.cache.size,
                snapshot.cache.hit_rate * 100.0
            ),
        ));

        let open = snapshot
            .providers
            .iter()
            .filter(|provider| provider.is_open())
            .collect::<Vec<_>>();
        for provider in &open {
            alerts.push(HealthAlert {
                kind: AlertKind::CircuitOpen,
                component: "providers",
                message: format!("circuit open for provider '{}'", provider.provider),
                value: f64::from(provider.circuit.consecutive_failures),
                threshold: 0.0,
            });
        }
        let provider_status = if snapshot.providers.is_empty() || open.len() == snapshot.providers.len() {
            ComponentStatus::Unhealthy
        } else if open.is_empty() {
            ComponentStatus::Healthy
        } else {
            ComponentStatus::Degraded
        };
        components.push(ComponentHealth::new(
            "providers",
            provider_status,
            format!("{} of {} circuit(s) open", open.len(), snapshot.providers.len()),
        ));

        let dedup = &snapshot.dedup;
        let dedup_status = if dedup.degraded_grants > 0 {
            alerts.push(HealthAlert {
                kind: AlertKind::DedupDegraded,
                component: "dedup",
                message: format!(
                    "{} reservation(s) granted without the persistent store",
                    dedup.degraded_grants
                ),
                value: dedup.degraded_grants as f64,
                threshold: 0.0,
            });
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        };
        components.push(ComponentHealth::new(
            "dedup",
            dedup_status,
            format!(
                "{} grant(s), {} denial(s), {} in memory",
                dedup.grants, dedup.denials, dedup.memory_entries
            ),
        ));

        let events = &snapshot.events;
        let failure_rate = events.failure_rate();
        let events_status = match failure_rate {
            Some(rate) if rate > MAX_EVENT_FAILURE_RATE => {
                alerts.push(HealthAlert {
                    kind: AlertKind::EventFailures,
                    component: "events",
                    message: format!(
                        "event handler failure rate {:.0}% is above {:.0}%",
                        rate * 100.0,
                        MAX_EVENT_FAILURE_RATE * 100.0
                    ),
                    value: rate,
                    threshold: MAX_EVENT_FAILURE_RATE,
                });
                ComponentStatus::Degraded
            }
            _ => ComponentStatus::Healthy,
        };
        components.push(ComponentHealth::new(
            "events",
            events_status,
            format!(
                "{} published, {} subscription(s)",
                events.published, events.subscriptions
            ),
        ));

        components.push(ComponentHealth::new(
            "scanner",
            ComponentStatus::Healthy,
            format!(
                "{} scan(s), {} from cache",
                snapshot.scanner.total_scans, snapshot.scanner.cache_hits
            ),
        ));

        let status = components
            .iter()
            .map(|component| component.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);

        Self {
            status,
            checked_at,
            components,
            alerts,
            snapshot,
        }
    }

    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components
            .iter()
            .find(|component| component.component == name)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn snapshot() -> HealthSnapshot {
        HealthSnapshot {
            state: CycleState::Idle,
            metrics: OrchestratorMetrics::default(),
            cache: CacheStats {
                hits: 0,
                misses: 0,
                stale_reads: 0,
                evictions: 0,
                expirations: 0,
                size: 0,
                tier_sizes: BTreeMap::new(),
                hit_rate: 0.0,
            },
            providers: Vec::new(),
            dedup: DedupStats::default(),
            events: EventBusStats::default(),
            scanner: ScannerMetrics::default(),
        }
    }

    #[test]
    fn low_success_rate_and_degraded_dedup_raise_alerts() {
        let mut snapshot = snapshot();
        snapshot.metrics.opportunities_processed = 10;
        snapshot.metrics.analyses_completed = 5;
        snapshot.dedup.degraded_grants = 2;

        let report = HealthReport::assess(snapshot, UtcDateTime::from_unix_millis(0));
        let kinds = report.alerts.iter().map(|alert| alert.kind).collect::<Vec<_>>();

        assert_eq!(kinds, vec![AlertKind::LowSuccessRate, AlertKind::DedupDegraded]);
        assert_eq!(
            report.component("dedup").map(|component| component.status),
            Some(ComponentStatus::Degraded)
        );
        // No providers registered at all.
        assert_eq!(report.status, ComponentStatus::Unhealthy);
    }

    #[test]
    fn event_failure_rate_above_limit_alerts() {
        let mut snapshot = snapshot();
        snapshot.events.delivered = 8;
        snapshot.events.failed = 2;

        let report = HealthReport::assess(snapshot, UtcDateTime::from_unix_millis(0));
        assert!(report
            .alerts
            .iter()
            .any(|alert| alert.kind == AlertKind::EventFailures));
    }
}
