//! Async persistence seams for dedup reservations and decisions.
//!
//! | Implementation | Backing | Use |
//! |----------------|---------|-----|
//! | [`DuckDbPersistence`] | `scoutgate-store` on a blocking thread | production, restart-safe |
//! | [`InMemoryPersistence`] | process memory | tests, `--ephemeral` runs, outage simulation |

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use scoutgate_store::{DecisionRecord, ReservationRecord, ReserveOutcome, Store, StoreError};

use crate::dedup::{DedupReservation, ReservationToken};
use crate::{CycleId, Decision, PipelineError, Stage, Symbol, UtcDateTime};

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PipelineError>> + Send + 'a>>;

/// Result of the store's conditional insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveAttempt {
    Inserted,
    /// An active reservation already holds the instrument.
    Occupied(DedupReservation),
}

/// Durable source of truth for dedup reservations.
pub trait ReservationStore: Send + Sync {
    /// Insert `reservation` unless the instrument has one active at `now`, in
    /// one atomic step.
    fn reserve_if_vacant<'a>(
        &'a self,
        reservation: &'a DedupReservation,
        now: UtcDateTime,
    ) -> StoreFuture<'a, ReserveAttempt>;

    fn active_reservations(&self, now: UtcDateTime) -> StoreFuture<'_, Vec<DedupReservation>>;

    fn release(&self, token: ReservationToken) -> StoreFuture<'_, bool>;

    fn clear(&self, instrument: Option<Symbol>) -> StoreFuture<'_, usize>;

    /// Delete reservations whose window ended at or before `now`.
    fn purge_expired(&self, now: UtcDateTime) -> StoreFuture<'_, usize>;
}

/// Idempotent decision writes keyed by (instrument, cycle).
pub trait DecisionSink: Send + Sync {
    /// `Ok(false)` means the decision was already stored.
    fn record_decision<'a>(&'a self, decision: &'a Decision) -> StoreFuture<'a, bool>;

    fn decision_count(&self) -> StoreFuture<'_, u64>;
}

/// `scoutgate-store` adapter. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct DuckDbPersistence {
    store: Store,
}

impl DuckDbPersistence {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn blocking<T, F>(&self, operation: F) -> Result<T, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || operation(&store))
            .await
            .map_err(|error| PipelineError::store_unavailable(format!("store task failed: {error}")))?
            .map_err(PipelineError::from)
    }
}

impl ReservationStore for DuckDbPersistence {
    fn reserve_if_vacant<'a>(
        &'a self,
        reservation: &'a DedupReservation,
        now: UtcDateTime,
    ) -> StoreFuture<'a, ReserveAttempt> {
        let record = to_record(reservation);
        Box::pin(async move {
            let outcome = self
                .blocking(move |store| store.reserve_if_vacant(&record, now.unix_millis()))
                .await?;
            match outcome {
                ReserveOutcome::Inserted => Ok(ReserveAttempt::Inserted),
                ReserveOutcome::Occupied(existing) => Ok(ReserveAttempt::Occupied(from_record(existing)?)),
            }
        })
    }

    fn active_reservations(&self, now: UtcDateTime) -> StoreFuture<'_, Vec<DedupReservation>> {
        Box::pin(async move {
            self.blocking(move |store| store.active_reservations(now.unix_millis()))
                .await?
                .into_iter()
                .map(from_record)
                .collect()
        })
    }

    fn release(&self, token: ReservationToken) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let token = token.to_string();
            self.blocking(move |store| store.release_reservation(&token)).await
        })
    }

    fn clear(&self, instrument: Option<Symbol>) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            self.blocking(move |store| {
                store.clear_reservations(instrument.as_ref().map(Symbol::as_str))
            })
            .await
        })
    }

    fn purge_expired(&self, now: UtcDateTime) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            self.blocking(move |store| store.purge_expired(now.unix_millis()))
                .await
        })
    }
}

impl DecisionSink for DuckDbPersistence {
    fn record_decision<'a>(&'a self, decision: &'a Decision) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let sizing_json = serde_json::to_string(&decision.sizing).map_err(|error| {
                PipelineError::stage(
                    Stage::Persist,
                    Some(decision.instrument.clone()),
                    format!("sizing is not serializable: {error}"),
                )
            })?;
            let record = DecisionRecord {
                instrument: decision.instrument.to_string(),
                cycle_id: decision.cycle_id.to_string(),
                signal: decision.signal.as_str().to_owned(),
                confidence: decision.confidence,
                sizing_json,
                created_at_ms: decision.created_at.unix_millis(),
            };
            self.blocking(move |store| store.record_decision(&record)).await
        })
    }

    fn decision_count(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move { self.blocking(Store::decision_count).await })
    }
}

fn to_record(reservation: &DedupReservation) -> ReservationRecord {
    ReservationRecord {
        token: reservation.token.to_string(),
        instrument: reservation.instrument.to_string(),
        window_start_ms: reservation.window_start.unix_millis(),
        window_end_ms: reservation.window_end.unix_millis(),
    }
}

fn from_record(record: ReservationRecord) -> Result<DedupReservation, PipelineError> {
    let invalid = |reason: String| {
        PipelineError::store_unavailable(format!("invalid reservation record: {reason}"))
    };
    Ok(DedupReservation {
        token: record
            .token
            .parse()
            .map_err(|error: uuid::Error| invalid(error.to_string()))?,
        instrument: Symbol::parse(&record.instrument).map_err(|error| invalid(error.to_string()))?,
        window_start: UtcDateTime::from_unix_millis(record.window_start_ms),
        window_end: UtcDateTime::from_unix_millis(record.window_end_ms),
    })
}

/// Process-local store with an availability switch.
#[derive(Debug)]
pub struct InMemoryPersistence {
    reservations: Mutex<Vec<DedupReservation>>,
    decisions: Mutex<BTreeMap<(Symbol, String), Decision>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self {
            reservations: Mutex::new(Vec::new()),
            decisions: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every call fails with `PersistentStoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it touches state.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    pub fn decisions(&self) -> Vec<Decision> {
        self.decisions
            .lock()
            .expect("decision lock is not poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn decision_for(&self, instrument: &Symbol, cycle_id: CycleId) -> Option<Decision> {
        self.decisions
            .lock()
            .expect("decision lock is not poisoned")
            .get(&(instrument.clone(), cycle_id.to_string()))
            .cloned()
    }

    async fn enter(&self) -> Result<(), PipelineError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.check_available()
    }

    fn check_available(&self) -> Result<(), PipelineError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PipelineError::store_unavailable("in-memory store switched off"))
        }
    }

    fn reservations(&self) -> std::sync::MutexGuard<'_, Vec<DedupReservation>> {
        self.reservations
            .lock()
            .expect("reservation lock is not poisoned")
    }
}

impl ReservationStore for InMemoryPersistence {
    fn reserve_if_vacant<'a>(
        &'a self,
        reservation: &'a DedupReservation,
        now: UtcDateTime,
    ) -> StoreFuture<'a, ReserveAttempt> {
        Box::pin(async move {
            self.enter().await?;
            let mut reservations = self.reservations();
            if let Some(existing) = reservations
                .iter()
                .find(|held| held.instrument == reservation.instrument && held.is_active_at(now))
            {
                return Ok(ReserveAttempt::Occupied(existing.clone()));
            }
            reservations.push(reservation.clone());
            Ok(ReserveAttempt::Inserted)
        })
    }

    fn active_reservations(&self, now: UtcDateTime) -> StoreFuture<'_, Vec<DedupReservation>> {
        Box::pin(async move {
            self.enter().await?;
            let mut active = self
                .reservations()
                .iter()
                .filter(|held| held.is_active_at(now))
                .cloned()
                .collect::<Vec<_>>();
            active.sort_by_key(|held| held.window_start);
            Ok(active)
        })
    }

    fn release(&self, token: ReservationToken) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.enter().await?;
            let mut reservations = self.reservations();
            let before = reservations.len();
            reservations.retain(|held| held.token != token);
            Ok(reservations.len() != before)
        })
    }

    fn clear(&self, instrument: Option<Symbol>) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            self.enter().await?;
            let mut reservations = self.reservations();
            let before = reservations.len();
            match &instrument {
                Some(instrument) => reservations.retain(|held| &held.instrument != instrument),
                None => reservations.clear(),
            }
            Ok(before - reservations.len())
        })
    }

    fn purge_expired(&self, now: UtcDateTime) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            self.enter().await?;
            let mut reservations = self.reservations();
            let before = reservations.len();
            reservations.retain(|held| held.is_active_at(now));
            Ok(before - reservations.len())
        })
    }
}

impl DecisionSink for InMemoryPersistence {
    fn record_decision<'a>(&'a self, decision: &'a Decision) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.enter().await?;
            let mut decisions = self.decisions.lock().expect("decision lock is not poisoned");
            let key = (decision.instrument.clone(), decision.cycle_id.to_string());
            if decisions.contains_key(&key) {
                return Ok(false);
            }
            decisions.insert(key, decision.clone());
            Ok(true)
        })
    }

    fn decision_count(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            self.enter().await?;
            Ok(self.decisions.lock().expect("decision lock is not poisoned").len() as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::Signal;

    fn symbol(value: &str) -> Symbol {
        Symbol::parse(value).expect("valid symbol")
    }

    fn decision(cycle_id: CycleId) -> Decision {
        Decision::new(
            symbol("BTCUSDT"),
            cycle_id,
            Signal::Long,
            0.8,
            json!({ "entry": 100.0 }),
            UtcDateTime::from_unix_millis(1_000),
        )
        .expect("valid decision")
    }

    #[tokio::test]
    async fn duckdb_reservation_blocks_until_window_end() {
        let persistence = DuckDbPersistence::new(Store::open_in_memory().expect("store"));
        let start = UtcDateTime::from_unix_millis(1_000_000);
        let first = DedupReservation::new(symbol("ETHUSDT"), start, Duration::from_secs(60));
        let second = DedupReservation::new(symbol("ETHUSDT"), start, Duration::from_secs(60));

        assert_eq!(
            persistence.reserve_if_vacant(&first, start).await.expect("insert"),
            ReserveAttempt::Inserted
        );
        assert_eq!(
            persistence.reserve_if_vacant(&second, start).await.expect("check"),
            ReserveAttempt::Occupied(first.clone())
        );

        let later = start.saturating_add(Duration::from_secs(60));
        let third = DedupReservation::new(symbol("ETHUSDT"), later, Duration::from_secs(60));
        assert_eq!(
            persistence.reserve_if_vacant(&third, later).await.expect("insert"),
            ReserveAttempt::Inserted
        );
    }

    #[tokio::test]
    async fn duckdb_decision_writes_are_idempotent() {
        let persistence = DuckDbPersistence::new(Store::open_in_memory().expect("store"));
        let cycle_id = CycleId::new();

        assert!(persistence.record_decision(&decision(cycle_id)).await.expect("insert"));
        assert!(!persistence.record_decision(&decision(cycle_id)).await.expect("duplicate"));
        assert_eq!(persistence.decision_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn in_memory_store_reports_outage() {
        let persistence = InMemoryPersistence::new();
        persistence.set_available(false);

        let error = persistence
            .decision_count()
            .await
            .expect_err("store is off");
        assert_eq!(error.code(), "pipeline.store_unavailable");

        persistence.set_available(true);
        assert!(persistence.record_decision(&decision(CycleId::new())).await.expect("insert"));
        assert_eq!(persistence.decisions().len(), 1);
    }
}
