//! Anti-duplicate coordinator.
//!
//! Guarantees at most one active reservation per instrument per window, across
//! concurrent workers and process restarts. Two layers collaborate:
//!
//! - an in-memory set for cheap rejection of the common case;
//! - a [`ReservationStore`] that is consulted on every attempt and stays the
//!   source of truth.
//!
//! Each instrument has its own async lock, so the memory check and the store's
//! conditional insert run as one check-and-set for that instrument while other
//! instruments proceed in parallel. When the store is unreachable the
//! coordinator grants from memory only and reports the grant as non-durable.

use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::duration_secs;
use crate::persistence::{ReservationStore, ReserveAttempt};
use crate::{PipelineError, Symbol, UtcDateTime, ValidationError};

/// Opaque handle proving a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationToken(Uuid);

impl ReservationToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReservationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ReservationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for ReservationToken {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value).map(Self)
    }
}

/// Reservation of one instrument for `[window_start, window_end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupReservation {
    pub token: ReservationToken,
    pub instrument: Symbol,
    pub window_start: UtcDateTime,
    pub window_end: UtcDateTime,
}

impl DedupReservation {
    pub fn new(instrument: Symbol, window_start: UtcDateTime, window: Duration) -> Self {
        Self {
            token: ReservationToken::new(),
            instrument,
            window_start,
            window_end: window_start.saturating_add(window),
        }
    }

    pub fn is_active_at(&self, now: UtcDateTime) -> bool {
        now < self.window_end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationOutcome {
    /// `durable` is false when the store was unreachable and only memory holds the grant.
    Granted {
        reservation: DedupReservation,
        durable: bool,
    },
    /// The instrument is already held by `existing`.
    Denied(DedupReservation),
}

impl ReservationOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }

    pub fn reservation(&self) -> &DedupReservation {
        match self {
            Self::Granted { reservation, .. } | Self::Denied(reservation) => reservation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    #[serde(rename = "window_secs", with = "duration_secs")]
    pub window: Duration,
    /// In-memory bound; the oldest insertion is evicted past it.
    pub max_memory_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(4 * 3_600),
            max_memory_entries: 10_000,
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.window.is_zero() {
            return Err(ValidationError::ZeroConfigValue {
                field: "dedup.window_secs",
            });
        }
        if self.max_memory_entries == 0 {
            return Err(ValidationError::ZeroConfigValue {
                field: "dedup.max_memory_entries",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DedupStats {
    pub grants: u64,
    pub denials: u64,
    /// Grants issued while the store was unreachable.
    pub degraded_grants: u64,
    pub releases: u64,
    pub memory_entries: usize,
    pub memory_evictions: u64,
    pub rehydrated: u64,
    /// Expired rows deleted from the store.
    pub purged: u64,
}

#[derive(Debug, Default)]
struct DedupCounters {
    grants: AtomicU64,
    denials: AtomicU64,
    degraded_grants: AtomicU64,
    releases: AtomicU64,
    memory_evictions: AtomicU64,
    rehydrated: AtomicU64,
    purged: AtomicU64,
}

/// Bounded instrument → reservation map with insertion-order eviction.
#[derive(Debug)]
struct MemorySet {
    by_instrument: HashMap<Symbol, DedupReservation>,
    order: VecDeque<(Symbol, ReservationToken)>,
    max_entries: usize,
}

impl MemorySet {
    fn new(max_entries: usize) -> Self {
        Self {
            by_instrument: HashMap::new(),
            order: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Returns how many entries were evicted to stay within bound.
    fn insert(&mut self, reservation: DedupReservation) -> u64 {
        self.order
            .push_back((reservation.instrument.clone(), reservation.token));
        self.by_instrument
            .insert(reservation.instrument.clone(), reservation);

        let mut evicted = 0;
        while self.by_instrument.len() > self.max_entries {
            let Some((instrument, token)) = self.order.pop_front() else {
                break;
            };
            // Skip order entries superseded by a newer reservation.
            if self
                .by_instrument
                .get(&instrument)
                .is_some_and(|held| held.token == token)
            {
                self.by_instrument.remove(&instrument);
                evicted += 1;
            }
        }
        if self.order.len() > self.max_entries.saturating_mul(2) {
            let by_instrument = &self.by_instrument;
            self.order.retain(|(instrument, token)| {
                by_instrument
                    .get(instrument)
                    .is_some_and(|held| held.token == *token)
            });
        }
        evicted
    }

    /// Active reservation of `instrument`; an expired one is dropped on the way.
    fn active(&mut self, instrument: &Symbol, now: UtcDateTime) -> Option<DedupReservation> {
        let held = self.by_instrument.get(instrument)?;
        if held.is_active_at(now) {
            return Some(held.clone());
        }
        self.by_instrument.remove(instrument);
        None
    }

    fn prune(&mut self, now: UtcDateTime) {
        self.by_instrument.retain(|_, held| held.is_active_at(now));
        let by_instrument = &self.by_instrument;
        self.order.retain(|(instrument, token)| {
            by_instrument
                .get(instrument)
                .is_some_and(|held| held.token == *token)
        });
    }

    fn remove_token(&mut self, token: ReservationToken) -> bool {
        let instrument = self
            .by_instrument
            .iter()
            .find(|(_, held)| held.token == token)
            .map(|(instrument, _)| instrument.clone());
        match instrument {
            Some(instrument) => self.by_instrument.remove(&instrument).is_some(),
            None => false,
        }
    }

    fn snapshot(&self, now: UtcDateTime) -> Vec<DedupReservation> {
        let mut active = self
            .by_instrument
            .values()
            .filter(|held| held.is_active_at(now))
            .cloned()
            .collect::<Vec<_>>();
        active.sort_by_key(|held| held.window_start);
        active
    }

    fn clear(&mut self, instrument: Option<&Symbol>) -> usize {
        let before = self.by_instrument.len();
        match instrument {
            Some(instrument) => {
                self.by_instrument.remove(instrument);
            }
            None => {
                self.by_instrument.clear();
                self.order.clear();
            }
        }
        before - self.by_instrument.len()
    }
}

pub struct DedupCoordinator {
    store: Arc<dyn ReservationStore>,
    clock: Arc<dyn Clock>,
    config: DedupConfig,
    locks: Mutex<HashMap<Symbol, Arc<tokio::sync::Mutex<()>>>>,
    memory: Mutex<MemorySet>,
    rehydrated: AtomicBool,
    counters: DedupCounters,
}

impl DedupCoordinator {
    pub fn new(store: Arc<dyn ReservationStore>, config: DedupConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn ReservationStore>,
        config: DedupConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            memory: Mutex::new(MemorySet::new(config.max_memory_entries)),
            config,
            locks: Mutex::new(HashMap::new()),
            rehydrated: AtomicBool::new(false),
            counters: DedupCounters::default(),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Reserve `instrument` for the configured window.
    pub async fn reserve(&self, instrument: &Symbol) -> ReservationOutcome {
        self.reserve_locked_window(instrument, self.config.window).await
    }

    /// Atomic check-and-set for `instrument`. Concurrent calls for the same
    /// instrument within one window grant exactly once.
    pub async fn try_reserve(
        &self,
        instrument: &Symbol,
        window: Duration,
    ) -> Result<ReservationOutcome, ValidationError> {
        if window.is_zero() {
            return Err(ValidationError::ZeroConfigValue {
                field: "dedup.window_secs",
            });
        }
        Ok(self.reserve_locked_window(instrument, window).await)
    }

    /// Drop a reservation early. Returns whether memory or the store held it.
    pub async fn release(&self, token: ReservationToken) -> bool {
        let in_memory = self.memory().remove_token(token);
        let in_store = match self.store.release(token).await {
            Ok(removed) => removed,
            Err(error) => {
                warn!(token = %token, error = %error, "could not release reservation in store");
                false
            }
        };
        let released = in_memory || in_store;
        if released {
            self.counters.releases.fetch_add(1, Ordering::Relaxed);
        }
        released
    }

    /// Load active reservations from the store into memory. Only the first
    /// successful call does any work; later calls return `Ok(0)`.
    pub async fn rehydrate(&self) -> Result<usize, PipelineError> {
        if self.rehydrated.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }

        let now = self.clock.now();
        let active = match self.store.active_reservations(now).await {
            Ok(active) => active,
            Err(error) => {
                self.rehydrated.store(false, Ordering::SeqCst);
                return Err(error);
            }
        };

        let loaded = active.len();
        let evicted = {
            let mut memory = self.memory();
            active
                .into_iter()
                .map(|reservation| memory.insert(reservation))
                .sum::<u64>()
        };
        self.counters
            .memory_evictions
            .fetch_add(evicted, Ordering::Relaxed);
        self.counters
            .rehydrated
            .fetch_add(loaded as u64, Ordering::Relaxed);
        info!(loaded, "dedup reservations rehydrated");

        if let Err(error) = self.purge_expired().await {
            warn!(error = %error, "expired reservations not purged after rehydration");
        }
        Ok(loaded)
    }

    /// Delete reservations whose window has ended, from memory and the store.
    /// Returns the number of store rows removed.
    pub async fn purge_expired(&self) -> Result<usize, PipelineError> {
        let now = self.clock.now();
        self.memory().prune(now);
        let purged = self.store.purge_expired(now).await?;
        self.counters
            .purged
            .fetch_add(purged as u64, Ordering::Relaxed);
        if purged > 0 {
            debug!(purged, "expired dedup reservations purged");
        }
        Ok(purged)
    }

    pub fn is_rehydrated(&self) -> bool {
        self.rehydrated.load(Ordering::SeqCst)
    }

    /// Active reservations from the store, or from memory while it is unreachable.
    pub async fn active_reservations(&self) -> Vec<DedupReservation> {
        let now = self.clock.now();
        match self.store.active_reservations(now).await {
            Ok(active) => active,
            Err(error) => {
                warn!(error = %error, "store unavailable, listing in-memory reservations");
                self.memory().snapshot(now)
            }
        }
    }

    /// Admin clear of one instrument or everything. Returns rows removed from the store.
    pub async fn clear(&self, instrument: Option<&Symbol>) -> Result<usize, PipelineError> {
        let from_memory = self.memory().clear(instrument);
        let from_store = self.store.clear(instrument.cloned()).await?;
        info!(
            instrument = instrument.map(Symbol::as_str).unwrap_or("*"),
            from_memory, from_store, "dedup reservations cleared"
        );
        Ok(from_store)
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            grants: self.counters.grants.load(Ordering::Relaxed),
            denials: self.counters.denials.load(Ordering::Relaxed),
            degraded_grants: self.counters.degraded_grants.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            memory_entries: self.memory().by_instrument.len(),
            memory_evictions: self.counters.memory_evictions.load(Ordering::Relaxed),
            rehydrated: self.counters.rehydrated.load(Ordering::Relaxed),
            purged: self.counters.purged.load(Ordering::Relaxed),
        }
    }

    async fn reserve_locked_window(&self, instrument: &Symbol, window: Duration) -> ReservationOutcome {
        let lock = self.instrument_lock(instrument);
        let outcome = {
            let _guard = lock.lock().await;
            self.check_and_set(instrument, window).await
        };
        self.release_lock(instrument, lock);
        outcome
    }

    async fn check_and_set(&self, instrument: &Symbol, window: Duration) -> ReservationOutcome {
        let now = self.clock.now();
        let remembered = self.memory().active(instrument, now);
        if let Some(existing) = remembered {
            self.counters.denials.fetch_add(1, Ordering::Relaxed);
            debug!(instrument = %instrument, until = %existing.window_end, "dedup denied from memory");
            return ReservationOutcome::Denied(existing);
        }

        let reservation = DedupReservation::new(instrument.clone(), now, window);
        match self.store.reserve_if_vacant(&reservation, now).await {
            Ok(ReserveAttempt::Inserted) => {
                self.remember(reservation.clone());
                self.counters.grants.fetch_add(1, Ordering::Relaxed);
                debug!(instrument = %instrument, until = %reservation.window_end, "dedup granted");
                ReservationOutcome::Granted {
                    reservation,
                    durable: true,
                }
            }
            Ok(ReserveAttempt::Occupied(existing)) => {
                self.remember(existing.clone());
                self.counters.denials.fetch_add(1, Ordering::Relaxed);
                debug!(instrument = %instrument, until = %existing.window_end, "dedup denied by store");
                ReservationOutcome::Denied(existing)
            }
            Err(error) => {
                warn!(
                    instrument = %instrument,
                    error = %error,
                    "reservation store unavailable, granting from memory only"
                );
                self.remember(reservation.clone());
                self.counters.grants.fetch_add(1, Ordering::Relaxed);
                self.counters.degraded_grants.fetch_add(1, Ordering::Relaxed);
                ReservationOutcome::Granted {
                    reservation,
                    durable: false,
                }
            }
        }
    }

    fn remember(&self, reservation: DedupReservation) {
        let evicted = self.memory().insert(reservation);
        if evicted > 0 {
            self.counters
                .memory_evictions
                .fetch_add(evicted, Ordering::Relaxed);
        }
    }

    fn memory(&self) -> MutexGuard<'_, MemorySet> {
        self.memory.lock().expect("dedup memory lock is not poisoned")
    }

    fn instrument_lock(&self, instrument: &Symbol) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("dedup lock map is not poisoned");
        Arc::clone(locks.entry(instrument.clone()).or_default())
    }

    fn release_lock(&self, instrument: &Symbol, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().expect("dedup lock map is not poisoned");
        if Arc::strong_count(&lock) == 2 {
            locks.remove(instrument);
        }
    }
}
