//! Multi-tier TTL cache with per-tier LRU bounds.
//!
//! Every fetch path goes through [`SmartCache`]. Each [`CacheTier`] has its own
//! TTL and max-entries bound. Expired entries are still returned, labeled as
//! [`CacheLookup::Stale`], until the background sweep removes them, so callers
//! can tell "never stored" apart from "stored but expired" and apply their own
//! fallback policy.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::duration_secs;
use crate::{Instrument, Series, ValidationError};

/// Longest TTL a tier accepts. Market data older than a week is never fresh.
pub const MAX_TIER_TTL: Duration = Duration::from_secs(7 * 24 * 3_600);

/// Cache partition with its own TTL and size bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Price,
    Series,
    Market,
    Indicator,
    Global,
}

impl CacheTier {
    pub const ALL: [Self; 5] = [
        Self::Price,
        Self::Series,
        Self::Market,
        Self::Indicator,
        Self::Global,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Series => "series",
            Self::Market => "market",
            Self::Indicator => "indicator",
            Self::Global => "global",
        }
    }
}

impl Display for CacheTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TTL and LRU bound of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    #[serde(rename = "ttl_secs", with = "duration_secs")]
    pub ttl: Duration,
    pub max_entries: usize,
}

impl TierPolicy {
    pub const fn new(ttl: Duration, max_entries: usize) -> Self {
        Self { ttl, max_entries }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub price: TierPolicy,
    pub series: TierPolicy,
    pub market: TierPolicy,
    pub indicator: TierPolicy,
    pub global: TierPolicy,
    #[serde(rename = "sweep_interval_secs", with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            price: TierPolicy::new(Duration::from_secs(30), 100),
            series: TierPolicy::new(Duration::from_secs(300), 50),
            market: TierPolicy::new(Duration::from_secs(120), 200),
            indicator: TierPolicy::new(Duration::from_secs(600), 75),
            global: TierPolicy::new(Duration::from_secs(900), 10),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub const fn policy(&self, tier: CacheTier) -> TierPolicy {
        match tier {
            CacheTier::Price => self.price,
            CacheTier::Series => self.series,
            CacheTier::Market => self.market,
            CacheTier::Indicator => self.indicator,
            CacheTier::Global => self.global,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for tier in CacheTier::ALL {
            let policy = self.policy(tier);
            if policy.max_entries == 0 {
                return Err(ValidationError::InvalidConfig {
                    field: "cache.max_entries",
                    reason: format!("tier '{tier}' must hold at least one entry"),
                });
            }
            if policy.ttl > MAX_TIER_TTL {
                return Err(ValidationError::InvalidConfig {
                    field: "cache.ttl_secs",
                    reason: format!(
                        "tier '{tier}' ttl {}s exceeds {}s",
                        policy.ttl.as_secs(),
                        MAX_TIER_TTL.as_secs()
                    ),
                });
            }
        }
        if self.sweep_interval.is_zero() {
            return Err(ValidationError::ZeroConfigValue {
                field: "cache.sweep_interval_secs",
            });
        }
        Ok(())
    }
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<V> {
    Fresh(V),
    /// Present but older than the tier TTL.
    Stale { value: V, age: Duration },
    Miss,
}

impl<V> CacheLookup<V> {
    pub fn fresh(self) -> Option<V> {
        match self {
            Self::Fresh(value) => Some(value),
            Self::Stale { .. } | Self::Miss => None,
        }
    }

    /// Value regardless of age.
    pub fn any(self) -> Option<V> {
        match self {
            Self::Fresh(value) | Self::Stale { value, .. } => Some(value),
            Self::Miss => None,
        }
    }

    pub const fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }

    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }

    pub const fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }
}

/// Values stored by the pipeline's shared cache.
#[derive(Debug, Clone)]
pub enum CachePayload {
    Series(Arc<Series>),
    Snapshot(Arc<Vec<Instrument>>),
    Price(f64),
    Json(serde_json::Value),
}

impl CachePayload {
    pub fn into_series(self) -> Option<Arc<Series>> {
        match self {
            Self::Series(series) => Some(series),
            _ => None,
        }
    }

    pub fn into_snapshot(self) -> Option<Arc<Vec<Instrument>>> {
        match self {
            Self::Snapshot(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    pub fn as_price(&self) -> Option<f64> {
        match self {
            Self::Price(price) => Some(*price),
            _ => None,
        }
    }
}

/// Counters exposed through health reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_reads: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub tier_sizes: BTreeMap<CacheTier, usize>,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
    last_access: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

#[derive(Debug)]
struct CacheInner<V> {
    tiers: HashMap<CacheTier, HashMap<String, CacheEntry<V>>>,
    config: CacheConfig,
}

impl<V> CacheInner<V> {
    fn tier(&self, tier: CacheTier) -> Option<&HashMap<String, CacheEntry<V>>> {
        self.tiers.get(&tier)
    }

    fn size(&self) -> usize {
        self.tiers.values().map(HashMap::len).sum()
    }

    /// Drop least-recently-used entries until `tier` fits its bound.
    fn enforce_bound(&mut self, tier: CacheTier) -> u64 {
        let max_entries = self.config.policy(tier).max_entries;
        let Some(entries) = self.tiers.get_mut(&tier) else {
            return 0;
        };

        let mut evicted = 0;
        while entries.len() > max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access.load(Ordering::Relaxed))
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_reads: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    access_clock: AtomicU64,
}

/// Thread-safe tiered cache shared by every component.
#[derive(Debug)]
pub struct SmartCache<V> {
    inner: Arc<RwLock<CacheInner<V>>>,
    counters: Arc<CacheCounters>,
}

impl<V> Clone for SmartCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<V> SmartCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        let tiers = CacheTier::ALL
            .into_iter()
            .map(|tier| (tier, HashMap::new()))
            .collect();
        Self {
            inner: Arc::new(RwLock::new(CacheInner { tiers, config })),
            counters: Arc::new(CacheCounters::default()),
        }
    }

    pub async fn get(&self, key: &str, tier: CacheTier) -> CacheLookup<V> {
        let store = self.inner.read().await;
        let Some(entry) = store.tier(tier).and_then(|entries| entries.get(key)) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return CacheLookup::Miss;
        };

        let tick = self.counters.access_clock.fetch_add(1, Ordering::Relaxed) + 1;
        entry.last_access.store(tick, Ordering::Relaxed);

        let now = Instant::now();
        if entry.is_fresh(now) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            CacheLookup::Fresh(entry.value.clone())
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.counters.stale_reads.fetch_add(1, Ordering::Relaxed);
            CacheLookup::Stale {
                value: entry.value.clone(),
                age: now.saturating_duration_since(entry.stored_at),
            }
        }
    }

    pub async fn put(&self, key: impl Into<String>, tier: CacheTier, value: V) {
        let mut store = self.inner.write().await;
        let ttl = store.config.policy(tier).ttl;
        let now = Instant::now();
        let tick = self.counters.access_clock.fetch_add(1, Ordering::Relaxed) + 1;

        store.tiers.entry(tier).or_default().insert(
            key.into(),
            CacheEntry {
                value,
                stored_at: now,
                ttl,
                last_access: AtomicU64::new(tick),
            },
        );

        let evicted = store.enforce_bound(tier);
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!(tier = tier.as_str(), evicted, "cache tier over capacity");
        }
    }

    /// Remove `key` from every tier.
    pub async fn invalidate(&self, key: &str) -> bool {
        let mut store = self.inner.write().await;
        let mut removed = false;
        for entries in store.tiers.values_mut() {
            removed |= entries.remove(key).is_some();
        }
        removed
    }

    /// Remove every key of `tier` starting with `prefix`.
    pub async fn invalidate_prefix(&self, tier: CacheTier, prefix: &str) -> usize {
        let mut store = self.inner.write().await;
        let Some(entries) = store.tiers.get_mut(&tier) else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    pub async fn invalidate_tier(&self, tier: CacheTier) -> usize {
        let mut store = self.inner.write().await;
        store
            .tiers
            .get_mut(&tier)
            .map(|entries| {
                let removed = entries.len();
                entries.clear();
                removed
            })
            .unwrap_or(0)
    }

    /// Drop expired entries from all tiers; returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let mut store = self.inner.write().await;
        let now = Instant::now();
        let mut removed = 0;
        for entries in store.tiers.values_mut() {
            let before = entries.len();
            entries.retain(|_, entry| entry.is_fresh(now));
            removed += before - entries.len();
        }
        if removed > 0 {
            self.counters
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.size()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let store = self.inner.read().await;
        let tier_sizes = CacheTier::ALL
            .into_iter()
            .map(|tier| (tier, store.tier(tier).map(HashMap::len).unwrap_or(0)))
            .collect::<BTreeMap<_, _>>();

        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            stale_reads: self.counters.stale_reads.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            size: store.size(),
            tier_sizes,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `sweep_interval` until
    /// `shutdown` flips to `true` or its sender is dropped.
    pub async fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.inner.read().await.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.sweep_expired().await;
                        if removed > 0 {
                            debug!(removed, "cache sweep removed expired entries");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
