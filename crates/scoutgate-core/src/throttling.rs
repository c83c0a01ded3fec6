use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use serde::Serialize;

use crate::provider_policy::ProviderPolicy;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Process-wide request budget for one upstream provider.
///
/// Clones share the same token bucket, so every worker draws from one budget.
#[derive(Clone)]
pub struct RequestBudget {
    limiter: Arc<DirectRateLimiter>,
    quota_window: Duration,
    quota_limit: u32,
    counters: Arc<BudgetCounters>,
}

#[derive(Debug, Default)]
struct BudgetCounters {
    granted: AtomicU64,
    throttled: AtomicU64,
}

/// Budget usage for health reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub quota_limit: u32,
    pub quota_window_secs: f64,
    pub granted: u64,
    pub throttled: u64,
}

impl RequestBudget {
    pub fn new(quota_window: Duration, quota_limit: u32) -> Self {
        let quota = quota_from_window(quota_window, quota_limit);
        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            quota_window,
            quota_limit: quota_limit.max(1),
            counters: Arc::new(BudgetCounters::default()),
        }
    }

    pub fn from_policy(policy: &ProviderPolicy) -> Self {
        Self::new(policy.quota_window, policy.quota_limit)
    }

    /// Take one token without waiting. On exhaustion returns how long until
    /// the next token becomes available.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        match self.limiter.check() {
            Ok(()) => {
                self.counters.granted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(not_until) => {
                self.counters.throttled.fetch_add(1, Ordering::Relaxed);
                Err(not_until.wait_time_from(DefaultClock::default().now()))
            }
        }
    }

    /// Wait until a token is available. Callers bound the wait with their own timeout.
    pub async fn acquire(&self) {
        if self.try_acquire().is_ok() {
            return;
        }
        self.limiter.until_ready().await;
        self.counters.granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            quota_limit: self.quota_limit,
            quota_window_secs: self.quota_window.as_secs_f64(),
            granted: self.counters.granted.load(Ordering::Relaxed),
            throttled: self.counters.throttled.load(Ordering::Relaxed),
        }
    }
}

fn quota_from_window(quota_window: Duration, quota_limit: u32) -> Quota {
    let safe_limit = quota_limit.max(1);
    let burst = NonZeroU32::new(safe_limit).unwrap_or(NonZeroU32::MIN);

    let seconds_per_cell = (quota_window.as_secs_f64() / f64::from(safe_limit)).max(0.001);
    let period = Duration::from_secs_f64(seconds_per_cell);

    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst)
}
