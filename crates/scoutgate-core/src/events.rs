//! Typed in-process event bus.
//!
//! Each subscription owns an unbounded queue drained by its own task, so
//! publishing never waits on a handler and a slow subscriber only delays
//! itself. Delivery within one subscription is FIFO; nothing is promised
//! across subscriptions.
//!
//! ```text
//! publish ──► history (bounded)
//!        ├──► [sub 1 queue] ──► task ──► handler (timeout)
//!        └──► [sub 2 queue] ──► task ──► handler (timeout)
//! ```

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::duration_secs;
use crate::health::HealthAlert;
use crate::orchestrator::CycleReport;
use crate::{
    AnalysisResult, CycleId, Decision, GatedAnalysis, Stage, Symbol, UtcDateTime, ValidationError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    OpportunitiesFound,
    AnalysisCompleted,
    Escalated,
    DecisionMade,
    StageFailed,
    CycleCompleted,
    CacheInvalidated,
    PerformanceAlert,
}

impl Topic {
    pub const ALL: [Self; 8] = [
        Self::OpportunitiesFound,
        Self::AnalysisCompleted,
        Self::Escalated,
        Self::DecisionMade,
        Self::StageFailed,
        Self::CycleCompleted,
        Self::CacheInvalidated,
        Self::PerformanceAlert,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpportunitiesFound => "opportunities_found",
            Self::AnalysisCompleted => "analysis_completed",
            Self::Escalated => "escalated",
            Self::DecisionMade => "decision_made",
            Self::StageFailed => "stage_failed",
            Self::CycleCompleted => "cycle_completed",
            Self::CacheInvalidated => "cache_invalidated",
            Self::PerformanceAlert => "performance_alert",
        }
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    OpportunitiesFound {
        instruments: Vec<Symbol>,
        from_cache: bool,
    },
    AnalysisCompleted {
        analysis: AnalysisResult,
        /// The series came from an expired cache entry.
        stale_series: bool,
    },
    Escalated(GatedAnalysis),
    DecisionMade {
        decision: Decision,
        /// False when the decision already existed in the store.
        newly_persisted: bool,
    },
    StageFailed {
        stage: Stage,
        instrument: Option<Symbol>,
        error: String,
    },
    CycleCompleted(Box<CycleReport>),
    CacheInvalidated {
        instrument: Symbol,
        removed: usize,
    },
    PerformanceAlert(HealthAlert),
}

impl EventPayload {
    pub const fn topic(&self) -> Topic {
        match self {
            Self::OpportunitiesFound { .. } => Topic::OpportunitiesFound,
            Self::AnalysisCompleted { .. } => Topic::AnalysisCompleted,
            Self::Escalated(_) => Topic::Escalated,
            Self::DecisionMade { .. } => Topic::DecisionMade,
            Self::StageFailed { .. } => Topic::StageFailed,
            Self::CycleCompleted(_) => Topic::CycleCompleted,
            Self::CacheInvalidated { .. } => Topic::CacheInvalidated,
            Self::PerformanceAlert(_) => Topic::PerformanceAlert,
        }
    }

    /// Instrument the event is about, if any.
    pub fn instrument(&self) -> Option<&Symbol> {
        match self {
            Self::AnalysisCompleted { analysis, .. } => Some(&analysis.instrument),
            Self::Escalated(gated) => Some(&gated.analysis.instrument),
            Self::DecisionMade { decision, .. } => Some(&decision.instrument),
            Self::StageFailed { instrument, .. } => instrument.as_ref(),
            Self::CacheInvalidated { instrument, .. } => Some(instrument),
            Self::OpportunitiesFound { .. } | Self::CycleCompleted(_) | Self::PerformanceAlert(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineEvent {
    pub id: Uuid,
    pub cycle_id: Option<CycleId>,
    pub emitted_at: UtcDateTime,
    /// Component that published the event.
    pub source: &'static str,
    pub payload: EventPayload,
}

impl PipelineEvent {
    pub fn new(source: &'static str, cycle_id: Option<CycleId>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            cycle_id,
            emitted_at: UtcDateTime::now(),
            source,
            payload,
        }
    }

    pub const fn topic(&self) -> Topic {
        self.payload.topic()
    }
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// Subscriber callback. Errors are counted and logged, never propagated.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: Arc<PipelineEvent>) -> HandlerFuture<'_>;
}

struct FnHandler<F>(F);

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<PipelineEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    fn handle(&self, event: Arc<PipelineEvent>) -> HandlerFuture<'_> {
        Box::pin((self.0)(event))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub history_limit: usize,
    #[serde(rename = "handler_timeout_secs", with = "duration_secs")]
    pub handler_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_limit: 1_000,
            handler_timeout: Duration::from_secs(30),
        }
    }
}

impl EventBusConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.handler_timeout.is_zero() {
            return Err(ValidationError::ZeroConfigValue {
                field: "events.handler_timeout_secs",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EventBusStats {
    pub published: u64,
    pub queued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub subscriptions: usize,
    pub history_len: usize,
}

impl EventBusStats {
    /// Failed share of finished deliveries, `None` before the first one.
    pub fn failure_rate(&self) -> Option<f64> {
        let finished = self.delivered + self.failed;
        (finished > 0).then(|| self.failed as f64 / finished as f64)
    }
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    queued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

struct Subscription {
    id: SubscriptionId,
    name: String,
    topics: Vec<Topic>,
    sender: mpsc::UnboundedSender<Arc<PipelineEvent>>,
}

struct BusInner {
    config: EventBusConfig,
    subscriptions: RwLock<Vec<Subscription>>,
    history: Mutex<VecDeque<Arc<PipelineEvent>>>,
    counters: Arc<BusCounters>,
    next_id: AtomicU64,
}

/// Cloneable handle; clones publish to the same subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                subscriptions: RwLock::new(Vec::new()),
                history: Mutex::new(VecDeque::new()),
                counters: Arc::new(BusCounters::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(
        &self,
        topic: Topic,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        self.subscribe_many(&[topic], name, handler)
    }

    /// Register `handler` for `topics`. Must be called inside a tokio runtime.
    pub fn subscribe_many(
        &self,
        topics: &[Topic],
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(drain_subscription(
            name.clone(),
            receiver,
            handler,
            self.inner.config.handler_timeout,
            Arc::clone(&self.inner.counters),
        ));

        debug!(subscription = %name, topics = ?topics, "event subscription added");
        self.subscriptions_mut().push(Subscription {
            id,
            name,
            topics: topics.to_vec(),
            sender,
        });
        id
    }

    pub fn subscribe_fn<F, Fut>(&self, topics: &[Topic], name: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<PipelineEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.subscribe_many(topics, name, Arc::new(FnHandler(handler)))
    }

    /// Remove a subscription. Events already queued for it are still delivered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions_mut();
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        subscriptions.len() != before
    }

    /// Queue `event` for every matching subscription. Returns how many queues received it.
    pub fn publish(&self, event: PipelineEvent) -> usize {
        let event = Arc::new(event);
        let topic = event.topic();
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        self.remember(Arc::clone(&event));

        let subscriptions = self
            .inner
            .subscriptions
            .read()
            .expect("subscription lock is not poisoned");
        let mut queued = 0;
        for subscription in subscriptions
            .iter()
            .filter(|subscription| subscription.topics.contains(&topic))
        {
            if subscription.sender.send(Arc::clone(&event)).is_ok() {
                queued += 1;
            } else {
                warn!(subscription = %subscription.name, topic = %topic, "subscriber task is gone");
            }
        }
        self.inner
            .counters
            .queued
            .fetch_add(queued as u64, Ordering::Relaxed);
        queued
    }

    pub fn emit(&self, source: &'static str, cycle_id: Option<CycleId>, payload: EventPayload) -> usize {
        self.publish(PipelineEvent::new(source, cycle_id, payload))
    }

    /// Up to `limit` most recent events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<Arc<PipelineEvent>> {
        let history = self.inner.history.lock().expect("history lock is not poisoned");
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> EventBusStats {
        let counters = &self.inner.counters;
        EventBusStats {
            published: counters.published.load(Ordering::Relaxed),
            queued: counters.queued.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
            subscriptions: self
                .inner
                .subscriptions
                .read()
                .expect("subscription lock is not poisoned")
                .len(),
            history_len: self.inner.history.lock().expect("history lock is not poisoned").len(),
        }
    }

    /// Wait until every queued event has been handled, or `timeout` passes.
    /// Returns whether the bus went idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let counters = Arc::clone(&self.inner.counters);
        let idle = async move {
            loop {
                let finished = counters.delivered.load(Ordering::Acquire) + counters.failed.load(Ordering::Acquire);
                if finished >= counters.queued.load(Ordering::Acquire) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    fn remember(&self, event: Arc<PipelineEvent>) {
        let limit = self.inner.config.history_limit;
        if limit == 0 {
            return;
        }
        let mut history = self.inner.history.lock().expect("history lock is not poisoned");
        history.push_back(event);
        while history.len() > limit {
            history.pop_front();
        }
    }

    fn subscriptions_mut(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Subscription>> {
        self.inner
            .subscriptions
            .write()
            .expect("subscription lock is not poisoned")
    }
}

async fn drain_subscription(
    name: String,
    mut receiver: mpsc::UnboundedReceiver<Arc<PipelineEvent>>,
    handler: Arc<dyn EventHandler>,
    handler_timeout: Duration,
    counters: Arc<BusCounters>,
) {
    while let Some(event) = receiver.recv().await {
        let topic = event.topic();
        let handled = AssertUnwindSafe(handler.handle(event)).catch_unwind();
        match tokio::time::timeout(handler_timeout, handled).await {
            Ok(Ok(Ok(()))) => {
                counters.delivered.fetch_add(1, Ordering::AcqRel);
            }
            Ok(Ok(Err(error))) => {
                counters.failed.fetch_add(1, Ordering::AcqRel);
                warn!(subscription = %name, topic = %topic, error = %error, "event handler failed");
            }
            Ok(Err(_)) => {
                counters.failed.fetch_add(1, Ordering::AcqRel);
                warn!(subscription = %name, topic = %topic, "event handler panicked");
            }
            Err(_) => {
                counters.timed_out.fetch_add(1, Ordering::Relaxed);
                counters.failed.fetch_add(1, Ordering::AcqRel);
                warn!(
                    subscription = %name,
                    topic = %topic,
                    timeout_ms = handler_timeout.as_millis() as u64,
                    "event handler timed out"
                );
            }
        }
    }
    debug!(subscription = %name, "event subscription closed");
}
