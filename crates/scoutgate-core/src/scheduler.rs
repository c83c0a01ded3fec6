//! Long-lived loop that triggers cycles and periodic health checks.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::duration_secs;
use crate::orchestrator::Orchestrator;
use crate::{PipelineError, ValidationError};

/// Longest period or health interval the timer accepts.
pub const MAX_INTERVAL: Duration = Duration::from_secs(7 * 24 * 3_600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(rename = "period_secs", with = "duration_secs")]
    pub period: Duration,
    #[serde(rename = "health_interval_secs", with = "duration_secs")]
    pub health_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(4 * 60 * 60),
            health_interval: Duration::from_secs(300),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.period.is_zero() {
            return Err(ValidationError::ZeroConfigValue {
                field: "scheduler.period_secs",
            });
        }
        if self.health_interval.is_zero() {
            return Err(ValidationError::ZeroConfigValue {
                field: "scheduler.health_interval_secs",
            });
        }
        for (field, value) in [
            ("scheduler.period_secs", self.period),
            ("scheduler.health_interval_secs", self.health_interval),
        ] {
            if value > MAX_INTERVAL {
                return Err(ValidationError::InvalidConfig {
                    field,
                    reason: format!("{}s exceeds {}s", value.as_secs(), MAX_INTERVAL.as_secs()),
                });
            }
        }
        Ok(())
    }
}

/// What wakes the scheduler.
pub enum TickSource {
    /// Fixed period; the first tick fires immediately.
    Interval(Duration),
    /// One cycle per message. The loop ends when every sender is dropped.
    Manual(mpsc::Receiver<()>),
}

/// Sender side of [`TickSource::Manual`].
#[derive(Debug, Clone)]
pub struct ManualTicks {
    sender: mpsc::Sender<()>,
}

impl ManualTicks {
    pub fn channel() -> (Self, TickSource) {
        let (sender, receiver) = mpsc::channel(16);
        (Self { sender }, TickSource::Manual(receiver))
    }

    /// Queue one tick. Returns false once the scheduler is gone.
    pub async fn tick(&self) -> bool {
        self.sender.send(()).await.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SchedulerSummary {
    pub cycles_run: u64,
    pub cycles_failed: u64,
    pub cycles_rejected: u64,
    pub health_checks: u64,
}

pub struct Scheduler;

impl Scheduler {
    pub fn spawn(orchestrator: Orchestrator, ticks: TickSource, config: SchedulerConfig) -> SchedulerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let drain = orchestrator.clone();
        let task = tokio::spawn(run_loop(orchestrator, ticks, config, receiver));
        SchedulerHandle {
            shutdown,
            task,
            orchestrator: drain,
        }
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<SchedulerSummary>,
    orchestrator: Orchestrator,
}

impl SchedulerHandle {
    /// Drain the orchestrator, stop the loop and wait for the running cycle.
    pub async fn shutdown(self) -> SchedulerSummary {
        self.orchestrator.request_drain();
        let _ = self.shutdown.send(true);
        self.join().await
    }

    /// Wait for the loop to end on its own (manual ticks closed).
    pub async fn join(self) -> SchedulerSummary {
        match self.task.await {
            Ok(summary) => summary,
            Err(join_error) => {
                error!(error = %join_error, "scheduler task ended abnormally");
                SchedulerSummary::default()
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

enum Wake {
    Cycle,
    Health,
    Stop,
}

async fn run_loop(
    orchestrator: Orchestrator,
    mut ticks: TickSource,
    config: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> SchedulerSummary {
    let mut summary = SchedulerSummary::default();
    let mut health = tokio::time::interval(config.health_interval);
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first interval tick completes immediately; skip it.
    health.tick().await;

    let mut period = match &ticks {
        TickSource::Interval(period) => {
            let mut interval = tokio::time::interval(*period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            Some(interval)
        }
        TickSource::Manual(_) => None,
    };

    info!(period_secs = config.period.as_secs_f64(), "scheduler started");
    loop {
        let wake = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { Wake::Stop } else { continue }
            }
            _ = health.tick() => Wake::Health,
            tick = next_tick(&mut ticks, period.as_mut()) => {
                if tick { Wake::Cycle } else { Wake::Stop }
            }
        };

        match wake {
            Wake::Stop => break,
            Wake::Health => {
                summary.health_checks += 1;
                orchestrator.check_health().await;
            }
            Wake::Cycle => match orchestrator.run_cycle().await {
                Ok(report) => {
                    summary.cycles_run += 1;
                    if report.is_failed() {
                        summary.cycles_failed += 1;
                    }
                }
                Err(PipelineError::CycleAlreadyRunning { cycle_id }) => {
                    summary.cycles_rejected += 1;
                    warn!(cycle_id = %cycle_id, "tick skipped, cycle still running");
                }
                Err(error) => {
                    summary.cycles_failed += 1;
                    warn!(error = %error, "scheduled cycle failed");
                }
            },
        }
    }

    info!(
        cycles_run = summary.cycles_run,
        cycles_rejected = summary.cycles_rejected,
        "scheduler stopped"
    );
    summary
}

/// Resolves on the next tick; false when a manual source is closed.
async fn next_tick(ticks: &mut TickSource, period: Option<&mut tokio::time::Interval>) -> bool {
    match (ticks, period) {
        (TickSource::Interval(_), Some(interval)) => {
            interval.tick().await;
            true
        }
        (TickSource::Manual(receiver), _) => receiver.recv().await.is_some(),
        (TickSource::Interval(_), None) => std::future::pending().await,
    }
}
