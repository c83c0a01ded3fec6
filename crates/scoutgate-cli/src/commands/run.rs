use scoutgate_core::events::Topic;
use scoutgate_core::scheduler::{Scheduler, TickSource};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{duration_from_flag, Runtime};
use crate::cli::RunArgs;
use crate::error::CliError;

pub async fn run(args: &RunArgs, runtime: &Runtime) -> Result<Value, CliError> {
    let mut scheduler_config = runtime.config.scheduler;
    if let Some(secs) = args.period_secs {
        scheduler_config.period = duration_from_flag("period_secs", secs)?;
    }
    scheduler_config.validate()?;

    let orchestrator = runtime.orchestrator.clone();
    if let Err(error) = orchestrator.start().await {
        warn!(error = %error, "dedup rehydration failed, continuing with in-memory reservations");
    }

    let (completed_tx, mut completed_rx) = mpsc::unbounded_channel();
    let subscription = orchestrator
        .bus()
        .subscribe_fn(&[Topic::CycleCompleted], "cli-cycle-counter", move |_| {
            let completed_tx = completed_tx.clone();
            async move {
                completed_tx
                    .send(())
                    .map_err(|_| String::from("cycle counter closed"))
            }
        });

    let handle = Scheduler::spawn(
        orchestrator.clone(),
        TickSource::Interval(scheduler_config.period),
        scheduler_config,
    );

    let mut completed = 0_u64;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(error = %error, "could not listen for Ctrl-C");
                }
                info!("interrupt received, draining");
                break;
            }
            tick = completed_rx.recv() => {
                if tick.is_none() {
                    break;
                }
                completed += 1;
                if args.max_cycles.is_some_and(|max| completed >= max) {
                    break;
                }
            }
        }
    }

    let summary = handle.shutdown().await;
    orchestrator.bus().unsubscribe(subscription);
    orchestrator.shutdown().await;

    Ok(json!({
        "summary": summary,
        "metrics": orchestrator.metrics(),
    }))
}
