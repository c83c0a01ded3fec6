use scoutgate_core::dedup::ReservationOutcome;
use scoutgate_core::Symbol;
use serde_json::{json, Value};
use tracing::warn;

use super::{duration_from_flag, Runtime};
use crate::cli::{DedupArgs, DedupCommand};
use crate::error::CliError;

pub async fn run(args: &DedupArgs, runtime: &Runtime) -> Result<Value, CliError> {
    let dedup = runtime.orchestrator.dedup();
    if let Err(error) = dedup.rehydrate().await {
        warn!(error = %error, "dedup rehydration failed");
    }

    match &args.command {
        DedupCommand::List => {
            let reservations = dedup.active_reservations().await;
            Ok(json!({
                "count": reservations.len(),
                "reservations": reservations,
            }))
        }
        DedupCommand::Clear { symbol } => {
            let symbol = symbol.as_deref().map(Symbol::parse).transpose()?;
            let removed = dedup.clear(symbol.as_ref()).await?;
            Ok(json!({
                "instrument": symbol,
                "removed": removed,
            }))
        }
        DedupCommand::Purge => {
            let purged = dedup.purge_expired().await?;
            Ok(json!({ "purged": purged }))
        }
        DedupCommand::Reserve { symbol, window_secs } => {
            let symbol = Symbol::parse(symbol)?;
            let window = match window_secs {
                Some(secs) => duration_from_flag("window_secs", *secs)?,
                None => runtime.config.dedup.window,
            };
            let outcome = dedup.try_reserve(&symbol, window).await?;
            let (granted, durable) = match &outcome {
                ReservationOutcome::Granted { durable, .. } => (true, Some(*durable)),
                ReservationOutcome::Denied(_) => (false, None),
            };
            Ok(json!({
                "granted": granted,
                "durable": durable,
                "reservation": outcome.reservation(),
            }))
        }
    }
}
