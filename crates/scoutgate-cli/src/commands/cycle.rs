use serde_json::Value;
use tracing::warn;

use super::{parse_symbols, Runtime};
use crate::cli::CycleArgs;
use crate::error::CliError;

pub async fn run(args: &CycleArgs, runtime: &Runtime) -> Result<Value, CliError> {
    for symbol in parse_symbols(&args.outage)? {
        for source in &runtime.sources {
            source.set_outage(symbol.clone(), true);
        }
    }
    let instruments = args
        .symbols
        .as_deref()
        .map(parse_symbols)
        .transpose()?;

    let orchestrator = &runtime.orchestrator;
    if let Err(error) = orchestrator.start().await {
        warn!(error = %error, "dedup rehydration failed, continuing with in-memory reservations");
    }
    let report = orchestrator.trigger_manual_cycle(instruments).await;
    orchestrator.shutdown().await;
    Ok(serde_json::to_value(report?)?)
}
