use serde_json::Value;
use tracing::warn;

use super::Runtime;
use crate::error::CliError;

pub async fn run(runtime: &Runtime) -> Result<Value, CliError> {
    if let Err(error) = runtime.orchestrator.dedup().rehydrate().await {
        warn!(error = %error, "dedup rehydration failed");
    }
    let report = runtime.orchestrator.health().await;
    Ok(serde_json::to_value(report)?)
}
