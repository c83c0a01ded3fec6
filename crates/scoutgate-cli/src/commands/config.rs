use scoutgate_core::PipelineConfig;
use serde_json::Value;

use crate::error::CliError;

pub fn run(config: &PipelineConfig) -> Result<Value, CliError> {
    Ok(serde_json::to_value(config)?)
}
