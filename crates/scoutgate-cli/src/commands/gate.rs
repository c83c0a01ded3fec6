use scoutgate_core::gate;
use scoutgate_core::{AnalysisResult, PipelineConfig, Signal, Symbol, UtcDateTime};
use serde_json::{json, Value};

use crate::cli::GateArgs;
use crate::error::CliError;

pub fn run(args: &GateArgs, config: &PipelineConfig) -> Result<Value, CliError> {
    let signal = args.signal.parse::<Signal>()?;
    let analysis = AnalysisResult::new(
        Symbol::parse(&args.symbol)?,
        signal,
        args.confidence,
        args.risk_reward,
        Value::Null,
        UtcDateTime::now(),
    )?;
    let verdict = gate::evaluate(&analysis, &config.gate, UtcDateTime::now());

    Ok(json!({
        "thresholds": config.gate,
        "analysis": analysis,
        "verdict": verdict,
        "path_description": verdict.path.map(|path| path.describe()),
    }))
}
