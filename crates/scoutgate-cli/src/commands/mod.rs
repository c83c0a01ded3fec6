mod config;
mod cycle;
mod dedup;
mod gate;
mod health;
mod run;

use std::sync::Arc;
use std::time::Duration;

use scoutgate_core::aggregator::MarketDataAggregator;
use scoutgate_core::cache::SmartCache;
use scoutgate_core::dedup::DedupCoordinator;
use scoutgate_core::orchestrator::Orchestrator;
use scoutgate_core::persistence::{
    DecisionSink, DuckDbPersistence, InMemoryPersistence, ReservationStore,
};
use scoutgate_core::provider_policy::ProviderPolicy;
use scoutgate_core::simulated::SimulatedSource;
use scoutgate_core::{resolve_scoutgate_home, PipelineConfig, ProviderId, Symbol, ValidationError};
use scoutgate_store::{Store, StoreConfig};
use serde_json::Value;
use tracing::debug;

use crate::cli::{Cli, Command};
use crate::error::CliError;

const DEFAULT_PROVIDERS: [&str; 2] = ["sim-a", "sim-b"];

pub async fn run(cli: &Cli) -> Result<Value, CliError> {
    let config = load_config(cli)?;

    match &cli.command {
        Command::Config => config::run(&config),
        Command::Gate(args) => gate::run(args, &config),
        Command::Cycle(args) => cycle::run(args, &Runtime::build(cli, config)?).await,
        Command::Run(args) => run::run(args, &Runtime::build(cli, config)?).await,
        Command::Health => health::run(&Runtime::build(cli, config)?).await,
        Command::Dedup(args) => dedup::run(args, &Runtime::build(cli, config)?).await,
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig, CliError> {
    match &cli.config {
        Some(path) => Ok(PipelineConfig::load(path)?),
        None => Ok(PipelineConfig::default()),
    }
}

/// Fully wired pipeline over simulated providers.
pub struct Runtime {
    pub config: PipelineConfig,
    pub orchestrator: Orchestrator,
    pub sources: Vec<SimulatedSource>,
}

impl Runtime {
    fn build(cli: &Cli, config: PipelineConfig) -> Result<Self, CliError> {
        if cli.ephemeral {
            return Self::wire(config, Arc::new(InMemoryPersistence::new()));
        }

        let home = cli.home.clone().unwrap_or_else(resolve_scoutgate_home);
        let store = Store::open(StoreConfig::for_home(home))?;
        debug!(db_path = ?store.db_path(), "store opened");
        Self::wire(config, Arc::new(DuckDbPersistence::new(store)))
    }

    fn wire<P>(config: PipelineConfig, persistence: Arc<P>) -> Result<Self, CliError>
    where
        P: ReservationStore + DecisionSink + 'static,
    {
        let policies = if config.providers.is_empty() {
            DEFAULT_PROVIDERS
                .iter()
                .map(|id| ProviderId::parse(id).map(ProviderPolicy::default_for))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            config.providers.clone()
        };

        let cache = SmartCache::new(config.cache.clone());
        let mut aggregator = MarketDataAggregator::new(config.aggregator.clone(), cache);
        let mut sources = Vec::with_capacity(policies.len());
        for policy in policies {
            let source = SimulatedSource::new(policy.provider_id.clone());
            aggregator = aggregator.with_provider_policy(Arc::new(source.clone()), policy);
            sources.push(source);
        }

        let reservations: Arc<dyn ReservationStore> = persistence.clone();
        let decisions: Arc<dyn DecisionSink> = persistence;
        let dedup = Arc::new(DedupCoordinator::new(reservations, config.dedup));
        let orchestrator = Orchestrator::builder(Arc::new(aggregator), dedup, decisions)
            .with_pipeline_config(&config)
            .build()?;

        Ok(Self {
            config,
            orchestrator,
            sources,
        })
    }
}

/// Positive, finite seconds from a command-line flag.
pub fn duration_from_flag(field: &'static str, secs: f64) -> Result<Duration, CliError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ValidationError::ZeroConfigValue { field }.into());
    }
    Duration::try_from_secs_f64(secs).map_err(|error| {
        ValidationError::InvalidConfig {
            field,
            reason: error.to_string(),
        }
        .into()
    })
}

pub fn parse_symbols(raw: &[String]) -> Result<Vec<Symbol>, CliError> {
    raw.iter()
        .map(|value| Symbol::parse(value).map_err(CliError::from))
        .collect()
}
