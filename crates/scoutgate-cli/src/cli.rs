//! CLI argument definitions for scoutgate.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cycle` | Run one manual cycle and print its report |
//! | `run` | Run the scheduler loop |
//! | `health` | Print component health and alerts |
//! | `dedup` | Inspect, clear or create reservations |
//! | `gate` | Evaluate the escalation gate for one analysis |
//! | `config` | Print the effective configuration |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | none | JSON configuration file |
//! | `--home` | `$SCOUTGATE_HOME` | Data directory holding the DuckDB store |
//! | `--pretty` | `false` | Pretty-print JSON output |
//! | `--log-format` | `text` | Log format on stderr |
//! | `--ephemeral` | `false` | Keep reservations and decisions in memory |
//!
//! # Examples
//!
//! ```bash
//! scoutgate cycle --symbols BTCUSDT,ETHUSDT --pretty
//! scoutgate run --period-secs 60 --max-cycles 3
//! scoutgate dedup reserve SOLUSDT --window-secs 600
//! scoutgate dedup purge
//! scoutgate gate --signal long --confidence 0.85 --risk-reward 1.2
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Scan, enrich, gate and decide on market opportunities.
#[derive(Debug, Parser)]
#[command(
    name = "scoutgate",
    author,
    version,
    about = "Market scan and escalation pipeline",
    long_about = "scoutgate scans a market, enriches the promising instruments, and escalates \
only the best of them to the strategic stage. Features include:\n\
\n\
  • Multi-provider fetch with fallback and cross-validation\n\
  • Tiered TTL cache with stale fallback\n\
  • Restart-safe anti-duplicate reservations in DuckDB\n\
  • Three-path escalation gate\n\
\n\
Use 'scoutgate <command> --help' for command-specific help."
)]
pub struct Cli {
    /// JSON configuration file. Missing fields use defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory. Defaults to SCOUTGATE_HOME, then ~/.scoutgate.
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Log format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Keep reservations and decisions in process memory instead of DuckDB.
    #[arg(long, global = true, default_value_t = false)]
    pub ephemeral: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one manual cycle and print the cycle report.
    ///
    /// # Examples
    ///
    ///   scoutgate cycle
    ///   scoutgate cycle --symbols BTCUSDT,ETHUSDT
    ///   scoutgate cycle --outage SOLUSDT
    Cycle(CycleArgs),

    /// Run the scheduler until Ctrl-C or the cycle limit.
    Run(RunArgs),

    /// Print component health and active alerts.
    Health,

    /// Anti-duplicate reservation management.
    Dedup(DedupArgs),

    /// Evaluate the escalation gate under the configured thresholds.
    Gate(GateArgs),

    /// Print the effective configuration.
    Config,
}

#[derive(Debug, Args)]
pub struct CycleArgs {
    /// Analyze these instruments instead of scanning the market.
    #[arg(long, value_delimiter = ',')]
    pub symbols: Option<Vec<String>>,

    /// Simulate an outage of every provider for these instruments.
    #[arg(long, value_delimiter = ',')]
    pub outage: Vec<String>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Cycle period in seconds. Defaults to the configured scheduler period.
    #[arg(long)]
    pub period_secs: Option<f64>,

    /// Stop after this many completed cycles.
    #[arg(long)]
    pub max_cycles: Option<u64>,
}

#[derive(Debug, Args)]
pub struct DedupArgs {
    #[command(subcommand)]
    pub command: DedupCommand,
}

#[derive(Debug, Subcommand)]
pub enum DedupCommand {
    /// List active reservations.
    List,
    /// Delete reservations whose window has ended.
    Purge,
    /// Remove reservations for one instrument, or all of them.
    Clear {
        #[arg(long)]
        symbol: Option<String>,
    },
    /// Reserve an instrument for a window.
    Reserve {
        symbol: String,
        /// Window length in seconds. Defaults to the configured dedup window.
        #[arg(long)]
        window_secs: Option<f64>,
    },
}

#[derive(Debug, Args)]
pub struct GateArgs {
    /// long, short or hold.
    #[arg(long)]
    pub signal: String,

    #[arg(long)]
    pub confidence: f64,

    #[arg(long)]
    pub risk_reward: f64,

    #[arg(long, default_value = "BTCUSDT")]
    pub symbol: String,
}
