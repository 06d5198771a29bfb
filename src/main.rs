//! Command line front end for the setup engine.
//!
//! Results are printed to stdout as pretty JSON; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, Level};

use spx_setup_optimizer::backtest::BacktestSource;
use spx_setup_optimizer::bars::ResolutionRequest;
use spx_setup_optimizer::calendar::parse_range;
use spx_setup_optimizer::{
    BacktestRequest, EngineBuilder, EngineConfig, ScanRequest, SetupEngine, SetupInstance, TransitionEvent,
};

/// SPX setup outcome tracking, backtesting and threshold optimization.
#[derive(Parser, Debug)]
#[command(name = "spx-setup-optimizer")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Database URL (overrides SPX_DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay stored setups against historical bars
    Backtest(BacktestArgs),

    /// Run a walk-forward optimizer scan and persist the result
    Scan(ScanArgs),

    /// Win-rate analytics over stored outcomes
    Analytics(RangeArgs),

    /// Print the active optimization profile
    Profile,

    /// Print the last scorecard
    Scorecard,

    /// Persist setup snapshots from a JSON array file
    Resolve(FileArgs),

    /// Apply lifecycle transitions from a JSON array file
    Transitions(FileArgs),
}

#[derive(Args, Debug)]
struct RangeArgs {
    /// First session date (YYYY-MM-DD)
    #[arg(long)]
    from: String,
    /// Last session date (YYYY-MM-DD)
    #[arg(long)]
    to: String,
}

#[derive(Args, Debug)]
struct BacktestArgs {
    #[command(flatten)]
    range: RangeArgs,
    /// Bar resolution: second or minute
    #[arg(long, default_value = "second")]
    resolution: String,
    /// Setup source: setup_instances (auto is an alias)
    #[arg(long, default_value = "setup_instances")]
    source: String,
    #[arg(long)]
    include_blocked_setups: bool,
    #[arg(long)]
    include_hidden_tiers: bool,
    #[arg(long)]
    include_paused_setups: bool,
    /// Include per-setup rows in the output
    #[arg(long)]
    include_rows: bool,
    /// Write replayed outcomes back to the store
    #[arg(long)]
    persist: bool,
}

#[derive(Args, Debug)]
struct ScanArgs {
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    /// Scan mode: manual or weekly_auto
    #[arg(long)]
    mode: Option<String>,
}

#[derive(Args, Debug)]
struct FileArgs {
    /// Path to a JSON file
    #[arg(long)]
    file: PathBuf,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{rendered}");
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn backtest_request(args: &BacktestArgs) -> Result<BacktestRequest> {
    let mut request = BacktestRequest::new(parse_range(&args.range.from, &args.range.to)?);
    request.resolution = args.resolution.parse::<ResolutionRequest>()?;
    request.source = args.source.parse::<BacktestSource>()?;
    request.include_blocked_setups = args.include_blocked_setups;
    request.include_hidden_tiers = args.include_hidden_tiers;
    request.include_paused_setups = args.include_paused_setups;
    request.include_rows = args.include_rows;
    request.persist_results = args.persist;
    Ok(request)
}

async fn execute(engine: &SetupEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Backtest(args) => {
            let request = backtest_request(&args)?;
            print_json(&engine.run_backtest(&request).await?)
        }
        Commands::Scan(args) => {
            let request = ScanRequest::parse(args.from.as_deref(), args.to.as_deref(), args.mode.as_deref())?;
            print_json(&engine.run_optimizer_scan(request).await?)
        }
        Commands::Analytics(args) => print_json(&engine.get_win_rate_analytics(&args.from, &args.to).await?),
        Commands::Profile => print_json(&engine.get_active_profile().await),
        Commands::Scorecard => print_json(&engine.get_scorecard().await),
        Commands::Resolve(args) => {
            let setups: Vec<SetupInstance> = read_json(&args.file).await?;
            print_json(&engine.resolve_outcomes(&setups).await)
        }
        Commands::Transitions(args) => {
            let events: Vec<TransitionEvent> = read_json(&args.file).await?;
            print_json(&engine.apply_transitions(&events).await)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut builder = EngineBuilder::from_config(EngineConfig::from_env());
    if let Some(url) = cli.database_url {
        builder = builder.with_database_url(url);
    }
    let engine = builder.build().await?;

    let result = execute(&engine, cli.command).await;
    engine.close().await;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    info!("Starting spx-setup-optimizer");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
