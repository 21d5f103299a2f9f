//! # Template Miner Entry Point
//!
//! One invocation is one run; an external scheduler (a Kubernetes CronJob)
//! provides the cadence.
//!
//! Usage:
//!   template-miner [run] [--replay FILE]
//!   template-miner show
//!   template-miner reset

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;

use miner::config::MinerConfig;
use miner::error::MinerError;
use miner::job::{open_store, Job};

#[derive(Parser)]
#[command(name = "template-miner")]
#[command(about = "Mine log templates from Loki and forward occurrences", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one mining pass (default)
    Run {
        /// Read entries from a `logcli --output jsonl` capture instead of Loki
        #[arg(long)]
        replay: Option<PathBuf>,
    },

    /// Print the persisted cursor and clusters
    Show,

    /// Delete the persisted state; the next run starts fresh
    Reset,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match MinerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run { replay: None }) {
        Commands::Run { replay } => run(&config, replay),
        Commands::Show => show(&config),
        Commands::Reset => reset(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if !e.is_fatal() => {
            warn!("{}", e);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: &MinerConfig, replay: Option<PathBuf>) -> Result<(), MinerError> {
    info!(
        "Template miner: source={} query={} limit={} state={} sink={}",
        replay
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| config.loki_url.clone()),
        config.loki_query,
        config.loki_limit,
        config.state_backend_url,
        config.sink_url
    );

    let job = Job::from_config(config, replay.as_deref())?;
    match job.run_once() {
        Err(MinerError::LockContention { lock }) => {
            info!("Another run holds '{}'; nothing to do", lock);
            Ok(())
        }
        other => other.map(|_| ()),
    }
}

fn show(config: &MinerConfig) -> Result<(), MinerError> {
    let store = open_store(config)?;
    let loaded = store.load()?;

    println!("State '{}' ({})", store.key(), loaded.origin);
    println!("  - Cursor: {}", loaded.state.cursor);
    println!("  - Clusters: {}", loaded.state.tree.len());
    println!();
    for cluster in loaded.state.tree.clusters() {
        println!(
            "  ID={:<6} size={:<8} {}",
            cluster.id(),
            cluster.size(),
            cluster.template_string()
        );
    }
    Ok(())
}

fn reset(config: &MinerConfig) -> Result<(), MinerError> {
    let store = open_store(config)?;
    let lease = store.acquire_lock(config.run_lock_ttl)?;
    let result = store.reset();
    store.release_lock(lease)?;

    if result? {
        info!("Deleted state '{}'", store.key());
    } else {
        info!("No state stored under '{}'", store.key());
    }
    Ok(())
}
