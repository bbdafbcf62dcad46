//! Streamlet simulator
//!
//! Runs a Streamlet network of in-process replicas for a number of epochs
//! and reports per-epoch progress plus finalized counts per replica.
//! Supports the synchronous driver and the task-per-replica async driver.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use streamlet_consensus::{
    AsyncProtocol, ProtocolConfig, ReplicaId, SimulationReport, StreamletProtocol,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

/// Driver mode
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// All replicas run synchronously in one loop
    Sync,
    /// One tokio task per replica with a round barrier
    Async,
}

/// Streamlet consensus simulator
#[derive(Parser, Debug)]
#[command(name = "streamlet-sim")]
#[command(about = "Simulate Streamlet BFT consensus across in-process replicas", long_about = None)]
struct Args {
    /// Driver mode (sync or async)
    #[arg(long, value_enum, default_value = "sync")]
    mode: Mode,

    /// Number of replicas (overrides the config file)
    #[arg(short = 'n', long)]
    replicas: Option<usize>,

    /// Epochs to simulate
    #[arg(long, default_value = "6")]
    epochs: u64,

    /// Synthetic transactions per epoch
    #[arg(long, default_value = "3")]
    tx_per_epoch: usize,

    /// Do not relay votes between replicas
    #[arg(long)]
    no_relay_votes: bool,

    /// Round timeout for the async driver in milliseconds
    #[arg(long)]
    round_timeout_ms: Option<u64>,

    /// Replica ids that stay silent (repeatable)
    #[arg(long)]
    silent: Vec<ReplicaId>,

    /// Replica ids whose proposals are misattributed (repeatable)
    #[arg(long)]
    misattribute: Vec<ReplicaId>,

    /// JSON file with a protocol configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the full report as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (protocol_config, simulation) = config::resolve(&args)?;

    tracing::info!("Starting Streamlet simulation - {:?} mode", args.mode);
    tracing::info!("  Replicas: {}", protocol_config.replicas);
    tracing::info!("  Epochs: {}", simulation.epochs);
    tracing::info!("  Transactions per epoch: {}", simulation.transactions_per_epoch);
    if !protocol_config.faults.is_empty() {
        tracing::info!("  Faults: {:?}", protocol_config.faults);
    }

    let report = match args.mode {
        Mode::Sync => run_sync(
            protocol_config,
            simulation.epochs,
            simulation.transactions_per_epoch,
        )?,
        Mode::Async => {
            run_async(
                protocol_config,
                simulation.epochs,
                simulation.transactions_per_epoch,
            )
            .await?
        }
    };

    if args.json {
        println!("{}", report.to_json()?);
    }

    Ok(())
}

fn run_sync(
    config: ProtocolConfig,
    epochs: u64,
    tx_per_epoch: usize,
) -> Result<SimulationReport> {
    let mut protocol = StreamletProtocol::new(config)?;
    Ok(protocol.run_simulation(epochs, tx_per_epoch))
}

async fn run_async(
    config: ProtocolConfig,
    epochs: u64,
    tx_per_epoch: usize,
) -> Result<SimulationReport> {
    let protocol = AsyncProtocol::spawn(config)?;

    let report = tokio::select! {
        report = protocol.run_simulation(epochs, tx_per_epoch) => report,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping replicas...");
            let votes_cast = protocol.votes_cast();
            let stats = protocol.shutdown().await;
            return Ok(SimulationReport::new(Vec::new(), stats, votes_cast));
        }
    };

    protocol.shutdown().await;
    tracing::info!("Simulation complete");
    Ok(report)
}
