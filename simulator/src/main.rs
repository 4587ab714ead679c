//! CryptoLedger Simulator
//!
//! Runs settlement scenarios and concurrent-approval stress runs.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cryptoledger_ledger::{MemoryStore, PgStore, SettlementStore};
use cryptoledger_settlement::EngineConfig;

mod accounts;
mod controller;
mod metrics;
mod scenario;

use controller::SimulationController;
use scenario::Scenario;

/// CryptoLedger Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Settlement scenarios and stress runs for the crypto ledger")]
struct Args {
    /// Number of simulated customers to create
    #[arg(short, long, default_value = "3")]
    users: usize,

    /// Scenario to run: a built-in name, `all`, or a path to a JSON scenario
    #[arg(short, long)]
    scenario: Option<String>,

    /// Transactions to submit in a stress run
    #[arg(long, default_value = "200")]
    transactions: usize,

    /// Concurrent deciders per transaction in a stress run
    #[arg(long, default_value = "4")]
    approvers: usize,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn open_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn SettlementStore>> {
    match &config.database_url {
        Some(url) => {
            info!("Using PostgreSQL store");
            let store = PgStore::connect(url, config.store_timeout).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        None => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();

    info!("Starting CryptoLedger Simulator");

    let config = EngineConfig::from_env().map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }
    info!(
        fee_rate = %config.withdrawal_fee_rate,
        store_timeout_ms = config.store_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let store = open_store(&config).await?;
    let controller = SimulationController::new(store, config, args.users, args.seed);
    controller.initialize().await?;

    match args.scenario.as_deref() {
        Some("all") => {
            for scenario in Scenario::all() {
                controller.run_scenario(&scenario).await?;
            }
        }
        Some(name) => {
            let scenario = Scenario::load(name)?;
            controller.run_scenario(&scenario).await?;
        }
        None => {
            let report = controller.run_stress(args.transactions, args.approvers).await?;
            info!(
                transactions = report.transactions,
                completed = report.completed,
                cancelled = report.cancelled,
                pending = report.pending,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Stress run complete"
            );
            let metrics = controller.metrics().await;
            info!("Throughput: {:.0} decisions/s", metrics.throughput(report.elapsed));
        }
    }

    let metrics = controller.metrics().await;
    let engine = controller.engine().metrics().snapshot();
    let stats = controller.reports().stats().await?;

    info!("Simulation complete");
    info!("Decisions: {}", metrics.total_decisions);
    info!("Successful: {}", metrics.successful_decisions);
    info!("Lost races: {}", metrics.lost_races);
    info!("Insufficient funds: {}", metrics.insufficient);
    info!("Other failures: {}", metrics.failed_decisions);
    info!("Average latency: {}µs (p99 {}µs)", metrics.average_latency_us(), metrics.p99_latency_us());
    info!("Engine counters: {}", serde_json::to_string(&engine)?);
    info!(
        "Volume: pending {} / completed {} / cancelled {} (total {})",
        stats.pending.volume,
        stats.completed.volume,
        stats.cancelled.volume,
        stats.total_volume()
    );

    Ok(())
}
