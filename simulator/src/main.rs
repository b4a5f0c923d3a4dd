//! Bridge-Me-Not Simulator
//!
//! Runs several resolver instances against one shared coordination store and
//! an in-memory chain pair, exercising lock contention, crash recovery and
//! cancellation.

use std::time::Duration;

use alloy_primitives::{address, Address, B256};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bridgemenot_common::SwapStatus;
use bridgemenot_coordinator::ResolverConfig;

mod scenario;
mod controller;

use controller::SimulationController;
use scenario::Scenario;

const SIM_FACTORY: Address = address!("a7bcb4eac8964306f9e3764f67db6a7af6ddf99a");
const SIM_ORDER_PROTOCOL: Address = address!("111111125421ca6dc452d289314280a0f8842a65");
const SIM_RESOLVER: Address = address!("00000000000000000000000000000000000000dd");

/// Bridge-Me-Not Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Multi-instance resolver simulation")]
struct Args {
    /// Number of resolver instances sharing the store
    #[arg(short, long, default_value = "3")]
    resolvers: usize,

    /// Scenario to run: contention, crash-recovery or cancellation
    #[arg(short, long, default_value = "contention")]
    scenario: String,

    /// Number of swaps the scenario commits
    #[arg(long, default_value = "5")]
    swaps: usize,

    /// Simulated confirmation latency per chain action (ms)
    #[arg(long, default_value = "20")]
    chain_latency_ms: u64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Print metrics in Prometheus text format
    #[arg(long)]
    prometheus: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = simulation_config();
    config.validate().map_err(anyhow::Error::msg)?;

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
    );
    if config.log_json {
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

    info!("Starting Bridge-Me-Not Simulator");
    info!("Resolvers: {}", args.resolvers);

    let scenario = Scenario::load(&args.scenario, args.swaps)?;
    let mut controller = SimulationController::new(
        config,
        args.resolvers,
        Duration::from_millis(args.chain_latency_ms),
        args.seed,
    )
    .await?;

    let outcome = controller.run_scenario(scenario).await;

    let (snapshot, rollups) = controller.shutdown().await?;

    info!("Simulation complete");
    info!("Steps attempted: {}", snapshot.steps);
    info!("Successful: {}", snapshot.steps - snapshot.failed_steps);
    info!("Failed: {}", snapshot.failed_steps);
    for (code, count) in &snapshot.step_errors {
        info!("  {}: {}", code, count);
    }
    for rollup in rollups.iter().filter(|r| r.operation.starts_with("step_")) {
        info!(
            "{}: {} runs, {} failed, mean {}ms, max {}ms",
            rollup.operation,
            rollup.count,
            rollup.failures,
            rollup.mean_duration_ms(),
            rollup.max_duration_ms
        );
    }
    info!("Swaps completed: {}", snapshot.transitions_to(SwapStatus::Completed));
    info!("Swaps cancelled: {}", snapshot.transitions_to(SwapStatus::Cancelled));
    info!(
        "Locks acquired: {} (contended {}, taken over {})",
        snapshot.locks_acquired, snapshot.lock_contention, snapshot.lock_takeovers
    );
    if args.prometheus {
        println!("{}", snapshot.to_prometheus());
    }

    outcome
}

/// Environment configuration with simulation contract addresses filled in.
fn simulation_config() -> ResolverConfig {
    let mut config = ResolverConfig::from_env();
    if config.resolver_address == Address::ZERO {
        config.resolver_address = SIM_RESOLVER;
    }
    if config.escrow_factory == Address::ZERO {
        config.escrow_factory = SIM_FACTORY;
    }
    if config.order_protocol == Address::ZERO {
        config.order_protocol = SIM_ORDER_PROTOCOL;
    }
    if config.proxy_bytecode_hash == B256::ZERO {
        config.proxy_bytecode_hash = B256::repeat_byte(0xbc);
    }
    config
}
