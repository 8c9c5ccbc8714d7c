use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tradepool::config::AppConfig;
use tradepool::logging::init_logging;
use tradepool::{
    Agent, ConstraintIndex, Credentials, Pool, PoolSettings, SimulatedTransport, UserId,
};

/// Dry run: a pool of simulated agents, served until ctrl-c
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        anyhow::bail!("invalid configuration ({} errors)", errors.len());
    }
    let _log_guard = init_logging(&config.logging);

    let agents: u32 = std::env::var("TRADEPOOL_DRY_RUN_AGENTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);

    let pool = Pool::new(PoolSettings::from_config(&config.pool));
    let constraints = ConstraintIndex::new();
    for n in 1..=agents {
        let user = UserId::from_account_id(n);
        let mut transport = SimulatedTransport::new(user);
        for game in &pool.settings().prefetch_games {
            transport = transport.with_inventory(game.id, 10);
        }
        let agent = Agent::builder(Credentials::new(format!("dry-run-{}", n), ""), Arc::new(transport))
            .id(user)
            .build(&constraints)?;
        pool.add(&agent)?;
    }

    let report = pool.startup().await;
    info!(
        "Dry run pool up: {} ready, {} failed",
        report.ready.len(),
        report.failed.len()
    );
    for (id, error) in &report.failed {
        warn!("Agent {} failed to start: {}", id, error);
    }

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    pool.shutdown().await;
    Ok(())
}
