use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use leverage_rebalancer::config::{self, KeeperConfig};
use leverage_rebalancer::constants::DEFAULT_CONFIG_DIR;
use leverage_rebalancer::core::access::AccessPolicy;
use leverage_rebalancer::core::clock::SystemClock;
use leverage_rebalancer::core::incentive::IncentiveSettlement;
use leverage_rebalancer::core::keeper::Keeper;
use leverage_rebalancer::core::strategy::LeverageStrategy;
use leverage_rebalancer::execution::exchange::ExchangeGateway;
use leverage_rebalancer::execution::market::MarketDataSource;
use leverage_rebalancer::execution::paper::PaperVenue;
use leverage_rebalancer::logging;
use leverage_rebalancer::types::{Caller, ExchangeId};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignore if missing).
    let _ = dotenvy::dotenv();

    let config_dir = std::env::var("REBALANCER_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR));

    let config = config::load_config(&config_dir)?;

    // Hold the guard for the process lifetime.
    let _guard = logging::init_tracing(&config.app.logging)?;

    info!(
        config_dir = %config_dir.display(),
        exchange = %config.policy.execution.exchange,
        poll_interval_seconds = config.keeper.poll_interval_seconds,
        "leverage rebalancer starting"
    );

    // -----------------------------------------------------------------------
    // Addresses
    // -----------------------------------------------------------------------

    let (keeper_address, operator, allowed_callers) = parse_addresses(&config.keeper)?;

    // -----------------------------------------------------------------------
    // Component construction
    // -----------------------------------------------------------------------

    let venue = Arc::new(
        PaperVenue::from_config(&config.keeper.paper).context("failed to seed paper venue")?,
    );
    let gateway = ExchangeGateway::new().with_adapter(ExchangeId::Paper, venue.clone());

    let access = AccessPolicy::new(operator)
        .with_allowed_callers(allowed_callers)
        .with_anyone_callable(config.keeper.anyone_callable);

    let incentives = Arc::new(IncentiveSettlement::new(config.keeper.reward_pool_balance));

    let strategy = Arc::new(
        LeverageStrategy::new(
            config.policy.clone(),
            venue.clone(),
            gateway,
            access,
            incentives,
            Arc::new(SystemClock),
        )
        .context("failed to build leverage strategy")?,
    );

    // A fresh paper position has no debt; lever it up so the keeper has
    // something to maintain.
    if venue.borrow_balance()?.is_zero() {
        match strategy.engage(&Caller::eoa(operator)) {
            Ok(outcome) => info!(
                chunk = %outcome.chunk_notional(),
                in_twap = outcome.twap.is_active(),
                "paper position engaged"
            ),
            Err(e) => warn!(error = %e, "failed to engage paper position"),
        }
    }

    info!("all components initialized");

    // -----------------------------------------------------------------------
    // Runtime
    // -----------------------------------------------------------------------

    let shutdown = CancellationToken::new();
    let keeper = Keeper::new(
        strategy.clone(),
        Caller::eoa(keeper_address),
        Duration::from_secs(config.keeper.poll_interval_seconds),
        shutdown.clone(),
    );

    let keeper_handle = tokio::spawn(async move {
        if let Err(e) = keeper.run().await {
            error!(error = %e, "keeper exited with error");
        }
    });

    info!("keeper running, press Ctrl+C to shutdown");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    info!("shutdown signal received, stopping gracefully...");
    shutdown.cancel();

    if let Err(e) = keeper_handle.await {
        error!(error = %e, "keeper task panicked");
    }

    match strategy.current_leverage_ratio() {
        Ok(ratio) => info!(%ratio, "final leverage ratio"),
        Err(e) => warn!(error = %e, "could not read final leverage ratio"),
    }

    info!("shutdown complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Initialization helpers
// ---------------------------------------------------------------------------

/// Parse the keeper, operator and allowlisted addresses from config.
fn parse_addresses(keeper: &KeeperConfig) -> Result<(Address, Address, Vec<Address>)> {
    let keeper_address = keeper
        .address
        .parse::<Address>()
        .context("failed to parse keeper.address")?;
    let operator = keeper
        .operator
        .parse::<Address>()
        .context("failed to parse keeper.operator")?;
    let allowed_callers = keeper
        .allowed_callers
        .iter()
        .map(|a| {
            a.parse::<Address>()
                .with_context(|| format!("failed to parse allowed caller {a}"))
        })
        .collect::<Result<Vec<_>>>()?;

    info!(
        keeper = %keeper_address,
        %operator,
        allowed = allowed_callers.len(),
        "addresses initialized"
    );

    Ok((keeper_address, operator, allowed_callers))
}
