//! Polling keeper that drives a [`LeverageStrategy`].
//!
//! Each tick asks `should_rebalance` what is callable and dispatches it.
//! Precondition errors are expected races (another caller acted first, a
//! cooldown moved) and are logged without counting as failures. A keeper
//! that is not permitted to act stops instead of re-polling.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{KEEPER_ERROR_BACKOFF, KEEPER_MAX_CONSECUTIVE_FAILURES};
use crate::core::strategy::LeverageStrategy;
use crate::errors::{EngineError, ErrorKind};
use crate::types::{Caller, RebalanceOutcome, ShouldRebalance};

pub struct Keeper {
    strategy: Arc<LeverageStrategy>,
    caller: Caller,
    poll_interval: Duration,
    shutdown: CancellationToken,
    consecutive_failures: AtomicU32,
    actions_executed: AtomicU64,
}

/// One decision-and-dispatch cycle.
///
/// Returns `None` when nothing was callable.
pub fn poll_once(
    strategy: &LeverageStrategy,
    caller: &Caller,
) -> Result<Option<RebalanceOutcome>, EngineError> {
    let decision = strategy.should_rebalance()?;
    let outcome = match decision {
        ShouldRebalance::NoAction => return Ok(None),
        ShouldRebalance::Rebalance => strategy.rebalance(caller)?,
        ShouldRebalance::Iterate => strategy.iterate_rebalance(caller)?,
        ShouldRebalance::Ripcord => strategy.ripcord(caller)?,
    };
    Ok(Some(outcome))
}

impl Keeper {
    pub fn new(
        strategy: Arc<LeverageStrategy>,
        caller: Caller,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            strategy,
            caller,
            poll_interval,
            shutdown,
            consecutive_failures: AtomicU32::new(0),
            actions_executed: AtomicU64::new(0),
        }
    }

    pub fn actions_executed(&self) -> u64 {
        self.actions_executed.load(Ordering::Relaxed)
    }

    /// Poll until the shutdown token is cancelled.
    ///
    /// A poisoned strategy or a caller without permission ends the loop
    /// early.
    pub async fn run(&self) -> Result<()> {
        info!(
            caller = %self.caller.address,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "keeper started"
        );

        let mut delay = self.poll_interval;
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!(actions = self.actions_executed(), "keeper shutting down");
                    break;
                }
                () = tokio::time::sleep(delay) => {
                    delay = self.tick().await?;
                }
            }
        }

        Ok(())
    }

    /// Run one poll off the async runtime and return the delay before the
    /// next one.
    async fn tick(&self) -> Result<Duration> {
        let strategy = self.strategy.clone();
        let caller = self.caller;
        let result = tokio::task::spawn_blocking(move || poll_once(&strategy, &caller))
            .await
            .context("keeper poll task panicked")?;

        match result {
            Ok(Some(outcome)) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.actions_executed.fetch_add(1, Ordering::Relaxed);
                info!(
                    action = outcome.action.as_str(),
                    ratio = %outcome.current_leverage_ratio,
                    target_ratio = %outcome.target_leverage_ratio,
                    chunk = %outcome.chunk_notional(),
                    in_twap = outcome.twap.is_active(),
                    "keeper action completed"
                );
                Ok(self.poll_interval)
            }
            Ok(None) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                debug!("nothing to do");
                Ok(self.poll_interval)
            }
            Err(e) => match e.kind() {
                ErrorKind::Precondition => {
                    warn!(error = %e, "keeper action no longer callable, re-polling");
                    Ok(self.poll_interval)
                }
                ErrorKind::Permission => {
                    error!(
                        error = %e,
                        caller = %self.caller.address,
                        "keeper is not permitted, stopping"
                    );
                    bail!("keeper not permitted: {e}");
                }
                ErrorKind::Internal => {
                    error!(error = %e, "strategy is unusable, stopping keeper");
                    bail!("keeper stopped: {e}");
                }
                ErrorKind::Validation | ErrorKind::Market | ErrorKind::Execution => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        error = %e,
                        consecutive_failures = failures,
                        "keeper poll failed"
                    );
                    if failures >= KEEPER_MAX_CONSECUTIVE_FAILURES {
                        error!(
                            "reached {KEEPER_MAX_CONSECUTIVE_FAILURES} consecutive keeper failures, position needs attention"
                        );
                    }
                    Ok(KEEPER_ERROR_BACKOFF)
                }
            },
        }
    }
}
