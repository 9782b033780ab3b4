//! Rebalancing state machine for one leveraged position.
//!
//! `LeverageStrategy` decides whether a keeper may act, sizes the next chunk
//! and commits the cooldown/TWAP state once the exchange confirms the trade.
//! Five actions mutate state:
//! - `engage`: operator levers a debt-free position toward target
//! - `rebalance`: keeper recenters an idle position when the interval has
//!   elapsed or the ratio left the band
//! - `iterate_rebalance`: keeper trades the next chunk of a TWAP sequence
//! - `ripcord`: anyone delevers a position above the incentivized ratio for a
//!   bounty
//! - `disengage`: operator unwinds toward 1.0x
//!
//! Every call holds one lock for its whole duration, exchange call included.
//! A second call on the same position, reentrant or concurrent, is rejected
//! with `OperationInProgress` rather than queued.

use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use alloy::primitives::Address;
use tracing::{debug, info, warn};

use crate::config::{ExecutionSettings, IncentiveSettings, MethodologySettings, PolicyConfig};
use crate::constants::CHUNK_ROUNDING_DUST;
use crate::core::access::{AccessPolicy, OperatorRole};
use crate::core::clock::Clock;
use crate::core::incentive::IncentiveSettlement;
use crate::core::leverage_math::{
    borrow_units_for_collateral, calculate_new_leverage_ratio,
    collateral_units_for_leverage_change, current_leverage_ratio, max_borrow_capacity,
    max_redeem_to_zero_debt, BorrowCapacityInputs,
};
use crate::errors::EngineError;
use crate::execution::exchange::{minimum_receive, ExchangeGateway};
use crate::execution::market::{capture_snapshot, MarketDataSource};
use crate::types::{
    ActionKind, Caller, ChunkPlan, MarketSnapshot, RebalanceOutcome, RebalanceState,
    ShouldRebalance, TradeDirection, TradeKind, TradeRequest, TwapStatus, Wad,
};

struct Inner {
    config: PolicyConfig,
    state: RebalanceState,
    access: AccessPolicy,
}

/// Market readings and the ratio derived from them, captured once per call.
#[derive(Debug, Clone, Copy)]
struct LeverageInfo {
    snapshot: MarketSnapshot,
    collateral_value: Wad,
    borrow_value: Wad,
    current_leverage_ratio: Wad,
}

impl LeverageInfo {
    fn from_snapshot(snapshot: MarketSnapshot) -> Result<Self, EngineError> {
        let collateral_value = snapshot.collateral_value()?;
        let borrow_value = snapshot.borrow_value()?;
        let current_leverage_ratio = if snapshot.has_debt() {
            current_leverage_ratio(collateral_value, borrow_value)?
        } else {
            Wad::ONE
        };
        Ok(Self {
            snapshot,
            collateral_value,
            borrow_value,
            current_leverage_ratio,
        })
    }

    /// Debt and supply must both exist for any keeper action.
    fn require_open_position(&self) -> Result<(), EngineError> {
        if !self.snapshot.has_debt() {
            return Err(EngineError::BorrowBalanceMustExist);
        }
        if self.snapshot.total_supply.is_zero() {
            return Err(EngineError::ZeroSupply);
        }
        Ok(())
    }

    fn capacity_inputs(&self, execution: &ExecutionSettings) -> BorrowCapacityInputs {
        BorrowCapacityInputs {
            collateral_units: self.snapshot.collateral_balance,
            collateral_value: self.collateral_value,
            collateral_price: self.snapshot.collateral_price,
            collateral_factor: self.snapshot.collateral_factor,
            borrow_value: self.borrow_value,
            unutilized_leverage_percentage: execution.unutilized_leverage_percentage,
        }
    }

    fn outside_band(&self, min: Wad, max: Wad) -> bool {
        self.current_leverage_ratio < min || self.current_leverage_ratio > max
    }
}

/// Size the chunk that moves `info` toward `new_ratio`.
///
/// `None` when there is nothing to trade. A non-zero move with no room under
/// the borrow limit fails with `NoBorrowCapacity`. A move within
/// [`CHUNK_ROUNDING_DUST`] of `max_trade_size` is not split.
fn plan_chunk(
    info: &LeverageInfo,
    execution: &ExecutionSettings,
    new_ratio: Wad,
    max_trade_size: Wad,
) -> Result<Option<ChunkPlan>, EngineError> {
    let delta = collateral_units_for_leverage_change(
        info.current_leverage_ratio,
        new_ratio,
        info.snapshot.collateral_balance,
        info.snapshot.total_supply,
    )?;
    if delta.total_units.is_zero() {
        return Ok(None);
    }

    let capacity = max_borrow_capacity(delta.direction, &info.capacity_inputs(execution))?;
    let size_cap = if delta.total_units <= max_trade_size.checked_add(CHUNK_ROUNDING_DUST)? {
        delta.total_units
    } else {
        max_trade_size
    };
    let chunk = delta.total_units.min(size_cap).min(capacity);
    if chunk.is_zero() {
        warn!(
            direction = delta.direction.as_str(),
            total = %delta.total_units,
            "no borrow capacity for rebalance"
        );
        return Err(EngineError::NoBorrowCapacity(delta.direction.as_str()));
    }

    Ok(Some(ChunkPlan::new(delta.direction, chunk, delta.total_units)))
}

/// Has the ratio reached the frozen TWAP target on its own?
///
/// A lever sequence has converged once the ratio is at or above target, a
/// delever sequence once it is at or below. `tolerance` widens both.
fn twap_converged(
    current: Wad,
    target: Wad,
    direction: TradeDirection,
    tolerance: Wad,
) -> Result<bool, EngineError> {
    Ok(match direction {
        TradeDirection::Lever => current.checked_add(tolerance)? >= target,
        TradeDirection::Delever => current <= target.checked_add(tolerance)?,
    })
}

fn twap_after(plan: &ChunkPlan, target: Wad) -> TwapStatus {
    if plan.is_capped() {
        TwapStatus::InTwap {
            target,
            direction: plan.direction,
        }
    } else {
        TwapStatus::Idle
    }
}

pub struct LeverageStrategy {
    inner: Mutex<Inner>,
    market: Arc<dyn MarketDataSource>,
    gateway: ExchangeGateway,
    incentives: Arc<IncentiveSettlement>,
    clock: Arc<dyn Clock>,
}

impl LeverageStrategy {
    /// Build a strategy with idle state. The policy is validated and its
    /// exchange must be registered in `gateway`.
    pub fn new(
        config: PolicyConfig,
        market: Arc<dyn MarketDataSource>,
        gateway: ExchangeGateway,
        access: AccessPolicy,
        incentives: Arc<IncentiveSettlement>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        gateway.ensure_registered(config.execution.exchange)?;

        info!(
            target_ratio = %config.methodology.target_leverage_ratio,
            min = %config.methodology.min_leverage_ratio,
            max = %config.methodology.max_leverage_ratio,
            incentivized = %config.incentive.incentivized_leverage_ratio,
            exchange = %config.execution.exchange,
            "leverage strategy initialised"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                config,
                state: RebalanceState::default(),
                access,
            }),
            market,
            gateway,
            incentives,
            clock,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, EngineError> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => {
                warn!("rejected call: another operation holds the position lock");
                Err(EngineError::OperationInProgress)
            }
            Err(TryLockError::Poisoned(_)) => Err(EngineError::StatePoisoned),
        }
    }

    fn leverage_info(&self) -> Result<LeverageInfo, EngineError> {
        LeverageInfo::from_snapshot(capture_snapshot(self.market.as_ref())?)
    }

    // -----------------------------------------------------------------------
    // Trade execution
    // -----------------------------------------------------------------------

    fn execute_chunk(
        &self,
        execution: &ExecutionSettings,
        info: &LeverageInfo,
        plan: &ChunkPlan,
        slippage_tolerance: Wad,
    ) -> Result<Wad, EngineError> {
        let borrow_units = borrow_units_for_collateral(
            plan.chunk_notional,
            info.snapshot.collateral_price,
            info.snapshot.borrow_price,
        )?;

        let request = match plan.direction {
            TradeDirection::Lever => TradeRequest {
                kind: TradeKind::Lever,
                send_quantity: borrow_units,
                min_receive_quantity: minimum_receive(plan.chunk_notional, slippage_tolerance)?,
                data: execution.lever_exchange_data.clone(),
            },
            TradeDirection::Delever => TradeRequest {
                kind: TradeKind::Delever,
                send_quantity: plan.chunk_notional,
                min_receive_quantity: minimum_receive(borrow_units, slippage_tolerance)?,
                data: execution.delever_exchange_data.clone(),
            },
        };

        self.gateway.execute(execution.exchange, &request)
    }

    /// Redeem enough collateral to repay all debt in one trade.
    fn execute_delever_to_zero(
        &self,
        execution: &ExecutionSettings,
        info: &LeverageInfo,
    ) -> Result<(ChunkPlan, Wad), EngineError> {
        let redeem = max_redeem_to_zero_debt(
            info.current_leverage_ratio,
            info.snapshot.collateral_balance,
            info.snapshot.total_supply,
            execution.slippage_tolerance,
        )?;

        let request = TradeRequest {
            kind: TradeKind::DeleverToZeroBorrowBalance,
            send_quantity: redeem.total_units,
            min_receive_quantity: info.snapshot.borrow_balance,
            data: execution.delever_exchange_data.clone(),
        };
        let received = self.gateway.execute(execution.exchange, &request)?;

        let plan = ChunkPlan::new(TradeDirection::Delever, redeem.total_units, redeem.total_units);
        Ok((plan, received))
    }

    /// Size and trade one chunk toward `new_ratio`, then commit state.
    ///
    /// Nothing is written unless the exchange call succeeds. A zero-sized
    /// move still stamps the trade timestamp.
    fn rebalance_toward(
        &self,
        inner: &mut Inner,
        info: &LeverageInfo,
        action: ActionKind,
        new_ratio: Wad,
        max_trade_size: Wad,
        slippage_tolerance: Wad,
        now: u64,
    ) -> Result<RebalanceOutcome, EngineError> {
        let execution = &inner.config.execution;
        let plan = plan_chunk(info, execution, new_ratio, max_trade_size)?;

        let Some(plan) = plan else {
            inner.state = RebalanceState {
                last_trade_timestamp: now,
                twap: TwapStatus::Idle,
            };
            info!(
                action = action.as_str(),
                ratio = %info.current_leverage_ratio,
                "ratio within bounds, no trade required"
            );
            return Ok(RebalanceOutcome {
                action,
                current_leverage_ratio: info.current_leverage_ratio,
                target_leverage_ratio: new_ratio,
                plan: None,
                received: Wad::ZERO,
                twap: TwapStatus::Idle,
                reward_paid: None,
            });
        };

        let received = self.execute_chunk(execution, info, &plan, slippage_tolerance)?;

        let twap = twap_after(&plan, new_ratio);
        inner.state = RebalanceState {
            last_trade_timestamp: now,
            twap,
        };

        info!(
            action = action.as_str(),
            direction = plan.direction.as_str(),
            current = %info.current_leverage_ratio,
            new = %new_ratio,
            chunk = %plan.chunk_notional,
            total = %plan.total_notional,
            %received,
            in_twap = twap.is_active(),
            "rebalance executed"
        );

        Ok(RebalanceOutcome {
            action,
            current_leverage_ratio: info.current_leverage_ratio,
            target_leverage_ratio: new_ratio,
            plan: Some(plan),
            received,
            twap,
            reward_paid: None,
        })
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Lever a debt-free position from 1.0x toward the target ratio.
    pub fn engage(&self, caller: &Caller) -> Result<RebalanceOutcome, EngineError> {
        let mut inner = self.lock()?;
        inner.access.authorize_operator(caller.address)?;

        let snapshot = capture_snapshot(self.market.as_ref())?;
        if snapshot.has_debt() {
            return Err(EngineError::DebtMustBeZero);
        }
        if snapshot.total_supply.is_zero() {
            return Err(EngineError::ZeroSupply);
        }
        if snapshot.collateral_balance.is_zero() {
            return Err(EngineError::ZeroCollateral);
        }

        let info = LeverageInfo::from_snapshot(snapshot)?;
        let now = self.clock.now();
        let target = inner.config.methodology.target_leverage_ratio;
        let execution = inner.config.execution.clone();

        info!(caller = %caller.address, target_ratio = %target, "engaging position");
        self.rebalance_toward(
            &mut inner,
            &info,
            ActionKind::Engage,
            target,
            execution.twap_max_trade_size,
            execution.slippage_tolerance,
            now,
        )
    }

    /// Unwind toward 1.0x. Repays all debt in one trade when the remaining
    /// move fits in a chunk, otherwise starts a delever TWAP toward 1.0x.
    pub fn disengage(&self, caller: &Caller) -> Result<RebalanceOutcome, EngineError> {
        let mut inner = self.lock()?;
        inner.access.authorize_operator(caller.address)?;

        let info = self.leverage_info()?;
        info.require_open_position()?;

        let now = self.clock.now();
        let execution = inner.config.execution.clone();
        let plan = plan_chunk(&info, &execution, Wad::ONE, execution.twap_max_trade_size)?;

        info!(
            caller = %caller.address,
            ratio = %info.current_leverage_ratio,
            "disengaging position"
        );

        match plan {
            Some(plan) if plan.is_capped() => {
                let received = self.execute_chunk(&execution, &info, &plan, execution.slippage_tolerance)?;
                let twap = twap_after(&plan, Wad::ONE);
                inner.state = RebalanceState {
                    last_trade_timestamp: now,
                    twap,
                };
                info!(
                    chunk = %plan.chunk_notional,
                    total = %plan.total_notional,
                    %received,
                    "disengage chunk executed, TWAP toward 1.0x started"
                );
                Ok(RebalanceOutcome {
                    action: ActionKind::Disengage,
                    current_leverage_ratio: info.current_leverage_ratio,
                    target_leverage_ratio: Wad::ONE,
                    plan: Some(plan),
                    received,
                    twap,
                    reward_paid: None,
                })
            }
            _ => {
                let (plan, received) = self.execute_delever_to_zero(&execution, &info)?;
                inner.state = RebalanceState {
                    last_trade_timestamp: now,
                    twap: TwapStatus::Idle,
                };
                info!(
                    redeemed = %plan.chunk_notional,
                    %received,
                    repaid = %info.snapshot.borrow_balance,
                    "position fully delevered"
                );
                Ok(RebalanceOutcome {
                    action: ActionKind::Disengage,
                    current_leverage_ratio: info.current_leverage_ratio,
                    target_leverage_ratio: Wad::ONE,
                    plan: Some(plan),
                    received,
                    twap: TwapStatus::Idle,
                    reward_paid: None,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Keeper actions
    // -----------------------------------------------------------------------

    /// Recenter an idle position.
    pub fn rebalance(&self, caller: &Caller) -> Result<RebalanceOutcome, EngineError> {
        let mut inner = self.lock()?;
        inner.access.check_keeper(caller)?;

        let info = self.leverage_info()?;
        info.require_open_position()?;

        let incentivized = inner.config.incentive.incentivized_leverage_ratio;
        if info.current_leverage_ratio >= incentivized {
            return Err(EngineError::MustCallRipcord {
                current: info.current_leverage_ratio,
                incentivized,
            });
        }
        if inner.state.twap.is_active() {
            return Err(EngineError::MustCallIterate);
        }

        let now = self.clock.now();
        let methodology = inner.config.methodology.clone();
        let interval_elapsed = inner.state.elapsed(now) >= methodology.rebalance_interval;
        if !interval_elapsed
            && !info.outside_band(methodology.min_leverage_ratio, methodology.max_leverage_ratio)
        {
            return Err(EngineError::CooldownOrInvalidRatio(info.current_leverage_ratio));
        }

        let new_ratio = calculate_new_leverage_ratio(info.current_leverage_ratio, &methodology)?;
        let execution = inner.config.execution.clone();
        self.rebalance_toward(
            &mut inner,
            &info,
            ActionKind::Rebalance,
            new_ratio,
            execution.twap_max_trade_size,
            execution.slippage_tolerance,
            now,
        )
    }

    /// Trade the next chunk of an in-flight TWAP sequence toward its frozen
    /// target, or close the sequence if the market already got there.
    pub fn iterate_rebalance(&self, caller: &Caller) -> Result<RebalanceOutcome, EngineError> {
        let mut inner = self.lock()?;
        inner.access.check_keeper(caller)?;

        let info = self.leverage_info()?;
        info.require_open_position()?;

        let incentivized = inner.config.incentive.incentivized_leverage_ratio;
        if info.current_leverage_ratio >= incentivized {
            return Err(EngineError::MustCallRipcord {
                current: info.current_leverage_ratio,
                incentivized,
            });
        }

        let TwapStatus::InTwap { target, direction } = inner.state.twap else {
            return Err(EngineError::NotInTwap);
        };

        let now = self.clock.now();
        let execution = inner.config.execution.clone();
        let elapsed = inner.state.elapsed(now);
        if elapsed < execution.twap_cooldown_period {
            return Err(EngineError::CooldownNotElapsed {
                remaining: execution.twap_cooldown_period - elapsed,
            });
        }

        // An unwind toward 1.0x only closes once the debt is repaid.
        let unwinding = target == Wad::ONE;
        if !unwinding
            && twap_converged(
                info.current_leverage_ratio,
                target,
                direction,
                execution.twap_convergence_tolerance,
            )?
        {
            inner.state = RebalanceState {
                last_trade_timestamp: now,
                twap: TwapStatus::Idle,
            };
            info!(
                ratio = %info.current_leverage_ratio,
                target_ratio = %target,
                direction = direction.as_str(),
                "ratio reached TWAP target, sequence closed without trading"
            );
            return Ok(RebalanceOutcome {
                action: ActionKind::Iterate,
                current_leverage_ratio: info.current_leverage_ratio,
                target_leverage_ratio: target,
                plan: None,
                received: Wad::ZERO,
                twap: TwapStatus::Idle,
                reward_paid: None,
            });
        }

        // The last chunk of an unwind repays the debt outright.
        if unwinding {
            let plan = plan_chunk(&info, &execution, target, execution.twap_max_trade_size)?;
            if !plan.is_some_and(|p| p.is_capped()) {
                debug!(ratio = %info.current_leverage_ratio, "final unwind chunk");
                let (plan, received) = self.execute_delever_to_zero(&execution, &info)?;
                inner.state = RebalanceState {
                    last_trade_timestamp: now,
                    twap: TwapStatus::Idle,
                };
                info!(redeemed = %plan.chunk_notional, %received, "unwind TWAP completed");
                return Ok(RebalanceOutcome {
                    action: ActionKind::Iterate,
                    current_leverage_ratio: info.current_leverage_ratio,
                    target_leverage_ratio: target,
                    plan: Some(plan),
                    received,
                    twap: TwapStatus::Idle,
                    reward_paid: None,
                });
            }
        }

        self.rebalance_toward(
            &mut inner,
            &info,
            ActionKind::Iterate,
            target,
            execution.twap_max_trade_size,
            execution.slippage_tolerance,
            now,
        )
    }

    /// Emergency delever toward the max ratio, open to any EOA, paying the
    /// caller a bounty.
    pub fn ripcord(&self, caller: &Caller) -> Result<RebalanceOutcome, EngineError> {
        let mut inner = self.lock()?;
        inner.access.check_eoa(caller)?;

        let info = self.leverage_info()?;
        info.require_open_position()?;

        let incentive = inner.config.incentive.clone();
        if info.current_leverage_ratio < incentive.incentivized_leverage_ratio {
            return Err(EngineError::BelowIncentivizedThreshold {
                current: info.current_leverage_ratio,
                incentivized: incentive.incentivized_leverage_ratio,
            });
        }

        let now = self.clock.now();
        let elapsed = inner.state.elapsed(now);
        if elapsed < incentive.incentivized_twap_cooldown_period {
            return Err(EngineError::CooldownNotElapsed {
                remaining: incentive.incentivized_twap_cooldown_period - elapsed,
            });
        }

        warn!(
            caller = %caller.address,
            ratio = %info.current_leverage_ratio,
            incentivized = %incentive.incentivized_leverage_ratio,
            "ripcord pulled"
        );

        let max = inner.config.methodology.max_leverage_ratio;
        let mut outcome = self.rebalance_toward(
            &mut inner,
            &info,
            ActionKind::Ripcord,
            max,
            incentive.incentivized_twap_max_trade_size,
            incentive.incentivized_slippage_tolerance,
            now,
        )?;

        let paid = self.incentives.payout(incentive.ether_reward, caller.address);
        outcome.reward_paid = Some(paid);
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Decision queries
    // -----------------------------------------------------------------------

    /// Which keeper action would currently pass its preconditions.
    pub fn should_rebalance(&self) -> Result<ShouldRebalance, EngineError> {
        let inner = self.lock()?;
        let methodology = &inner.config.methodology;
        let (min, max) = (methodology.min_leverage_ratio, methodology.max_leverage_ratio);
        self.decide(&inner, min, max)
    }

    /// As [`should_rebalance`](Self::should_rebalance) but triggering a
    /// rebalance only outside a custom band, which must contain the
    /// methodology band.
    pub fn should_rebalance_with_bounds(
        &self,
        custom_min: Wad,
        custom_max: Wad,
    ) -> Result<ShouldRebalance, EngineError> {
        let inner = self.lock()?;
        let methodology = &inner.config.methodology;
        if custom_min > methodology.min_leverage_ratio || custom_max < methodology.max_leverage_ratio
        {
            return Err(EngineError::InvalidCustomBounds);
        }
        self.decide(&inner, custom_min, custom_max)
    }

    fn decide(&self, inner: &Inner, min: Wad, max: Wad) -> Result<ShouldRebalance, EngineError> {
        let info = self.leverage_info()?;
        if info.require_open_position().is_err() {
            return Ok(ShouldRebalance::NoAction);
        }

        let config = &inner.config;
        let elapsed = inner.state.elapsed(self.clock.now());
        let ratio = info.current_leverage_ratio;

        let decision = if ratio >= config.incentive.incentivized_leverage_ratio {
            if elapsed >= config.incentive.incentivized_twap_cooldown_period {
                ShouldRebalance::Ripcord
            } else {
                ShouldRebalance::NoAction
            }
        } else if inner.state.twap.is_active() {
            if elapsed >= config.execution.twap_cooldown_period {
                ShouldRebalance::Iterate
            } else {
                ShouldRebalance::NoAction
            }
        } else if elapsed >= config.methodology.rebalance_interval || info.outside_band(min, max) {
            ShouldRebalance::Rebalance
        } else {
            ShouldRebalance::NoAction
        };

        debug!(%ratio, elapsed, decision = decision.as_str(), "rebalance decision");
        Ok(decision)
    }

    /// Current ratio, 1.0 when there is no debt.
    pub fn current_leverage_ratio(&self) -> Result<Wad, EngineError> {
        let _inner = self.lock()?;
        Ok(self.leverage_info()?.current_leverage_ratio)
    }

    /// Bounty a ripcord would pay right now, zero below the incentivized
    /// ratio.
    pub fn current_ether_incentive(&self) -> Result<Wad, EngineError> {
        let inner = self.lock()?;
        let info = self.leverage_info()?;
        let incentive = &inner.config.incentive;
        if info.current_leverage_ratio >= incentive.incentivized_leverage_ratio {
            Ok(self.incentives.current_incentive(incentive.ether_reward))
        } else {
            Ok(Wad::ZERO)
        }
    }

    /// Chunk the next keeper action would trade, without trading it.
    ///
    /// Above the incentivized ratio this is the ripcord chunk. Mid-TWAP it
    /// moves toward the frozen target, otherwise toward the recentered ratio.
    pub fn chunk_rebalance_notional(&self) -> Result<Option<ChunkPlan>, EngineError> {
        let inner = self.lock()?;
        let info = self.leverage_info()?;
        info.require_open_position()?;

        let config = &inner.config;
        let (new_ratio, max_trade_size) =
            if info.current_leverage_ratio >= config.incentive.incentivized_leverage_ratio {
                (
                    config.methodology.max_leverage_ratio,
                    config.incentive.incentivized_twap_max_trade_size,
                )
            } else if let TwapStatus::InTwap { target, .. } = inner.state.twap {
                (target, config.execution.twap_max_trade_size)
            } else {
                (
                    calculate_new_leverage_ratio(info.current_leverage_ratio, &config.methodology)?,
                    config.execution.twap_max_trade_size,
                )
            };

        plan_chunk(&info, &config.execution, new_ratio, max_trade_size)
    }

    // -----------------------------------------------------------------------
    // Operator configuration
    // -----------------------------------------------------------------------

    /// Mint an operator role token for `address`.
    pub fn authorize_operator(&self, address: Address) -> Result<OperatorRole, EngineError> {
        self.lock()?.access.authorize_operator(address)
    }

    pub fn set_methodology_settings(
        &self,
        role: &OperatorRole,
        methodology: MethodologySettings,
    ) -> Result<(), EngineError> {
        self.update_config(role, "methodology", |config| config.methodology = methodology)
    }

    pub fn set_execution_settings(
        &self,
        role: &OperatorRole,
        execution: ExecutionSettings,
    ) -> Result<(), EngineError> {
        self.update_config(role, "execution", |config| config.execution = execution)
    }

    pub fn set_incentive_settings(
        &self,
        role: &OperatorRole,
        incentive: IncentiveSettings,
    ) -> Result<(), EngineError> {
        self.update_config(role, "incentive", |config| config.incentive = incentive)
    }

    /// Validate the whole candidate policy before swapping it in, so a
    /// rejected write leaves the previous policy in place. The candidate's
    /// exchange must be registered, as in [`LeverageStrategy::new`].
    fn update_config(
        &self,
        role: &OperatorRole,
        section: &'static str,
        apply: impl FnOnce(&mut PolicyConfig),
    ) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        inner.access.check_role(role)?;
        if inner.state.twap.is_active() {
            warn!(section, "config update rejected: rebalance in progress");
            return Err(EngineError::RebalanceInProgress);
        }

        let mut candidate = inner.config.clone();
        apply(&mut candidate);
        let checked = candidate
            .validate()
            .and_then(|()| self.gateway.ensure_registered(candidate.execution.exchange));
        if let Err(e) = checked {
            warn!(section, error = %e, "config update rejected");
            return Err(e);
        }

        inner.config = candidate;
        info!(section, operator = %role.address(), "policy updated");
        Ok(())
    }

    pub fn update_caller_status(
        &self,
        role: &OperatorRole,
        updates: &[(Address, bool)],
    ) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        inner.access.check_role(role)?;
        inner.access.update_caller_status(updates);
        Ok(())
    }

    pub fn update_anyone_callable(
        &self,
        role: &OperatorRole,
        anyone_callable: bool,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock()?;
        inner.access.check_role(role)?;
        inner.access.set_anyone_callable(anyone_callable);
        Ok(())
    }

    /// Drain the bounty pool. Refused mid-TWAP so a pending ripcord keeps its
    /// reward.
    pub fn withdraw_incentive(&self, role: &OperatorRole) -> Result<Wad, EngineError> {
        let inner = self.lock()?;
        inner.access.check_role(role)?;
        if inner.state.twap.is_active() {
            return Err(EngineError::RebalanceInProgress);
        }
        Ok(self.incentives.withdraw_all())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> Result<PolicyConfig, EngineError> {
        Ok(self.lock()?.config.clone())
    }

    pub fn state(&self) -> Result<RebalanceState, EngineError> {
        Ok(self.lock()?.state)
    }

    pub fn is_allowed_caller(&self, address: Address) -> Result<bool, EngineError> {
        Ok(self.lock()?.access.is_allowed_caller(address))
    }

    pub fn incentives(&self) -> &IncentiveSettlement {
        &self.incentives
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_policy, PaperVenueConfig};
    use crate::core::clock::ManualClock;
    use crate::execution::exchange::ExchangeAdapter;
    use crate::execution::paper::PaperVenue;
    use crate::types::{Asset, ExchangeId};
    use alloy::primitives::address;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::{OnceLock, Weak};

    const OPERATOR: Address = address!("ABCDEF1234567890abcdef1234567890ABCDEF12");
    const KEEPER: Address = address!("1234567890abcdef1234567890abcdef12345678");

    fn wad(d: Decimal) -> Wad {
        Wad::from_decimal(d).unwrap()
    }

    struct Fixture {
        strategy: Arc<LeverageStrategy>,
        venue: Arc<PaperVenue>,
        clock: Arc<ManualClock>,
    }

    fn venue() -> Arc<PaperVenue> {
        Arc::new(
            PaperVenue::from_config(&PaperVenueConfig {
                collateral_units: Wad::from_units(10),
                collateral_price: Wad::from_units(100),
                borrow_price: Wad::ONE,
                collateral_factor: wad(dec!(0.8)),
                exchange_rate: Wad::ONE,
                total_supply: Wad::from_units(10),
                swap_fee: Wad::ZERO,
            })
            .unwrap(),
        )
    }

    fn fixture_with(policy: PolicyConfig, adapter: Arc<dyn ExchangeAdapter>, venue: Arc<PaperVenue>) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let strategy = LeverageStrategy::new(
            policy,
            venue.clone(),
            ExchangeGateway::new().with_adapter(ExchangeId::Paper, adapter),
            AccessPolicy::new(OPERATOR).with_allowed_callers([KEEPER]),
            Arc::new(IncentiveSettlement::new(Wad::from_units(5))),
            clock.clone(),
        )
        .unwrap();
        Fixture {
            strategy: Arc::new(strategy),
            venue,
            clock,
        }
    }

    fn fixture() -> Fixture {
        let venue = venue();
        fixture_with(test_policy(), venue.clone(), venue)
    }

    #[test]
    fn test_new_rejects_invalid_policy() {
        let venue = venue();
        let mut policy = test_policy();
        policy.methodology.recentering_speed = Wad::ZERO;
        let result = LeverageStrategy::new(
            policy,
            venue.clone(),
            ExchangeGateway::new().with_adapter(ExchangeId::Paper, venue),
            AccessPolicy::new(OPERATOR),
            Arc::new(IncentiveSettlement::default()),
            Arc::new(ManualClock::new(0)),
        );
        assert!(matches!(result, Err(EngineError::InvalidRecenteringSpeed(_))));
    }

    #[test]
    fn test_new_rejects_unregistered_exchange() {
        let venue = venue();
        let result = LeverageStrategy::new(
            test_policy(),
            venue,
            ExchangeGateway::new(),
            AccessPolicy::new(OPERATOR),
            Arc::new(IncentiveSettlement::default()),
            Arc::new(ManualClock::new(0)),
        );
        assert!(matches!(
            result,
            Err(EngineError::UnknownExchange(ExchangeId::Paper))
        ));
    }

    #[test]
    fn test_engage_requires_operator() {
        let f = fixture();
        assert_eq!(
            f.strategy.engage(&Caller::eoa(KEEPER)).unwrap_err(),
            EngineError::NotOperator(KEEPER)
        );
    }

    #[test]
    fn test_engage_caps_at_twap_max_and_starts_twap() {
        let f = fixture();
        let outcome = f.strategy.engage(&Caller::eoa(OPERATOR)).unwrap();

        // 10 units to reach 2x, capped at 5
        let plan = outcome.plan.unwrap();
        assert_eq!(plan.total_notional, Wad::from_units(10));
        assert_eq!(plan.chunk_notional, Wad::from_units(5));
        assert_eq!(
            outcome.twap,
            TwapStatus::InTwap {
                target: Wad::from_units(2),
                direction: TradeDirection::Lever
            }
        );

        let state = f.strategy.state().unwrap();
        assert_eq!(state.last_trade_timestamp, 1_000_000);
        assert_eq!(f.venue.borrow_balance().unwrap(), Wad::from_units(500));
    }

    #[test]
    fn test_engage_rejects_existing_debt() {
        let f = fixture();
        f.strategy.engage(&Caller::eoa(OPERATOR)).unwrap();
        assert_eq!(
            f.strategy.engage(&Caller::eoa(OPERATOR)).unwrap_err(),
            EngineError::DebtMustBeZero
        );
    }

    #[test]
    fn test_engage_rejects_zero_supply() {
        let f = fixture();
        f.venue.set_total_supply(Wad::ZERO).unwrap();
        assert_eq!(
            f.strategy.engage(&Caller::eoa(OPERATOR)).unwrap_err(),
            EngineError::ZeroSupply
        );
    }

    #[test]
    fn test_rebalance_requires_debt() {
        let f = fixture();
        assert_eq!(
            f.strategy.rebalance(&Caller::eoa(KEEPER)).unwrap_err(),
            EngineError::BorrowBalanceMustExist
        );
        assert_eq!(f.strategy.should_rebalance().unwrap(), ShouldRebalance::NoAction);
    }

    #[test]
    fn test_rebalance_mid_twap_must_iterate() {
        let f = fixture();
        f.strategy.engage(&Caller::eoa(OPERATOR)).unwrap();
        assert_eq!(
            f.strategy.rebalance(&Caller::eoa(KEEPER)).unwrap_err(),
            EngineError::MustCallIterate
        );
    }

    #[test]
    fn test_iterate_respects_twap_cooldown() {
        let f = fixture();
        f.strategy.engage(&Caller::eoa(OPERATOR)).unwrap();
        f.clock.advance(1_000);
        assert_eq!(
            f.strategy.iterate_rebalance(&Caller::eoa(KEEPER)).unwrap_err(),
            EngineError::CooldownNotElapsed { remaining: 2_000 }
        );
        assert_eq!(f.strategy.should_rebalance().unwrap(), ShouldRebalance::NoAction);

        f.clock.advance(2_000);
        assert_eq!(f.strategy.should_rebalance().unwrap(), ShouldRebalance::Iterate);
        let outcome = f.strategy.iterate_rebalance(&Caller::eoa(KEEPER)).unwrap();
        assert!(outcome.traded());
    }

    #[test]
    fn test_iterate_when_idle_fails() {
        let f = fixture();
        f.strategy.engage(&Caller::eoa(OPERATOR)).unwrap();
        f.clock.advance(3_000);
        f.strategy.iterate_rebalance(&Caller::eoa(KEEPER)).unwrap();
        // 5 + 5 units reached the target in two chunks.
        assert_eq!(f.strategy.state().unwrap().twap, TwapStatus::Idle);

        f.clock.advance(3_000);
        assert_eq!(
            f.strategy.iterate_rebalance(&Caller::eoa(KEEPER)).unwrap_err(),
            EngineError::NotInTwap
        );
    }

    #[test]
    fn test_within_band_after_interval_commits_timestamp_only() {
        let f = fixture();
        f.strategy.engage(&Caller::eoa(OPERATOR)).unwrap();
        f.clock.advance(3_000);
        f.strategy.iterate_rebalance(&Caller::eoa(KEEPER)).unwrap();

        f.clock.advance(100);
        assert!(matches!(
            f.strategy.rebalance(&Caller::eoa(KEEPER)).unwrap_err(),
            EngineError::CooldownOrInvalidRatio(_)
        ));

        f.clock.advance(86_400);
        let fills_before = f.venue.fills().unwrap().len();
        let outcome = f.strategy.rebalance(&Caller::eoa(KEEPER)).unwrap();
        assert!(!outcome.traded());
        assert_eq!(f.venue.fills().unwrap().len(), fills_before);
        assert_eq!(
            f.strategy.state().unwrap().last_trade_timestamp,
            f.clock.now()
        );
    }

    #[test]
    fn test_setters_reject_while_in_twap() {
        let f = fixture();
        f.strategy.engage(&Caller::eoa(OPERATOR)).unwrap();
        let role = f.strategy.authorize_operator(OPERATOR).unwrap();
        let before = f.strategy.config().unwrap();

        let mut methodology = before.methodology.clone();
        methodology.recentering_speed = wad(dec!(0.5));
        assert_eq!(
            f.strategy.set_methodology_settings(&role, methodology),
            Err(EngineError::RebalanceInProgress)
        );
        assert_eq!(
            f.strategy.withdraw_incentive(&role),
            Err(EngineError::RebalanceInProgress)
        );
        assert_eq!(f.strategy.config().unwrap(), before);
    }

    #[test]
    fn test_invalid_setter_leaves_config_unchanged() {
        let f = fixture();
        let role = f.strategy.authorize_operator(OPERATOR).unwrap();
        let before = f.strategy.config().unwrap();

        let mut incentive = before.incentive.clone();
        incentive.incentivized_leverage_ratio = wad(dec!(2.2));
        assert!(matches!(
            f.strategy.set_incentive_settings(&role, incentive),
            Err(EngineError::InvalidLeverageRatios { .. })
        ));

        let mut execution = before.execution.clone();
        execution.exchange = ExchangeId::ZeroEx;
        assert_eq!(
            f.strategy.set_execution_settings(&role, execution),
            Err(EngineError::UnknownExchange(ExchangeId::ZeroEx))
        );
        assert_eq!(f.strategy.config().unwrap(), before);

        let mut methodology = before.methodology.clone();
        methodology.target_leverage_ratio = wad(dec!(2.1));
        f.strategy.set_methodology_settings(&role, methodology.clone()).unwrap();
        assert_eq!(f.strategy.config().unwrap().methodology, methodology);
    }

    #[test]
    fn test_settings_writes_check_role_first() {
        let f = fixture();
        let foreign = AccessPolicy::new(KEEPER).authorize_operator(KEEPER).unwrap();

        let mut execution = f.strategy.config().unwrap().execution;
        execution.exchange = ExchangeId::ZeroEx;
        assert_eq!(
            f.strategy.set_execution_settings(&foreign, execution),
            Err(EngineError::NotOperator(KEEPER))
        );
    }

    #[test]
    fn test_disengage_requires_operator() {
        let f = fixture();
        f.strategy.engage(&Caller::eoa(OPERATOR)).unwrap();
        let debt = f.venue.borrow_balance().unwrap();

        assert_eq!(
            f.strategy.disengage(&Caller::eoa(KEEPER)).unwrap_err(),
            EngineError::NotOperator(KEEPER)
        );
        assert_eq!(f.venue.borrow_balance().unwrap(), debt);
    }

    #[test]
    fn test_custom_bounds_must_contain_methodology_band() {
        let f = fixture();
        assert_eq!(
            f.strategy
                .should_rebalance_with_bounds(wad(dec!(1.8)), wad(dec!(2.3))),
            Err(EngineError::InvalidCustomBounds)
        );
        assert_eq!(
            f.strategy
                .should_rebalance_with_bounds(wad(dec!(1.7)), wad(dec!(2.2))),
            Err(EngineError::InvalidCustomBounds)
        );
        assert!(f
            .strategy
            .should_rebalance_with_bounds(wad(dec!(1.5)), wad(dec!(2.5)))
            .is_ok());
    }

    #[test]
    fn test_failed_trade_commits_nothing() {
        let f = fixture();
        f.venue.fail_next_trade("router down").unwrap();
        assert!(matches!(
            f.strategy.engage(&Caller::eoa(OPERATOR)).unwrap_err(),
            EngineError::Exchange { .. }
        ));
        assert_eq!(f.strategy.state().unwrap(), RebalanceState::default());
        assert_eq!(f.venue.borrow_balance().unwrap(), Wad::ZERO);
    }

    #[test]
    fn test_operator_role_follows_access_updates() {
        let f = fixture();
        let role = f.strategy.authorize_operator(OPERATOR).unwrap();
        assert_eq!(
            f.strategy.authorize_operator(KEEPER),
            Err(EngineError::NotOperator(KEEPER))
        );

        let stranger = address!("cA11bde05977b3631167028862bE2a173976CA11");
        assert!(!f.strategy.is_allowed_caller(stranger).unwrap());
        f.strategy.update_caller_status(&role, &[(stranger, true)]).unwrap();
        assert!(f.strategy.is_allowed_caller(stranger).unwrap());

        f.strategy.update_anyone_callable(&role, true).unwrap();
        assert!(f
            .strategy
            .is_allowed_caller(address!("0000000000000000000000000000000000000001"))
            .unwrap());
    }

    #[test]
    fn test_current_ether_incentive_only_above_threshold() {
        let f = fixture();
        f.strategy.engage(&Caller::eoa(OPERATOR)).unwrap();
        assert_eq!(f.strategy.current_ether_incentive().unwrap(), Wad::ZERO);

        // 15 units against 500 of debt is 3x at a price of 50.
        f.venue.set_price(Asset::Collateral, wad(dec!(50))).unwrap();
        assert_eq!(f.strategy.current_ether_incentive().unwrap(), Wad::ONE);
    }

    /// Calls back into the strategy from inside a trade.
    struct Reentrant {
        venue: Arc<PaperVenue>,
        strategy: OnceLock<Weak<LeverageStrategy>>,
        observed: Mutex<Option<EngineError>>,
    }

    impl ExchangeAdapter for Reentrant {
        fn trade(&self, request: &TradeRequest) -> Result<Wad, EngineError> {
            if let Some(strategy) = self.strategy.get().and_then(Weak::upgrade) {
                let err = strategy.rebalance(&Caller::eoa(KEEPER)).unwrap_err();
                *self.observed.lock().unwrap() = Some(err);
            }
            self.venue.trade(request)
        }
    }

    #[test]
    fn test_reentrant_call_rejected() {
        let venue = venue();
        let adapter = Arc::new(Reentrant {
            venue: venue.clone(),
            strategy: OnceLock::new(),
            observed: Mutex::new(None),
        });
        let f = fixture_with(test_policy(), adapter.clone(), venue);
        adapter.strategy.set(Arc::downgrade(&f.strategy)).unwrap();

        f.strategy.engage(&Caller::eoa(OPERATOR)).unwrap();
        assert_eq!(
            adapter.observed.lock().unwrap().clone(),
            Some(EngineError::OperationInProgress)
        );
    }

    /// Panics mid-trade, poisoning the strategy lock.
    struct Exploding;

    impl ExchangeAdapter for Exploding {
        fn trade(&self, _request: &TradeRequest) -> Result<Wad, EngineError> {
            panic!("adapter blew up");
        }
    }

    #[test]
    fn test_poisoned_lock_fails_closed() {
        let f = fixture_with(test_policy(), Arc::new(Exploding), venue());
        let strategy = f.strategy.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = strategy.engage(&Caller::eoa(OPERATOR));
        }));
        assert!(result.is_err());
        assert_eq!(f.strategy.state(), Err(EngineError::StatePoisoned));
        assert_eq!(
            f.strategy.should_rebalance(),
            Err(EngineError::StatePoisoned)
        );
    }

    #[test]
    fn test_plan_chunk_absorbs_rounding_dust() {
        let info = LeverageInfo::from_snapshot(capture_snapshot(venue().as_ref()).unwrap()).unwrap();
        let mut execution = test_policy().execution;
        let five = Wad::from_units(5);
        let wei = |n: u64| Wad::from_raw(alloy::primitives::U256::from(n));

        // 10 debt-free units at 1x move 5 units to reach 1.5x.
        execution.twap_max_trade_size = five.checked_sub(wei(500)).unwrap();
        let plan = plan_chunk(&info, &execution, wad(dec!(1.5)), execution.twap_max_trade_size)
            .unwrap()
            .unwrap();
        assert_eq!(plan.chunk_notional, five);
        assert!(!plan.is_capped());

        execution.twap_max_trade_size = five.checked_sub(wei(5_000)).unwrap();
        let plan = plan_chunk(&info, &execution, wad(dec!(1.5)), execution.twap_max_trade_size)
            .unwrap()
            .unwrap();
        assert_eq!(plan.chunk_notional, execution.twap_max_trade_size);
        assert!(plan.is_capped());
    }

    #[test]
    fn test_twap_converged_direction_aware() {
        let target = wad(dec!(1.9));
        let above = wad(dec!(1.91));
        let below = wad(dec!(1.89));
        let tol = wad(dec!(0.02));

        assert!(twap_converged(above, target, TradeDirection::Lever, Wad::ZERO).unwrap());
        assert!(!twap_converged(below, target, TradeDirection::Lever, Wad::ZERO).unwrap());
        assert!(twap_converged(below, target, TradeDirection::Lever, tol).unwrap());

        assert!(twap_converged(below, target, TradeDirection::Delever, Wad::ZERO).unwrap());
        assert!(!twap_converged(above, target, TradeDirection::Delever, Wad::ZERO).unwrap());
        assert!(twap_converged(above, target, TradeDirection::Delever, tol).unwrap());
    }
}
