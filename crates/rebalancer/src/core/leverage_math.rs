//! Pure leverage arithmetic.
//!
//! Every function here is deterministic over [`Wad`] inputs and never touches
//! engine state. Sizing helpers round toward zero so a computed trade never
//! exceeds what the position can bear.

use crate::config::MethodologySettings;
use crate::errors::MathError;
use crate::types::{TradeDirection, Wad};

/// Leverage ratio `cv / (cv - dv)`.
///
/// Fails with `DivisionByZero` when collateral equals debt and `Underflow`
/// when debt exceeds collateral. Callers treat a debt-free position as 1.0x
/// instead of calling this.
pub fn current_leverage_ratio(collateral_value: Wad, borrow_value: Wad) -> Result<Wad, MathError> {
    let equity = collateral_value.checked_sub(borrow_value)?;
    collateral_value.precise_div(equity)
}

/// Ratio the next trade should aim for.
///
/// Inside `[min, max]` the current ratio is returned unchanged, which makes a
/// time-gated rebalance a no-op. Outside the band the ratio moves
/// `recentering_speed` of the way toward target and is clamped to the band.
pub fn calculate_new_leverage_ratio(
    current: Wad,
    methodology: &MethodologySettings,
) -> Result<Wad, MathError> {
    let min = methodology.min_leverage_ratio;
    let max = methodology.max_leverage_ratio;
    if current >= min && current <= max {
        return Ok(current);
    }

    let speed = methodology.recentering_speed;
    let toward_target = methodology.target_leverage_ratio.precise_mul(speed)?;
    let from_current = Wad::ONE.checked_sub(speed)?.precise_mul(current)?;
    let recentered = toward_target.checked_add(from_current)?;

    Ok(recentered.clamp(min, max))
}

/// Collateral that must move to take the position from one ratio to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollateralDelta {
    pub direction: TradeDirection,
    /// Collateral units for the whole position.
    pub total_units: Wad,
    /// `total_units / total_supply`.
    pub units_per_token: Wad,
}

/// `collateral_units * |new - current| / current`, truncated.
pub fn collateral_units_for_leverage_change(
    current: Wad,
    new: Wad,
    collateral_units: Wad,
    total_supply: Wad,
) -> Result<CollateralDelta, MathError> {
    let direction = if new > current {
        TradeDirection::Lever
    } else {
        TradeDirection::Delever
    };
    let fraction = new.abs_diff(current).precise_div(current)?;
    let total_units = fraction.precise_mul(collateral_units)?;
    let units_per_token = total_units.precise_div(total_supply)?;

    Ok(CollateralDelta {
        direction,
        total_units,
        units_per_token,
    })
}

/// Market inputs for [`max_borrow_capacity`].
#[derive(Debug, Clone, Copy)]
pub struct BorrowCapacityInputs {
    pub collateral_units: Wad,
    pub collateral_value: Wad,
    pub collateral_price: Wad,
    pub collateral_factor: Wad,
    pub borrow_value: Wad,
    /// Share of the borrow limit held back as a buffer.
    pub unutilized_leverage_percentage: Wad,
}

impl BorrowCapacityInputs {
    /// `cv * cf * (1 - buffer)`
    fn net_borrow_limit(&self) -> Result<Wad, MathError> {
        let buffer_remaining = Wad::ONE.checked_sub(self.unutilized_leverage_percentage)?;
        self.collateral_value
            .precise_mul(self.collateral_factor)?
            .precise_mul(buffer_remaining)
    }
}

/// Largest chunk, in collateral units, the lending market lets us trade in
/// `direction` without breaching the buffered borrow limit. Never negative.
///
/// Lever: headroom below the limit converted at the collateral price.
/// Delever: the share of collateral that can be redeemed while repaying,
/// `collateral * (limit - debt) / limit`.
pub fn max_borrow_capacity(
    direction: TradeDirection,
    inputs: &BorrowCapacityInputs,
) -> Result<Wad, MathError> {
    let net_limit = inputs.net_borrow_limit()?;
    let headroom = net_limit.saturating_sub(inputs.borrow_value);

    match direction {
        TradeDirection::Lever => headroom.precise_div(inputs.collateral_price),
        TradeDirection::Delever => {
            if net_limit.is_zero() {
                return Ok(Wad::ZERO);
            }
            inputs
                .collateral_units
                .precise_mul(headroom)?
                .precise_div(net_limit)
        }
    }
}

/// Borrow-asset units with the same value as `collateral_units`.
pub fn borrow_units_for_collateral(
    collateral_units: Wad,
    collateral_price: Wad,
    borrow_price: Wad,
) -> Result<Wad, MathError> {
    collateral_units
        .precise_mul(collateral_price)?
        .precise_div(borrow_price)
}

/// Collateral to redeem so the swap proceeds repay all debt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeemToZero {
    pub total_units: Wad,
    pub units_per_token: Wad,
}

/// `collateral * (current - 1) / current / (1 - slippage)`, rounded down and
/// capped at the collateral balance.
pub fn max_redeem_to_zero_debt(
    current: Wad,
    collateral_units: Wad,
    total_supply: Wad,
    slippage_tolerance: Wad,
) -> Result<RedeemToZero, MathError> {
    let debt_share = current.checked_sub(Wad::ONE)?.precise_div(current)?;
    let inflated = collateral_units
        .precise_mul(debt_share)?
        .precise_div(Wad::ONE.checked_sub(slippage_tolerance)?)?;
    let total_units = inflated.min(collateral_units);
    let units_per_token = total_units.precise_div(total_supply)?;

    Ok(RedeemToZero {
        total_units,
        units_per_token,
    })
}
