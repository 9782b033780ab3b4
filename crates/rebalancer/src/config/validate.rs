use anyhow::{bail, Result};

use super::types::{
    ExecutionSettings, IncentiveSettings, MethodologySettings, PolicyConfig, RebalancerConfig,
};
use crate::errors::EngineError;
use crate::types::Wad;

impl PolicyConfig {
    /// Check every cross-field invariant. The first violation is returned as
    /// a typed error so setters can reject the write without touching state.
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_leverage_ratios(&self.methodology, &self.incentive)?;
        validate_methodology(&self.methodology)?;
        validate_execution(&self.execution)?;
        validate_incentive(&self.incentive)?;
        validate_cooldowns(&self.methodology, &self.execution, &self.incentive)?;
        validate_trade_sizes(&self.execution, &self.incentive)?;
        validate_convergence_tolerance(&self.methodology, &self.execution)
    }
}

fn validate_leverage_ratios(
    methodology: &MethodologySettings,
    incentive: &IncentiveSettings,
) -> Result<(), EngineError> {
    let min = methodology.min_leverage_ratio;
    let target = methodology.target_leverage_ratio;
    let max = methodology.max_leverage_ratio;
    let incentivized = incentive.incentivized_leverage_ratio;

    // 0 < min <= target <= max < incentivized
    if min.is_zero() || min > target || target > max || max >= incentivized {
        return Err(EngineError::InvalidLeverageRatios {
            min,
            target,
            max,
            incentivized,
        });
    }
    Ok(())
}

fn validate_methodology(methodology: &MethodologySettings) -> Result<(), EngineError> {
    let speed = methodology.recentering_speed;
    if speed.is_zero() || speed > Wad::ONE {
        return Err(EngineError::InvalidRecenteringSpeed(speed));
    }
    Ok(())
}

fn validate_execution(execution: &ExecutionSettings) -> Result<(), EngineError> {
    if execution.unutilized_leverage_percentage >= Wad::ONE {
        return Err(EngineError::InvalidUnutilizedLeveragePercentage(
            execution.unutilized_leverage_percentage,
        ));
    }
    if execution.slippage_tolerance >= Wad::ONE {
        return Err(EngineError::InvalidSlippageTolerance {
            field: "slippage_tolerance",
            value: execution.slippage_tolerance,
        });
    }
    Ok(())
}

fn validate_incentive(incentive: &IncentiveSettings) -> Result<(), EngineError> {
    if incentive.incentivized_slippage_tolerance >= Wad::ONE {
        return Err(EngineError::InvalidSlippageTolerance {
            field: "incentivized_slippage_tolerance",
            value: incentive.incentivized_slippage_tolerance,
        });
    }
    Ok(())
}

fn validate_cooldowns(
    methodology: &MethodologySettings,
    execution: &ExecutionSettings,
    incentive: &IncentiveSettings,
) -> Result<(), EngineError> {
    let incentivized = incentive.incentivized_twap_cooldown_period;
    let twap = execution.twap_cooldown_period;
    let interval = methodology.rebalance_interval;

    if incentivized >= twap || twap >= interval {
        return Err(EngineError::InvalidCooldownPeriods {
            incentivized,
            twap,
            interval,
        });
    }
    Ok(())
}

fn validate_trade_sizes(
    execution: &ExecutionSettings,
    incentive: &IncentiveSettings,
) -> Result<(), EngineError> {
    let twap = execution.twap_max_trade_size;
    let incentivized = incentive.incentivized_twap_max_trade_size;

    if twap.is_zero() || twap > incentivized {
        return Err(EngineError::InvalidTwapMaxTradeSize { twap, incentivized });
    }
    Ok(())
}

/// A non-zero early-exit tolerance must be narrower than the band, otherwise
/// any in-band reading would close a TWAP on its first iterate.
fn validate_convergence_tolerance(
    methodology: &MethodologySettings,
    execution: &ExecutionSettings,
) -> Result<(), EngineError> {
    let tolerance = execution.twap_convergence_tolerance;
    let band = methodology
        .max_leverage_ratio
        .saturating_sub(methodology.min_leverage_ratio);

    if !tolerance.is_zero() && tolerance >= band {
        return Err(EngineError::InvalidTwapConvergenceTolerance { tolerance, band });
    }
    Ok(())
}

/// Validate invariants across the merged config that serde alone cannot enforce.
///
/// Called automatically by [`super::load_config`].
pub fn validate_config(config: &RebalancerConfig) -> Result<()> {
    let mut errors: Vec<String> = Vec::new();

    if let Err(e) = config.policy.validate() {
        errors.push(format!("policy: {e}"));
    }
    validate_keeper_config(config, &mut errors);
    validate_paper_venue(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = format!(
            "Configuration validation failed ({} error{}):\n  - {}",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" },
            errors.join("\n  - ")
        );
        bail!("{msg}");
    }
}

// ---------------------------------------------------------------------------
// Keeper config
// ---------------------------------------------------------------------------

fn validate_keeper_config(config: &RebalancerConfig, errors: &mut Vec<String>) {
    let keeper = &config.keeper;

    if let Err(e) = validate_address(&keeper.address) {
        errors.push(format!("keeper.address: {e}"));
    }
    if let Err(e) = validate_address(&keeper.operator) {
        errors.push(format!("keeper.operator: {e}"));
    }
    for (i, caller) in keeper.allowed_callers.iter().enumerate() {
        if let Err(e) = validate_address(caller) {
            errors.push(format!("keeper.allowed_callers[{i}]: {e}"));
        }
    }

    if keeper.poll_interval_seconds == 0 {
        errors.push("keeper: poll_interval_seconds must be > 0".into());
    }

    // A poll slower than the ripcord cooldown would miss emergencies.
    let ripcord_cooldown = config.policy.incentive.incentivized_twap_cooldown_period;
    if ripcord_cooldown > 0 && keeper.poll_interval_seconds > ripcord_cooldown {
        errors.push(format!(
            "keeper: poll_interval_seconds ({}) should be <= incentivized_twap_cooldown_period ({ripcord_cooldown})",
            keeper.poll_interval_seconds
        ));
    }
}

// ---------------------------------------------------------------------------
// Paper venue
// ---------------------------------------------------------------------------

fn validate_paper_venue(config: &RebalancerConfig, errors: &mut Vec<String>) {
    let paper = &config.keeper.paper;

    let positive = [
        ("collateral_price", paper.collateral_price),
        ("borrow_price", paper.borrow_price),
        ("exchange_rate", paper.exchange_rate),
        ("total_supply", paper.total_supply),
    ];
    for (name, value) in positive {
        if value.is_zero() {
            errors.push(format!("keeper.paper: {name} must be > 0"));
        }
    }

    if paper.collateral_factor.is_zero() || paper.collateral_factor >= Wad::ONE {
        errors.push(format!(
            "keeper.paper: collateral_factor ({}) must be in (0, 1)",
            paper.collateral_factor
        ));
    }
    if paper.swap_fee >= Wad::ONE {
        errors.push(format!(
            "keeper.paper: swap_fee ({}) must be < 1",
            paper.swap_fee
        ));
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Validate an Ethereum-style address string: must be 0x-prefixed and 42 chars
/// of hex.
pub(crate) fn validate_address(addr: &str) -> Result<(), String> {
    if addr.is_empty() {
        return Err("address is empty".into());
    }
    if !addr.starts_with("0x") && !addr.starts_with("0X") {
        return Err(format!("address '{addr}' must start with 0x"));
    }
    if addr.len() != 42 {
        return Err(format!(
            "address '{addr}' has length {} (expected 42)",
            addr.len()
        ));
    }
    if !addr[2..].chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("address '{addr}' contains non-hex characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_policy;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn wad(d: Decimal) -> Wad {
        Wad::from_decimal(d).unwrap()
    }

    #[test]
    fn test_default_policy_is_valid() {
        assert!(test_policy().validate().is_ok());
    }

    #[test]
    fn test_min_above_target_rejected() {
        let mut policy = test_policy();
        policy.methodology.min_leverage_ratio = wad(dec!(2.1));
        assert!(matches!(
            policy.validate(),
            Err(EngineError::InvalidLeverageRatios { .. })
        ));
    }

    #[test]
    fn test_zero_min_rejected() {
        let mut policy = test_policy();
        policy.methodology.min_leverage_ratio = Wad::ZERO;
        assert!(matches!(
            policy.validate(),
            Err(EngineError::InvalidLeverageRatios { .. })
        ));
    }

    #[test]
    fn test_incentivized_must_exceed_max() {
        let mut policy = test_policy();
        policy.incentive.incentivized_leverage_ratio = policy.methodology.max_leverage_ratio;
        assert!(matches!(
            policy.validate(),
            Err(EngineError::InvalidLeverageRatios { .. })
        ));
    }

    #[test]
    fn test_recentering_speed_bounds() {
        let mut policy = test_policy();
        policy.methodology.recentering_speed = Wad::ZERO;
        assert!(matches!(
            policy.validate(),
            Err(EngineError::InvalidRecenteringSpeed(_))
        ));

        policy.methodology.recentering_speed = Wad::ONE;
        assert!(policy.validate().is_ok());

        policy.methodology.recentering_speed = wad(dec!(1.01));
        assert!(matches!(
            policy.validate(),
            Err(EngineError::InvalidRecenteringSpeed(_))
        ));
    }

    #[test]
    fn test_unutilized_leverage_must_be_below_one() {
        let mut policy = test_policy();
        policy.execution.unutilized_leverage_percentage = Wad::ONE;
        assert!(matches!(
            policy.validate(),
            Err(EngineError::InvalidUnutilizedLeveragePercentage(_))
        ));
    }

    #[test]
    fn test_slippage_fields_reported_by_name() {
        let mut policy = test_policy();
        policy.incentive.incentivized_slippage_tolerance = Wad::ONE;
        match policy.validate() {
            Err(EngineError::InvalidSlippageTolerance { field, .. }) => {
                assert_eq!(field, "incentivized_slippage_tolerance")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_cooldown_ordering() {
        let mut policy = test_policy();
        policy.execution.twap_cooldown_period = policy.methodology.rebalance_interval;
        assert!(matches!(
            policy.validate(),
            Err(EngineError::InvalidCooldownPeriods { .. })
        ));

        let mut policy = test_policy();
        policy.incentive.incentivized_twap_cooldown_period = policy.execution.twap_cooldown_period;
        assert!(matches!(
            policy.validate(),
            Err(EngineError::InvalidCooldownPeriods { .. })
        ));
    }

    #[test]
    fn test_twap_size_must_not_exceed_incentivized() {
        let mut policy = test_policy();
        policy.execution.twap_max_trade_size = policy
            .incentive
            .incentivized_twap_max_trade_size
            .checked_add(Wad::ONE)
            .unwrap();
        assert!(matches!(
            policy.validate(),
            Err(EngineError::InvalidTwapMaxTradeSize { .. })
        ));
    }

    #[test]
    fn test_convergence_tolerance_must_be_narrower_than_band() {
        let mut policy = test_policy();
        policy.execution.twap_convergence_tolerance = wad(dec!(0.02));
        assert!(policy.validate().is_ok());

        // Band is 2.3 - 1.7 = 0.6.
        policy.execution.twap_convergence_tolerance = wad(dec!(0.6));
        assert_eq!(
            policy.validate(),
            Err(EngineError::InvalidTwapConvergenceTolerance {
                tolerance: wad(dec!(0.6)),
                band: wad(dec!(0.6)),
            })
        );

        policy.execution.twap_convergence_tolerance = Wad::from_units(1000);
        assert!(matches!(
            policy.validate(),
            Err(EngineError::InvalidTwapConvergenceTolerance { .. })
        ));
    }

    #[test]
    fn test_zero_width_band_allows_only_zero_tolerance() {
        let mut policy = test_policy();
        policy.methodology.min_leverage_ratio = wad(dec!(2.0));
        policy.methodology.max_leverage_ratio = wad(dec!(2.0));
        assert!(policy.validate().is_ok());

        policy.execution.twap_convergence_tolerance = wad(dec!(0.001));
        assert!(matches!(
            policy.validate(),
            Err(EngineError::InvalidTwapConvergenceTolerance { .. })
        ));
    }

    #[test]
    fn test_validate_address_valid() {
        assert!(validate_address("0xcA11bde05977b3631167028862bE2a173976CA11").is_ok());
    }

    #[test]
    fn test_validate_address_no_prefix() {
        let err = validate_address("cA11bde05977b3631167028862bE2a173976CA11").unwrap_err();
        assert!(err.contains("must start with 0x"));
    }

    #[test]
    fn test_validate_address_wrong_length() {
        let err = validate_address("0xcA11bde05977b3631167028862bE2a17").unwrap_err();
        assert!(err.contains("length"));
    }

    #[test]
    fn test_validate_address_non_hex() {
        let err = validate_address("0xZZ11bde05977b3631167028862bE2a173976CA11").unwrap_err();
        assert!(err.contains("non-hex"));
    }
}
