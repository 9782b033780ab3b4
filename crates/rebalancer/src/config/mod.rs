pub mod types;
pub mod validate;

pub use types::*;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

use crate::types::Wad;

/// Load and merge all config JSON files into a single [`RebalancerConfig`],
/// then apply environment variable overrides and validate.
///
/// Expected directory layout:
/// ```text
/// config/
///   app.json
///   policy.json
///   keeper.json
/// ```
///
/// # Environment variable overrides
///
/// | Env Var                        | Config Field                                   |
/// |--------------------------------|------------------------------------------------|
/// | `KEEPER_POLL_INTERVAL_SECONDS` | `keeper.poll_interval_seconds`                 |
/// | `KEEPER_ADDRESS`               | `keeper.address`                               |
/// | `TWAP_MAX_TRADE_SIZE`          | `policy.execution.twap_max_trade_size`         |
/// | `TARGET_LEVERAGE_RATIO`        | `policy.methodology.target_leverage_ratio`     |
pub fn load_config(config_dir: &Path) -> Result<RebalancerConfig> {
    let read = |name: &str| -> Result<String> {
        let path = config_dir.join(name);
        std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))
    };

    let app: AppConfig = serde_json::from_str(&read("app.json")?).context("parsing app.json")?;

    let policy: PolicyConfig =
        serde_json::from_str(&read("policy.json")?).context("parsing policy.json")?;

    let keeper: KeeperConfig =
        serde_json::from_str(&read("keeper.json")?).context("parsing keeper.json")?;

    let mut config = RebalancerConfig {
        app,
        policy,
        keeper,
    };

    apply_env_overrides(&mut config);
    validate::validate_config(&config)?;

    Ok(config)
}

// ---------------------------------------------------------------------------
// Environment variable overrides
// ---------------------------------------------------------------------------

/// Only non-empty env vars take effect. Parse failures are logged and skipped
/// (the JSON value remains).
fn apply_env_overrides(config: &mut RebalancerConfig) {
    // -- Keeper --------------------------------------------------------------
    if let Some(val) = env_parse::<u64>("KEEPER_POLL_INTERVAL_SECONDS") {
        info!(val, "env override: KEEPER_POLL_INTERVAL_SECONDS");
        config.keeper.poll_interval_seconds = val;
    }

    if let Some(val) = env_string("KEEPER_ADDRESS") {
        info!("env override: KEEPER_ADDRESS");
        config.keeper.address = val;
    }

    // -- Policy --------------------------------------------------------------
    if let Some(val) = env_wad("TWAP_MAX_TRADE_SIZE") {
        info!(%val, "env override: TWAP_MAX_TRADE_SIZE");
        config.policy.execution.twap_max_trade_size = val;
    }

    if let Some(val) = env_wad("TARGET_LEVERAGE_RATIO") {
        info!(%val, "env override: TARGET_LEVERAGE_RATIO");
        config.policy.methodology.target_leverage_ratio = val;
    }
}

/// Read a non-empty env var as a `String`.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Read a non-empty env var and parse it as `T`.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}

/// Read a non-empty env var as a non-negative decimal and convert it to a WAD.
fn env_wad(key: &str) -> Option<Wad> {
    let value = env_parse::<Decimal>(key)?;
    match Wad::from_decimal(value) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(key, error = %e, "ignoring env override");
            None
        }
    }
}

/// Baseline policy shared by unit tests across modules.
#[cfg(test)]
pub(crate) fn test_policy() -> PolicyConfig {
    use crate::types::ExchangeId;
    use alloy::primitives::Bytes;
    use rust_decimal_macros::dec;

    let wad = |d: Decimal| Wad::from_decimal(d).unwrap();
    PolicyConfig {
        methodology: MethodologySettings {
            target_leverage_ratio: wad(dec!(2.0)),
            min_leverage_ratio: wad(dec!(1.7)),
            max_leverage_ratio: wad(dec!(2.3)),
            recentering_speed: wad(dec!(0.05)),
            rebalance_interval: 86_400,
        },
        execution: ExecutionSettings {
            unutilized_leverage_percentage: wad(dec!(0.01)),
            twap_max_trade_size: wad(dec!(5)),
            twap_cooldown_period: 3_000,
            slippage_tolerance: wad(dec!(0.02)),
            exchange: ExchangeId::Paper,
            lever_exchange_data: Bytes::new(),
            delever_exchange_data: Bytes::new(),
            twap_convergence_tolerance: Wad::ZERO,
        },
        incentive: IncentiveSettings {
            incentivized_twap_max_trade_size: wad(dec!(10)),
            incentivized_twap_cooldown_period: 60,
            incentivized_slippage_tolerance: wad(dec!(0.05)),
            ether_reward: wad(dec!(1)),
            incentivized_leverage_ratio: wad(dec!(2.6)),
        },
    }
}
