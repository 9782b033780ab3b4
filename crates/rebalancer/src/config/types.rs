use alloy::primitives::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{ExchangeId, Wad};

// ---------------------------------------------------------------------------
// Top-level aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RebalancerConfig {
    pub app: AppConfig,
    pub policy: PolicyConfig,
    pub keeper: KeeperConfig,
}

// ---------------------------------------------------------------------------
// app.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub log_dir: String,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub default_filter: String,
}

fn default_log_filter() -> String {
    "leverage_rebalancer=info,warn".into()
}

// ---------------------------------------------------------------------------
// policy.json
// ---------------------------------------------------------------------------

/// Complete policy for one leveraged position.
///
/// Only constructed through deserialization or the strategy setters, both of
/// which run [`PolicyConfig::validate`](super::validate) before the value is
/// used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub methodology: MethodologySettings,
    pub execution: ExecutionSettings,
    pub incentive: IncentiveSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodologySettings {
    pub target_leverage_ratio: Wad,
    pub min_leverage_ratio: Wad,
    pub max_leverage_ratio: Wad,
    /// Fraction of the gap to target closed per rebalance.
    pub recentering_speed: Wad,
    /// Seconds between time-based rebalances.
    pub rebalance_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Share of borrow capacity kept unused as a liquidation buffer.
    pub unutilized_leverage_percentage: Wad,
    /// Collateral units per chunk.
    pub twap_max_trade_size: Wad,
    /// Seconds between TWAP chunks.
    pub twap_cooldown_period: u64,
    pub slippage_tolerance: Wad,
    pub exchange: ExchangeId,
    #[serde(with = "hex_bytes", default)]
    pub lever_exchange_data: Bytes,
    #[serde(with = "hex_bytes", default)]
    pub delever_exchange_data: Bytes,
    /// Distance from the in-flight TWAP target at which `iterate_rebalance`
    /// stops trading and clears the sequence.
    #[serde(default)]
    pub twap_convergence_tolerance: Wad,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncentiveSettings {
    pub incentivized_twap_max_trade_size: Wad,
    /// Seconds between ripcord calls.
    pub incentivized_twap_cooldown_period: u64,
    pub incentivized_slippage_tolerance: Wad,
    /// Bounty ceiling paid to ripcord callers.
    pub ether_reward: Wad,
    pub incentivized_leverage_ratio: Wad,
}

// ---------------------------------------------------------------------------
// keeper.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeeperConfig {
    /// Address the keeper signs as.
    pub address: String,
    pub operator: String,
    #[serde(default)]
    pub allowed_callers: Vec<String>,
    #[serde(default)]
    pub anyone_callable: bool,
    pub poll_interval_seconds: u64,
    /// Initial bounty pool balance.
    #[serde(default)]
    pub reward_pool_balance: Wad,
    pub paper: PaperVenueConfig,
}

/// Seed for the in-memory lending market and exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct PaperVenueConfig {
    pub collateral_units: Wad,
    pub collateral_price: Wad,
    pub borrow_price: Wad,
    pub collateral_factor: Wad,
    pub exchange_rate: Wad,
    pub total_supply: Wad,
    /// Price impact applied to every paper swap.
    #[serde(default)]
    pub swap_fee: Wad,
}

/// Hex-encode/decode routing payloads for JSON serialization.
mod hex_bytes {
    use alloy::primitives::{hex, Bytes};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode_prefixed(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
