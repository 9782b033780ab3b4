use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

use super::Wad;

/// Which way a trade moves the leverage ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    /// Borrow, swap into collateral, supply.
    Lever,
    /// Redeem collateral, swap into the borrow asset, repay.
    Delever,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lever => "lever",
            Self::Delever => "delever",
        }
    }
}

/// Whether a caller is an externally owned account or a contract.
///
/// Supplied by the dispatcher in front of the engine; contract callers are
/// refused on keeper-facing actions to prevent flash-loan composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerKind {
    ExternallyOwned,
    Contract,
}

/// Identity of whoever invokes an engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Caller {
    pub address: Address,
    pub kind: CallerKind,
}

impl Caller {
    pub fn eoa(address: Address) -> Self {
        Self {
            address,
            kind: CallerKind::ExternallyOwned,
        }
    }

    pub fn contract(address: Address) -> Self {
        Self {
            address,
            kind: CallerKind::Contract,
        }
    }

    pub fn is_eoa(&self) -> bool {
        self.kind == CallerKind::ExternallyOwned
    }
}

/// Progress of a chunked (TWAP) rebalance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TwapStatus {
    #[default]
    Idle,
    /// A capped chunk was traded; `target` is frozen until the sequence
    /// completes or the market reaches it on its own.
    InTwap {
        target: Wad,
        direction: TradeDirection,
    },
}

impl TwapStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InTwap { .. })
    }

    /// In-flight target ratio, zero when idle.
    pub fn leverage_ratio(&self) -> Wad {
        match self {
            Self::Idle => Wad::ZERO,
            Self::InTwap { target, .. } => *target,
        }
    }
}

/// Mutable engine state: the cooldown anchor and TWAP progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceState {
    /// Unix seconds of the last committed trade.
    pub last_trade_timestamp: u64,
    pub twap: TwapStatus,
}

impl RebalanceState {
    /// Seconds since the last trade (saturating for clocks behind the anchor).
    pub fn elapsed(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_trade_timestamp)
    }

    pub fn twap_leverage_ratio(&self) -> Wad {
        self.twap.leverage_ratio()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_has_zero_twap_ratio() {
        let state = RebalanceState::default();
        assert!(!state.twap.is_active());
        assert_eq!(state.twap_leverage_ratio(), Wad::ZERO);
        assert_eq!(state.last_trade_timestamp, 0);
    }

    #[test]
    fn test_in_twap_exposes_target() {
        let state = RebalanceState {
            last_trade_timestamp: 100,
            twap: TwapStatus::InTwap {
                target: Wad::from_units(2),
                direction: TradeDirection::Lever,
            },
        };
        assert!(state.twap.is_active());
        assert_eq!(state.twap_leverage_ratio(), Wad::from_units(2));
        assert_eq!(state.elapsed(160), 60);
        assert_eq!(state.elapsed(50), 0);
    }

    #[test]
    fn test_caller_kind() {
        assert!(Caller::eoa(Address::ZERO).is_eoa());
        assert!(!Caller::contract(Address::ZERO).is_eoa());
    }
}
