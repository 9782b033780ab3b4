use serde::{Deserialize, Serialize};

use super::{Asset, TradeDirection, TwapStatus, Wad};

/// Answer to "what should a keeper call next?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShouldRebalance {
    NoAction,
    Rebalance,
    Iterate,
    Ripcord,
}

impl ShouldRebalance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoAction => "no_action",
            Self::Rebalance => "rebalance",
            Self::Iterate => "iterate",
            Self::Ripcord => "ripcord",
        }
    }
}

/// State-changing action that produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Engage,
    Rebalance,
    Iterate,
    Ripcord,
    Disengage,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Engage => "engage",
            Self::Rebalance => "rebalance",
            Self::Iterate => "iterate",
            Self::Ripcord => "ripcord",
            Self::Disengage => "disengage",
        }
    }
}

/// Sizing of the next trade, as computed before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub direction: TradeDirection,
    /// Collateral units traded by this call.
    pub chunk_notional: Wad,
    /// Collateral units required to reach the target in one go.
    pub total_notional: Wad,
    /// Asset sent to the exchange.
    pub sell_asset: Asset,
    /// Asset received from the exchange.
    pub buy_asset: Asset,
}

impl ChunkPlan {
    pub fn new(direction: TradeDirection, chunk_notional: Wad, total_notional: Wad) -> Self {
        let (sell_asset, buy_asset) = match direction {
            TradeDirection::Lever => (Asset::Borrow, Asset::Collateral),
            TradeDirection::Delever => (Asset::Collateral, Asset::Borrow),
        };
        Self {
            direction,
            chunk_notional,
            total_notional,
            sell_asset,
            buy_asset,
        }
    }

    /// More chunks are needed after this one.
    pub fn is_capped(&self) -> bool {
        self.chunk_notional < self.total_notional
    }
}

/// Result of a successful state-changing call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceOutcome {
    pub action: ActionKind,
    pub current_leverage_ratio: Wad,
    /// Ratio the trade was sized toward.
    pub target_leverage_ratio: Wad,
    /// `None` when the call completed without trading.
    pub plan: Option<ChunkPlan>,
    /// Amount received from the exchange (zero when no trade ran).
    pub received: Wad,
    pub twap: TwapStatus,
    /// Bounty paid to the caller (ripcord only).
    pub reward_paid: Option<Wad>,
}

impl RebalanceOutcome {
    pub fn traded(&self) -> bool {
        self.plan.is_some()
    }

    pub fn chunk_notional(&self) -> Wad {
        self.plan.map(|p| p.chunk_notional).unwrap_or(Wad::ZERO)
    }
}
