use alloy::primitives::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Wad;

/// Exchange adapters the gateway can route through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeId {
    UniswapV3,
    ZeroEx,
    AmmSplitter,
    /// In-memory venue used for dry runs and tests.
    Paper,
}

impl ExchangeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UniswapV3 => "uniswap_v3",
            Self::ZeroEx => "zero_ex",
            Self::AmmSplitter => "amm_splitter",
            Self::Paper => "paper",
        }
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the leverage module does around the swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeKind {
    /// Borrow `send_quantity` of the borrow asset, swap to collateral, supply.
    Lever,
    /// Redeem `send_quantity` collateral, swap, repay.
    Delever,
    /// Redeem up to `send_quantity` collateral, swap, repay the whole debt.
    /// Leftover borrow asset stays with the position as a plain holding.
    DeleverToZeroBorrowBalance,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lever => "lever",
            Self::Delever => "delever",
            Self::DeleverToZeroBorrowBalance => "delever_to_zero_borrow_balance",
        }
    }
}

/// Fully sized instruction handed to an [`ExchangeAdapter`](crate::execution::exchange::ExchangeAdapter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeRequest {
    pub kind: TradeKind,
    pub send_quantity: Wad,
    /// Adapters must not settle below this amount of the received asset.
    pub min_receive_quantity: Wad,
    /// Opaque routing payload from the execution settings.
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_id_round_trips_through_config_names() {
        let id: ExchangeId = serde_json::from_str("\"uniswap_v3\"").unwrap();
        assert_eq!(id, ExchangeId::UniswapV3);
        assert_eq!(id.to_string(), "uniswap_v3");
    }
}
