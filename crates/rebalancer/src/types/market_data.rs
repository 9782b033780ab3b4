use serde::{Deserialize, Serialize};

use crate::errors::MathError;

use super::Wad;

/// Which leg of the position an asset belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    /// Supplied asset (held through a yield-bearing wrapper).
    Collateral,
    /// Borrowed asset.
    Borrow,
}

impl Asset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collateral => "collateral",
            Self::Borrow => "borrow",
        }
    }
}

/// Point-in-time view of the position, read once per engine call.
///
/// All quantities are 18-decimal WADs. Prices share a common quote unit so
/// `balance * price` values are comparable across legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Wrapper-token balance held by the position.
    pub wrapped_collateral_balance: Wad,
    /// Underlying collateral per wrapper token.
    pub exchange_rate: Wad,
    /// Underlying collateral units (`wrapped * exchange_rate`).
    pub collateral_balance: Wad,
    pub borrow_balance: Wad,
    pub collateral_price: Wad,
    pub borrow_price: Wad,
    /// Maximum loan-to-value of the collateral asset.
    pub collateral_factor: Wad,
    /// Outstanding position-token supply.
    pub total_supply: Wad,
}

impl MarketSnapshot {
    /// Build from raw readings, deriving the underlying collateral balance.
    pub fn from_parts(
        wrapped_collateral_balance: Wad,
        exchange_rate: Wad,
        borrow_balance: Wad,
        collateral_price: Wad,
        borrow_price: Wad,
        collateral_factor: Wad,
        total_supply: Wad,
    ) -> Result<Self, MathError> {
        Ok(Self {
            wrapped_collateral_balance,
            exchange_rate,
            collateral_balance: wrapped_collateral_balance.precise_mul(exchange_rate)?,
            borrow_balance,
            collateral_price,
            borrow_price,
            collateral_factor,
            total_supply,
        })
    }

    pub fn collateral_value(&self) -> Result<Wad, MathError> {
        self.collateral_balance.precise_mul(self.collateral_price)
    }

    pub fn borrow_value(&self) -> Result<Wad, MathError> {
        self.borrow_balance.precise_mul(self.borrow_price)
    }

    pub fn has_debt(&self) -> bool {
        !self.borrow_balance.is_zero()
    }
}
