use tracing::debug;

use crate::errors::EngineError;
use crate::types::{Asset, MarketSnapshot, Wad};

/// Lending-market and oracle readings for one position.
///
/// Read synchronously under the strategy lock, once per call.
pub trait MarketDataSource: Send + Sync {
    /// Wrapper-token balance held as collateral.
    fn wrapped_collateral_balance(&self) -> Result<Wad, EngineError>;
    /// Underlying collateral per wrapper token.
    fn exchange_rate(&self) -> Result<Wad, EngineError>;
    fn borrow_balance(&self) -> Result<Wad, EngineError>;
    fn price(&self, asset: Asset) -> Result<Wad, EngineError>;
    fn collateral_factor(&self) -> Result<Wad, EngineError>;
    fn total_supply(&self) -> Result<Wad, EngineError>;
}

/// Read every input the engine needs into one consistent snapshot.
pub fn capture_snapshot(source: &dyn MarketDataSource) -> Result<MarketSnapshot, EngineError> {
    let snapshot = MarketSnapshot::from_parts(
        source.wrapped_collateral_balance()?,
        source.exchange_rate()?,
        source.borrow_balance()?,
        source.price(Asset::Collateral)?,
        source.price(Asset::Borrow)?,
        source.collateral_factor()?,
        source.total_supply()?,
    )?;

    if snapshot.collateral_price.is_zero() || snapshot.borrow_price.is_zero() {
        return Err(EngineError::MarketData {
            reason: "oracle returned a zero price".into(),
        });
    }

    debug!(
        collateral = %snapshot.collateral_balance,
        debt = %snapshot.borrow_balance,
        collateral_price = %snapshot.collateral_price,
        borrow_price = %snapshot.borrow_price,
        supply = %snapshot.total_supply,
        "market snapshot"
    );
    Ok(snapshot)
}
