//! In-memory lending market and leverage module.
//!
//! Implements both [`MarketDataSource`] and [`ExchangeAdapter`] over one
//! shared book so trades immediately move the readings the strategy sees.
//! Swaps fill at oracle price less `swap_fee`. A trade that would fill below
//! its minimum is rejected without touching the book.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::config::PaperVenueConfig;
use crate::constants::LEDGER_HISTORY_LIMIT;
use crate::errors::EngineError;
use crate::execution::exchange::ExchangeAdapter;
use crate::execution::market::MarketDataSource;
use crate::types::{Asset, ExchangeId, TradeKind, TradeRequest, Wad};

#[derive(Debug, Clone)]
struct Book {
    wrapped_collateral: Wad,
    exchange_rate: Wad,
    borrow_balance: Wad,
    /// Borrow asset left over after a full unwind.
    borrow_holding: Wad,
    collateral_price: Wad,
    borrow_price: Wad,
    collateral_factor: Wad,
    total_supply: Wad,
    swap_fee: Wad,
    fail_next: Option<String>,
    /// Most recent fills, oldest first.
    fills: VecDeque<PaperFill>,
}

/// Record of a settled paper trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperFill {
    pub request: TradeRequest,
    pub received: Wad,
}

#[derive(Debug)]
pub struct PaperVenue {
    book: Mutex<Book>,
}

impl PaperVenue {
    pub fn from_config(config: &PaperVenueConfig) -> Result<Self, EngineError> {
        let wrapped_collateral = config.collateral_units.precise_div(config.exchange_rate)?;
        Ok(Self {
            book: Mutex::new(Book {
                wrapped_collateral,
                exchange_rate: config.exchange_rate,
                borrow_balance: Wad::ZERO,
                borrow_holding: Wad::ZERO,
                collateral_price: config.collateral_price,
                borrow_price: config.borrow_price,
                collateral_factor: config.collateral_factor,
                total_supply: config.total_supply,
                swap_fee: config.swap_fee,
                fail_next: None,
                fills: VecDeque::new(),
            }),
        })
    }

    fn book(&self) -> Result<MutexGuard<'_, Book>, EngineError> {
        self.book.lock().map_err(|_| EngineError::MarketData {
            reason: "paper book lock poisoned".into(),
        })
    }

    // -----------------------------------------------------------------------
    // Scenario controls
    // -----------------------------------------------------------------------

    pub fn set_price(&self, asset: Asset, price: Wad) -> Result<(), EngineError> {
        let mut book = self.book()?;
        match asset {
            Asset::Collateral => book.collateral_price = price,
            Asset::Borrow => book.borrow_price = price,
        }
        info!(asset = asset.as_str(), %price, "paper price moved");
        Ok(())
    }

    pub fn set_exchange_rate(&self, rate: Wad) -> Result<(), EngineError> {
        self.book()?.exchange_rate = rate;
        Ok(())
    }

    pub fn set_total_supply(&self, supply: Wad) -> Result<(), EngineError> {
        self.book()?.total_supply = supply;
        Ok(())
    }

    pub fn set_swap_fee(&self, fee: Wad) -> Result<(), EngineError> {
        self.book()?.swap_fee = fee;
        Ok(())
    }

    /// Make the next trade fail with `reason`.
    pub fn fail_next_trade(&self, reason: impl Into<String>) -> Result<(), EngineError> {
        self.book()?.fail_next = Some(reason.into());
        Ok(())
    }

    pub fn collateral_balance(&self) -> Result<Wad, EngineError> {
        let book = self.book()?;
        Ok(book.wrapped_collateral.precise_mul(book.exchange_rate)?)
    }

    pub fn borrow_holding(&self) -> Result<Wad, EngineError> {
        Ok(self.book()?.borrow_holding)
    }

    /// Up to [`LEDGER_HISTORY_LIMIT`] most recent fills, oldest first.
    pub fn fills(&self) -> Result<Vec<PaperFill>, EngineError> {
        Ok(self.book()?.fills.iter().cloned().collect())
    }
}

impl Book {
    fn collateral_units(&self) -> Result<Wad, EngineError> {
        Ok(self.wrapped_collateral.precise_mul(self.exchange_rate)?)
    }

    fn after_fee(&self, amount: Wad) -> Result<Wad, EngineError> {
        Ok(amount.precise_mul(Wad::ONE.checked_sub(self.swap_fee)?)?)
    }

    fn borrow_to_collateral(&self, borrow_units: Wad) -> Result<Wad, EngineError> {
        let gross = borrow_units
            .precise_mul(self.borrow_price)?
            .precise_div(self.collateral_price)?;
        self.after_fee(gross)
    }

    fn collateral_to_borrow(&self, collateral_units: Wad) -> Result<Wad, EngineError> {
        let gross = collateral_units
            .precise_mul(self.collateral_price)?
            .precise_div(self.borrow_price)?;
        self.after_fee(gross)
    }

    fn redeem(&mut self, collateral_units: Wad) -> Result<(), EngineError> {
        if collateral_units > self.collateral_units()? {
            return Err(EngineError::Exchange {
                exchange: ExchangeId::Paper,
                reason: format!("cannot redeem {collateral_units} collateral"),
            });
        }
        let wrapped = collateral_units.precise_div_ceil(self.exchange_rate)?;
        self.wrapped_collateral = self.wrapped_collateral.saturating_sub(wrapped);
        Ok(())
    }
}

fn below_minimum(received: Wad, minimum: Wad) -> Result<(), EngineError> {
    if received < minimum {
        return Err(EngineError::InsufficientReceived { received, minimum });
    }
    Ok(())
}

impl ExchangeAdapter for PaperVenue {
    fn trade(&self, request: &TradeRequest) -> Result<Wad, EngineError> {
        let mut book = self.book()?;
        if let Some(reason) = book.fail_next.take() {
            return Err(EngineError::Exchange {
                exchange: ExchangeId::Paper,
                reason,
            });
        }

        // Work on a copy so a rejected trade leaves the book untouched.
        let mut next = book.clone();
        let received = match request.kind {
            TradeKind::Lever => {
                let received = next.borrow_to_collateral(request.send_quantity)?;
                below_minimum(received, request.min_receive_quantity)?;
                next.borrow_balance = next.borrow_balance.checked_add(request.send_quantity)?;
                let wrapped = received.precise_div(next.exchange_rate)?;
                next.wrapped_collateral = next.wrapped_collateral.checked_add(wrapped)?;
                received
            }
            TradeKind::Delever => {
                let received = next.collateral_to_borrow(request.send_quantity)?;
                below_minimum(received, request.min_receive_quantity)?;
                next.redeem(request.send_quantity)?;
                let repay = received.min(next.borrow_balance);
                next.borrow_balance = next.borrow_balance.saturating_sub(repay);
                next.borrow_holding = next
                    .borrow_holding
                    .checked_add(received.saturating_sub(repay))?;
                received
            }
            TradeKind::DeleverToZeroBorrowBalance => {
                let received = next.collateral_to_borrow(request.send_quantity)?;
                below_minimum(received, request.min_receive_quantity)?;
                below_minimum(received, next.borrow_balance)?;
                next.redeem(request.send_quantity)?;
                let residual = received.checked_sub(next.borrow_balance)?;
                next.borrow_balance = Wad::ZERO;
                next.borrow_holding = next.borrow_holding.checked_add(residual)?;
                received
            }
        };

        if next.fills.len() == LEDGER_HISTORY_LIMIT {
            next.fills.pop_front();
        }
        next.fills.push_back(PaperFill {
            request: request.clone(),
            received,
        });
        debug!(
            kind = request.kind.as_str(),
            collateral = %next.collateral_units()?,
            debt = %next.borrow_balance,
            "paper book updated"
        );
        *book = next;
        Ok(received)
    }
}

impl MarketDataSource for PaperVenue {
    fn wrapped_collateral_balance(&self) -> Result<Wad, EngineError> {
        Ok(self.book()?.wrapped_collateral)
    }

    fn exchange_rate(&self) -> Result<Wad, EngineError> {
        Ok(self.book()?.exchange_rate)
    }

    fn borrow_balance(&self) -> Result<Wad, EngineError> {
        Ok(self.book()?.borrow_balance)
    }

    fn price(&self, asset: Asset) -> Result<Wad, EngineError> {
        let book = self.book()?;
        Ok(match asset {
            Asset::Collateral => book.collateral_price,
            Asset::Borrow => book.borrow_price,
        })
    }

    fn collateral_factor(&self) -> Result<Wad, EngineError> {
        Ok(self.book()?.collateral_factor)
    }

    fn total_supply(&self) -> Result<Wad, EngineError> {
        Ok(self.book()?.total_supply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Bytes;
    use rust_decimal_macros::dec;

    fn venue() -> PaperVenue {
        PaperVenue::from_config(&PaperVenueConfig {
            collateral_units: Wad::from_units(10),
            collateral_price: Wad::from_units(100),
            borrow_price: Wad::ONE,
            collateral_factor: Wad::from_decimal(dec!(0.8)).unwrap(),
            exchange_rate: Wad::from_decimal(dec!(0.5)).unwrap(),
            total_supply: Wad::from_units(10),
            swap_fee: Wad::ZERO,
        })
        .unwrap()
    }

    fn request(kind: TradeKind, send: Wad, min: Wad) -> TradeRequest {
        TradeRequest {
            kind,
            send_quantity: send,
            min_receive_quantity: min,
            data: Bytes::new(),
        }
    }

    #[test]
    fn test_wrapped_balance_from_exchange_rate() {
        let venue = venue();
        assert_eq!(venue.wrapped_collateral_balance().unwrap(), Wad::from_units(20));
        assert_eq!(venue.collateral_balance().unwrap(), Wad::from_units(10));
    }

    #[test]
    fn test_lever_adds_debt_and_collateral() {
        let venue = venue();
        let received = venue
            .trade(&request(TradeKind::Lever, Wad::from_units(500), Wad::from_units(5)))
            .unwrap();
        assert_eq!(received, Wad::from_units(5));
        assert_eq!(venue.borrow_balance().unwrap(), Wad::from_units(500));
        assert_eq!(venue.collateral_balance().unwrap(), Wad::from_units(15));
    }

    #[test]
    fn test_delever_repays_debt() {
        let venue = venue();
        venue
            .trade(&request(TradeKind::Lever, Wad::from_units(500), Wad::ZERO))
            .unwrap();
        let received = venue
            .trade(&request(TradeKind::Delever, Wad::from_units(2), Wad::ZERO))
            .unwrap();
        assert_eq!(received, Wad::from_units(200));
        assert_eq!(venue.borrow_balance().unwrap(), Wad::from_units(300));
        assert_eq!(venue.collateral_balance().unwrap(), Wad::from_units(13));
    }

    #[test]
    fn test_delever_to_zero_keeps_residual() {
        let venue = venue();
        venue
            .trade(&request(TradeKind::Lever, Wad::from_units(500), Wad::ZERO))
            .unwrap();
        venue
            .trade(&request(
                TradeKind::DeleverToZeroBorrowBalance,
                Wad::from_units(6),
                Wad::from_units(500),
            ))
            .unwrap();
        assert_eq!(venue.borrow_balance().unwrap(), Wad::ZERO);
        assert_eq!(venue.borrow_holding().unwrap(), Wad::from_units(100));
        assert_eq!(venue.collateral_balance().unwrap(), Wad::from_units(9));
    }

    #[test]
    fn test_short_fill_leaves_book_untouched() {
        let venue = venue();
        venue.set_swap_fee(Wad::from_decimal(dec!(0.1)).unwrap()).unwrap();
        let err = venue
            .trade(&request(TradeKind::Lever, Wad::from_units(500), Wad::from_units(5)))
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientReceived { .. }));
        assert_eq!(venue.borrow_balance().unwrap(), Wad::ZERO);
        assert!(venue.fills().unwrap().is_empty());
    }

    #[test]
    fn test_fill_history_keeps_most_recent() {
        let venue = venue();
        let wei = |n: u64| Wad::from_raw(alloy::primitives::U256::from(n));
        for n in 1..=LEDGER_HISTORY_LIMIT as u64 + 5 {
            venue
                .trade(&request(TradeKind::Lever, wei(n), Wad::ZERO))
                .unwrap();
        }

        let fills = venue.fills().unwrap();
        assert_eq!(fills.len(), LEDGER_HISTORY_LIMIT);
        assert_eq!(fills[0].request.send_quantity, wei(6));
    }

    #[test]
    fn test_fail_next_trade_fires_once() {
        let venue = venue();
        venue.fail_next_trade("router down").unwrap();
        let err = venue
            .trade(&request(TradeKind::Lever, Wad::ONE, Wad::ZERO))
            .unwrap_err();
        assert!(matches!(err, EngineError::Exchange { .. }));
        assert!(venue
            .trade(&request(TradeKind::Lever, Wad::ONE, Wad::ZERO))
            .is_ok());
    }
}
