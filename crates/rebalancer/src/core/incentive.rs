//! Bounty pool paid out to ripcord callers.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use alloy::primitives::Address;
use tracing::{info, warn};

use crate::constants::LEDGER_HISTORY_LIMIT;
use crate::types::Wad;

/// One bounty payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Payout {
    pub recipient: Address,
    pub requested: Wad,
    pub paid: Wad,
}

#[derive(Debug, Default)]
struct Ledger {
    balance: Wad,
    /// Most recent payouts, oldest first.
    payouts: VecDeque<Payout>,
}

/// Holds the reward balance. Payouts degrade to whatever is left instead of
/// failing, so a drained pool never blocks an emergency delever.
#[derive(Debug, Default)]
pub struct IncentiveSettlement {
    ledger: Mutex<Ledger>,
}

impl IncentiveSettlement {
    pub fn new(initial_balance: Wad) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                balance: initial_balance,
                payouts: VecDeque::new(),
            }),
        }
    }

    // No mutation can panic halfway, so a poisoned guard still holds a
    // consistent ledger.
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn balance(&self) -> Wad {
        self.ledger().balance
    }

    /// What a caller would receive right now for a `requested` bounty.
    pub fn current_incentive(&self, requested: Wad) -> Wad {
        requested.min(self.balance())
    }

    /// Pay `min(requested, balance)` to `recipient`.
    pub fn payout(&self, requested: Wad, recipient: Address) -> Wad {
        let mut ledger = self.ledger();
        let paid = requested.min(ledger.balance);
        ledger.balance = ledger.balance.saturating_sub(paid);
        if ledger.payouts.len() == LEDGER_HISTORY_LIMIT {
            ledger.payouts.pop_front();
        }
        ledger.payouts.push_back(Payout {
            recipient,
            requested,
            paid,
        });

        if paid < requested {
            warn!(%recipient, %requested, %paid, "incentive pool short, partial bounty paid");
        } else {
            info!(%recipient, %paid, "bounty paid");
        }
        paid
    }

    /// Drain the pool. Returns the amount removed.
    pub fn withdraw_all(&self) -> Wad {
        let mut ledger = self.ledger();
        let amount = ledger.balance;
        ledger.balance = Wad::ZERO;
        info!(%amount, "incentive pool withdrawn");
        amount
    }

    /// Up to [`LEDGER_HISTORY_LIMIT`] most recent payouts, oldest first.
    pub fn payouts(&self) -> Vec<Payout> {
        self.ledger().payouts.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn wad(d: rust_decimal::Decimal) -> Wad {
        Wad::from_decimal(d).unwrap()
    }

    #[test]
    fn test_payout_full_when_funded() {
        let pool = IncentiveSettlement::new(Wad::from_units(5));
        let paid = pool.payout(Wad::ONE, Address::ZERO);
        assert_eq!(paid, Wad::ONE);
        assert_eq!(pool.balance(), Wad::from_units(4));
    }

    #[test]
    fn test_payout_degrades_to_balance() {
        let pool = IncentiveSettlement::new(wad(dec!(0.3)));
        let paid = pool.payout(Wad::ONE, Address::ZERO);
        assert_eq!(paid, wad(dec!(0.3)));
        assert_eq!(pool.balance(), Wad::ZERO);

        let payouts = pool.payouts();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].requested, Wad::ONE);
        assert_eq!(payouts[0].paid, wad(dec!(0.3)));
    }

    #[test]
    fn test_empty_pool_pays_zero() {
        let pool = IncentiveSettlement::default();
        assert_eq!(pool.payout(Wad::ONE, Address::ZERO), Wad::ZERO);
        assert_eq!(pool.current_incentive(Wad::ONE), Wad::ZERO);
    }

    #[test]
    fn test_withdraw_drains_pool() {
        let pool = IncentiveSettlement::new(Wad::from_units(2));
        assert_eq!(pool.withdraw_all(), Wad::from_units(2));
        assert_eq!(pool.balance(), Wad::ZERO);
        assert_eq!(pool.withdraw_all(), Wad::ZERO);
    }

    #[test]
    fn test_payout_history_keeps_most_recent() {
        let pool = IncentiveSettlement::default();
        let total = LEDGER_HISTORY_LIMIT as u64 + 10;
        for n in 0..total {
            pool.payout(Wad::from_units(n), Address::ZERO);
        }

        let payouts = pool.payouts();
        assert_eq!(payouts.len(), LEDGER_HISTORY_LIMIT);
        assert_eq!(payouts[0].requested, Wad::from_units(10));
        assert_eq!(payouts.last().unwrap().requested, Wad::from_units(total - 1));
    }
}
