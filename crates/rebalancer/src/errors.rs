use alloy::primitives::Address;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{ExchangeId, Wad};

/// Fixed-point arithmetic failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MathError {
    #[error("arithmetic overflow")]
    Overflow,

    #[error("arithmetic underflow")]
    Underflow,

    #[error("division by zero")]
    DivisionByZero,

    #[error("negative value {0} cannot be represented as a WAD")]
    Negative(Decimal),
}

/// Coarse classification of [`EngineError`] used by keepers to decide whether
/// to retry, re-poll, or alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad configuration or argument. Nothing was mutated.
    Validation,
    /// The caller or role may not perform the action. Retrying with the
    /// same identity cannot succeed.
    Permission,
    /// Wrong state for the requested action. Poll `should_rebalance` first.
    Precondition,
    /// Reflects external market state.
    Market,
    /// The trade was attempted and rejected. Nothing was committed.
    Execution,
    /// Lock poisoning and other engine faults.
    Internal,
}

/// Typed error hierarchy for the rebalancing engine.
///
/// Application code wraps with `anyhow::Context` for propagation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    // -- Validation ---------------------------------------------------------
    #[error("leverage ratios must satisfy 0 < min ({min}) <= target ({target}) <= max ({max}) < incentivized ({incentivized})")]
    InvalidLeverageRatios {
        min: Wad,
        target: Wad,
        max: Wad,
        incentivized: Wad,
    },

    #[error("recentering speed {0} must be in (0, 1]")]
    InvalidRecenteringSpeed(Wad),

    #[error("unutilized leverage percentage {0} must be < 1")]
    InvalidUnutilizedLeveragePercentage(Wad),

    #[error("{field} {value} must be < 1")]
    InvalidSlippageTolerance { field: &'static str, value: Wad },

    #[error("cooldowns must satisfy incentivized ({incentivized}s) < twap ({twap}s) < rebalance interval ({interval}s)")]
    InvalidCooldownPeriods {
        incentivized: u64,
        twap: u64,
        interval: u64,
    },

    #[error("twap max trade size ({twap}) must be > 0 and <= incentivized twap max trade size ({incentivized})")]
    InvalidTwapMaxTradeSize { twap: Wad, incentivized: Wad },

    #[error("twap convergence tolerance {tolerance} must be 0 or < the leverage band width {band}")]
    InvalidTwapConvergenceTolerance { tolerance: Wad, band: Wad },

    #[error("custom bounds must widen the methodology band")]
    InvalidCustomBounds,

    #[error("exchange {0} is not registered")]
    UnknownExchange(ExchangeId),

    // -- Preconditions ------------------------------------------------------
    #[error("caller {0} is not the operator")]
    NotOperator(Address),

    #[error("address {0} is not permitted to rebalance")]
    AddressNotPermitted(Address),

    #[error("caller must be an externally owned account")]
    CallerMustBeEOA,

    #[error("rebalance in progress: must call iterate_rebalance")]
    MustCallIterate,

    #[error("not in a TWAP rebalance")]
    NotInTwap,

    #[error("rebalance interval not elapsed and leverage ratio {0} is within bounds")]
    CooldownOrInvalidRatio(Wad),

    #[error("cooldown not elapsed: {remaining}s remaining")]
    CooldownNotElapsed { remaining: u64 },

    #[error("leverage ratio {current} is at or above incentivized ratio {incentivized}: must call ripcord")]
    MustCallRipcord { current: Wad, incentivized: Wad },

    #[error("leverage ratio {current} is below incentivized ratio {incentivized}")]
    BelowIncentivizedThreshold { current: Wad, incentivized: Wad },

    #[error("configuration locked: rebalance in progress")]
    RebalanceInProgress,

    #[error("another operation is in progress on this position")]
    OperationInProgress,

    // -- Market -------------------------------------------------------------
    #[error("debt must be zero to engage")]
    DebtMustBeZero,

    #[error("position token supply must be > 0")]
    ZeroSupply,

    #[error("collateral balance must be > 0")]
    ZeroCollateral,

    #[error("borrow balance must exist")]
    BorrowBalanceMustExist,

    #[error("no borrow capacity left for a {0} trade")]
    NoBorrowCapacity(&'static str),

    #[error("market data unavailable: {reason}")]
    MarketData { reason: String },

    #[error(transparent)]
    Math(#[from] MathError),

    // -- Execution ----------------------------------------------------------
    #[error("received {received} is below minimum {minimum}")]
    InsufficientReceived { received: Wad, minimum: Wad },

    #[error("exchange {exchange} failed: {reason}")]
    Exchange { exchange: ExchangeId, reason: String },

    // -- Internal -----------------------------------------------------------
    #[error("strategy state lock poisoned")]
    StatePoisoned,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        use EngineError::*;
        match self {
            InvalidLeverageRatios { .. }
            | InvalidRecenteringSpeed(_)
            | InvalidUnutilizedLeveragePercentage(_)
            | InvalidSlippageTolerance { .. }
            | InvalidCooldownPeriods { .. }
            | InvalidTwapMaxTradeSize { .. }
            | InvalidTwapConvergenceTolerance { .. }
            | InvalidCustomBounds
            | UnknownExchange(_) => ErrorKind::Validation,

            NotOperator(_) | AddressNotPermitted(_) | CallerMustBeEOA => ErrorKind::Permission,

            MustCallIterate
            | NotInTwap
            | CooldownOrInvalidRatio(_)
            | CooldownNotElapsed { .. }
            | MustCallRipcord { .. }
            | BelowIncentivizedThreshold { .. }
            | RebalanceInProgress
            | OperationInProgress => ErrorKind::Precondition,

            DebtMustBeZero
            | ZeroSupply
            | ZeroCollateral
            | BorrowBalanceMustExist
            | NoBorrowCapacity(_)
            | MarketData { .. }
            | Math(_) => ErrorKind::Market,

            InsufficientReceived { .. } | Exchange { .. } => ErrorKind::Execution,

            StatePoisoned => ErrorKind::Internal,
        }
    }
}
