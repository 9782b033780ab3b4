use std::time::Duration;

use alloy::primitives::U256;

use crate::types::Wad;

// ---------------------------------------------------------------------------
// Keeper loop
// ---------------------------------------------------------------------------

/// Consecutive failed polls after which the keeper logs at error level.
pub const KEEPER_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Pause after a failed poll before the next attempt.
pub const KEEPER_ERROR_BACKOFF: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Directory searched when `REBALANCER_CONFIG_DIR` is unset.
pub const DEFAULT_CONFIG_DIR: &str = "config";

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

/// A remaining move this close to the trade-size cap is traded in one chunk.
/// Totals are recomputed from rounded market values on every call and can
/// drift a few wei above the cap.
pub const CHUNK_ROUNDING_DUST: Wad = Wad(U256::from_limbs([1_000, 0, 0, 0]));

// ---------------------------------------------------------------------------
// Ledgers
// ---------------------------------------------------------------------------

/// Entries kept in the payout and paper fill histories. Older entries are
/// dropped first.
pub const LEDGER_HISTORY_LIMIT: usize = 256;
