pub mod aggregator;
pub mod market_data;
pub mod position;
pub mod signal;
pub mod wad;

pub use aggregator::{ExchangeId, TradeKind, TradeRequest};
pub use market_data::{Asset, MarketSnapshot};
pub use position::{Caller, CallerKind, RebalanceState, TradeDirection, TwapStatus};
pub use signal::{ActionKind, ChunkPlan, RebalanceOutcome, ShouldRebalance};
pub use wad::Wad;
