//! Exchange adapters and the registry the strategy trades through.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::types::{ExchangeId, TradeRequest, Wad};

/// A venue that can execute one leverage-module trade.
///
/// Implementations run synchronously while the strategy lock is held and
/// must not settle below `request.min_receive_quantity`. They return the
/// amount of the received asset.
pub trait ExchangeAdapter: Send + Sync {
    fn trade(&self, request: &TradeRequest) -> Result<Wad, EngineError>;
}

/// `expected * (1 - slippage)`, truncated.
pub fn minimum_receive(expected: Wad, slippage_tolerance: Wad) -> Result<Wad, EngineError> {
    let kept = Wad::ONE.checked_sub(slippage_tolerance)?;
    Ok(expected.precise_mul(kept)?)
}

/// Typed registry of adapters, injected into the strategy at construction.
#[derive(Clone, Default)]
pub struct ExchangeGateway {
    adapters: HashMap<ExchangeId, Arc<dyn ExchangeAdapter>>,
}

impl fmt::Debug for ExchangeGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeGateway")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExchangeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, id: ExchangeId, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        self.register(id, adapter);
        self
    }

    pub fn register(&mut self, id: ExchangeId, adapter: Arc<dyn ExchangeAdapter>) {
        if self.adapters.insert(id, adapter).is_some() {
            warn!(exchange = %id, "replacing registered exchange adapter");
        }
    }

    pub fn contains(&self, id: ExchangeId) -> bool {
        self.adapters.contains_key(&id)
    }

    pub fn ensure_registered(&self, id: ExchangeId) -> Result<(), EngineError> {
        if !self.contains(id) {
            return Err(EngineError::UnknownExchange(id));
        }
        Ok(())
    }

    /// Route `request` to `exchange` and verify the minimum was honoured.
    pub fn execute(&self, exchange: ExchangeId, request: &TradeRequest) -> Result<Wad, EngineError> {
        let adapter = self
            .adapters
            .get(&exchange)
            .ok_or(EngineError::UnknownExchange(exchange))?;

        debug!(
            %exchange,
            kind = request.kind.as_str(),
            send = %request.send_quantity,
            min_receive = %request.min_receive_quantity,
            "submitting trade"
        );

        let received = adapter.trade(request)?;
        if received < request.min_receive_quantity {
            warn!(
                %exchange,
                %received,
                minimum = %request.min_receive_quantity,
                "exchange settled below minimum"
            );
            return Err(EngineError::InsufficientReceived {
                received,
                minimum: request.min_receive_quantity,
            });
        }

        info!(
            %exchange,
            kind = request.kind.as_str(),
            send = %request.send_quantity,
            %received,
            "trade settled"
        );
        Ok(received)
    }
}
