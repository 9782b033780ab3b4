//! Who may call what.
//!
//! The operator configures the strategy and engages or disengages the
//! position. Keeper actions (`rebalance`, `iterate_rebalance`) are limited to
//! an allowlist unless the strategy is opened to anyone. Every keeper action,
//! `ripcord` included, refuses contract callers.

use std::collections::HashSet;

use alloy::primitives::Address;
use tracing::info;

use crate::errors::EngineError;
use crate::types::Caller;

/// Proof that the holder was checked against the operator address.
///
/// Only [`AccessPolicy::authorize_operator`] mints one. Setters still compare
/// the embedded address with the current operator, so a token outlives an
/// operator change only as a rejected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorRole {
    address: Address,
}

impl OperatorRole {
    pub fn address(&self) -> Address {
        self.address
    }
}

#[derive(Debug, Clone)]
pub struct AccessPolicy {
    operator: Address,
    allowed_callers: HashSet<Address>,
    anyone_callable: bool,
}

impl AccessPolicy {
    pub fn new(operator: Address) -> Self {
        Self {
            operator,
            allowed_callers: HashSet::new(),
            anyone_callable: false,
        }
    }

    pub fn with_allowed_callers(mut self, callers: impl IntoIterator<Item = Address>) -> Self {
        self.allowed_callers.extend(callers);
        self
    }

    pub fn with_anyone_callable(mut self, anyone_callable: bool) -> Self {
        self.anyone_callable = anyone_callable;
        self
    }

    pub fn operator(&self) -> Address {
        self.operator
    }

    pub fn anyone_callable(&self) -> bool {
        self.anyone_callable
    }

    pub fn is_allowed_caller(&self, address: Address) -> bool {
        self.anyone_callable || self.allowed_callers.contains(&address)
    }

    pub fn is_operator(&self, address: Address) -> bool {
        address == self.operator
    }

    pub fn authorize_operator(&self, address: Address) -> Result<OperatorRole, EngineError> {
        if !self.is_operator(address) {
            return Err(EngineError::NotOperator(address));
        }
        Ok(OperatorRole { address })
    }

    /// Re-validate a previously issued role against the current operator.
    pub fn check_role(&self, role: &OperatorRole) -> Result<(), EngineError> {
        if !self.is_operator(role.address) {
            return Err(EngineError::NotOperator(role.address));
        }
        Ok(())
    }

    pub fn check_eoa(&self, caller: &Caller) -> Result<(), EngineError> {
        if !caller.is_eoa() {
            return Err(EngineError::CallerMustBeEOA);
        }
        Ok(())
    }

    /// EOA check first, then the allowlist.
    pub fn check_keeper(&self, caller: &Caller) -> Result<(), EngineError> {
        self.check_eoa(caller)?;
        if !self.is_allowed_caller(caller.address) {
            return Err(EngineError::AddressNotPermitted(caller.address));
        }
        Ok(())
    }

    pub fn update_caller_status(&mut self, updates: &[(Address, bool)]) {
        for &(caller, allowed) in updates {
            if allowed {
                self.allowed_callers.insert(caller);
            } else {
                self.allowed_callers.remove(&caller);
            }
            info!(%caller, allowed, "caller status updated");
        }
    }

    pub fn set_anyone_callable(&mut self, anyone_callable: bool) {
        self.anyone_callable = anyone_callable;
        info!(anyone_callable, "anyone-callable flag updated");
    }
}
