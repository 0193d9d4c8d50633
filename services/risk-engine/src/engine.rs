//! Risk Engine orchestrator
//!
//! Applies the rules in order; the first rejection wins:
//! 1. blacklist (destination, then the user's own wallet)
//! 2. token contract paused
//! 3. per-transaction limit
//! 4. velocity volume, then velocity count
//!
//! A request that passes every rule goes to manual review when its amount is
//! above the configured review threshold, and is approved otherwise.

use serde::{Deserialize, Serialize};
use tracing::debug;
use types::ledger::LedgerEntry;
use types::risk::{BlacklistEntry, RiskConfig, RiskDecision};
use types::withdrawal::WithdrawRequest;

use crate::validator;

/// Everything a decision depends on
#[derive(Debug, Clone, Copy)]
pub struct RiskInputs<'a> {
    pub request: &'a WithdrawRequest,
    /// User/asset history preceding this request's reservation
    pub history: &'a [LedgerEntry],
    pub config: &'a RiskConfig,
    /// Blacklist entries relevant to this request's addresses
    pub blacklist: &'a [BlacklistEntry],
    /// Pause state as read from the token contract
    pub contract_paused: bool,
}

/// Risk engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskEngineConfig {
    /// Also reject when the user's linked wallet is blacklisted
    pub check_owner_address: bool,
}

impl Default for RiskEngineConfig {
    fn default() -> Self {
        Self {
            check_owner_address: true,
        }
    }
}

/// Risk engine service
#[derive(Debug, Clone, Default)]
pub struct RiskEngine {
    config: RiskEngineConfig,
}

impl RiskEngine {
    /// Create a new risk engine with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new risk engine with custom configuration
    pub fn with_config(config: RiskEngineConfig) -> Self {
        Self { config }
    }

    /// Decide a withdrawal. No I/O, no clock, no hidden state.
    pub fn evaluate(&self, inputs: &RiskInputs<'_>) -> RiskDecision {
        let request = inputs.request;
        let rejection = validator::check_blacklist(
            request,
            inputs.blacklist,
            self.config.check_owner_address,
        )
        .or_else(|| validator::check_paused(inputs.contract_paused))
        .or_else(|| validator::check_per_tx_limit(request, inputs.config))
        .or_else(|| validator::check_velocity(request, inputs.history, inputs.config));

        let decision = match rejection {
            Some(rejection) => RiskDecision::Reject(rejection),
            None => match validator::needs_review(request, inputs.config) {
                Some(threshold) => RiskDecision::ManualReview {
                    reason: format!("amount above review threshold {}", threshold),
                },
                None => RiskDecision::Approve,
            },
        };

        debug!(
            withdraw_id = %request.id,
            amount = %request.amount,
            decision = ?decision,
            "Risk evaluated"
        );
        decision
    }
}
