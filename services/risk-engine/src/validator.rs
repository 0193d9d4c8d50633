//! Individual risk rules
//!
//! Each rule inspects its slice of the inputs and returns the rejection it
//! would raise, if any. The engine applies them in a fixed order and the
//! first hit wins.

use types::address::Address;
use types::ledger::LedgerEntry;
use types::numeric::Amount;
use types::risk::{BlacklistEntry, Rejection, RiskConfig};
use types::withdrawal::WithdrawRequest;

use crate::velocity;

/// Rule 1: destination or the user's own wallet is blacklisted.
pub fn check_blacklist(
    request: &WithdrawRequest,
    blacklist: &[BlacklistEntry],
    check_owner: bool,
) -> Option<Rejection> {
    let listed = |address: &Address| blacklist.iter().any(|e| &e.address == address);
    if listed(&request.to_address) {
        return Some(Rejection::Blacklisted {
            address: request.to_address,
        });
    }
    match request.owner_address {
        Some(owner) if check_owner && listed(&owner) => {
            Some(Rejection::Blacklisted { address: owner })
        }
        _ => None,
    }
}

/// Rule 2: token contract is paused.
pub fn check_paused(contract_paused: bool) -> Option<Rejection> {
    contract_paused.then_some(Rejection::ContractPaused)
}

/// Rule 3: single withdrawal above the per-transaction limit.
pub fn check_per_tx_limit(request: &WithdrawRequest, config: &RiskConfig) -> Option<Rejection> {
    (request.amount > config.per_tx_limit).then(|| Rejection::PerTxLimitExceeded {
        limit: config.per_tx_limit.clone(),
        requested: request.amount.clone(),
    })
}

/// Rules 4 and 5: volume, then count, inside the velocity window.
pub fn check_velocity(
    request: &WithdrawRequest,
    history: &[LedgerEntry],
    config: &RiskConfig,
) -> Option<Rejection> {
    let (used, count) = velocity::used_in_window(request, history, config.velocity_window_secs);
    if &used + &request.amount > config.daily_limit {
        return Some(Rejection::VelocityLimitExceeded {
            used,
            limit: config.daily_limit.clone(),
        });
    }
    if config.velocity_max_count > 0 && count >= config.velocity_max_count {
        return Some(Rejection::VelocityCountExceeded {
            count,
            max: config.velocity_max_count,
        });
    }
    None
}

/// Amount strictly above the review threshold.
pub fn needs_review(request: &WithdrawRequest, config: &RiskConfig) -> Option<Amount> {
    config
        .review_threshold
        .as_ref()
        .filter(|threshold| request.amount > **threshold)
        .cloned()
}
