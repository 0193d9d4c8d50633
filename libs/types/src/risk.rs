//! Risk management types
//!
//! Configuration, blacklist entries and the decision the risk engine returns.
//! A rejection is a business outcome, never an error.

use crate::address::Address;
use crate::ids::AssetId;
use crate::numeric::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which requests a configuration applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskScope {
    Global,
    Asset(AssetId),
}

impl fmt::Display for RiskScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskScope::Global => write!(f, "global"),
            RiskScope::Asset(asset) => write!(f, "asset:{}", asset),
        }
    }
}

/// Risk limits, maintained by an administrative collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub scope: RiskScope,
    pub per_tx_limit: Amount,
    /// Ceiling on withdrawal volume inside the velocity window
    pub daily_limit: Amount,
    pub velocity_window_secs: i64,
    /// Ceiling on withdrawal count inside the velocity window (0 disables)
    pub velocity_max_count: u32,
    /// Amounts strictly above this go to manual review
    pub review_threshold: Option<Amount>,
}

impl RiskConfig {
    pub fn global(per_tx_limit: Amount, daily_limit: Amount) -> Self {
        Self {
            scope: RiskScope::Global,
            per_tx_limit,
            daily_limit,
            velocity_window_secs: 24 * 60 * 60,
            velocity_max_count: 0,
            review_threshold: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub address: Address,
    pub reason: String,
    pub added_at: DateTime<Utc>,
}

impl BlacklistEntry {
    pub fn new(address: Address, reason: impl Into<String>) -> Self {
        Self {
            address,
            reason: reason.into(),
            added_at: Utc::now(),
        }
    }
}

/// Why a withdrawal was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    Blacklisted { address: Address },
    ContractPaused,
    PerTxLimitExceeded { limit: Amount, requested: Amount },
    /// `used` is volume already committed in the window, excluding this request
    VelocityLimitExceeded { used: Amount, limit: Amount },
    VelocityCountExceeded { count: u32, max: u32 },
    ConfigUnavailable,
    ReviewDeclined { reason: String },
    /// `available` is the final balance less open reservations
    InsufficientFunds { available: Amount, requested: Amount },
}

impl Rejection {
    /// Stable reason string surfaced to callers.
    pub fn reason(&self) -> &str {
        match self {
            Rejection::Blacklisted { .. } => "blacklisted",
            Rejection::ContractPaused => "contract paused",
            Rejection::PerTxLimitExceeded { .. } => "per-transaction limit exceeded",
            Rejection::VelocityLimitExceeded { .. } => "velocity limit exceeded",
            Rejection::VelocityCountExceeded { .. } => "velocity count exceeded",
            Rejection::ConfigUnavailable => "risk configuration unavailable",
            Rejection::ReviewDeclined { reason } => reason,
            Rejection::InsufficientFunds { .. } => "insufficient funds",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::VelocityLimitExceeded { used, limit } => {
                write!(f, "velocity limit exceeded (used {}, limit {})", used, limit)
            }
            Rejection::PerTxLimitExceeded { limit, requested } => write!(
                f,
                "per-transaction limit exceeded (requested {}, limit {})",
                requested, limit
            ),
            Rejection::VelocityCountExceeded { count, max } => {
                write!(f, "velocity count exceeded ({} of {})", count, max)
            }
            Rejection::InsufficientFunds {
                available,
                requested,
            } => write!(
                f,
                "insufficient funds (requested {}, available {})",
                requested, available
            ),
            other => write!(f, "{}", other.reason()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskDecision {
    Approve,
    Reject(Rejection),
    ManualReview { reason: String },
}

impl RiskDecision {
    pub fn reason(&self) -> Option<&str> {
        match self {
            RiskDecision::Approve => None,
            RiskDecision::Reject(rejection) => Some(rejection.reason()),
            RiskDecision::ManualReview { reason } => Some(reason),
        }
    }

    pub fn is_approve(&self) -> bool {
        matches!(self, RiskDecision::Approve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_reason_strings() {
        assert_eq!(
            Rejection::Blacklisted {
                address: Address::ZERO
            }
            .reason(),
            "blacklisted"
        );
        assert_eq!(Rejection::ContractPaused.reason(), "contract paused");
        assert_eq!(
            Rejection::PerTxLimitExceeded {
                limit: Amount::from(1u64),
                requested: Amount::from(2u64)
            }
            .reason(),
            "per-transaction limit exceeded"
        );
        assert_eq!(
            Rejection::VelocityLimitExceeded {
                used: Amount::from(4950u64),
                limit: Amount::from(5000u64)
            }
            .reason(),
            "velocity limit exceeded"
        );
        assert_eq!(
            Rejection::InsufficientFunds {
                available: Amount::zero(),
                requested: Amount::from(1800u64)
            }
            .reason(),
            "insufficient funds"
        );
    }

    #[test]
    fn test_velocity_display_carries_figures() {
        let rejection = Rejection::VelocityLimitExceeded {
            used: Amount::from(4950u64),
            limit: Amount::from(5000u64),
        };
        assert_eq!(
            rejection.to_string(),
            "velocity limit exceeded (used 4950, limit 5000)"
        );
    }

    #[test]
    fn test_decision_reason() {
        assert_eq!(RiskDecision::Approve.reason(), None);
        assert_eq!(
            RiskDecision::Reject(Rejection::ContractPaused).reason(),
            Some("contract paused")
        );
        let review = RiskDecision::ManualReview {
            reason: "above review threshold".into(),
        };
        assert_eq!(review.reason(), Some("above review threshold"));
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(RiskScope::Global.to_string(), "global");
        assert_eq!(RiskScope::Asset(AssetId::new("USDK")).to_string(), "asset:USDK");
    }
}
