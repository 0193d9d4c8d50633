//! Withdrawal request lifecycle
//!
//! ```text
//! Requested -> RiskChecked -> Rejected
//!                          -> Approved -> Submitted -> Confirmed -> (admin) Reverted
//!                                      |            -> Failed
//!                                      -> Failed (submission reverted)
//! Failed("confirmation timeout") -> Confirmed (operator reconciliation)
//! ```

use crate::address::Address;
use crate::errors::{TransitionError, ValidationError};
use crate::ids::{AssetId, ChainId, TxHash, UserId, WithdrawId};
use crate::numeric::Amount;
use crate::risk::RiskDecision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure reason recorded when confirmation polling exhausts its budget.
/// The reservation stays pending until an operator reconciles.
pub const CONFIRMATION_TIMEOUT: &str = "confirmation timeout";

/// Failure reason recorded when the transfer call itself timed out. The
/// transaction may or may not have been broadcast; funds stay reserved.
pub const SUBMISSION_TIMEOUT: &str = "submission timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WithdrawStatus {
    Requested,
    RiskChecked,
    Approved,
    Rejected,
    Submitted,
    Confirmed,
    Failed,
    Reverted,
}

impl WithdrawStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WithdrawStatus::Rejected
                | WithdrawStatus::Confirmed
                | WithdrawStatus::Failed
                | WithdrawStatus::Reverted
        )
    }

    pub fn can_transition_to(self, next: WithdrawStatus) -> bool {
        use WithdrawStatus::*;
        matches!(
            (self, next),
            (Requested, RiskChecked)
                | (RiskChecked, Approved)
                | (RiskChecked, Rejected)
                | (Approved, Submitted)
                | (Approved, Failed)
                | (Submitted, Confirmed)
                | (Submitted, Failed)
                | (Failed, Confirmed)
                | (Confirmed, Reverted)
        )
    }
}

impl fmt::Display for WithdrawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Unvalidated withdrawal input as received from the outer surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawOrder {
    pub user_id: UserId,
    /// Wallet linked to the user, if any
    pub owner_address: Option<String>,
    pub chain_id: ChainId,
    pub asset_id: String,
    pub to_address: String,
    /// Decimal amount in base units
    pub amount: String,
}

impl WithdrawOrder {
    /// Validate and build a fresh `Requested` withdrawal.
    pub fn validate(self) -> Result<WithdrawRequest, ValidationError> {
        let asset_id = AssetId::try_new(self.asset_id)?;
        let to_address: Address = self.to_address.parse()?;
        if to_address.is_zero() {
            return Err(ValidationError::InvalidAddress {
                value: self.to_address,
            });
        }
        let owner_address = self
            .owner_address
            .map(|a| a.parse::<Address>())
            .transpose()?;
        let amount = Amount::parse_positive(&self.amount)?;
        Ok(WithdrawRequest::new(
            self.user_id,
            owner_address,
            self.chain_id,
            asset_id,
            to_address,
            amount,
        ))
    }
}

/// Withdrawal request record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub id: WithdrawId,
    pub user_id: UserId,
    pub owner_address: Option<Address>,
    pub chain_id: ChainId,
    pub asset_id: AssetId,
    pub to_address: Address,
    pub amount: Amount,
    pub status: WithdrawStatus,
    pub risk_decision: Option<RiskDecision>,
    pub risk_reason: Option<String>,
    pub tx_hash: Option<TxHash>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WithdrawRequest {
    pub fn new(
        user_id: UserId,
        owner_address: Option<Address>,
        chain_id: ChainId,
        asset_id: AssetId,
        to_address: Address,
        amount: Amount,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WithdrawId::new(),
            user_id,
            owner_address,
            chain_id,
            asset_id,
            to_address,
            amount,
            status: WithdrawStatus::Requested,
            risk_decision: None,
            risk_reason: None,
            tx_hash: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Ledger reference for this request's reservation entries.
    pub fn reference(&self) -> String {
        self.id.to_string()
    }

    /// Move forward along the state machine.
    pub fn advance(&mut self, next: WithdrawStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_confirmation_timeout(&self) -> bool {
        self.status == WithdrawStatus::Failed
            && self.failure_reason.as_deref() == Some(CONFIRMATION_TIMEOUT)
    }

    /// Failed without a known chain outcome. The reservation is still held
    /// and only an operator may resolve it.
    pub fn is_unresolved(&self) -> bool {
        self.status == WithdrawStatus::Failed
            && matches!(
                self.failure_reason.as_deref(),
                Some(CONFIRMATION_TIMEOUT) | Some(SUBMISSION_TIMEOUT)
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(amount: &str, to: &str) -> WithdrawOrder {
        WithdrawOrder {
            user_id: UserId::new(),
            owner_address: None,
            chain_id: ChainId(11155111),
            asset_id: "USDK".into(),
            to_address: to.into(),
            amount: amount.into(),
        }
    }

    const TO: &str = "0x1111111111111111111111111111111111111111";

    #[test]
    fn test_validate_builds_requested() {
        let req = order("100", TO).validate().unwrap();
        assert_eq!(req.status, WithdrawStatus::Requested);
        assert_eq!(req.amount, Amount::from(100u64));
        assert!(req.tx_hash.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        assert_eq!(order("0", TO).validate(), Err(ValidationError::ZeroAmount));
        assert!(matches!(
            order("12x", TO).validate(),
            Err(ValidationError::InvalidAmount { .. })
        ));
        assert!(matches!(
            order("1", "0x1234").validate(),
            Err(ValidationError::InvalidAddress { .. })
        ));
        assert!(matches!(
            order("1", "0x0000000000000000000000000000000000000000").validate(),
            Err(ValidationError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut req = order("5", TO).validate().unwrap();
        for next in [
            WithdrawStatus::RiskChecked,
            WithdrawStatus::Approved,
            WithdrawStatus::Submitted,
            WithdrawStatus::Confirmed,
        ] {
            req.advance(next).unwrap();
        }
        assert!(req.status.is_terminal());
    }

    #[test]
    fn test_status_never_moves_backwards() {
        let mut req = order("5", TO).validate().unwrap();
        req.advance(WithdrawStatus::RiskChecked).unwrap();
        req.advance(WithdrawStatus::Approved).unwrap();
        let err = req.advance(WithdrawStatus::Requested).unwrap_err();
        assert_eq!(err.from, "Approved");
        assert_eq!(err.to, "Requested");
    }

    #[test]
    fn test_rejected_is_final() {
        let mut req = order("5", TO).validate().unwrap();
        req.advance(WithdrawStatus::RiskChecked).unwrap();
        req.advance(WithdrawStatus::Rejected).unwrap();
        assert!(req.advance(WithdrawStatus::Approved).is_err());
        assert!(req.advance(WithdrawStatus::Submitted).is_err());
    }

    #[test]
    fn test_admin_transitions() {
        assert!(WithdrawStatus::Confirmed.can_transition_to(WithdrawStatus::Reverted));
        assert!(WithdrawStatus::Failed.can_transition_to(WithdrawStatus::Confirmed));
        assert!(!WithdrawStatus::Rejected.can_transition_to(WithdrawStatus::Reverted));
        assert!(!WithdrawStatus::Submitted.can_transition_to(WithdrawStatus::Reverted));
    }

    #[test]
    fn test_confirmation_timeout_flag() {
        let mut req = order("5", TO).validate().unwrap();
        req.status = WithdrawStatus::Failed;
        req.failure_reason = Some(CONFIRMATION_TIMEOUT.to_string());
        assert!(req.is_confirmation_timeout());
        assert!(req.is_unresolved());
        req.failure_reason = Some(SUBMISSION_TIMEOUT.to_string());
        assert!(!req.is_confirmation_timeout());
        assert!(req.is_unresolved());
        req.failure_reason = Some("insufficient balance".to_string());
        assert!(!req.is_unresolved());
    }
}
