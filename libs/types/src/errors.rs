//! Error types shared across the custody core
//!
//! Validation failures are raised before any state mutation. Transition
//! errors guard the withdrawal state machine.

use thiserror::Error;

/// Malformed input rejected before anything is recorded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid address: {value}")]
    InvalidAddress { value: String },

    #[error("Invalid amount: {value}")]
    InvalidAmount { value: String },

    #[error("Amount must be greater than zero")]
    ZeroAmount,

    #[error("Amount does not fit in 256 bits")]
    AmountOverflow,

    #[error("Invalid transaction hash: {value}")]
    InvalidHash { value: String },

    #[error("Invalid asset id: {value}")]
    InvalidAsset { value: String },
}

/// Illegal withdrawal state transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid state transition from {from} to {to}")]
pub struct TransitionError {
    pub from: String,
    pub to: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::InvalidAddress {
            value: "0x12".into(),
        };
        assert_eq!(err.to_string(), "Invalid address: 0x12");
        assert_eq!(
            ValidationError::AmountOverflow.to_string(),
            "Amount does not fit in 256 bits"
        );
    }

    #[test]
    fn test_transition_error_message() {
        let err = TransitionError {
            from: "Confirmed".into(),
            to: "Submitted".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from Confirmed to Submitted"
        );
    }
}
