//! Risk Engine Service
//!
//! Pure decision function over a withdrawal request, the user's ledger
//! history, the applicable risk configuration and the blacklist. Identical
//! inputs always produce the identical decision, so any decision can be
//! replayed for audit.

pub mod velocity;
pub mod validator;
pub mod engine;

pub use engine::{RiskEngine, RiskEngineConfig, RiskInputs};
