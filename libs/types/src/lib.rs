//! Types library for the custody core
//!
//! Shared type definitions used by the ledger, risk engine, chain gateway,
//! settlement pipeline and proof reconciler. Every crate in the workspace
//! speaks in these types; none of them depends on chain-binding types.
//!
//! # Modules
//! - `ids`: Unique identifiers (UserId, WithdrawId, LedgerEntryId, AssetId, ChainId, BatchId, TxHash)
//! - `address`: 20-byte account addresses on the public ledger
//! - `numeric`: Arbitrary-precision token amounts
//! - `ledger`: Ledger entry model and reservation bookkeeping helpers
//! - `withdrawal`: Withdrawal request lifecycle
//! - `risk`: Risk configuration, blacklist and decisions
//! - `proof`: Proof batch model
//! - `merkle`: Keccak-256 Merkle tree with sorted-pair hashing
//! - `errors`: Error taxonomy

pub mod ids;
pub mod address;
pub mod numeric;
pub mod ledger;
pub mod withdrawal;
pub mod risk;
pub mod proof;
pub mod merkle;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::address::*;
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::ledger::*;
    pub use crate::merkle::*;
    pub use crate::numeric::*;
    pub use crate::proof::*;
    pub use crate::risk::*;
    pub use crate::withdrawal::*;
}
