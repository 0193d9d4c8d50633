//! Proof of reserves
//!
//! Builds Merkle batches over ledger state, publishes their roots to the
//! proof registry and serves inclusion proofs and audits afterwards.

pub mod reconciler;
pub mod snapshot;

pub use reconciler::{
    AuditReport, LeafProof, ProofBatchReconciler, ReconcilerConfig, ReconcilerError, RunOutcome,
};
