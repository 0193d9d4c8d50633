//! Repository seams consumed by the settlement pipeline and reconciler
//!
//! Storage engines sit behind these traits. [`crate::store::RecordStore`] is
//! the in-process implementation, optionally backed by the journal.

use crate::journal::JournalError;
use async_trait::async_trait;
use thiserror::Error;
use types::address::Address;
use types::ids::{BatchId, WithdrawId};
use types::merkle::Digest;
use types::proof::{BatchType, ProofBatchRecord};
use types::risk::{BlacklistEntry, RiskConfig, RiskScope};
use types::withdrawal::{WithdrawRequest, WithdrawStatus};

#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Backend temporarily unreachable; callers may retry
    #[error("Repository unavailable: {0}")]
    Unavailable(String),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Conflict: {0}")]
    Conflict(String),
}

#[async_trait]
pub trait WithdrawRepository: Send + Sync {
    async fn save_withdraw(&self, request: &WithdrawRequest) -> Result<(), RepositoryError>;

    async fn load_withdraw(&self, id: WithdrawId) -> Result<Option<WithdrawRequest>, RepositoryError>;

    async fn withdraws_with_status(
        &self,
        statuses: &[WithdrawStatus],
    ) -> Result<Vec<WithdrawRequest>, RepositoryError>;
}

#[async_trait]
pub trait RiskConfigRepository: Send + Sync {
    async fn load_risk_config(&self, scope: &RiskScope) -> Result<Option<RiskConfig>, RepositoryError>;
}

#[async_trait]
pub trait BlacklistRepository: Send + Sync {
    async fn is_blacklisted(&self, address: &Address) -> Result<bool, RepositoryError>;

    /// Entries for whichever of `addresses` are blacklisted.
    async fn blacklist_entries(
        &self,
        addresses: &[Address],
    ) -> Result<Vec<BlacklistEntry>, RepositoryError>;
}

#[async_trait]
pub trait ProofBatchRepository: Send + Sync {
    /// Insert or replace, keyed by root while staged and by batch id once committed.
    async fn save_proof_batch_record(&self, record: &ProofBatchRecord) -> Result<(), RepositoryError>;

    async fn load_proof_batch_record(
        &self,
        batch_id: BatchId,
    ) -> Result<Option<ProofBatchRecord>, RepositoryError>;

    /// Records of a type staged before publication and not yet committed,
    /// ordered by window start.
    async fn staged_records(
        &self,
        batch_type: BatchType,
    ) -> Result<Vec<ProofBatchRecord>, RepositoryError>;

    /// Drop a staged record whose publication is known not to have landed.
    async fn discard_staged_record(&self, root: &Digest) -> Result<(), RepositoryError>;

    /// Most recent committed record of a type, by end timestamp.
    async fn latest_proof_batch_record(
        &self,
        batch_type: BatchType,
    ) -> Result<Option<ProofBatchRecord>, RepositoryError>;
}
