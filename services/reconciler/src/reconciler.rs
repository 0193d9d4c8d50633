//! Proof Batch Reconciler
//!
//! Publishes Merkle roots over ledger state and answers audit queries.
//!
//! One run for a batch type:
//! 0. settle records an earlier run staged but never committed
//! 1. window from the previous batch's end (or genesis) to now
//! 2. build leaves for the type; an empty window publishes nothing
//! 3. build the tree and check a proof for every leaf against the root
//! 4. stage the record with its leaves, publish, wait for the receipt
//! 5. commit the record under the registry-assigned batch id
//!
//! Runs of the same type never overlap; runs of different types may.

use chain_gateway::{ChainGateway, GatewayError, PublishBatch, RetryError, RetryPolicy, TransactionStatus};
use chrono::{DateTime, Utc};
use ledger::{LedgerRecorder, ProofBatchRepository, RepositoryError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::address::Address;
use types::errors::ValidationError;
use types::ids::{BatchId, TxHash};
use types::merkle::{self, Digest, MerkleTree};
use types::proof::{BatchType, ProofBatch, ProofBatchRecord};

use crate::snapshot;

/// Registry page size when searching for a staged root
const REGISTRY_PAGE: u64 = 50;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ReconcilerError {
    #[error("Leaf encoding failed: {0}")]
    Encoding(#[from] ValidationError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Chain error: {0}")]
    Chain(#[from] GatewayError),

    #[error("Invalid window {start}..{end}")]
    InvalidWindow { start: u64, end: u64 },

    #[error("Self-check failed for {batch_type} leaf {index}")]
    SelfCheckFailed { batch_type: BatchType, index: usize },

    #[error("Publish transaction {tx_hash} failed: {reason}")]
    PublishFailed { tx_hash: TxHash, reason: String },

    #[error("Publish transaction {tx_hash} not confirmed in time")]
    PublishTimeout { tx_hash: TxHash },

    #[error("Publish receipt {tx_hash} carries no batch id")]
    MissingBatchId { tx_hash: TxHash },

    #[error("Registry root for batch {batch_id} differs from the published root")]
    RootMismatch { batch_id: BatchId },

    #[error("No retained leaves for batch {0}")]
    UnknownBatch(BatchId),

    #[error("Leaf {index} out of range for batch {batch_id} ({count} leaves)")]
    LeafOutOfRange {
        batch_id: BatchId,
        index: usize,
        count: usize,
    },
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Wallet whose on-chain balance closes every Reserves batch
    pub custody_address: Option<Address>,
    /// Prefix of each batch's off-chain document URI
    pub uri_base: String,
    /// Scheduler period
    pub interval: Duration,
    /// Start of the first window for each type (unix seconds)
    pub genesis_timestamp: u64,
    /// Applied to each receipt poll
    pub receipt_retry: RetryPolicy,
    pub poll_interval: Duration,
    pub max_pending_polls: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            custody_address: None,
            uri_base: "ipfs://proofs".to_string(),
            interval: Duration::from_secs(60 * 60),
            genesis_timestamp: 0,
            receipt_retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(3),
            max_pending_polls: 200,
        }
    }
}

// ── Results ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Published(ProofBatchRecord),
    /// No leaves in the window
    Empty { start: u64, end: u64 },
    /// Another run of the same type holds the lock
    AlreadyRunning,
}

/// Everything needed to check one retained leaf against the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafProof {
    pub batch_id: BatchId,
    pub index: usize,
    pub leaf: Vec<u8>,
    pub leaf_hash: Digest,
    pub proof: Vec<Digest>,
    pub root: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub batch_id: BatchId,
    pub batch_type: BatchType,
    pub entry_count: u32,
    pub local_root: Option<Digest>,
    pub chain_root: Digest,
    pub verified: bool,
}

impl AuditReport {
    /// Retained leaves reproduce the registry's root.
    pub fn is_consistent(&self) -> bool {
        self.local_root == Some(self.chain_root)
    }
}

// ── Reconciler ──────────────────────────────────────────────────────

pub struct ProofBatchReconciler {
    ledger: Arc<LedgerRecorder>,
    records: Arc<dyn ProofBatchRepository>,
    gateway: Arc<ChainGateway>,
    config: ReconcilerConfig,
    /// Indexed by `BatchType::as_u8`
    run_locks: [Mutex<()>; 3],
}

impl ProofBatchReconciler {
    pub fn new(
        ledger: Arc<LedgerRecorder>,
        records: Arc<dyn ProofBatchRepository>,
        gateway: Arc<ChainGateway>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            ledger,
            records,
            gateway,
            config,
            run_locks: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
        }
    }

    /// Publish the window of `batch_type` ending now.
    pub async fn run_once(&self, batch_type: BatchType) -> Result<RunOutcome, ReconcilerError> {
        self.publish_window(batch_type, Utc::now()).await
    }

    /// Run every batch type once, in order.
    pub async fn run_all(&self) -> Vec<(BatchType, Result<RunOutcome, ReconcilerError>)> {
        let mut results = Vec::with_capacity(BatchType::ALL.len());
        for batch_type in BatchType::ALL {
            results.push((batch_type, self.run_once(batch_type).await));
        }
        results
    }

    /// Run all types every `interval` until `shutdown` is cancelled.
    pub fn spawn_scheduler(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_secs = self.config.interval.as_secs(), "Proof batch scheduler started");
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for (batch_type, result) in self.run_all().await {
                            match result {
                                Ok(RunOutcome::Published(_)) | Ok(RunOutcome::Empty { .. }) => {}
                                Ok(RunOutcome::AlreadyRunning) => {
                                    debug!(batch_type = %batch_type, "Previous run still in progress")
                                }
                                Err(err) => {
                                    error!(batch_type = %batch_type, error = %err, "Proof batch run failed")
                                }
                            }
                        }
                    }
                }
            }
            info!("Proof batch scheduler stopped");
        })
    }

    /// Publish the window of `batch_type` that ends at `end`.
    pub async fn publish_window(
        &self,
        batch_type: BatchType,
        end: DateTime<Utc>,
    ) -> Result<RunOutcome, ReconcilerError> {
        let Ok(_guard) = self.run_locks[usize::from(batch_type.as_u8())].try_lock() else {
            return Ok(RunOutcome::AlreadyRunning);
        };
        self.settle_staged(batch_type).await?;

        let start = match self.records.latest_proof_batch_record(batch_type).await? {
            Some(previous) => previous.end_timestamp,
            None => self.config.genesis_timestamp,
        };
        let end = u64::try_from(end.timestamp()).unwrap_or(0);
        if end <= start {
            return Ok(RunOutcome::Empty { start, end });
        }

        let leaves = self.build_leaves(batch_type, start, end).await?;
        if leaves.is_empty() {
            debug!(batch_type = %batch_type, start, end, "Empty window; nothing to publish");
            return Ok(RunOutcome::Empty { start, end });
        }

        let tree = MerkleTree::from_leaves(&leaves);
        let root = self_check(batch_type, &tree)?;
        let (record, tx_hash) = self.stage_and_publish(batch_type, root, start, end, leaves).await?;
        self.commit(record, tx_hash).await.map(RunOutcome::Published)
    }

    /// Resolve records of `batch_type` that an earlier run staged but did
    /// not commit, oldest first.
    ///
    /// A record with a submitted transaction is committed once its receipt
    /// is in and discarded if the transaction failed. A record without one
    /// is committed if the registry already holds its root, else discarded.
    /// A transaction still pending stops the run so that windows stay
    /// contiguous.
    async fn settle_staged(&self, batch_type: BatchType) -> Result<(), ReconcilerError> {
        for staged in self.records.staged_records(batch_type).await? {
            let root = staged.root;
            debug!(
                batch_type = %batch_type,
                start = staged.start_timestamp,
                end = staged.end_timestamp,
                root = %hex_root(&root),
                "Settling staged batch"
            );
            match staged.tx_hash {
                Some(tx_hash) => match self.commit(staged, tx_hash).await {
                    Ok(_) => {}
                    Err(ReconcilerError::PublishFailed { tx_hash, reason }) => {
                        warn!(tx_hash = %tx_hash, reason = %reason, "Staged batch failed on chain; discarding");
                        self.records.discard_staged_record(&root).await?;
                    }
                    Err(err) => return Err(err),
                },
                None => match self.find_published(&staged).await? {
                    Some(batch_id) => {
                        self.record_committed(staged, batch_id).await?;
                    }
                    None => {
                        info!(batch_type = %batch_type, root = %hex_root(&root), "Staged batch never published; discarding");
                        self.records.discard_staged_record(&root).await?;
                    }
                },
            }
        }
        Ok(())
    }

    /// Search the registry, newest first, for a batch carrying `staged`'s
    /// root. Batches ending at or before its window start cannot match.
    async fn find_published(
        &self,
        staged: &ProofBatchRecord,
    ) -> Result<Option<BatchId>, ReconcilerError> {
        let batch_type = staged.batch_type;
        let mut upper = self.gateway.batch_count_by_type(batch_type).await?;
        while upper > 0 {
            let offset = upper.saturating_sub(REGISTRY_PAGE);
            let ids = self
                .gateway
                .batches_by_type(batch_type, offset, upper - offset)
                .await?;
            for batch_id in ids.into_iter().rev() {
                let batch = self.gateway.get_proof_batch(batch_id).await?;
                if batch.root == staged.root {
                    return Ok(Some(batch_id));
                }
                if batch.end_timestamp <= staged.start_timestamp {
                    return Ok(None);
                }
            }
            upper = offset;
        }
        Ok(None)
    }

    /// Persist the leaves under the root, then submit the root.
    async fn stage_and_publish(
        &self,
        batch_type: BatchType,
        root: Digest,
        start: u64,
        end: u64,
        leaves: Vec<Vec<u8>>,
    ) -> Result<(ProofBatchRecord, TxHash), ReconcilerError> {
        let uri = format!(
            "{}/{}/0x{}.json",
            self.config.uri_base.trim_end_matches('/'),
            batch_type,
            hex_root(&root)
        );
        let mut staged = ProofBatchRecord::staged(root, batch_type, start, end, uri, leaves);
        self.records.save_proof_batch_record(&staged).await?;
        let published = self
            .gateway
            .publish_batch(&PublishBatch {
                root,
                batch_type,
                start_timestamp: start,
                end_timestamp: end,
                uri: staged.uri.clone(),
                entry_count: staged.entry_count(),
            })
            .await;
        let tx_hash = match published {
            Ok(tx_hash) => tx_hash,
            // The outcome of a timed-out or dropped submission is settled
            // against the registry by the next run
            Err(err @ (GatewayError::Transient(_) | GatewayError::Timeout { .. })) => {
                warn!(batch_type = %batch_type, error = %err, "Publish outcome unknown; record stays staged");
                return Err(err.into());
            }
            Err(err) => {
                self.records.discard_staged_record(&root).await?;
                return Err(err.into());
            }
        };
        staged.tx_hash = Some(tx_hash);
        self.records.save_proof_batch_record(&staged).await?;
        debug!(batch_type = %batch_type, tx_hash = %tx_hash, "Proof batch staged and submitted");
        Ok((staged, tx_hash))
    }

    async fn build_leaves(
        &self,
        batch_type: BatchType,
        start: u64,
        end: u64,
    ) -> Result<Vec<Vec<u8>>, ReconcilerError> {
        let invalid = || ReconcilerError::InvalidWindow { start, end };
        let start_at = to_datetime(start).ok_or_else(invalid)?;
        let end_at = to_datetime(end).ok_or_else(invalid)?;
        let leaves = match batch_type {
            BatchType::Transactions => snapshot::transaction_leaves(&self.ledger, start_at, end_at)?,
            BatchType::Liabilities => snapshot::liability_leaves(&self.ledger, end_at)?,
            BatchType::Reserves => {
                let custody = match self.config.custody_address {
                    Some(address) => Some((address, self.gateway.balance_of(address).await?)),
                    None => None,
                };
                snapshot::reserve_leaves(&self.ledger, custody, end_at)?
            }
        };
        Ok(leaves)
    }

    /// Wait for the publish receipt, then commit the record under the
    /// batch id it carries.
    async fn commit(
        &self,
        record: ProofBatchRecord,
        tx_hash: TxHash,
    ) -> Result<ProofBatchRecord, ReconcilerError> {
        let mut pending_polls = 0u32;
        let receipt = loop {
            let status = self
                .config
                .receipt_retry
                .run("transaction_receipt", |_| self.gateway.transaction_status(tx_hash))
                .await;
            match status {
                Ok(TransactionStatus::Confirmed(receipt)) => break receipt,
                Ok(TransactionStatus::Failed { reason, .. }) => {
                    return Err(ReconcilerError::PublishFailed {
                        tx_hash,
                        reason: reason.as_str().to_string(),
                    })
                }
                Ok(TransactionStatus::Pending) => {
                    pending_polls += 1;
                    if pending_polls >= self.config.max_pending_polls {
                        warn!(tx_hash = %tx_hash, "Publish receipt still pending; record stays staged");
                        return Err(ReconcilerError::PublishTimeout { tx_hash });
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(RetryError::Exhausted { last, .. }) | Err(RetryError::Terminal(last)) => {
                    return Err(last.into())
                }
            }
        };

        let batch_id = receipt
            .batch_id
            .ok_or(ReconcilerError::MissingBatchId { tx_hash })?;
        self.record_committed(record, batch_id).await
    }

    /// Confirm the registry holds the record's root under `batch_id`, then
    /// commit the record.
    async fn record_committed(
        &self,
        mut record: ProofBatchRecord,
        batch_id: BatchId,
    ) -> Result<ProofBatchRecord, ReconcilerError> {
        let on_chain = self.gateway.get_proof_batch(batch_id).await?;
        if on_chain.root != record.root {
            return Err(ReconcilerError::RootMismatch { batch_id });
        }

        record.batch_id = Some(batch_id);
        self.records.save_proof_batch_record(&record).await?;
        info!(
            batch_id = %batch_id,
            batch_type = %record.batch_type,
            entries = record.entry_count(),
            start = record.start_timestamp,
            end = record.end_timestamp,
            root = %hex_root(&record.root),
            "Proof batch published"
        );
        Ok(record)
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Reproduce the proof for a retained leaf.
    pub async fn proof_for(&self, batch_id: BatchId, index: usize) -> Result<LeafProof, ReconcilerError> {
        let record = self.record(batch_id).await?;
        let tree = record.tree();
        let (Some(leaf), Some(leaf_hash), Some(proof)) =
            (record.leaves.get(index), tree.leaf(index), tree.proof(index))
        else {
            return Err(ReconcilerError::LeafOutOfRange {
                batch_id,
                index,
                count: record.leaves.len(),
            });
        };
        Ok(LeafProof {
            batch_id,
            index,
            leaf: leaf.clone(),
            leaf_hash,
            proof,
            root: record.root,
        })
    }

    /// Authoritative check of raw leaf bytes against the registry.
    pub async fn verify_proof(
        &self,
        batch_id: BatchId,
        leaf: &[u8],
        proof: &[Digest],
    ) -> Result<bool, ReconcilerError> {
        Ok(self
            .gateway
            .verify_proof(batch_id, merkle::leaf_hash(leaf), proof)
            .await?)
    }

    /// Page through published batches of one type.
    pub async fn list_batches(
        &self,
        batch_type: BatchType,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ProofBatch>, ReconcilerError> {
        let ids = self.gateway.batches_by_type(batch_type, offset, limit).await?;
        let mut batches = Vec::with_capacity(ids.len());
        for batch_id in ids {
            batches.push(self.gateway.get_proof_batch(batch_id).await?);
        }
        Ok(batches)
    }

    /// Compare the root rebuilt from retained leaves with the registry's.
    pub async fn audit(&self, batch_id: BatchId) -> Result<AuditReport, ReconcilerError> {
        let record = self.record(batch_id).await?;
        let on_chain = self.gateway.get_proof_batch(batch_id).await?;
        let report = AuditReport {
            batch_id,
            batch_type: on_chain.batch_type,
            entry_count: on_chain.entry_count,
            local_root: record.tree().root(),
            chain_root: on_chain.root,
            verified: on_chain.verified,
        };
        if !report.is_consistent() {
            error!(batch_id = %batch_id, "Retained leaves do not reproduce the registry root");
        }
        Ok(report)
    }

    async fn record(&self, batch_id: BatchId) -> Result<ProofBatchRecord, ReconcilerError> {
        self.records
            .load_proof_batch_record(batch_id)
            .await?
            .ok_or(ReconcilerError::UnknownBatch(batch_id))
    }
}

/// Root of `tree` after checking every leaf's proof against it.
fn self_check(batch_type: BatchType, tree: &MerkleTree) -> Result<Digest, ReconcilerError> {
    let failed = |index| ReconcilerError::SelfCheckFailed { batch_type, index };
    let root = tree.root().ok_or_else(|| failed(0))?;
    for index in 0..tree.leaf_count() {
        let leaf = tree.leaf(index).ok_or_else(|| failed(index))?;
        let proof = tree.proof(index).ok_or_else(|| failed(index))?;
        if !merkle::verify(&root, &leaf, &proof) {
            return Err(failed(index));
        }
    }
    Ok(root)
}

fn to_datetime(secs: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(i64::try_from(secs).ok()?, 0)
}

fn hex_root(root: &Digest) -> String {
    hex::encode(root)
}
