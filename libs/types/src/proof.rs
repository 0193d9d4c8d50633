//! Proof batch model
//!
//! `ProofBatch` mirrors what the on-chain registry stores. `ProofBatchRecord`
//! is the off-chain companion: the ordered leaf set needed to reproduce a
//! proof for any leaf of a published batch.

use crate::address::Address;
use crate::ids::{BatchId, TxHash};
use crate::merkle::{Digest, MerkleTree};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BatchType {
    Reserves,
    Transactions,
    Liabilities,
}

impl BatchType {
    pub const ALL: [BatchType; 3] = [
        BatchType::Reserves,
        BatchType::Transactions,
        BatchType::Liabilities,
    ];

    /// Registry enum discriminant
    pub fn as_u8(self) -> u8 {
        match self {
            BatchType::Reserves => 0,
            BatchType::Transactions => 1,
            BatchType::Liabilities => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BatchType::Reserves),
            1 => Some(BatchType::Transactions),
            2 => Some(BatchType::Liabilities),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchType::Reserves => "reserves",
            BatchType::Transactions => "transactions",
            BatchType::Liabilities => "liabilities",
        }
    }
}

impl fmt::Display for BatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batch as stored by the proof registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBatch {
    pub batch_id: BatchId,
    pub root: Digest,
    pub batch_type: BatchType,
    /// Unix seconds, inclusive
    pub start_timestamp: u64,
    /// Unix seconds, exclusive
    pub end_timestamp: u64,
    pub uri: String,
    pub publisher: Address,
    pub entry_count: u32,
    /// Flipped by the registry oracle only
    pub verified: bool,
}

/// Off-chain record of a batch and its retained leaves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBatchRecord {
    /// `None` while staged, before the registry has assigned an id
    pub batch_id: Option<BatchId>,
    pub root: Digest,
    pub batch_type: BatchType,
    pub start_timestamp: u64,
    pub end_timestamp: u64,
    pub uri: String,
    /// Canonical leaf bytes in tree order
    pub leaves: Vec<Vec<u8>>,
    pub tx_hash: Option<TxHash>,
    pub created_at: DateTime<Utc>,
}

impl ProofBatchRecord {
    pub fn staged(
        root: Digest,
        batch_type: BatchType,
        start_timestamp: u64,
        end_timestamp: u64,
        uri: String,
        leaves: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            batch_id: None,
            root,
            batch_type,
            start_timestamp,
            end_timestamp,
            uri,
            leaves,
            tx_hash: None,
            created_at: Utc::now(),
        }
    }

    pub fn entry_count(&self) -> u32 {
        u32::try_from(self.leaves.len()).unwrap_or(u32::MAX)
    }

    pub fn tree(&self) -> MerkleTree {
        MerkleTree::from_leaves(&self.leaves)
    }

    /// True when the retained leaves still hash to the recorded root.
    pub fn is_consistent(&self) -> bool {
        self.tree().root() == Some(self.root)
    }
}
