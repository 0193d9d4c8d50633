//! Typed chain client surface
//!
//! The low-level contract bindings (ABI encoding, RPC transport, signing)
//! live behind this trait. Nothing outside this crate sees binding types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use types::address::Address;
use types::ids::{BatchId, ChainId, TxHash};
use types::merkle::Digest;
use types::numeric::Amount;
use types::proof::{BatchType, ProofBatch};

use crate::errors::ClientError;

/// Key material handed to the client library for signing
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SigningKey(String);

impl SigningKey {
    pub fn new(material: impl Into<String>) -> Self {
        Self(material.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// Custodial signing identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerIdentity {
    pub address: Address,
    pub key: SigningKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub total_supply: Amount,
    pub contract_address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Success,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub status: ReceiptStatus,
    pub block_number: u64,
    pub gas_used: u64,
    /// Decoded from the registry's publish event, when present
    pub batch_id: Option<BatchId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub chain_id: ChainId,
    pub block_number: u64,
}

/// Arguments of the registry's `publishBatch`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishBatch {
    pub root: Digest,
    pub batch_type: BatchType,
    pub start_timestamp: u64,
    pub end_timestamp: u64,
    pub uri: String,
    pub entry_count: u32,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    // ── Token reads ─────────────────────────────────────────────────

    async fn balance_of(&self, owner: Address) -> Result<Amount, ClientError>;

    async fn is_blacklisted(&self, address: Address) -> Result<bool, ClientError>;

    async fn paused(&self) -> Result<bool, ClientError>;

    async fn token_info(&self) -> Result<TokenInfo, ClientError>;

    // ── Registry reads ──────────────────────────────────────────────

    async fn get_batch(&self, batch_id: BatchId) -> Result<ProofBatch, ClientError>;

    async fn batch_count(&self) -> Result<u64, ClientError>;

    async fn batch_count_by_type(&self, batch_type: BatchType) -> Result<u64, ClientError>;

    /// Reverts when `offset` is beyond the count for the type.
    async fn batches_by_type(
        &self,
        batch_type: BatchType,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<BatchId>, ClientError>;

    async fn verify_proof(
        &self,
        batch_id: BatchId,
        leaf: Digest,
        proof: &[Digest],
    ) -> Result<bool, ClientError>;

    // ── Network ─────────────────────────────────────────────────────

    /// `None` while the transaction is not yet mined.
    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TxReceipt>, ClientError>;

    async fn network_status(&self) -> Result<NetworkStatus, ClientError>;

    // ── Signed writes ───────────────────────────────────────────────

    async fn transfer(
        &self,
        signer: &SignerIdentity,
        to: Address,
        amount: &Amount,
    ) -> Result<TxHash, ClientError>;

    async fn mint(
        &self,
        signer: &SignerIdentity,
        to: Address,
        amount: &Amount,
    ) -> Result<TxHash, ClientError>;

    async fn burn(&self, signer: &SignerIdentity, amount: &Amount) -> Result<TxHash, ClientError>;

    async fn publish_batch(
        &self,
        signer: &SignerIdentity,
        batch: &PublishBatch,
    ) -> Result<TxHash, ClientError>;
}
