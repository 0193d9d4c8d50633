//! ChainGateway: the only component that talks to the public ledger
//!
//! - Reads carry a timeout, go through the TTL cache and retry transient
//!   failures with the configured policy.
//! - Writes require the signing identity, are serialized FIFO on one lock
//!   (one in flight per signer, so account nonces never race), are never
//!   retried here, and clear the read cache on success.
//! - Receipt polling carries a timeout only; callers bring their own retry
//!   policy.
//! - Paginated listing is range-checked locally before any network call.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use types::address::Address;
use types::ids::{BatchId, TxHash};
use types::merkle::Digest;
use types::numeric::Amount;
use types::proof::{BatchType, ProofBatch};

use crate::cache::{ReadCache, ReadKey, ReadValue};
use crate::client::{
    ChainClient, NetworkStatus, PublishBatch, ReceiptStatus, SignerIdentity, TokenInfo, TxReceipt,
};
use crate::config::GatewayConfig;
use crate::errors::{ClientError, GatewayError, RevertReason};

/// Outcome of one receipt poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Confirmed(TxReceipt),
    Failed {
        reason: RevertReason,
        receipt: TxReceipt,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub reachable: bool,
    pub network: Option<NetworkStatus>,
    pub latency: Duration,
    pub signer_configured: bool,
    pub error: Option<String>,
}

pub struct ChainGateway {
    client: Arc<dyn ChainClient>,
    config: GatewayConfig,
    cache: ReadCache,
    write_lock: Mutex<()>,
    submitted: DashMap<String, TxHash>,
}

impl ChainGateway {
    pub fn new(client: Arc<dyn ChainClient>, config: GatewayConfig) -> Self {
        let signer = config
            .signer
            .as_ref()
            .map(|s| s.address.to_string())
            .unwrap_or_else(|| "none".to_string());
        info!(
            rpc_endpoint = %config.rpc_endpoint,
            token = %config.token_address,
            registry = %config.proof_registry_address,
            signer = %signer,
            "Chain gateway configured"
        );
        Self {
            cache: ReadCache::new(config.cache_ttl),
            client,
            config,
            write_lock: Mutex::new(()),
            submitted: DashMap::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn signer_address(&self) -> Option<Address> {
        self.config.signer.as_ref().map(|s| s.address)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn balance_of(&self, owner: Address) -> Result<Amount, GatewayError> {
        self.cached_read(
            ReadKey::Balance(owner),
            "balance_of",
            ReadValue::Amount,
            |v| match v {
                ReadValue::Amount(a) => Some(a),
                _ => None,
            },
            || self.client.balance_of(owner),
        )
        .await
    }

    pub async fn is_blacklisted(&self, address: Address) -> Result<bool, GatewayError> {
        self.cached_read(
            ReadKey::Blacklisted(address),
            "is_blacklisted",
            ReadValue::Flag,
            as_flag,
            || self.client.is_blacklisted(address),
        )
        .await
    }

    pub async fn is_paused(&self) -> Result<bool, GatewayError> {
        self.cached_read(ReadKey::Paused, "paused", ReadValue::Flag, as_flag, || {
            self.client.paused()
        })
        .await
    }

    pub async fn token_info(&self) -> Result<TokenInfo, GatewayError> {
        self.cached_read(
            ReadKey::TokenInfo,
            "token_info",
            ReadValue::TokenInfo,
            |v| match v {
                ReadValue::TokenInfo(info) => Some(info),
                _ => None,
            },
            || self.client.token_info(),
        )
        .await
    }

    pub async fn get_proof_batch(&self, batch_id: BatchId) -> Result<ProofBatch, GatewayError> {
        self.cached_read(
            ReadKey::Batch(batch_id),
            "get_batch",
            ReadValue::Batch,
            |v| match v {
                ReadValue::Batch(batch) => Some(batch),
                _ => None,
            },
            || self.client.get_batch(batch_id),
        )
        .await
    }

    pub async fn batch_count(&self) -> Result<u64, GatewayError> {
        self.cached_read(ReadKey::BatchCount, "batch_count", ReadValue::Count, as_count, || {
            self.client.batch_count()
        })
        .await
    }

    pub async fn batch_count_by_type(&self, batch_type: BatchType) -> Result<u64, GatewayError> {
        self.cached_read(
            ReadKey::BatchCountByType(batch_type),
            "batch_count_by_type",
            ReadValue::Count,
            as_count,
            || self.client.batch_count_by_type(batch_type),
        )
        .await
    }

    /// Page of batch ids of one type.
    ///
    /// `offset` beyond the count is rejected locally; `limit` is clamped so
    /// the request never reaches past the count; `offset == count` returns an
    /// empty page without a network call.
    pub async fn batches_by_type(
        &self,
        batch_type: BatchType,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<BatchId>, GatewayError> {
        let count = self.batch_count_by_type(batch_type).await?;
        if offset > count {
            return Err(GatewayError::InvalidPagination {
                offset,
                limit,
                count,
            });
        }
        let limit = limit.min(count - offset);
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.read("batches_by_type", || {
            self.client.batches_by_type(batch_type, offset, limit)
        })
        .await
    }

    /// Authoritative on-chain proof check.
    pub async fn verify_proof(
        &self,
        batch_id: BatchId,
        leaf: Digest,
        proof: &[Digest],
    ) -> Result<bool, GatewayError> {
        self.read("verify_proof", || self.client.verify_proof(batch_id, leaf, proof))
            .await
    }

    /// One receipt poll. Not cached, not retried.
    pub async fn transaction_status(&self, hash: TxHash) -> Result<TransactionStatus, GatewayError> {
        let receipt = self
            .with_timeout("transaction_receipt", self.client.transaction_receipt(hash))
            .await?;
        Ok(match receipt {
            None => TransactionStatus::Pending,
            Some(receipt) => match &receipt.status {
                ReceiptStatus::Success => TransactionStatus::Confirmed(receipt),
                ReceiptStatus::Failed { reason } => TransactionStatus::Failed {
                    reason: RevertReason::from_raw(reason),
                    receipt,
                },
            },
        })
    }

    /// Reachability probe. Never fails; problems are reported in the body.
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let result = self
            .with_timeout("network_status", self.client.network_status())
            .await;
        let latency = started.elapsed();
        let signer_configured = self.config.signer.is_some();
        match result {
            Ok(network) => HealthReport {
                reachable: true,
                network: Some(network),
                latency,
                signer_configured,
                error: None,
            },
            Err(err) => {
                warn!(error = %err, "Chain health check failed");
                HealthReport {
                    reachable: false,
                    network: None,
                    latency,
                    signer_configured,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Custodial transfer keyed by `idempotency_key` (the withdrawal id).
    /// A key that already produced a hash in this process returns that hash
    /// without another chain write.
    pub async fn transfer(
        &self,
        idempotency_key: &str,
        to: Address,
        amount: &Amount,
    ) -> Result<TxHash, GatewayError> {
        let signer = self.signer("transfer")?;
        if let Some(hash) = self.submitted.get(idempotency_key) {
            debug!(key = idempotency_key, tx_hash = %*hash, "Transfer already submitted");
            return Ok(*hash);
        }

        let _guard = self.write_lock.lock().await;
        if let Some(hash) = self.submitted.get(idempotency_key) {
            return Ok(*hash);
        }
        let hash = self
            .with_timeout("transfer", self.client.transfer(signer, to, amount))
            .await?;
        self.submitted.insert(idempotency_key.to_string(), hash);
        self.cache.clear();
        info!(key = idempotency_key, to = %to, amount = %amount, tx_hash = %hash, "Transfer submitted");
        Ok(hash)
    }

    pub async fn mint(&self, to: Address, amount: &Amount) -> Result<TxHash, GatewayError> {
        let signer = self.signer("mint")?;
        let hash = self
            .serialized_write("mint", self.client.mint(signer, to, amount))
            .await?;
        info!(to = %to, amount = %amount, tx_hash = %hash, "Mint submitted");
        Ok(hash)
    }

    pub async fn burn(&self, amount: &Amount) -> Result<TxHash, GatewayError> {
        let signer = self.signer("burn")?;
        let hash = self
            .serialized_write("burn", self.client.burn(signer, amount))
            .await?;
        info!(amount = %amount, tx_hash = %hash, "Burn submitted");
        Ok(hash)
    }

    pub async fn publish_batch(&self, batch: &PublishBatch) -> Result<TxHash, GatewayError> {
        let signer = self.signer("publish_batch")?;
        let hash = self
            .serialized_write("publish_batch", self.client.publish_batch(signer, batch))
            .await?;
        info!(
            batch_type = %batch.batch_type,
            entry_count = batch.entry_count,
            tx_hash = %hash,
            "Proof batch submitted"
        );
        Ok(hash)
    }

    // ── Internal Helpers ────────────────────────────────────────────

    fn signer(&self, operation: &'static str) -> Result<&SignerIdentity, GatewayError> {
        self.config
            .signer
            .as_ref()
            .ok_or(GatewayError::MissingSigner { operation })
    }

    async fn serialized_write<F>(&self, operation: &'static str, call: F) -> Result<TxHash, GatewayError>
    where
        F: Future<Output = Result<TxHash, ClientError>>,
    {
        let _guard = self.write_lock.lock().await;
        let hash = self.with_timeout(operation, call).await?;
        self.cache.clear();
        Ok(hash)
    }

    async fn with_timeout<T, F>(&self, operation: &'static str, call: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result.map_err(GatewayError::from),
            Err(_) => Err(GatewayError::Timeout {
                operation,
                after: self.config.call_timeout,
            }),
        }
    }

    async fn read<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        self.config
            .read_retry
            .run(operation, |_| self.with_timeout(operation, call()))
            .await
            .map_err(|e| e.into_inner())
    }

    async fn cached_read<T, F, Fut>(
        &self,
        key: ReadKey,
        operation: &'static str,
        wrap: fn(T) -> ReadValue,
        unwrap: fn(ReadValue) -> Option<T>,
        call: F,
    ) -> Result<T, GatewayError>
    where
        T: Clone,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        if let Some(value) = self.cache.get(&key).and_then(unwrap) {
            return Ok(value);
        }
        let value = self.read(operation, call).await?;
        self.cache.insert(key, wrap(value.clone()));
        Ok(value)
    }
}

fn as_flag(value: ReadValue) -> Option<bool> {
    match value {
        ReadValue::Flag(flag) => Some(flag),
        _ => None,
    }
}

fn as_count(value: ReadValue) -> Option<u64> {
    match value {
        ReadValue::Count(count) => Some(count),
        _ => None,
    }
}
