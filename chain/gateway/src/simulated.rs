//! In-memory chain for tests and local runs
//!
//! Models the token and proof registry contracts closely enough to drive the
//! gateway: roles, pause, blacklist, balances, registry pagination and
//! receipts that stay pending for a configurable number of polls. Fault
//! knobs inject transport failures and reverts.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use types::address::Address;
use types::ids::{BatchId, ChainId, TxHash};
use types::merkle::{self, Digest};
use types::numeric::Amount;
use types::proof::{BatchType, ProofBatch};

use crate::client::{
    ChainClient, NetworkStatus, PublishBatch, ReceiptStatus, SignerIdentity, TokenInfo, TxReceipt,
};
use crate::errors::ClientError;

/// Sepolia
pub const SIMULATED_CHAIN_ID: ChainId = ChainId(11_155_111);

const TOKEN_ADDRESS: Address = Address::from_bytes([0xaa; 20]);

struct PendingReceipt {
    receipt: TxReceipt,
    polls_remaining: u32,
}

#[derive(Default)]
struct State {
    balances: HashMap<Address, Amount>,
    total_supply: Amount,
    paused: bool,
    blacklist: HashSet<Address>,
    minters: HashSet<Address>,
    burners: HashSet<Address>,
    publishers: HashSet<Address>,
    registry: Vec<ProofBatch>,
    receipts: HashMap<TxHash, PendingReceipt>,
    block_number: u64,
    nonce: u64,

    // Fault injection
    failing_reads: u32,
    failing_writes: u32,
    failing_receipt_polls: u32,
    pending_polls: u32,
    next_transfer_revert: Option<String>,
    next_transfer_receipt_failure: Option<String>,
    write_delay: Duration,
    last_page_request: Option<(u64, u64)>,
}

impl State {
    fn balance(&self, owner: &Address) -> Amount {
        self.balances.get(owner).cloned().unwrap_or_default()
    }

    fn next_hash(&mut self) -> TxHash {
        self.nonce += 1;
        self.block_number += 1;
        let mut seed = b"simulated-tx".to_vec();
        seed.extend_from_slice(&self.nonce.to_be_bytes());
        TxHash::from_bytes(merkle::keccak256(&seed))
    }

    fn record(&mut self, status: ReceiptStatus, batch_id: Option<BatchId>) -> TxHash {
        let tx_hash = self.next_hash();
        let receipt = TxReceipt {
            tx_hash,
            status,
            block_number: self.block_number,
            gas_used: 21_000,
            batch_id,
        };
        self.receipts.insert(
            tx_hash,
            PendingReceipt {
                receipt,
                polls_remaining: self.pending_polls,
            },
        );
        tx_hash
    }

    fn read_gate(&mut self) -> Result<(), ClientError> {
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(ClientError::Transport("connection reset by peer".into()));
        }
        Ok(())
    }

    /// Write failures happen before the transaction reaches the mempool.
    fn write_gate(&mut self) -> Result<(), ClientError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(ClientError::Transport("connection refused".into()));
        }
        Ok(())
    }

    fn require_role(roles: &HashSet<Address>, account: &Address) -> Result<(), ClientError> {
        if roles.contains(account) {
            Ok(())
        } else {
            Err(ClientError::Revert(format!(
                "AccessControlUnauthorizedAccount({account})"
            )))
        }
    }

    fn require_not_paused(&self) -> Result<(), ClientError> {
        if self.paused {
            Err(ClientError::Revert("EnforcedPause()".into()))
        } else {
            Ok(())
        }
    }

    fn require_not_blacklisted(&self, account: &Address) -> Result<(), ClientError> {
        if self.blacklist.contains(account) {
            Err(ClientError::Revert(format!("Address {account} is blacklisted")))
        } else {
            Ok(())
        }
    }
}

/// Decrements the in-flight write gauge on drop
struct InFlight<'a>(&'a AtomicU64);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SimulatedChain {
    state: Mutex<State>,
    write_calls: AtomicU64,
    transfer_calls: AtomicU64,
    batches_by_type_calls: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
}

impl Default for SimulatedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            write_calls: AtomicU64::new(0),
            transfer_calls: AtomicU64::new(0),
            batches_by_type_calls: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            max_in_flight: AtomicU64::new(0),
        }
    }

    // ── Contract Admin ──────────────────────────────────────────────

    /// Overwrite a balance, adjusting total supply to match.
    pub fn set_balance(&self, owner: Address, amount: Amount) {
        let mut state = self.state.lock();
        let previous = state.balance(&owner);
        let supply = state.total_supply.saturating_sub(&previous);
        state.total_supply = supply + amount.clone();
        state.balances.insert(owner, amount);
    }

    pub fn balance(&self, owner: Address) -> Amount {
        self.state.lock().balance(&owner)
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    pub fn blacklist(&self, account: Address) {
        self.state.lock().blacklist.insert(account);
    }

    pub fn unblacklist(&self, account: Address) {
        self.state.lock().blacklist.remove(&account);
    }

    pub fn grant_minter(&self, account: Address) {
        self.state.lock().minters.insert(account);
    }

    pub fn grant_burner(&self, account: Address) {
        self.state.lock().burners.insert(account);
    }

    pub fn grant_publisher(&self, account: Address) {
        self.state.lock().publishers.insert(account);
    }

    /// Registry oracle marks a batch verified.
    pub fn verify_batch(&self, batch_id: BatchId) -> bool {
        let mut state = self.state.lock();
        match usize::try_from(batch_id.0)
            .ok()
            .and_then(|i| state.registry.get_mut(i))
        {
            Some(batch) => {
                batch.verified = true;
                true
            }
            None => false,
        }
    }

    pub fn published_batches(&self) -> Vec<ProofBatch> {
        self.state.lock().registry.clone()
    }

    // ── Fault Injection ─────────────────────────────────────────────

    /// The next `n` reads (not receipt polls) fail with a transport error.
    pub fn fail_next_reads(&self, n: u32) {
        self.state.lock().failing_reads = n;
    }

    /// The next `n` writes fail with a transport error and change nothing.
    pub fn fail_next_writes(&self, n: u32) {
        self.state.lock().failing_writes = n;
    }

    /// The next `n` receipt polls fail with a transport error.
    pub fn fail_receipt_polls(&self, n: u32) {
        self.state.lock().failing_receipt_polls = n;
    }

    /// Receipts of later writes report "not mined" for `n` polls.
    pub fn set_pending_polls(&self, n: u32) {
        self.state.lock().pending_polls = n;
    }

    /// The next transfer reverts at submission with `reason`.
    pub fn revert_next_transfer(&self, reason: &str) {
        self.state.lock().next_transfer_revert = Some(reason.to_string());
    }

    /// The next transfer is accepted but its receipt reports failure.
    pub fn fail_next_transfer_receipt(&self, reason: &str) {
        self.state.lock().next_transfer_receipt_failure = Some(reason.to_string());
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().write_delay = delay;
    }

    // ── Observations ────────────────────────────────────────────────

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn transfer_calls(&self) -> u64 {
        self.transfer_calls.load(Ordering::SeqCst)
    }

    pub fn batches_by_type_calls(&self) -> u64 {
        self.batches_by_type_calls.load(Ordering::SeqCst)
    }

    /// Highest number of writes observed in flight at once.
    pub fn max_concurrent_writes(&self) -> u64 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// `(offset, limit)` of the last paginated registry call.
    pub fn last_page_request(&self) -> Option<(u64, u64)> {
        self.state.lock().last_page_request
    }

    async fn begin_write(&self) -> InFlight<'_> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        let delay = self.state.lock().write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        guard
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    async fn balance_of(&self, owner: Address) -> Result<Amount, ClientError> {
        let mut state = self.state.lock();
        state.read_gate()?;
        Ok(state.balance(&owner))
    }

    async fn is_blacklisted(&self, address: Address) -> Result<bool, ClientError> {
        let mut state = self.state.lock();
        state.read_gate()?;
        Ok(state.blacklist.contains(&address))
    }

    async fn paused(&self) -> Result<bool, ClientError> {
        let mut state = self.state.lock();
        state.read_gate()?;
        Ok(state.paused)
    }

    async fn token_info(&self) -> Result<TokenInfo, ClientError> {
        let mut state = self.state.lock();
        state.read_gate()?;
        Ok(TokenInfo {
            name: "USDK Stablecoin".into(),
            symbol: "USDK".into(),
            decimals: 18,
            total_supply: state.total_supply.clone(),
            contract_address: TOKEN_ADDRESS,
        })
    }

    async fn get_batch(&self, batch_id: BatchId) -> Result<ProofBatch, ClientError> {
        let mut state = self.state.lock();
        state.read_gate()?;
        usize::try_from(batch_id.0)
            .ok()
            .and_then(|i| state.registry.get(i))
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("batch {batch_id}")))
    }

    async fn batch_count(&self) -> Result<u64, ClientError> {
        let mut state = self.state.lock();
        state.read_gate()?;
        Ok(state.registry.len() as u64)
    }

    async fn batch_count_by_type(&self, batch_type: BatchType) -> Result<u64, ClientError> {
        let mut state = self.state.lock();
        state.read_gate()?;
        Ok(state
            .registry
            .iter()
            .filter(|b| b.batch_type == batch_type)
            .count() as u64)
    }

    async fn batches_by_type(
        &self,
        batch_type: BatchType,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<BatchId>, ClientError> {
        self.batches_by_type_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.read_gate()?;
        state.last_page_request = Some((offset, limit));
        let ids: Vec<BatchId> = state
            .registry
            .iter()
            .filter(|b| b.batch_type == batch_type)
            .map(|b| b.batch_id)
            .collect();
        let count = ids.len() as u64;
        if offset >= count {
            return Err(ClientError::Revert("Offset out of bounds".into()));
        }
        // The registry indexes without clamping
        if offset.saturating_add(limit) > count {
            return Err(ClientError::Revert("array out-of-bounds access (0x32)".into()));
        }
        Ok(ids
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn verify_proof(
        &self,
        batch_id: BatchId,
        leaf: Digest,
        proof: &[Digest],
    ) -> Result<bool, ClientError> {
        let mut state = self.state.lock();
        state.read_gate()?;
        let batch = usize::try_from(batch_id.0)
            .ok()
            .and_then(|i| state.registry.get(i))
            .ok_or_else(|| ClientError::NotFound(format!("batch {batch_id}")))?;
        Ok(merkle::verify(&batch.root, &leaf, proof))
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TxReceipt>, ClientError> {
        let mut state = self.state.lock();
        if state.failing_receipt_polls > 0 {
            state.failing_receipt_polls -= 1;
            return Err(ClientError::Transport("rpc unavailable".into()));
        }
        match state.receipts.get_mut(&hash) {
            None => Ok(None),
            Some(pending) if pending.polls_remaining > 0 => {
                pending.polls_remaining -= 1;
                Ok(None)
            }
            Some(pending) => Ok(Some(pending.receipt.clone())),
        }
    }

    async fn network_status(&self) -> Result<NetworkStatus, ClientError> {
        let mut state = self.state.lock();
        state.read_gate()?;
        Ok(NetworkStatus {
            chain_id: SIMULATED_CHAIN_ID,
            block_number: state.block_number,
        })
    }

    async fn transfer(
        &self,
        signer: &SignerIdentity,
        to: Address,
        amount: &Amount,
    ) -> Result<TxHash, ClientError> {
        self.transfer_calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = self.begin_write().await;
        let mut state = self.state.lock();
        state.write_gate()?;
        state.require_not_paused()?;
        state.require_not_blacklisted(&signer.address)?;
        state.require_not_blacklisted(&to)?;
        if let Some(reason) = state.next_transfer_revert.take() {
            return Err(ClientError::Revert(reason));
        }
        let from_balance = state.balance(&signer.address);
        let Some(remaining) = from_balance.checked_sub(amount) else {
            return Err(ClientError::Revert(format!(
                "ERC20InsufficientBalance({}, {from_balance}, {amount})",
                signer.address
            )));
        };

        if let Some(reason) = state.next_transfer_receipt_failure.take() {
            return Ok(state.record(ReceiptStatus::Failed { reason }, None));
        }
        let to_balance = state.balance(&to) + amount.clone();
        state.balances.insert(signer.address, remaining);
        state.balances.insert(to, to_balance);
        Ok(state.record(ReceiptStatus::Success, None))
    }

    async fn mint(
        &self,
        signer: &SignerIdentity,
        to: Address,
        amount: &Amount,
    ) -> Result<TxHash, ClientError> {
        let _in_flight = self.begin_write().await;
        let mut state = self.state.lock();
        state.write_gate()?;
        state.require_not_paused()?;
        State::require_role(&state.minters, &signer.address)?;
        state.require_not_blacklisted(&to)?;
        let balance = state.balance(&to) + amount.clone();
        state.balances.insert(to, balance);
        state.total_supply += amount;
        Ok(state.record(ReceiptStatus::Success, None))
    }

    async fn burn(&self, signer: &SignerIdentity, amount: &Amount) -> Result<TxHash, ClientError> {
        let _in_flight = self.begin_write().await;
        let mut state = self.state.lock();
        state.write_gate()?;
        state.require_not_paused()?;
        State::require_role(&state.burners, &signer.address)?;
        let balance = state.balance(&signer.address);
        let Some(remaining) = balance.checked_sub(amount) else {
            return Err(ClientError::Revert(format!(
                "ERC20InsufficientBalance({}, {balance}, {amount})",
                signer.address
            )));
        };
        state.balances.insert(signer.address, remaining);
        state.total_supply = state.total_supply.saturating_sub(amount);
        Ok(state.record(ReceiptStatus::Success, None))
    }

    async fn publish_batch(
        &self,
        signer: &SignerIdentity,
        batch: &PublishBatch,
    ) -> Result<TxHash, ClientError> {
        let _in_flight = self.begin_write().await;
        let mut state = self.state.lock();
        state.write_gate()?;
        State::require_role(&state.publishers, &signer.address)?;
        if batch.root == [0u8; 32]
            || batch.entry_count == 0
            || batch.start_timestamp >= batch.end_timestamp
        {
            return Err(ClientError::Revert("InvalidBatch()".into()));
        }
        let batch_id = BatchId(state.registry.len() as u64);
        state.registry.push(ProofBatch {
            batch_id,
            root: batch.root,
            batch_type: batch.batch_type,
            start_timestamp: batch.start_timestamp,
            end_timestamp: batch.end_timestamp,
            uri: batch.uri.clone(),
            publisher: signer.address,
            entry_count: batch.entry_count,
            verified: false,
        });
        Ok(state.record(ReceiptStatus::Success, Some(batch_id)))
    }
}
