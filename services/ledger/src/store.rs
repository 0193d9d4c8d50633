//! RecordStore: in-process implementation of every repository trait
//!
//! Holds withdrawal requests, risk configuration, the blacklist and proof
//! batch records. With a journal attached, every mutation is appended before
//! it becomes visible, and reopening the directory restores the last state.

use crate::journal::{Journal, JournalConfig, JournalRecord};
use crate::repository::{
    BlacklistRepository, ProofBatchRepository, RepositoryError, RiskConfigRepository,
    WithdrawRepository,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};
use types::address::Address;
use types::ids::{BatchId, WithdrawId};
use types::merkle::Digest;
use types::proof::{BatchType, ProofBatchRecord};
use types::risk::{BlacklistEntry, RiskConfig, RiskScope};
use types::withdrawal::{WithdrawRequest, WithdrawStatus};

#[derive(Default)]
struct StoreState {
    withdrawals: HashMap<WithdrawId, WithdrawRequest>,
    risk_configs: HashMap<RiskScope, RiskConfig>,
    blacklist: HashMap<Address, BlacklistEntry>,
    committed_batches: BTreeMap<BatchId, ProofBatchRecord>,
    staged_batches: HashMap<Digest, ProofBatchRecord>,
}

impl StoreState {
    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Withdraw(request) => {
                self.withdrawals.insert(request.id, request);
            }
            JournalRecord::RiskConfig(config) => {
                self.risk_configs.insert(config.scope.clone(), config);
            }
            JournalRecord::BlacklistAdd(entry) => {
                self.blacklist.insert(entry.address, entry);
            }
            JournalRecord::BlacklistRemove(address) => {
                self.blacklist.remove(&address);
            }
            JournalRecord::ProofBatch(record) => match record.batch_id {
                Some(batch_id) => {
                    self.staged_batches.remove(&record.root);
                    self.committed_batches.insert(batch_id, record);
                }
                None => {
                    self.staged_batches.insert(record.root, record);
                }
            },
            JournalRecord::ProofBatchDiscard(root) => {
                self.staged_batches.remove(&root);
            }
            JournalRecord::Ledger(_) => {}
        }
    }
}

struct Inner {
    state: StoreState,
    journal: Option<Journal>,
}

impl Inner {
    fn commit(&mut self, record: JournalRecord) -> Result<(), RepositoryError> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append(&record)?;
        }
        self.state.apply(record);
        Ok(())
    }
}

pub struct RecordStore {
    inner: Mutex<Inner>,
}

impl RecordStore {
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: StoreState::default(),
                journal: None,
            }),
        }
    }

    pub fn open(config: JournalConfig) -> Result<Self, RepositoryError> {
        let (journal, records) = Journal::open(config)?;
        let mut state = StoreState::default();
        for record in records {
            state.apply(record);
        }
        info!(
            withdrawals = state.withdrawals.len(),
            batches = state.committed_batches.len(),
            staged = state.staged_batches.len(),
            "Record store recovered from journal"
        );
        Ok(Self {
            inner: Mutex::new(Inner {
                state,
                journal: Some(journal),
            }),
        })
    }

    // ── Administrative mutations ────────────────────────────────────

    pub fn put_risk_config(&self, config: RiskConfig) -> Result<(), RepositoryError> {
        info!(scope = %config.scope, per_tx_limit = %config.per_tx_limit, daily_limit = %config.daily_limit, "Risk config updated");
        self.inner.lock().commit(JournalRecord::RiskConfig(config))
    }

    pub fn add_to_blacklist(&self, entry: BlacklistEntry) -> Result<(), RepositoryError> {
        info!(address = %entry.address, reason = %entry.reason, "Address blacklisted");
        self.inner.lock().commit(JournalRecord::BlacklistAdd(entry))
    }

    pub fn remove_from_blacklist(&self, address: Address) -> Result<(), RepositoryError> {
        info!(address = %address, "Address removed from blacklist");
        self.inner.lock().commit(JournalRecord::BlacklistRemove(address))
    }

    /// Committed records of a type, ordered by batch id.
    pub fn proof_batch_records(&self, batch_type: BatchType) -> Vec<ProofBatchRecord> {
        self.inner
            .lock()
            .state
            .committed_batches
            .values()
            .filter(|r| r.batch_type == batch_type)
            .cloned()
            .collect()
    }

    pub fn sync(&self) -> Result<(), RepositoryError> {
        if let Some(journal) = self.inner.lock().journal.as_mut() {
            journal.sync()?;
        }
        Ok(())
    }
}

#[async_trait]
impl WithdrawRepository for RecordStore {
    async fn save_withdraw(&self, request: &WithdrawRequest) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.state.withdrawals.get(&request.id) {
            if existing.status != request.status
                && !existing.status.can_transition_to(request.status)
            {
                return Err(RepositoryError::Conflict(format!(
                    "withdrawal {} cannot move from {} to {}",
                    request.id, existing.status, request.status
                )));
            }
        }
        inner.commit(JournalRecord::Withdraw(request.clone()))?;
        debug!(withdraw_id = %request.id, status = %request.status, "Withdrawal saved");
        Ok(())
    }

    async fn load_withdraw(&self, id: WithdrawId) -> Result<Option<WithdrawRequest>, RepositoryError> {
        Ok(self.inner.lock().state.withdrawals.get(&id).cloned())
    }

    async fn withdraws_with_status(
        &self,
        statuses: &[WithdrawStatus],
    ) -> Result<Vec<WithdrawRequest>, RepositoryError> {
        let inner = self.inner.lock();
        let mut found: Vec<WithdrawRequest> = inner
            .state
            .withdrawals
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.id);
        Ok(found)
    }
}

#[async_trait]
impl RiskConfigRepository for RecordStore {
    async fn load_risk_config(&self, scope: &RiskScope) -> Result<Option<RiskConfig>, RepositoryError> {
        Ok(self.inner.lock().state.risk_configs.get(scope).cloned())
    }
}

#[async_trait]
impl BlacklistRepository for RecordStore {
    async fn is_blacklisted(&self, address: &Address) -> Result<bool, RepositoryError> {
        Ok(self.inner.lock().state.blacklist.contains_key(address))
    }

    async fn blacklist_entries(
        &self,
        addresses: &[Address],
    ) -> Result<Vec<BlacklistEntry>, RepositoryError> {
        let inner = self.inner.lock();
        Ok(addresses
            .iter()
            .filter_map(|a| inner.state.blacklist.get(a).cloned())
            .collect())
    }
}

#[async_trait]
impl ProofBatchRepository for RecordStore {
    async fn save_proof_batch_record(&self, record: &ProofBatchRecord) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock();
        if let Some(batch_id) = record.batch_id {
            if let Some(existing) = inner.state.committed_batches.get(&batch_id) {
                if existing.root != record.root {
                    return Err(RepositoryError::Conflict(format!(
                        "batch {} already recorded with a different root",
                        batch_id
                    )));
                }
            }
        }
        inner.commit(JournalRecord::ProofBatch(record.clone()))
    }

    async fn load_proof_batch_record(
        &self,
        batch_id: BatchId,
    ) -> Result<Option<ProofBatchRecord>, RepositoryError> {
        Ok(self.inner.lock().state.committed_batches.get(&batch_id).cloned())
    }

    async fn staged_records(
        &self,
        batch_type: BatchType,
    ) -> Result<Vec<ProofBatchRecord>, RepositoryError> {
        let inner = self.inner.lock();
        let mut staged: Vec<ProofBatchRecord> = inner
            .state
            .staged_batches
            .values()
            .filter(|r| r.batch_type == batch_type)
            .cloned()
            .collect();
        staged.sort_by_key(|r| (r.start_timestamp, r.end_timestamp));
        Ok(staged)
    }

    async fn discard_staged_record(&self, root: &Digest) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.state.staged_batches.get(root) else {
            return Ok(());
        };
        let (batch_type, start, end) = (record.batch_type, record.start_timestamp, record.end_timestamp);
        inner.commit(JournalRecord::ProofBatchDiscard(*root))?;
        debug!(batch_type = %batch_type, start, end, "Staged proof batch discarded");
        Ok(())
    }

    async fn latest_proof_batch_record(
        &self,
        batch_type: BatchType,
    ) -> Result<Option<ProofBatchRecord>, RepositoryError> {
        Ok(self
            .inner
            .lock()
            .state
            .committed_batches
            .values()
            .filter(|r| r.batch_type == batch_type)
            .max_by_key(|r| (r.end_timestamp, r.batch_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use types::ids::{AssetId, ChainId, UserId};
    use types::merkle::MerkleTree;
    use types::numeric::Amount;

    fn request() -> WithdrawRequest {
        WithdrawRequest::new(
            UserId::new(),
            None,
            ChainId(1),
            AssetId::new("USDK"),
            Address::from_bytes([0x33; 20]),
            Amount::from(10u64),
        )
    }

    fn staged(batch_type: BatchType, end: u64) -> ProofBatchRecord {
        let leaves = vec![end.to_be_bytes().to_vec(), b"leaf".to_vec()];
        let root = MerkleTree::from_leaves(&leaves).root().unwrap();
        ProofBatchRecord::staged(root, batch_type, end - 60, end, "uri".into(), leaves)
    }

    #[tokio::test]
    async fn test_save_and_load_withdraw() {
        let store = RecordStore::in_memory();
        let mut req = request();
        store.save_withdraw(&req).await.unwrap();
        req.advance(WithdrawStatus::RiskChecked).unwrap();
        store.save_withdraw(&req).await.unwrap();

        let loaded = store.load_withdraw(req.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WithdrawStatus::RiskChecked);
        let pending = store
            .withdraws_with_status(&[WithdrawStatus::RiskChecked])
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_backward_save_is_conflict() {
        let store = RecordStore::in_memory();
        let mut req = request();
        req.advance(WithdrawStatus::RiskChecked).unwrap();
        store.save_withdraw(&req).await.unwrap();
        req.status = WithdrawStatus::Requested;
        assert!(matches!(
            store.save_withdraw(&req).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_blacklist_lookup() {
        let store = RecordStore::in_memory();
        let bad = Address::from_bytes([0xbb; 20]);
        let good = Address::from_bytes([0x99; 20]);
        store.add_to_blacklist(BlacklistEntry::new(bad, "sanctioned")).unwrap();

        assert!(store.is_blacklisted(&bad).await.unwrap());
        assert!(!store.is_blacklisted(&good).await.unwrap());
        let entries = store.blacklist_entries(&[good, bad]).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "sanctioned");

        store.remove_from_blacklist(bad).unwrap();
        assert!(!store.is_blacklisted(&bad).await.unwrap());
    }

    #[tokio::test]
    async fn test_risk_config_by_scope() {
        let store = RecordStore::in_memory();
        let config = RiskConfig::global(Amount::from(1_000u64), Amount::from(5_000u64));
        store.put_risk_config(config.clone()).unwrap();
        assert_eq!(
            store.load_risk_config(&RiskScope::Global).await.unwrap(),
            Some(config)
        );
        assert_eq!(
            store
                .load_risk_config(&RiskScope::Asset(AssetId::new("USDK")))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_staged_record_moves_to_committed() {
        let store = RecordStore::in_memory();
        let mut record = staged(BatchType::Transactions, 120);
        store.save_proof_batch_record(&record).await.unwrap();
        let staged_now = store.staged_records(BatchType::Transactions).await.unwrap();
        assert_eq!(staged_now, vec![record.clone()]);
        assert!(store.staged_records(BatchType::Reserves).await.unwrap().is_empty());

        record.batch_id = Some(BatchId(0));
        store.save_proof_batch_record(&record).await.unwrap();
        assert!(store.staged_records(BatchType::Transactions).await.unwrap().is_empty());
        assert_eq!(
            store.load_proof_batch_record(BatchId(0)).await.unwrap(),
            Some(record)
        );
    }

    #[tokio::test]
    async fn test_discarded_staged_record_stays_gone_after_reopen() {
        let tmp = TempDir::new().unwrap();
        let dropped = staged(BatchType::Liabilities, 120);
        let kept = staged(BatchType::Liabilities, 240);
        {
            let store = RecordStore::open(JournalConfig::new(tmp.path())).unwrap();
            store.save_proof_batch_record(&kept).await.unwrap();
            store.save_proof_batch_record(&dropped).await.unwrap();
            store.discard_staged_record(&dropped.root).await.unwrap();
            // Discarding an unknown root is a no-op
            store.discard_staged_record(&[7u8; 32]).await.unwrap();
            store.sync().unwrap();
        }
        let store = RecordStore::open(JournalConfig::new(tmp.path())).unwrap();
        assert_eq!(
            store.staged_records(BatchType::Liabilities).await.unwrap(),
            vec![kept]
        );
    }

    #[tokio::test]
    async fn test_latest_record_per_type() {
        let store = RecordStore::in_memory();
        for (id, end) in [(0u64, 120u64), (1, 240), (2, 180)] {
            let mut record = staged(BatchType::Liabilities, end);
            record.batch_id = Some(BatchId(id));
            store.save_proof_batch_record(&record).await.unwrap();
        }
        let latest = store
            .latest_proof_batch_record(BatchType::Liabilities)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.end_timestamp, 240);
        assert!(store
            .latest_proof_batch_record(BatchType::Reserves)
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.proof_batch_records(BatchType::Liabilities).len(), 3);
    }

    #[tokio::test]
    async fn test_durable_store_reopens() {
        let tmp = TempDir::new().unwrap();
        let req = request();
        let bad = Address::from_bytes([0xcc; 20]);
        {
            let store = RecordStore::open(JournalConfig::new(tmp.path())).unwrap();
            store.save_withdraw(&req).await.unwrap();
            store.add_to_blacklist(BlacklistEntry::new(bad, "fraud")).unwrap();
            store.sync().unwrap();
        }
        let store = RecordStore::open(JournalConfig::new(tmp.path())).unwrap();
        assert_eq!(store.load_withdraw(req.id).await.unwrap(), Some(req));
        assert!(store.is_blacklisted(&bad).await.unwrap());
    }
}
