use chain_gateway::simulated::SimulatedChain;
use chain_gateway::{
    ChainGateway, GatewayConfig, GatewayError, PublishBatch, RetryPolicy, RevertReason,
    SignerIdentity, SigningKey,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ledger::{JournalConfig, LedgerRecorder, ProofBatchRepository, RecordStore};
use reconciler::{ProofBatchReconciler, ReconcilerConfig, ReconcilerError, RunOutcome};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use types::address::Address;
use types::ids::{AssetId, BatchId, ChainId, UserId};
use types::ledger::{Direction, EntryKind, EntryStatus, LedgerEntry};
use types::merkle::{self, MerkleTree};
use types::numeric::Amount;
use types::proof::{BatchType, ProofBatchRecord};

const CHAIN: ChainId = ChainId(11_155_111);

fn custody() -> Address {
    Address::from_bytes([0xc0; 20])
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        multiplier: 2.0,
    }
}

struct Harness {
    chain: Arc<SimulatedChain>,
    ledger: Arc<LedgerRecorder>,
    store: Arc<RecordStore>,
    reconciler: ProofBatchReconciler,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(Arc::new(RecordStore::in_memory()), true)
    }

    fn with_store(store: Arc<RecordStore>, publisher: bool) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let chain = Arc::new(SimulatedChain::new());
        chain.set_balance(custody(), Amount::from(1_000_000u64));
        if publisher {
            chain.grant_publisher(custody());
        }
        let ledger = Arc::new(LedgerRecorder::in_memory());
        let reconciler = Self::build(&chain, &ledger, &store);
        Self {
            chain,
            ledger,
            store,
            reconciler,
        }
    }

    fn build(
        chain: &Arc<SimulatedChain>,
        ledger: &Arc<LedgerRecorder>,
        store: &Arc<RecordStore>,
    ) -> ProofBatchReconciler {
        let gateway = Arc::new(ChainGateway::new(
            chain.clone(),
            GatewayConfig {
                signer: Some(SignerIdentity {
                    address: custody(),
                    key: SigningKey::new("publisher-key"),
                }),
                cache_ttl: Duration::ZERO,
                read_retry: fast_retry(),
                ..GatewayConfig::default()
            },
        ));
        ProofBatchReconciler::new(
            ledger.clone(),
            store.clone(),
            gateway,
            ReconcilerConfig {
                custody_address: Some(custody()),
                receipt_retry: fast_retry(),
                poll_interval: Duration::from_millis(5),
                max_pending_polls: 20,
                ..ReconcilerConfig::default()
            },
        )
    }

    /// Final credit dated a minute back so it falls inside any window ending now.
    fn deposit(&self, user: UserId, amount: u64) {
        let mut entry = LedgerEntry::new(
            user,
            AssetId::new("USDK"),
            CHAIN,
            Direction::Credit,
            Amount::from(amount),
            EntryKind::Deposit,
            EntryStatus::Final,
            format!("deposit-{}-{}", user, amount),
        );
        entry.created_at = Utc::now() - ChronoDuration::seconds(60);
        self.ledger.append(entry).unwrap();
    }
}

fn window_end() -> DateTime<Utc> {
    Utc::now() + ChronoDuration::seconds(1)
}

fn published(outcome: RunOutcome) -> ProofBatchRecord {
    match outcome {
        RunOutcome::Published(record) => record,
        other => panic!("expected a published batch, got {:?}", other),
    }
}

#[tokio::test]
async fn test_transactions_batch_proves_inclusion() {
    let h = Harness::new();
    for i in 0..500u64 {
        h.deposit(UserId::new(), i + 1);
    }

    let record = published(
        h.reconciler
            .publish_window(BatchType::Transactions, window_end())
            .await
            .unwrap(),
    );
    let batch_id = record.batch_id.unwrap();
    assert_eq!(record.entry_count(), 500);
    assert_eq!(record.start_timestamp, 0);
    assert!(record.uri.starts_with("ipfs://proofs/transactions/0x"));

    let on_chain = h.chain.published_batches();
    assert_eq!(on_chain.len(), 1);
    assert_eq!(on_chain[0].root, record.root);
    assert_eq!(on_chain[0].entry_count, 500);

    let proof = h.reconciler.proof_for(batch_id, 137).await.unwrap();
    assert_eq!(proof.leaf_hash, merkle::leaf_hash(&proof.leaf));
    assert!(h
        .reconciler
        .verify_proof(batch_id, &proof.leaf, &proof.proof)
        .await
        .unwrap());

    let mut tampered = proof.leaf.clone();
    tampered[10] ^= 0x01;
    assert!(!h
        .reconciler
        .verify_proof(batch_id, &tampered, &proof.proof)
        .await
        .unwrap());

    assert!(matches!(
        h.reconciler.proof_for(batch_id, 500).await,
        Err(ReconcilerError::LeafOutOfRange { index: 500, count: 500, .. })
    ));
}

#[tokio::test]
async fn test_audit_matches_registry() {
    let h = Harness::new();
    for i in 0..12u64 {
        h.deposit(UserId::new(), 10 * (i + 1));
    }

    let end = window_end();
    let mut ids = Vec::new();
    for batch_type in BatchType::ALL {
        let record = published(h.reconciler.publish_window(batch_type, end).await.unwrap());
        ids.push(record.batch_id.unwrap());
    }

    for batch_id in &ids {
        let report = h.reconciler.audit(*batch_id).await.unwrap();
        assert!(report.is_consistent());
        assert!(!report.verified);
    }

    assert!(h.chain.verify_batch(ids[0]));
    assert!(h.reconciler.audit(ids[0]).await.unwrap().verified);
}

#[tokio::test]
async fn test_reserves_close_with_custody_leaf() {
    let h = Harness::new();
    h.deposit(UserId::new(), 400);
    h.deposit(UserId::new(), 600);

    let record = published(
        h.reconciler
            .publish_window(BatchType::Reserves, window_end())
            .await
            .unwrap(),
    );
    // One aggregate for (USDK, chain), then custody
    assert_eq!(record.leaves.len(), 2);
    assert_eq!(record.leaves[0][1], b'R');
    assert_eq!(record.leaves[1][1], b'C');
    assert_eq!(&record.leaves[1][2..22], custody().as_bytes());
}

#[tokio::test]
async fn test_empty_window_publishes_nothing() {
    let h = Harness::new();
    let outcome = h
        .reconciler
        .publish_window(BatchType::Transactions, window_end())
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Empty { start: 0, .. }));
    assert_eq!(h.chain.write_calls(), 0);
    assert!(h.chain.published_batches().is_empty());
}

#[tokio::test]
async fn test_next_window_starts_at_previous_end() {
    let h = Harness::new();
    h.deposit(UserId::new(), 75);

    let first_end = window_end();
    let first = published(
        h.reconciler
            .publish_window(BatchType::Liabilities, first_end)
            .await
            .unwrap(),
    );
    let boundary = first.end_timestamp;
    assert_eq!(boundary, first_end.timestamp() as u64);

    // No transactions after the first window closed
    published(
        h.reconciler
            .publish_window(BatchType::Transactions, first_end)
            .await
            .unwrap(),
    );
    let later = first_end + ChronoDuration::seconds(60);
    assert_eq!(
        h.reconciler
            .publish_window(BatchType::Transactions, later)
            .await
            .unwrap(),
        RunOutcome::Empty {
            start: boundary,
            end: boundary + 60
        }
    );

    let second = published(
        h.reconciler
            .publish_window(BatchType::Liabilities, later)
            .await
            .unwrap(),
    );
    assert_eq!(second.start_timestamp, boundary);
    assert_ne!(second.root, first.root);

    // A window that would end before the previous one is empty
    assert!(matches!(
        h.reconciler
            .publish_window(BatchType::Liabilities, first_end)
            .await
            .unwrap(),
        RunOutcome::Empty { .. }
    ));
}

#[tokio::test]
async fn test_same_type_runs_do_not_overlap() {
    let h = Harness::new();
    h.deposit(UserId::new(), 5);
    h.chain.set_write_delay(Duration::from_millis(200));

    let end = window_end();
    let (first, second) = tokio::join!(
        h.reconciler.publish_window(BatchType::Transactions, end),
        h.reconciler.publish_window(BatchType::Transactions, end),
    );
    assert!(matches!(first.unwrap(), RunOutcome::Published(_)));
    assert_eq!(second.unwrap(), RunOutcome::AlreadyRunning);
    assert_eq!(h.chain.published_batches().len(), 1);
}

#[tokio::test]
async fn test_list_batches_guards_pagination() {
    let h = Harness::new();
    h.deposit(UserId::new(), 9);

    let end = window_end();
    published(h.reconciler.publish_window(BatchType::Liabilities, end).await.unwrap());
    published(
        h.reconciler
            .publish_window(BatchType::Liabilities, end + ChronoDuration::seconds(60))
            .await
            .unwrap(),
    );

    let all = h.reconciler.list_batches(BatchType::Liabilities, 0, 10).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(h.chain.last_page_request(), Some((0, 2)));

    let tail = h.reconciler.list_batches(BatchType::Liabilities, 1, 10).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].start_timestamp, all[0].end_timestamp);
    assert_eq!(h.chain.last_page_request(), Some((1, 1)));

    let calls = h.chain.batches_by_type_calls();
    assert!(h
        .reconciler
        .list_batches(BatchType::Liabilities, 2, 10)
        .await
        .unwrap()
        .is_empty());
    assert!(matches!(
        h.reconciler.list_batches(BatchType::Liabilities, 5, 1).await,
        Err(ReconcilerError::Chain(GatewayError::InvalidPagination { offset: 5, count: 2, .. }))
    ));
    assert_eq!(h.chain.batches_by_type_calls(), calls);
}

#[tokio::test]
async fn test_missing_publisher_role_commits_nothing() {
    let h = Harness::with_store(Arc::new(RecordStore::in_memory()), false);
    h.deposit(UserId::new(), 20);

    let err = h
        .reconciler
        .publish_window(BatchType::Transactions, window_end())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReconcilerError::Chain(GatewayError::Reverted(RevertReason::MissingRole))
    ));
    assert!(h.store.proof_batch_records(BatchType::Transactions).is_empty());
    assert!(h
        .store
        .latest_proof_batch_record(BatchType::Transactions)
        .await
        .unwrap()
        .is_none());
    assert!(h
        .store
        .staged_records(BatchType::Transactions)
        .await
        .unwrap()
        .is_empty());

    // Once the role is granted the same window publishes exactly once
    h.chain.grant_publisher(custody());
    let record = published(
        h.reconciler
            .publish_window(BatchType::Transactions, window_end())
            .await
            .unwrap(),
    );
    assert_eq!(record.start_timestamp, 0);
    assert_eq!(h.chain.published_batches().len(), 1);
}

#[tokio::test]
async fn test_timed_out_publication_settles_before_next_window() {
    let h = Harness::new();
    h.deposit(UserId::new(), 75);
    h.chain.set_pending_polls(25);

    let first_end = window_end();
    let err = h
        .reconciler
        .publish_window(BatchType::Liabilities, first_end)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcilerError::PublishTimeout { .. }));
    let staged = h.store.staged_records(BatchType::Liabilities).await.unwrap();
    assert_eq!(staged.len(), 1);
    assert!(staged[0].tx_hash.is_some());

    // New activity lands before the next run
    h.chain.set_pending_polls(0);
    h.deposit(UserId::new(), 40);
    let later = first_end + ChronoDuration::seconds(60);
    let second = published(
        h.reconciler
            .publish_window(BatchType::Liabilities, later)
            .await
            .unwrap(),
    );
    assert_eq!(second.start_timestamp, first_end.timestamp() as u64);
    assert_eq!(second.batch_id, Some(BatchId(1)));

    let records = h.store.proof_batch_records(BatchType::Liabilities);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].root, staged[0].root);
    assert_eq!(records[0].batch_id, Some(BatchId(0)));
    assert_eq!(h.chain.published_batches().len(), 2);
    for record in &records {
        let report = h.reconciler.audit(record.batch_id.unwrap()).await.unwrap();
        assert!(report.is_consistent());
    }
    assert!(h
        .store
        .staged_records(BatchType::Liabilities)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_pending_staged_publication_blocks_next_window() {
    let h = Harness::new();
    h.deposit(UserId::new(), 10);
    h.chain.set_pending_polls(1_000);

    let end = window_end();
    assert!(h
        .reconciler
        .publish_window(BatchType::Transactions, end)
        .await
        .is_err());
    let writes = h.chain.write_calls();

    let err = h
        .reconciler
        .publish_window(BatchType::Transactions, end + ChronoDuration::seconds(60))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcilerError::PublishTimeout { .. }));
    assert_eq!(h.chain.write_calls(), writes);
    assert_eq!(h.store.staged_records(BatchType::Transactions).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_staged_record_found_in_registry_is_committed() {
    let h = Harness::new();
    let end = (Utc::now() - ChronoDuration::seconds(30)).timestamp() as u64;
    let leaves: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 8]).collect();
    let root = MerkleTree::from_leaves(&leaves).root().unwrap();
    let staged = ProofBatchRecord::staged(
        root,
        BatchType::Transactions,
        0,
        end,
        "ipfs://proofs/transactions/staged.json".into(),
        leaves,
    );
    h.store.save_proof_batch_record(&staged).await.unwrap();

    // Published by a process that stopped before recording the hash
    let other = ChainGateway::new(
        h.chain.clone(),
        GatewayConfig {
            signer: Some(SignerIdentity {
                address: custody(),
                key: SigningKey::new("publisher-key"),
            }),
            ..GatewayConfig::default()
        },
    );
    other
        .publish_batch(&PublishBatch {
            root,
            batch_type: BatchType::Transactions,
            start_timestamp: 0,
            end_timestamp: end,
            uri: staged.uri.clone(),
            entry_count: staged.entry_count(),
        })
        .await
        .unwrap();

    let outcome = h
        .reconciler
        .publish_window(BatchType::Transactions, window_end())
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Empty { start, .. } if start == end));
    assert_eq!(h.chain.published_batches().len(), 1);

    let committed = h.store.proof_batch_records(BatchType::Transactions);
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].batch_id, Some(BatchId(0)));
    assert!(h.reconciler.audit(BatchId(0)).await.unwrap().is_consistent());
    assert!(h
        .store
        .staged_records(BatchType::Transactions)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_unpublished_staged_record_is_discarded() {
    let h = Harness::new();
    let leaves = vec![b"orphan".to_vec()];
    let root = MerkleTree::from_leaves(&leaves).root().unwrap();
    let orphan = ProofBatchRecord::staged(
        root,
        BatchType::Reserves,
        0,
        60,
        "ipfs://proofs/reserves/orphan.json".into(),
        leaves,
    );
    h.store.save_proof_batch_record(&orphan).await.unwrap();
    h.deposit(UserId::new(), 500);

    let record = published(
        h.reconciler
            .publish_window(BatchType::Reserves, window_end())
            .await
            .unwrap(),
    );
    assert_eq!(record.start_timestamp, 0);
    assert_ne!(record.root, root);
    assert_eq!(h.chain.published_batches().len(), 1);
    assert!(h
        .store
        .staged_records(BatchType::Reserves)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_run_all_publishes_every_type() {
    let h = Harness::new();
    h.deposit(UserId::new(), 1_000);
    h.deposit(UserId::new(), 2_000);

    let results = h.reconciler.run_all().await;
    assert_eq!(results.len(), 3);
    for (batch_type, result) in results {
        let record = published(result.unwrap());
        assert_eq!(record.batch_type, batch_type);
    }
    assert_eq!(h.chain.published_batches().len(), 3);
}

#[tokio::test]
async fn test_proofs_survive_restart() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(RecordStore::open(JournalConfig::new(dir.path())).unwrap());
    let h = Harness::with_store(store, true);
    for i in 0..30u64 {
        h.deposit(UserId::new(), i + 100);
    }
    let record = published(
        h.reconciler
            .publish_window(BatchType::Transactions, window_end())
            .await
            .unwrap(),
    );
    let batch_id = record.batch_id.unwrap();

    let Harness { chain, ledger, store, reconciler } = h;
    drop(reconciler);
    drop(store);

    let reopened = Arc::new(RecordStore::open(JournalConfig::new(dir.path())).unwrap());
    let reconciler = Harness::build(&chain, &ledger, &reopened);
    let proof = reconciler.proof_for(batch_id, 29).await.unwrap();
    assert_eq!(proof.root, record.root);
    assert!(reconciler
        .verify_proof(batch_id, &proof.leaf, &proof.proof)
        .await
        .unwrap());
    assert!(reconciler.audit(batch_id).await.unwrap().is_consistent());
}
