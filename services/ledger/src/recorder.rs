//! LedgerRecorder: append-only store of balance-affecting events
//!
//! All appends go through one write lock, which makes a reservation the
//! linearization point for concurrent withdrawals: whatever a risk check
//! sees via [`LedgerRecorder::history_before`] includes every reservation
//! that was made earlier, in any task.
//!
//! Entries are never edited. Finalizing or releasing a reservation appends a
//! new entry under the same reference.

use crate::journal::{Journal, JournalConfig, JournalError, JournalRecord};
use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info};
use types::errors::ValidationError;
use types::ids::{AssetId, ChainId, LedgerEntryId, UserId};
use types::ledger::{
    committed_withdrawals_since, Direction, EntryKind, EntryStatus, LedgerEntry,
};
use types::numeric::Amount;
use types::withdrawal::WithdrawRequest;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Reservation already exists for reference {reference}")]
    ReservationExists { reference: String },

    #[error("No reservation for reference {reference}")]
    ReservationNotFound { reference: String },

    #[error("Reservation {reference} is already {status:?}")]
    ReservationClosed {
        reference: String,
        status: EntryStatus,
    },

    #[error("Withdrawal {reference} was already reversed")]
    AlreadyReversed { reference: String },

    #[error("Insufficient funds for {reference}: available {available}, requested {requested}")]
    InsufficientFunds {
        reference: String,
        available: Amount,
        requested: Amount,
    },
}

// ── State ───────────────────────────────────────────────────────────

#[derive(Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    by_pair: HashMap<(UserId, AssetId), Vec<usize>>,
    by_reference: HashMap<String, Vec<usize>>,
}

impl LedgerState {
    fn apply(&mut self, entry: LedgerEntry) {
        let index = self.entries.len();
        self.by_pair
            .entry((entry.user_id, entry.asset_id.clone()))
            .or_default()
            .push(index);
        self.by_reference
            .entry(entry.reference_id.clone())
            .or_default()
            .push(index);
        self.entries.push(entry);
    }

    fn referencing<'a>(&'a self, reference: &str) -> impl Iterator<Item = &'a LedgerEntry> + 'a {
        self.by_reference
            .get(reference)
            .into_iter()
            .flatten()
            .map(move |i| &self.entries[*i])
    }

    /// Latest withdraw debit under the reference.
    fn latest_reservation(&self, reference: &str) -> Option<&LedgerEntry> {
        self.referencing(reference)
            .filter(|e| e.is_withdraw_debit())
            .last()
    }

    /// Final balance less every reservation still open.
    fn available(&self, user_id: UserId, asset_id: &AssetId) -> BigInt {
        let Some(indices) = self.by_pair.get(&(user_id, asset_id.clone())) else {
            return BigInt::default();
        };
        let mut available = BigInt::default();
        for entry in indices.iter().map(|i| &self.entries[*i]) {
            match entry.status {
                EntryStatus::Final => available += entry.signed_amount(),
                EntryStatus::Pending
                    if entry.is_withdraw_debit()
                        && self
                            .latest_reservation(&entry.reference_id)
                            .is_some_and(|latest| latest.status == EntryStatus::Pending) =>
                {
                    available -= entry.amount.to_signed();
                }
                _ => {}
            }
        }
        available
    }

    fn pair_entries(&self, user_id: UserId, asset_id: &AssetId) -> Vec<LedgerEntry> {
        self.by_pair
            .get(&(user_id, asset_id.clone()))
            .map(|idx| idx.iter().map(|i| self.entries[*i].clone()).collect())
            .unwrap_or_default()
    }
}

struct Inner {
    state: LedgerState,
    journal: Option<Journal>,
}

impl Inner {
    /// Journal first, then memory: an entry is visible only once durable.
    fn commit(&mut self, entry: LedgerEntry) -> Result<LedgerEntry, LedgerError> {
        entry.amount.to_be_bytes32()?;
        if let Some(journal) = self.journal.as_mut() {
            journal.append(&JournalRecord::Ledger(entry.clone()))?;
        }
        self.state.apply(entry.clone());
        Ok(entry)
    }
}

// ── Recorder ────────────────────────────────────────────────────────

pub struct LedgerRecorder {
    inner: RwLock<Inner>,
}

impl LedgerRecorder {
    /// Volatile recorder, for tests and dry runs.
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: LedgerState::default(),
                journal: None,
            }),
        }
    }

    /// Durable recorder. Replays ledger records from the journal; other record
    /// kinds in the same directory are ignored.
    pub fn open(config: JournalConfig) -> Result<Self, LedgerError> {
        let (journal, records) = Journal::open(config)?;
        let mut state = LedgerState::default();
        for record in records {
            if let JournalRecord::Ledger(entry) = record {
                state.apply(entry);
            }
        }
        info!(entries = state.entries.len(), "Ledger recovered from journal");
        Ok(Self {
            inner: RwLock::new(Inner {
                state,
                journal: Some(journal),
            }),
        })
    }

    /// Append an arbitrary entry (deposits, mints, fees, seeded history).
    pub fn append(&self, entry: LedgerEntry) -> Result<LedgerEntryId, LedgerError> {
        let entry = self.inner.write().commit(entry)?;
        debug!(
            entry_id = %entry.id,
            user_id = %entry.user_id,
            kind = ?entry.kind,
            status = ?entry.status,
            "Ledger entry appended"
        );
        Ok(entry.id)
    }

    /// Reserve funds for a withdrawal with a pending debit.
    ///
    /// Fails if the request already holds a reservation, open or closed, or
    /// if the amount exceeds the final balance less open reservations.
    pub fn reserve(&self, request: &WithdrawRequest) -> Result<LedgerEntry, LedgerError> {
        let reference = request.reference();
        let mut inner = self.inner.write();
        if inner.state.latest_reservation(&reference).is_some() {
            return Err(LedgerError::ReservationExists { reference });
        }
        let available = inner.state.available(request.user_id, &request.asset_id);
        if available < request.amount.to_signed() {
            return Err(LedgerError::InsufficientFunds {
                reference,
                available: Amount::from_biguint(available.to_biguint().unwrap_or_default()),
                requested: request.amount.clone(),
            });
        }
        let entry = inner.commit(LedgerEntry::new(
            request.user_id,
            request.asset_id.clone(),
            request.chain_id,
            Direction::Debit,
            request.amount.clone(),
            EntryKind::Withdraw,
            EntryStatus::Pending,
            reference,
        ))?;
        debug!(withdraw_id = %request.id, amount = %request.amount, "Funds reserved");
        Ok(entry)
    }

    /// Pending → final. Idempotent: a second call returns the existing final entry.
    pub fn finalize(&self, reference: &str) -> Result<LedgerEntry, LedgerError> {
        self.close_reservation(reference, EntryStatus::Final)
    }

    /// Pending → reverted. Idempotent like [`finalize`](Self::finalize).
    pub fn release(&self, reference: &str) -> Result<LedgerEntry, LedgerError> {
        self.close_reservation(reference, EntryStatus::Reverted)
    }

    fn close_reservation(
        &self,
        reference: &str,
        target: EntryStatus,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut inner = self.inner.write();
        let latest = inner
            .state
            .latest_reservation(reference)
            .cloned()
            .ok_or_else(|| LedgerError::ReservationNotFound {
                reference: reference.to_string(),
            })?;
        match latest.status {
            status if status == target => Ok(latest),
            EntryStatus::Pending => {
                let entry = inner.commit(LedgerEntry {
                    id: LedgerEntryId::new(),
                    status: target,
                    created_at: Utc::now(),
                    ..latest
                })?;
                debug!(reference, status = ?target, "Reservation closed");
                Ok(entry)
            }
            status => Err(LedgerError::ReservationClosed {
                reference: reference.to_string(),
                status,
            }),
        }
    }

    /// Compensating credit for a finalized withdrawal (administrative reversal).
    pub fn reverse_final(&self, reference: &str) -> Result<LedgerEntry, LedgerError> {
        let mut inner = self.inner.write();
        let latest = inner
            .state
            .latest_reservation(reference)
            .cloned()
            .ok_or_else(|| LedgerError::ReservationNotFound {
                reference: reference.to_string(),
            })?;
        if latest.status != EntryStatus::Final {
            return Err(LedgerError::ReservationClosed {
                reference: reference.to_string(),
                status: latest.status,
            });
        }
        let already = inner
            .state
            .referencing(reference)
            .any(|e| e.kind == EntryKind::Withdraw && e.direction == Direction::Credit);
        if already {
            return Err(LedgerError::AlreadyReversed {
                reference: reference.to_string(),
            });
        }
        let entry = inner.commit(LedgerEntry {
            id: LedgerEntryId::new(),
            direction: Direction::Credit,
            status: EntryStatus::Final,
            created_at: Utc::now(),
            ..latest
        })?;
        info!(reference, amount = %entry.amount, "Finalized withdrawal reversed");
        Ok(entry)
    }

    pub fn reservation_status(&self, reference: &str) -> Option<EntryStatus> {
        self.inner
            .read()
            .state
            .latest_reservation(reference)
            .map(|e| e.status)
    }

    pub fn entries_for_reference(&self, reference: &str) -> Vec<LedgerEntry> {
        self.inner
            .read()
            .state
            .referencing(reference)
            .cloned()
            .collect()
    }

    /// Full history for a user/asset pair, in append order.
    pub fn history(&self, user_id: UserId, asset_id: &AssetId) -> Vec<LedgerEntry> {
        self.inner.read().state.pair_entries(user_id, asset_id)
    }

    /// History for a user/asset pair strictly before the first entry under
    /// `reference`. With no such entry, the full history.
    pub fn history_before(
        &self,
        user_id: UserId,
        asset_id: &AssetId,
        reference: &str,
    ) -> Vec<LedgerEntry> {
        let mut history = self.history(user_id, asset_id);
        if let Some(cut) = history.iter().position(|e| e.reference_id == reference) {
            history.truncate(cut);
        }
        history
    }

    /// Withdrawal volume reserved or finalized since `since`.
    pub fn sum_debits_since(
        &self,
        user_id: UserId,
        asset_id: &AssetId,
        since: DateTime<Utc>,
    ) -> Amount {
        committed_withdrawals_since(&self.history(user_id, asset_id), since).0
    }

    /// Entries created in `[start, end)`, ordered by id.
    pub fn entries_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<LedgerEntry> {
        let inner = self.inner.read();
        let mut entries: Vec<LedgerEntry> = inner
            .state
            .entries
            .iter()
            .filter(|e| e.created_at >= start && e.created_at < end)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Final balance less open reservations for a user/asset pair.
    pub fn available(&self, user_id: UserId, asset_id: &AssetId) -> BigInt {
        self.inner.read().state.available(user_id, asset_id)
    }

    /// Sum of final entries for a user/asset pair.
    pub fn balance(&self, user_id: UserId, asset_id: &AssetId) -> BigInt {
        self.history(user_id, asset_id)
            .iter()
            .filter(|e| e.status == EntryStatus::Final)
            .map(LedgerEntry::signed_amount)
            .sum()
    }

    /// Final balances per (user, asset, chain) as of `as_of` (exclusive).
    pub fn balances_at(&self, as_of: DateTime<Utc>) -> BTreeMap<(UserId, AssetId, ChainId), BigInt> {
        let inner = self.inner.read();
        let mut balances: BTreeMap<(UserId, AssetId, ChainId), BigInt> = BTreeMap::new();
        for entry in inner
            .state
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::Final && e.created_at < as_of)
        {
            *balances
                .entry((entry.user_id, entry.asset_id.clone(), entry.chain_id))
                .or_default() += entry.signed_amount();
        }
        balances
    }

    /// Aggregate final balances per (asset, chain) as of `as_of` (exclusive).
    pub fn asset_totals_at(&self, as_of: DateTime<Utc>) -> BTreeMap<(AssetId, ChainId), BigInt> {
        let mut totals: BTreeMap<(AssetId, ChainId), BigInt> = BTreeMap::new();
        for ((_, asset, chain), balance) in self.balances_at(as_of) {
            *totals.entry((asset, chain)).or_default() += balance;
        }
        totals
    }

    pub fn len(&self) -> usize {
        self.inner.read().state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush and fsync the journal, if any.
    pub fn sync(&self) -> Result<(), LedgerError> {
        if let Some(journal) = self.inner.write().journal.as_mut() {
            journal.sync()?;
        }
        Ok(())
    }
}
