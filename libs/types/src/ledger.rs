//! Ledger entry model
//!
//! Entries are immutable. A reservation is a `Pending` debit; finalizing it
//! appends a `Final` debit under the same reference, releasing it appends a
//! `Reverted` debit. The latest entry for a reference decides its state.

use crate::errors::ValidationError;
use crate::ids::{AssetId, ChainId, LedgerEntryId, UserId};
use crate::numeric::Amount;
use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Canonical leaf layout version
pub const CANONICAL_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    fn tag(self) -> u8 {
        match self {
            Direction::Credit => 0,
            Direction::Debit => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Deposit,
    Withdraw,
    Mint,
    Burn,
    Fee,
}

impl EntryKind {
    fn tag(self) -> u8 {
        match self {
            EntryKind::Deposit => 0,
            EntryKind::Withdraw => 1,
            EntryKind::Mint => 2,
            EntryKind::Burn => 3,
            EntryKind::Fee => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    Pending,
    Final,
    Reverted,
}

impl EntryStatus {
    fn tag(self) -> u8 {
        match self {
            EntryStatus::Pending => 0,
            EntryStatus::Final => 1,
            EntryStatus::Reverted => 2,
        }
    }
}

/// Single balance-affecting event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub user_id: UserId,
    pub asset_id: AssetId,
    pub chain_id: ChainId,
    pub direction: Direction,
    pub amount: Amount,
    pub kind: EntryKind,
    pub status: EntryStatus,
    /// Correlates entries of one business event (withdraw id, deposit tx hash)
    pub reference_id: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: UserId,
        asset_id: AssetId,
        chain_id: ChainId,
        direction: Direction,
        amount: Amount,
        kind: EntryKind,
        status: EntryStatus,
        reference_id: impl Into<String>,
    ) -> Self {
        Self {
            id: LedgerEntryId::new(),
            user_id,
            asset_id,
            chain_id,
            direction,
            amount,
            kind,
            status,
            reference_id: reference_id.into(),
            created_at: Utc::now(),
        }
    }

    /// Credits positive, debits negative.
    pub fn signed_amount(&self) -> BigInt {
        match self.direction {
            Direction::Credit => self.amount.to_signed(),
            Direction::Debit => -self.amount.to_signed(),
        }
    }

    pub fn is_withdraw_debit(&self) -> bool {
        self.kind == EntryKind::Withdraw && self.direction == Direction::Debit
    }

    /// Fixed-layout serialization used as a Transactions batch leaf.
    ///
    /// ```text
    /// [version u8][id 16][user 16][asset_len u16][asset][chain u64]
    /// [direction u8][kind u8][status u8][amount 32][ref_len u16][ref][created_at_ms i64]
    /// ```
    /// Integers are big-endian.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, ValidationError> {
        let asset = self.asset_id.as_str().as_bytes();
        let reference = self.reference_id.as_bytes();
        let mut buf = Vec::with_capacity(1 + 16 + 16 + 2 + asset.len() + 8 + 3 + 32 + 2 + reference.len() + 8);
        buf.push(CANONICAL_VERSION);
        buf.extend_from_slice(self.id.as_uuid().as_bytes());
        buf.extend_from_slice(self.user_id.as_uuid().as_bytes());
        put_bytes(&mut buf, asset);
        buf.extend_from_slice(&self.chain_id.0.to_be_bytes());
        buf.push(self.direction.tag());
        buf.push(self.kind.tag());
        buf.push(self.status.tag());
        buf.extend_from_slice(&self.amount.to_be_bytes32()?);
        put_bytes(&mut buf, reference);
        buf.extend_from_slice(&self.created_at.timestamp_millis().to_be_bytes());
        Ok(buf)
    }
}

/// Length-prefixed (u16 big-endian) byte string. Longer inputs are truncated
/// to `u16::MAX`; asset symbols and references never come close.
pub(crate) fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    let len = bytes.len().min(u16::MAX as usize);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&bytes[..len]);
}

/// Effective status of a reservation: the status of the latest entry under
/// its reference, in append order.
pub fn reservation_state<'a>(
    entries: impl IntoIterator<Item = &'a LedgerEntry>,
    reference_id: &str,
) -> Option<EntryStatus> {
    entries
        .into_iter()
        .filter(|e| e.reference_id == reference_id && e.is_withdraw_debit())
        .last()
        .map(|e| e.status)
}

/// Withdrawal volume and count committed since `since`.
///
/// A withdrawal counts once per reference while it is reserved or final.
/// Released reservations do not count. The window test uses the timestamp of
/// the first entry for the reference, i.e. when the funds were first
/// encumbered.
pub fn committed_withdrawals_since(history: &[LedgerEntry], since: DateTime<Utc>) -> (Amount, u32) {
    let mut first_seen: HashMap<&str, (DateTime<Utc>, &Amount)> = HashMap::new();
    let mut latest: HashMap<&str, EntryStatus> = HashMap::new();
    for entry in history.iter().filter(|e| e.is_withdraw_debit()) {
        first_seen
            .entry(entry.reference_id.as_str())
            .or_insert((entry.created_at, &entry.amount));
        latest.insert(entry.reference_id.as_str(), entry.status);
    }

    let mut total = Amount::zero();
    let mut count = 0u32;
    for (reference, status) in latest {
        if status == EntryStatus::Reverted {
            continue;
        }
        if let Some((created_at, amount)) = first_seen.get(reference) {
            if *created_at >= since {
                total += amount;
                count += 1;
            }
        }
    }
    (total, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn withdraw(user: UserId, amount: u64, status: EntryStatus, reference: &str) -> LedgerEntry {
        LedgerEntry::new(
            user,
            AssetId::new("USDK"),
            ChainId(11155111),
            Direction::Debit,
            Amount::from(amount),
            EntryKind::Withdraw,
            status,
            reference,
        )
    }

    #[test]
    fn test_signed_amount() {
        let user = UserId::new();
        let debit = withdraw(user, 40, EntryStatus::Final, "w1");
        assert_eq!(debit.signed_amount(), BigInt::from(-40));
        let credit = LedgerEntry {
            direction: Direction::Credit,
            kind: EntryKind::Deposit,
            ..debit
        };
        assert_eq!(credit.signed_amount(), BigInt::from(40));
    }

    #[test]
    fn test_canonical_bytes_stable_and_sensitive() {
        let entry = withdraw(UserId::new(), 100, EntryStatus::Final, "w1");
        let a = entry.canonical_bytes().unwrap();
        let b = entry.canonical_bytes().unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0], CANONICAL_VERSION);

        let mut other = entry.clone();
        other.amount = Amount::from(101u64);
        assert_ne!(a, other.canonical_bytes().unwrap());
    }

    #[test]
    fn test_reservation_state_follows_latest_entry() {
        let user = UserId::new();
        let entries = vec![
            withdraw(user, 10, EntryStatus::Pending, "w1"),
            withdraw(user, 10, EntryStatus::Final, "w1"),
            withdraw(user, 5, EntryStatus::Pending, "w2"),
        ];
        assert_eq!(reservation_state(&entries, "w1"), Some(EntryStatus::Final));
        assert_eq!(reservation_state(&entries, "w2"), Some(EntryStatus::Pending));
        assert_eq!(reservation_state(&entries, "w3"), None);
    }

    #[test]
    fn test_committed_withdrawals_counts_each_reference_once() {
        let user = UserId::new();
        let history = vec![
            withdraw(user, 100, EntryStatus::Pending, "w1"),
            withdraw(user, 100, EntryStatus::Final, "w1"),
            withdraw(user, 50, EntryStatus::Pending, "w2"),
            withdraw(user, 70, EntryStatus::Pending, "w3"),
            withdraw(user, 70, EntryStatus::Reverted, "w3"),
        ];
        let since = Utc::now() - Duration::hours(24);
        let (total, count) = committed_withdrawals_since(&history, since);
        assert_eq!(total, Amount::from(150u64));
        assert_eq!(count, 2);
    }

    #[test]
    fn test_committed_withdrawals_respects_window() {
        let user = UserId::new();
        let mut old = withdraw(user, 4000, EntryStatus::Final, "old");
        old.created_at = Utc::now() - Duration::hours(30);
        let recent = withdraw(user, 300, EntryStatus::Final, "recent");
        let since = Utc::now() - Duration::hours(24);
        let (total, count) = committed_withdrawals_since(&[old, recent], since);
        assert_eq!(total, Amount::from(300u64));
        assert_eq!(count, 1);
    }
}
