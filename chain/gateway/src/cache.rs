//! Short-TTL cache for side-effect-free chain reads
//!
//! Bounds the read rate against the RPC endpoint. Entries expire on read;
//! any custodial write clears the cache so a read never reflects pre-write
//! state for longer than one round trip.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use types::address::Address;
use types::ids::BatchId;
use types::numeric::Amount;
use types::proof::{BatchType, ProofBatch};

use crate::client::TokenInfo;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReadKey {
    Balance(Address),
    Blacklisted(Address),
    Paused,
    TokenInfo,
    Batch(BatchId),
    BatchCount,
    BatchCountByType(BatchType),
}

#[derive(Debug, Clone)]
pub enum ReadValue {
    Amount(Amount),
    Flag(bool),
    Count(u64),
    TokenInfo(TokenInfo),
    Batch(ProofBatch),
}

pub struct ReadCache {
    ttl: Duration,
    entries: DashMap<ReadKey, (ReadValue, Instant)>,
}

impl ReadCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Fresh value for `key`, if any. A zero TTL disables caching.
    pub fn get(&self, key: &ReadKey) -> Option<ReadValue> {
        if self.ttl.is_zero() {
            return None;
        }
        let fresh = self
            .entries
            .get(key)
            .filter(|entry| entry.1.elapsed() < self.ttl)
            .map(|entry| entry.0.clone());
        if fresh.is_none() {
            self.entries.remove(key);
        }
        fresh
    }

    pub fn insert(&self, key: ReadKey, value: ReadValue) {
        if !self.ttl.is_zero() {
            self.entries.insert(key, (value, Instant::now()));
        }
    }

    pub fn invalidate(&self, key: &ReadKey) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
