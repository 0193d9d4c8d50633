//! Custody ledger
//!
//! The append-only ledger of balance-affecting events, the durable journal
//! under it, and the repositories for withdrawal requests, risk
//! configuration, the blacklist and proof batch records.

pub mod journal;
pub mod recorder;
pub mod repository;
pub mod store;

pub use journal::{FsyncPolicy, JournalConfig, JournalError};
pub use recorder::{LedgerError, LedgerRecorder};
pub use repository::{
    BlacklistRepository, ProofBatchRepository, RepositoryError, RiskConfigRepository,
    WithdrawRepository,
};
pub use store::RecordStore;
