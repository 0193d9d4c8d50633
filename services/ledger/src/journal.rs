//! Durable journal for ledger entries and custody records
//!
//! Append-only, CRC32C-checksummed, length-prefixed frames with bincode
//! payloads. Files rotate at `max_file_size`. Opening a journal replays every
//! intact frame; a torn tail in the newest file (crash mid-write) is cut off
//! so new frames append after the last good one.
//!
//! # Binary Format (per frame)
//! ```text
//! [body_len: u32]
//! [sequence: u64]
//! [recorded_at_ms: i64]
//! [kind: u8]
//! [payload_len: u32][payload: bincode(JournalRecord)]
//! [checksum: u32]  // CRC32C over sequence+recorded_at+kind+payload
//! ```
//! Integers are little-endian.

use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use types::address::Address;
use types::ledger::LedgerEntry;
use types::merkle::Digest;
use types::proof::ProofBatchRecord;
use types::risk::{BlacklistEntry, RiskConfig};
use types::withdrawal::WithdrawRequest;

/// Minimum body: seq 8 + ts 8 + kind 1 + payload_len 4 + crc 4
const MIN_BODY_LEN: usize = 25;
/// Upper bound on a single frame body; anything larger is corruption
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted frame in {file} at byte {offset}: {detail}")]
    Corrupted {
        file: String,
        offset: u64,
        detail: String,
    },
}

impl From<bincode::Error> for JournalError {
    fn from(err: bincode::Error) -> Self {
        JournalError::Serialization(err.to_string())
    }
}

// ── Records ─────────────────────────────────────────────────────────

/// Everything the custody core persists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalRecord {
    Ledger(LedgerEntry),
    Withdraw(WithdrawRequest),
    RiskConfig(RiskConfig),
    BlacklistAdd(BlacklistEntry),
    BlacklistRemove(Address),
    ProofBatch(ProofBatchRecord),
    /// Staged record, by root, that never reached the registry
    ProofBatchDiscard(Digest),
}

impl JournalRecord {
    pub fn kind(&self) -> u8 {
        match self {
            JournalRecord::Ledger(_) => 1,
            JournalRecord::Withdraw(_) => 2,
            JournalRecord::RiskConfig(_) => 3,
            JournalRecord::BlacklistAdd(_) => 4,
            JournalRecord::BlacklistRemove(_) => 5,
            JournalRecord::ProofBatch(_) => 6,
            JournalRecord::ProofBatchDiscard(_) => 7,
        }
    }
}

// ── Frame ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct Frame {
    sequence: u64,
    recorded_at: i64,
    kind: u8,
    payload: Vec<u8>,
    checksum: u32,
}

impl Frame {
    fn new(sequence: u64, recorded_at: i64, kind: u8, payload: Vec<u8>) -> Self {
        let checksum = Self::checksum_of(sequence, recorded_at, kind, &payload);
        Self {
            sequence,
            recorded_at,
            kind,
            payload,
            checksum,
        }
    }

    fn checksum_of(sequence: u64, recorded_at: i64, kind: u8, payload: &[u8]) -> u32 {
        let mut buf = Vec::with_capacity(17 + payload.len());
        buf.extend_from_slice(&sequence.to_le_bytes());
        buf.extend_from_slice(&recorded_at.to_le_bytes());
        buf.push(kind);
        buf.extend_from_slice(payload);
        crc32c(&buf)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let body_len = (MIN_BODY_LEN + self.payload.len()) as u32;
        let mut buf = Vec::with_capacity(4 + body_len as usize);
        buf.extend_from_slice(&body_len.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.recorded_at.to_le_bytes());
        buf.push(self.kind);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Decode one frame. Returns `(frame, bytes_consumed)`.
    fn from_bytes(data: &[u8]) -> Result<(Self, usize), String> {
        let body_len = read_u32(data, 0).ok_or("truncated length prefix")? as usize;
        if !(MIN_BODY_LEN..=MAX_BODY_LEN).contains(&body_len) {
            return Err(format!("implausible body length {}", body_len));
        }
        let total = 4 + body_len;
        if data.len() < total {
            return Err(format!("incomplete frame: need {} bytes, have {}", total, data.len()));
        }
        let body = &data[4..total];
        let sequence = read_u64(body, 0).ok_or("truncated sequence")?;
        let recorded_at = read_u64(body, 8).ok_or("truncated timestamp")? as i64;
        let kind = body[16];
        let payload_len = read_u32(body, 17).ok_or("truncated payload length")? as usize;
        if 21 + payload_len + 4 != body.len() {
            return Err(format!(
                "payload length {} disagrees with body length {}",
                payload_len, body_len
            ));
        }
        let payload = body[21..21 + payload_len].to_vec();
        let checksum = read_u32(body, 21 + payload_len).ok_or("truncated checksum")?;

        let frame = Self {
            sequence,
            recorded_at,
            kind,
            payload,
            checksum,
        };
        if Self::checksum_of(sequence, recorded_at, kind, &frame.payload) != checksum {
            return Err(format!("CRC32C mismatch for seq={}", sequence));
        }
        Ok((frame, total))
    }
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    data.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
}

// ── Configuration ───────────────────────────────────────────────────

/// Controls when `fsync` (durable write) is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsyncPolicy {
    /// Fsync after every append.
    EveryWrite,
    /// Fsync every N appends.
    EveryN(usize),
    /// Fsync only on file rotation and explicit `sync`.
    OnRotation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Directory for journal files.
    pub dir: PathBuf,
    /// Maximum file size in bytes before rotation (default 64 MiB).
    pub max_file_size: u64,
    pub fsync_policy: FsyncPolicy,
}

impl JournalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_file_size: 64 * 1024 * 1024,
            fsync_policy: FsyncPolicy::EveryWrite,
        }
    }
}

// ── Journal ─────────────────────────────────────────────────────────

pub struct Journal {
    config: JournalConfig,
    writer: BufWriter<File>,
    current_file: PathBuf,
    current_file_size: u64,
    file_index: u64,
    next_sequence: u64,
    writes_since_fsync: usize,
}

impl Journal {
    /// Open the journal directory, replaying every intact record in order.
    pub fn open(config: JournalConfig) -> Result<(Self, Vec<JournalRecord>), JournalError> {
        fs::create_dir_all(&config.dir)?;
        let files = Self::discover_files(&config.dir)?;

        let mut records = Vec::new();
        let mut next_sequence = 1u64;
        for (position, (_, path)) in files.iter().enumerate() {
            let is_newest = position + 1 == files.len();
            let data = fs::read(path)?;
            let mut pos = 0usize;
            while pos < data.len() {
                match Frame::from_bytes(&data[pos..]) {
                    Ok((frame, consumed)) => {
                        let record: JournalRecord = bincode::deserialize(&frame.payload)?;
                        records.push(record);
                        next_sequence = frame.sequence + 1;
                        pos += consumed;
                    }
                    Err(detail) if is_newest => {
                        warn!(
                            file = %path.display(),
                            offset = pos,
                            discarded = data.len() - pos,
                            detail = %detail,
                            "Truncating torn journal tail"
                        );
                        let file = OpenOptions::new().write(true).open(path)?;
                        file.set_len(pos as u64)?;
                        file.sync_all()?;
                        break;
                    }
                    Err(detail) => {
                        return Err(JournalError::Corrupted {
                            file: path.display().to_string(),
                            offset: pos as u64,
                            detail,
                        });
                    }
                }
            }
        }

        let file_index = files.last().map(|(index, _)| *index).unwrap_or(0);
        let current_file = Self::journal_path(&config.dir, file_index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&current_file)?;
        let current_file_size = file.metadata()?.len();

        debug!(
            dir = %config.dir.display(),
            records = records.len(),
            next_sequence,
            "Journal opened"
        );

        Ok((
            Self {
                config,
                writer: BufWriter::new(file),
                current_file,
                current_file_size,
                file_index,
                next_sequence,
                writes_since_fsync: 0,
            },
            records,
        ))
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn current_file_path(&self) -> &Path {
        &self.current_file
    }

    /// Append one record. Returns its sequence number once flushed.
    pub fn append(&mut self, record: &JournalRecord) -> Result<u64, JournalError> {
        if self.current_file_size >= self.config.max_file_size {
            self.rotate()?;
        }

        let payload = bincode::serialize(record)?;
        let sequence = self.next_sequence;
        let frame = Frame::new(
            sequence,
            chrono::Utc::now().timestamp_millis(),
            record.kind(),
            payload,
        );
        let bytes = frame.to_bytes();
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;

        self.current_file_size += bytes.len() as u64;
        self.next_sequence += 1;
        self.writes_since_fsync += 1;

        let should_fsync = match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => self.writes_since_fsync >= n,
            FsyncPolicy::OnRotation => false,
        };
        if should_fsync {
            self.writer.get_ref().sync_data()?;
            self.writes_since_fsync = 0;
        }
        Ok(sequence)
    }

    /// Force flush + fsync (used before shutdown).
    pub fn sync(&mut self) -> Result<(), JournalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.writes_since_fsync = 0;
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), JournalError> {
        self.sync()?;
        self.file_index += 1;
        self.current_file = Self::journal_path(&self.config.dir, self.file_index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.current_file)?;
        self.writer = BufWriter::new(file);
        self.current_file_size = 0;
        debug!(file = %self.current_file.display(), "Journal rotated");
        Ok(())
    }

    fn journal_path(dir: &Path, index: u64) -> PathBuf {
        dir.join(format!("journal-{:06}.bin", index))
    }

    fn discover_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>, JournalError> {
        let mut files: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_prefix("journal-")
                    .and_then(|rest| rest.strip_suffix(".bin"))
                    .and_then(|index| index.parse::<u64>().ok())
                    .map(|index| (index, e.path()))
            })
            .collect();
        files.sort_by_key(|(index, _)| *index);
        Ok(files)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
