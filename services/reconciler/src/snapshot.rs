//! Leaf construction for proof batches
//!
//! Each batch type has its own leaf layout and ordering:
//! - Transactions: every ledger entry created in the window, by entry id
//! - Liabilities: final balance per (user, asset, chain) at the window end
//! - Reserves: aggregate final balance per (asset, chain) at the window end,
//!   then the custody wallet's on-chain balance
//!
//! Snapshot leaves are fixed-layout bytes: version, tag, key fields,
//! sign byte, 32-byte big-endian magnitude, snapshot time.

use chrono::{DateTime, Utc};
use ledger::LedgerRecorder;
use num_bigint::{BigInt, Sign};
use types::address::Address;
use types::errors::ValidationError;
use types::ids::{AssetId, ChainId, UserId};
use types::ledger::LedgerEntry;
use types::numeric::Amount;

pub const SNAPSHOT_VERSION: u8 = 1;

const TAG_LIABILITY: u8 = b'L';
const TAG_RESERVE: u8 = b'R';
const TAG_CUSTODY: u8 = b'C';

/// Canonical bytes of every entry created in `[start, end)`.
pub fn transaction_leaves(
    ledger: &LedgerRecorder,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Vec<u8>>, ValidationError> {
    ledger
        .entries_between(start, end)
        .iter()
        .map(LedgerEntry::canonical_bytes)
        .collect()
}

/// One leaf per (user, asset, chain) with a non-zero balance at `as_of`.
pub fn liability_leaves(
    ledger: &LedgerRecorder,
    as_of: DateTime<Utc>,
) -> Result<Vec<Vec<u8>>, ValidationError> {
    ledger
        .balances_at(as_of)
        .into_iter()
        .filter(|(_, balance)| balance.sign() != Sign::NoSign)
        .map(|((user, asset, chain), balance)| liability_bytes(user, &asset, chain, &balance, as_of))
        .collect()
}

/// One leaf per (asset, chain) with a non-zero total, then the custody leaf.
pub fn reserve_leaves(
    ledger: &LedgerRecorder,
    custody: Option<(Address, Amount)>,
    as_of: DateTime<Utc>,
) -> Result<Vec<Vec<u8>>, ValidationError> {
    let mut leaves = ledger
        .asset_totals_at(as_of)
        .into_iter()
        .filter(|(_, total)| total.sign() != Sign::NoSign)
        .map(|((asset, chain), total)| reserve_bytes(&asset, chain, &total, as_of))
        .collect::<Result<Vec<_>, _>>()?;
    if let Some((address, balance)) = custody {
        leaves.push(custody_bytes(address, &balance, as_of)?);
    }
    Ok(leaves)
}

pub fn liability_bytes(
    user: UserId,
    asset: &AssetId,
    chain: ChainId,
    balance: &BigInt,
    as_of: DateTime<Utc>,
) -> Result<Vec<u8>, ValidationError> {
    let mut buf = header(TAG_LIABILITY);
    buf.extend_from_slice(user.as_uuid().as_bytes());
    put_str(&mut buf, asset.as_str())?;
    buf.extend_from_slice(&chain.0.to_be_bytes());
    put_signed(&mut buf, balance)?;
    buf.extend_from_slice(&as_of.timestamp().to_be_bytes());
    Ok(buf)
}

pub fn reserve_bytes(
    asset: &AssetId,
    chain: ChainId,
    total: &BigInt,
    as_of: DateTime<Utc>,
) -> Result<Vec<u8>, ValidationError> {
    let mut buf = header(TAG_RESERVE);
    put_str(&mut buf, asset.as_str())?;
    buf.extend_from_slice(&chain.0.to_be_bytes());
    put_signed(&mut buf, total)?;
    buf.extend_from_slice(&as_of.timestamp().to_be_bytes());
    Ok(buf)
}

pub fn custody_bytes(
    address: Address,
    balance: &Amount,
    as_of: DateTime<Utc>,
) -> Result<Vec<u8>, ValidationError> {
    let mut buf = header(TAG_CUSTODY);
    buf.extend_from_slice(address.as_bytes());
    buf.extend_from_slice(&balance.to_be_bytes32()?);
    buf.extend_from_slice(&as_of.timestamp().to_be_bytes());
    Ok(buf)
}

fn header(tag: u8) -> Vec<u8> {
    vec![SNAPSHOT_VERSION, tag]
}

fn put_str(buf: &mut Vec<u8>, value: &str) -> Result<(), ValidationError> {
    let len = u16::try_from(value.len()).map_err(|_| ValidationError::InvalidAsset {
        value: value.to_string(),
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_signed(buf: &mut Vec<u8>, value: &BigInt) -> Result<(), ValidationError> {
    buf.push(u8::from(value.sign() == Sign::Minus));
    let magnitude = Amount::from_biguint(value.magnitude().clone());
    buf.extend_from_slice(&magnitude.to_be_bytes32()?);
    Ok(())
}
