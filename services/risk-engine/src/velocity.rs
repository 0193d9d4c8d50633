//! Velocity window arithmetic
//!
//! The window is anchored at the request's creation time rather than the
//! wall clock, so re-evaluating a stored request gives the same answer.

use chrono::{DateTime, Duration, Utc};
use types::ledger::{committed_withdrawals_since, LedgerEntry};
use types::numeric::Amount;
use types::withdrawal::WithdrawRequest;

/// Start of the trailing window for `request`.
pub fn window_start(request: &WithdrawRequest, window_secs: i64) -> DateTime<Utc> {
    request.created_at - Duration::seconds(window_secs.max(0))
}

/// Volume and count already committed inside the window, excluding `request`.
pub fn used_in_window(
    request: &WithdrawRequest,
    history: &[LedgerEntry],
    window_secs: i64,
) -> (Amount, u32) {
    let reference = request.reference();
    let prior: Vec<LedgerEntry> = history
        .iter()
        .filter(|e| e.reference_id != reference)
        .cloned()
        .collect();
    committed_withdrawals_since(&prior, window_start(request, window_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::address::Address;
    use types::ids::{AssetId, ChainId, UserId};
    use types::ledger::{Direction, EntryKind, EntryStatus};

    fn request(user: UserId, amount: u64) -> WithdrawRequest {
        WithdrawRequest::new(
            user,
            None,
            ChainId(1),
            AssetId::new("USDK"),
            Address::from_bytes([0x44; 20]),
            Amount::from(amount),
        )
    }

    fn debit(user: UserId, amount: u64, reference: &str, at: DateTime<Utc>) -> LedgerEntry {
        let mut entry = LedgerEntry::new(
            user,
            AssetId::new("USDK"),
            ChainId(1),
            Direction::Debit,
            Amount::from(amount),
            EntryKind::Withdraw,
            EntryStatus::Final,
            reference,
        );
        entry.created_at = at;
        entry
    }

    #[test]
    fn test_window_anchored_at_request() {
        let req = request(UserId::new(), 1);
        assert_eq!(window_start(&req, 3600), req.created_at - Duration::hours(1));
        assert_eq!(window_start(&req, -5), req.created_at);
    }

    #[test]
    fn test_used_excludes_own_reservation() {
        let user = UserId::new();
        let req = request(user, 50);
        let history = vec![
            debit(user, 200, "earlier", req.created_at - Duration::minutes(5)),
            debit(user, 50, &req.reference(), req.created_at),
        ];
        let (used, count) = used_in_window(&req, &history, 86_400);
        assert_eq!(used, Amount::from(200u64));
        assert_eq!(count, 1);
    }

    #[test]
    fn test_used_ignores_entries_before_window() {
        let user = UserId::new();
        let req = request(user, 50);
        let history = vec![debit(user, 900, "old", req.created_at - Duration::days(2))];
        let (used, count) = used_in_window(&req, &history, 86_400);
        assert_eq!(used, Amount::zero());
        assert_eq!(count, 0);
    }
}
