use serde::Serialize;

use crate::models::UserId;

/// Side effects produced by ledger operations.
///
/// Operations return these instead of triggering notifications themselves;
/// the caller hands them to [`crate::notify::dispatch`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    WithdrawalRequested {
        withdrawal_id: i64,
        user_id: UserId,
        amount: i64,
    },
    WithdrawalReserved {
        withdrawal_id: i64,
        user_id: UserId,
        entry_id: i64,
        amount: i64,
    },
    WithdrawalFailed {
        withdrawal_id: i64,
        user_id: UserId,
        reason: String,
    },
    WithdrawalPaid {
        withdrawal_id: i64,
        user_id: UserId,
    },
    BalanceCredited {
        user_id: UserId,
        entry_id: i64,
        amount: i64,
        kind: String,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::WithdrawalRequested { .. } => "withdrawal_requested",
            DomainEvent::WithdrawalReserved { .. } => "withdrawal_reserved",
            DomainEvent::WithdrawalFailed { .. } => "withdrawal_failed",
            DomainEvent::WithdrawalPaid { .. } => "withdrawal_paid",
            DomainEvent::BalanceCredited { .. } => "balance_credited",
        }
    }

    pub fn user_id(&self) -> UserId {
        match self {
            DomainEvent::WithdrawalRequested { user_id, .. }
            | DomainEvent::WithdrawalReserved { user_id, .. }
            | DomainEvent::WithdrawalFailed { user_id, .. }
            | DomainEvent::WithdrawalPaid { user_id, .. }
            | DomainEvent::BalanceCredited { user_id, .. } => *user_id,
        }
    }
}
