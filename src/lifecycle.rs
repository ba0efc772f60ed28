//! Withdrawal status machine.
//!
//! PENDING -> PAID and PENDING -> FAILED are the only legal moves. Both
//! targets are terminal. Re-applying the current terminal state is a no-op
//! so duplicate confirmations are harmless.

use crate::models::WithdrawalStatus;

#[derive(Debug, Clone, Copy)]
pub enum Event {
    PayoutConfirmed,
    PayoutFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid withdrawal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

pub fn target(event: Event) -> WithdrawalStatus {
    match event {
        Event::PayoutConfirmed => WithdrawalStatus::Paid,
        Event::PayoutFailed => WithdrawalStatus::Failed,
    }
}

pub fn apply_event(
    current: WithdrawalStatus,
    event: Event,
) -> Result<WithdrawalStatus, TransitionError> {
    let next = target(event);
    match (current, next) {
        (from, _) if !from.is_terminal() => Ok(next),
        (from, to) if from == to => Ok(from),
        (from, to) => Err(TransitionError {
            from: from.as_str(),
            to: to.as_str(),
        }),
    }
}
