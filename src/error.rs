/// Reasons a withdrawal request is refused or fails.
///
/// Every variant carries the message shown to the requesting user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("{0}")]
    InsufficientBalance(String),
    #[error("{0}")]
    TermsNotAgreed(String),
    #[error("{0}")]
    RateLimited(String),
    #[error("{0}")]
    InvalidFeeConfiguration(String),
    #[error("{0}")]
    InvalidWithdrawalAmount(String),
    #[error("{0}")]
    WithdrawalsDisabled(String),
    #[error("payout transfer failed: {0}")]
    PayoutTransferFailed(String),
    #[error("{0}")]
    UnknownFailure(String),
}

impl GateError {
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::InsufficientBalance(_) => "insufficient_balance",
            GateError::TermsNotAgreed(_) => "terms_not_agreed",
            GateError::RateLimited(_) => "rate_limited",
            GateError::InvalidFeeConfiguration(_) => "invalid_fee_configuration",
            GateError::InvalidWithdrawalAmount(_) => "invalid_withdrawal_amount",
            GateError::WithdrawalsDisabled(_) => "withdrawals_disabled",
            GateError::PayoutTransferFailed(_) => "payout_transfer_failed",
            GateError::UnknownFailure(_) => "unknown_failure",
        }
    }

    /// Rejected before any record was written.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            GateError::PayoutTransferFailed(_) | GateError::UnknownFailure(_)
        )
    }

    /// All gate failures are client errors; none of them is fatal.
    pub fn status_code(&self) -> u16 {
        400
    }
}

impl From<anyhow::Error> for GateError {
    fn from(err: anyhow::Error) -> Self {
        GateError::UnknownFailure(err.to_string())
    }
}
