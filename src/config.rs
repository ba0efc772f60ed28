use chrono::{DateTime, TimeZone, Utc};

/// Mainnet token contract used when `WEB3_RSC_ADDRESS` is unset.
pub const DEFAULT_TOKEN_ADDRESS: &str = "0xD101dCC414F310268c37eEb4cD376CcFA507F571";

#[derive(Debug, Clone)]
pub struct Config {
    pub sqlite_path: String,
    /// Requested amount must be strictly greater than this.
    pub withdrawal_minimum: i64,
    pub transaction_fee: i64,
    pub withdrawal_cooldown_secs: i64,
    pub withdrawal_window_secs: i64,
    /// Unix seconds; requests before this instant are refused.
    pub withdrawals_open_at: i64,
    pub payout_base: String,
    pub payout_timeout_secs: u64,
    pub shared_secret: Option<String>,
    pub token_address: String,
    pub referral_amount: i64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./hubledger.sqlite".to_string()),
            withdrawal_minimum: std::env::var("WITHDRAWAL_MINIMUM").ok().and_then(|v| v.parse().ok()).unwrap_or(100),
            transaction_fee: std::env::var("TRANSACTION_FEE").ok().and_then(|v| v.parse().ok()).unwrap_or(100),
            withdrawal_cooldown_secs: std::env::var("WITHDRAWAL_COOLDOWN_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(600),
            withdrawal_window_secs: std::env::var("WITHDRAWAL_WINDOW_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(14 * 86_400),
            withdrawals_open_at: std::env::var("WITHDRAWALS_OPEN_AT").ok().and_then(|v| v.parse().ok()).unwrap_or(1_598_918_400),
            payout_base: std::env::var("ASYNC_SERVICE_HOST").unwrap_or_else(|_| "http://localhost:8080".to_string()),
            payout_timeout_secs: std::env::var("PAYOUT_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(10),
            shared_secret: std::env::var("WEB3_SHARED_SECRET").ok(),
            token_address: std::env::var("WEB3_RSC_ADDRESS").unwrap_or_else(|_| DEFAULT_TOKEN_ADDRESS.to_string()),
            referral_amount: std::env::var("REFERRAL_AMOUNT").ok().and_then(|v| v.parse().ok()).unwrap_or(50),
        }
    }

    pub fn withdrawals_open_from(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.withdrawals_open_at, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
