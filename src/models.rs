use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub agreed_to_terms: bool,
    pub created_at: DateTime<Utc>,
    pub invited_by: Option<UserId>,
}

impl User {
    pub fn new(id: UserId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            agreed_to_terms: false,
            created_at,
            invited_by: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WithdrawalStatus {
    Pending,
    Paid,
    Failed,
}

impl WithdrawalStatus {
    /// Statuses that count toward withdrawal history limits.
    pub const ACTIVE: [WithdrawalStatus; 2] = [WithdrawalStatus::Paid, WithdrawalStatus::Pending];

    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "PENDING",
            WithdrawalStatus::Paid => "PAID",
            WithdrawalStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(WithdrawalStatus::Pending),
            "PAID" => Some(WithdrawalStatus::Paid),
            "FAILED" => Some(WithdrawalStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WithdrawalStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: i64,
    pub user_id: UserId,
    pub token_address: String,
    pub to_address: String,
    /// Net amount after the transaction fee.
    pub amount: i64,
    pub status: WithdrawalStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub user_id: UserId,
    pub token_address: String,
    pub to_address: String,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum SourceRef {
    Withdrawal(i64),
    Distribution(i64),
}

impl SourceRef {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceRef::Withdrawal(_) => "withdrawal",
            SourceRef::Distribution(_) => "distribution",
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            SourceRef::Withdrawal(id) | SourceRef::Distribution(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: i64) -> Option<Self> {
        match kind {
            "withdrawal" => Some(SourceRef::Withdrawal(id)),
            "distribution" => Some(SourceRef::Distribution(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: UserId,
    pub amount: i64,
    pub source: SourceRef,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub user_id: UserId,
    pub amount: i64,
    pub source: SourceRef,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: i64,
    pub user_id: UserId,
    pub amount: i64,
    pub from_address: String,
    pub transaction_hash: String,
    pub credited: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_roundtrip() {
        for s in [WithdrawalStatus::Pending, WithdrawalStatus::Paid, WithdrawalStatus::Failed] {
            assert_eq!(WithdrawalStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(WithdrawalStatus::parse("paid"), None);
    }

    #[test]
    fn test_source_ref_parts() {
        let src = SourceRef::Withdrawal(9);
        assert_eq!(SourceRef::from_parts(src.kind(), src.id()), Some(src));
        assert_eq!(SourceRef::from_parts("purchase", 1), None);
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&WithdrawalStatus::Failed).unwrap();
        assert_eq!(json, "\"FAILED\"");
    }
}
