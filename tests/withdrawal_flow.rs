//! End-to-end withdrawal flow against a file-backed store.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use hubledger::distributor::{credit_referral, distribute, Distribution};
use hubledger::config::Config;
use hubledger::error::GateError;
use hubledger::events::DomainEvent;
use hubledger::models::{User, Withdrawal, WithdrawalStatus};
use hubledger::notify::{dispatch, LogNotifier};
use hubledger::payout::{TokenTransferService, TransferReceipt, UnconfiguredTransfer};
use hubledger::report::LogReporter;
use hubledger::store::{BalanceStore, SqliteStore};
use hubledger::withdrawal::{GateConfig, WithdrawalGate, WithdrawalRequest};

struct AcceptAll;

#[async_trait]
impl TokenTransferService for AcceptAll {
    async fn transfer(&self, _w: &Withdrawal, _amount: i64) -> Result<TransferReceipt> {
        Ok(TransferReceipt { transaction_hash: Some("0xfeed".into()) })
    }
}

struct RejectAll;

#[async_trait]
impl TokenTransferService for RejectAll {
    async fn transfer(&self, w: &Withdrawal, _amount: i64) -> Result<TransferReceipt> {
        Err(anyhow!("rejected withdrawal {}", w.id))
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 2, 14, 9, 30, 0).unwrap()
}

fn gate_cfg() -> GateConfig {
    let mut cfg = Config::from_env();
    cfg.withdrawal_minimum = 100;
    cfg.transaction_fee = 100;
    cfg.withdrawal_cooldown_secs = 600;
    cfg.withdrawal_window_secs = 14 * 86_400;
    cfg.withdrawals_open_at = 1_598_918_400;
    cfg.payout_timeout_secs = 5;
    GateConfig::from_config(&cfg)
}

fn open_store(dir: &TempDir) -> SqliteStore {
    let path = dir.path().join("ledger.sqlite");
    let mut store = SqliteStore::new(path.to_str().unwrap()).unwrap();
    store.init().unwrap();
    store
}

fn seed(store: &mut SqliteStore, user: i64, balance: i64) {
    let mut u = User::new(user, now() - Duration::days(365));
    u.agreed_to_terms = true;
    store.upsert_user(&u).unwrap();
    distribute(store, Distribution::reward(balance), user, user, now() - Duration::days(30)).unwrap();
}

fn request(user: i64, amount: i64, to: &str) -> WithdrawalRequest {
    WithdrawalRequest {
        user_id: user,
        amount,
        to_address: to.into(),
        agreed_to_terms: false,
    }
}

#[tokio::test]
async fn withdrawal_nets_fee_and_reserves_balance() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    seed(&mut store, 1, 1000);

    let mut gate = WithdrawalGate::new(gate_cfg(), store, AcceptAll, LogReporter);
    let receipt = gate.request_withdrawal(&request(1, 500, "0xA1"), now()).await.unwrap();

    assert_eq!(receipt.withdrawal.status, WithdrawalStatus::Pending);
    assert_eq!(receipt.withdrawal.amount, 400);
    assert_eq!(receipt.entry.amount, -400);
    assert_eq!(gate.balance(1).unwrap(), 600);

    let events = gate.drain_events();
    assert_eq!(dispatch(&events, &LogNotifier, &LogReporter), events.len());
}

#[tokio::test]
async fn ledger_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let withdrawal_id = {
        let mut store = open_store(&dir);
        seed(&mut store, 1, 1000);
        let mut gate = WithdrawalGate::new(gate_cfg(), store, AcceptAll, LogReporter);
        let receipt = gate.request_withdrawal(&request(1, 500, "0xA1"), now()).await.unwrap();
        gate.confirm_payout(receipt.withdrawal.id).unwrap();
        receipt.withdrawal.id
    };

    let store = open_store(&dir);
    assert_eq!(store.balance(1).unwrap(), 600);
    let w = store.withdrawal(withdrawal_id).unwrap().unwrap();
    assert_eq!(w.status, WithdrawalStatus::Paid);
    assert_eq!(w.to_address, "0xA1");
}

#[tokio::test]
async fn failed_payout_restores_balance() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    seed(&mut store, 1, 1000);

    let mut gate = WithdrawalGate::new(gate_cfg(), store, RejectAll, LogReporter);
    let err = gate.request_withdrawal(&request(1, 500, "0xA1"), now()).await.unwrap_err();
    assert!(matches!(err, GateError::PayoutTransferFailed(_)));
    assert_eq!(err.status_code(), 400);
    assert_eq!(gate.balance(1).unwrap(), 1000);

    let events = gate.drain_events();
    assert!(matches!(events.first(), Some(DomainEvent::WithdrawalRequested { .. })));
    assert!(matches!(events.last(), Some(DomainEvent::WithdrawalFailed { .. })));
}

#[tokio::test]
async fn unconfigured_payouts_never_debit() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    seed(&mut store, 1, 1000);

    let mut gate = WithdrawalGate::new(gate_cfg(), store, UnconfiguredTransfer, LogReporter);
    let err = gate.request_withdrawal(&request(1, 500, "0xA1"), now()).await.unwrap_err();
    assert_eq!(err.kind(), "payout_transfer_failed");
    assert_eq!(gate.balance(1).unwrap(), 1000);
}

#[tokio::test]
async fn rejected_requests_leave_no_records() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    seed(&mut store, 1, 150);

    let mut gate = WithdrawalGate::new(gate_cfg(), store, AcceptAll, LogReporter);
    for amount in [50, 100, 151] {
        let err = gate.request_withdrawal(&request(1, amount, "0xA1"), now()).await.unwrap_err();
        assert!(err.is_validation(), "{:?}", err);
    }
    assert_eq!(gate.store().count_withdrawals(1).unwrap(), 0);
    assert_eq!(gate.balance(1).unwrap(), 150);
    assert!(gate.drain_events().is_empty());
}

#[tokio::test]
async fn shared_address_only_limits_its_own_user() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    seed(&mut store, 1, 1000);
    seed(&mut store, 2, 1000);

    let mut gate = WithdrawalGate::new(gate_cfg(), store, AcceptAll, LogReporter);
    gate.request_withdrawal(&request(1, 500, "0xAbCd"), now()).await.unwrap();

    // Same exchange deposit address, different case, different user.
    let receipt = gate
        .request_withdrawal(&request(2, 500, "0xabcd"), now() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(receipt.withdrawal.user_id, 2);

    let err = gate
        .request_withdrawal(&request(1, 500, "0xABCD"), now() + Duration::days(1))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GateError::RateLimited("The next time you're able to withdraw is in 13 days".into())
    );
}

#[tokio::test]
async fn open_transaction_blocks_a_second_connection() {
    let dir = TempDir::new().unwrap();
    let mut first = open_store(&dir);
    seed(&mut first, 1, 1000);
    let second = open_store(&dir);
    second.set_busy_timeout(std::time::Duration::from_millis(50)).unwrap();

    first.begin().unwrap();
    let mut gate = WithdrawalGate::new(gate_cfg(), second, AcceptAll, LogReporter);
    let err = gate.request_withdrawal(&request(1, 500, "0xA1"), now()).await.unwrap_err();
    assert!(matches!(err, GateError::UnknownFailure(_)), "{:?}", err);
    first.rollback().unwrap();
    assert_eq!(first.count_withdrawals(1).unwrap(), 0);

    // Once the lock is released the same gate can stage the withdrawal.
    gate.request_withdrawal(&request(1, 500, "0xA1"), now()).await.unwrap();
    assert_eq!(first.count_withdrawals(1).unwrap(), 1);
}

#[tokio::test]
async fn racing_requests_admit_exactly_one() {
    let dir = TempDir::new().unwrap();
    let mut seeded = open_store(&dir);
    seed(&mut seeded, 1, 2000);
    drop(seeded);

    let mut a = WithdrawalGate::new(gate_cfg(), open_store(&dir), AcceptAll, LogReporter);
    let mut b = WithdrawalGate::new(gate_cfg(), open_store(&dir), AcceptAll, LogReporter);
    let req_a = request(1, 500, "0xA1");
    let req_b = request(1, 500, "0xB2");
    let (ra, rb) = tokio::join!(
        a.request_withdrawal(&req_a, now()),
        b.request_withdrawal(&req_b, now()),
    );

    let outcomes = [ra.is_ok(), rb.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1, "{:?} {:?}", ra, rb);
    let rejected = if ra.is_ok() { rb.unwrap_err() } else { ra.unwrap_err() };
    assert!(matches!(rejected, GateError::RateLimited(_)), "{:?}", rejected);

    let store = open_store(&dir);
    assert_eq!(store.count_withdrawals(1).unwrap(), 1);
    assert_eq!(store.balance(1).unwrap(), 1600);
}

#[test]
fn referral_credits_both_users() {
    let dir = TempDir::new().unwrap();
    let mut store = open_store(&dir);
    let mut cfg = Config::from_env();
    cfg.referral_amount = 50;

    let credits = credit_referral(&mut store, &cfg, 10, 11, now()).unwrap();
    assert_eq!(credits.len(), 2);
    assert_eq!(store.balance(10).unwrap(), 50);
    assert_eq!(store.balance(11).unwrap(), 50);
}
