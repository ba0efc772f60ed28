//! Withdrawal gate: validates a payout request, books it against the
//! ledger and hands it to the token transfer service.
//!
//! Checks run in a fixed order and stop at the first rejection:
//!
//! | # | Check              | Rejection                  |
//! |---|--------------------|----------------------------|
//! | 0 | opening date       | `WithdrawalsDisabled`      |
//! | 1 | minimum / balance  | `InsufficientBalance`      |
//! | 2 | terms agreement    | `TermsNotAgreed`           |
//! | 3 | interval           | `RateLimited`              |
//! | 4 | address time limit | never (informational only) |
//! | 5 | fee netting        | `InvalidFeeConfiguration`, `InvalidWithdrawalAmount` |
//!
//! Checks and record creation share one store transaction. A rejection
//! rolls it back, so validation failures leave no trace. The transfer
//! itself runs after commit.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::config::Config;
use crate::error::GateError;
use crate::events::DomainEvent;
use crate::lifecycle::{apply_event, Event};
use crate::logging::{log, log_gate_check, log_payout, log_withdrawal_created, log_withdrawal_status, obj, v_str, Domain, Level};
use crate::models::{LedgerEntry, NewLedgerEntry, NewWithdrawal, SourceRef, UserId, Withdrawal, WithdrawalStatus};
use crate::payout::TokenTransferService;
use crate::report::{ErrorReport, ErrorReporter};
use crate::store::BalanceStore;

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub minimum: i64,
    pub transaction_fee: i64,
    pub cooldown: Duration,
    pub window: Duration,
    pub open_from: DateTime<Utc>,
    pub token_address: String,
    pub payout_timeout: std::time::Duration,
}

impl GateConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            minimum: cfg.withdrawal_minimum,
            transaction_fee: cfg.transaction_fee,
            cooldown: Duration::seconds(cfg.withdrawal_cooldown_secs),
            window: Duration::seconds(cfg.withdrawal_window_secs),
            open_from: cfg.withdrawals_open_from(),
            token_address: cfg.token_address.clone(),
            payout_timeout: std::time::Duration::from_secs(cfg.payout_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawalRequest {
    pub user_id: UserId,
    /// Gross amount; the fee is taken out of it.
    pub amount: i64,
    pub to_address: String,
    pub agreed_to_terms: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawalReceipt {
    pub withdrawal: Withdrawal,
    /// The reserved ledger entry (amount is minus the net payout).
    pub entry: LedgerEntry,
}

pub struct WithdrawalGate<S, T, R> {
    cfg: GateConfig,
    store: S,
    transfer: T,
    reporter: R,
    outbox: Vec<DomainEvent>,
}

impl<S, T, R> WithdrawalGate<S, T, R>
where
    S: BalanceStore,
    T: TokenTransferService + Sync,
    R: ErrorReporter,
{
    pub fn new(cfg: GateConfig, store: S, transfer: T, reporter: R) -> Self {
        Self {
            cfg,
            store,
            transfer,
            reporter,
            outbox: Vec::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn transaction_fee(&self) -> i64 {
        self.cfg.transaction_fee
    }

    pub fn balance(&self, user: UserId) -> Result<i64, GateError> {
        Ok(self.store.balance(user)?)
    }

    /// Events produced since the last drain, oldest first.
    pub fn drain_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.outbox)
    }

    pub async fn request_withdrawal(
        &mut self,
        req: &WithdrawalRequest,
        now: DateTime<Utc>,
    ) -> Result<WithdrawalReceipt, GateError> {
        self.store.begin()?;
        let staged = match self.validate_and_stage(req, now) {
            Ok(staged) => staged,
            Err(err) => {
                self.rollback(req.user_id);
                return Err(err);
            }
        };
        if let Err(err) = self.store.commit() {
            self.rollback(req.user_id);
            return Err(err.into());
        }

        let (withdrawal, placeholder, net_amount) = staged;
        log_withdrawal_created(withdrawal.id, withdrawal.user_id, net_amount, &withdrawal.to_address);
        self.outbox.push(DomainEvent::WithdrawalRequested {
            withdrawal_id: withdrawal.id,
            user_id: withdrawal.user_id,
            amount: net_amount,
        });

        self.pay(withdrawal, placeholder, net_amount).await
    }

    /// Promotes a PENDING withdrawal to PAID once the chain transfer settles.
    pub fn confirm_payout(&mut self, withdrawal_id: i64) -> Result<Withdrawal, GateError> {
        self.transition(withdrawal_id, Event::PayoutConfirmed, None)
    }

    /// Marks a PENDING withdrawal FAILED; its ledger entry stops counting.
    pub fn fail_payout(&mut self, withdrawal_id: i64, reason: &str) -> Result<Withdrawal, GateError> {
        self.transition(withdrawal_id, Event::PayoutFailed, Some(reason))
    }

    fn rollback(&mut self, user: UserId) {
        if let Err(rb) = self.store.rollback() {
            log(
                Level::Error,
                Domain::Withdrawal,
                "rollback_failed",
                obj(&[("user_id", json!(user)), ("error", v_str(&rb.to_string()))]),
            );
        }
    }

    // ---------------------------------------------------------------------
    // Validation chain
    // ---------------------------------------------------------------------

    fn validate_and_stage(
        &mut self,
        req: &WithdrawalRequest,
        now: DateTime<Utc>,
    ) -> Result<(Withdrawal, LedgerEntry, i64), GateError> {
        let user = req.user_id;
        gate(user, "opening_date", self.check_open(now))?;
        gate(user, "minimum", self.check_meets_minimum(req.amount))?;
        gate(user, "balance", self.check_balance(user, req.amount))?;
        gate(user, "terms", self.check_agreed_to_terms(user, req.agreed_to_terms))?;
        gate(user, "interval", self.check_interval(user, &req.to_address, now))?;
        gate(user, "address_time_limit", self.check_time_limit(user, &req.to_address, now))?;
        let net_amount = match self.check_amount(req.amount) {
            Ok(net) => {
                log_gate_check(user, "fee", true, None);
                net
            }
            Err(err) => {
                log_gate_check(user, "fee", false, Some(&err.to_string()));
                return Err(err);
            }
        };

        let withdrawal = self.store.insert_withdrawal(&NewWithdrawal {
            user_id: user,
            token_address: self.cfg.token_address.clone(),
            to_address: req.to_address.clone(),
            amount: net_amount,
            created_at: now,
        })?;
        let placeholder = self.store.append_entry(&NewLedgerEntry {
            user_id: user,
            amount: 0,
            source: SourceRef::Withdrawal(withdrawal.id),
            created_at: now,
        })?;
        Ok((withdrawal, placeholder, net_amount))
    }

    fn check_open(&self, now: DateTime<Utc>) -> Result<(), GateError> {
        if now < self.cfg.open_from {
            return Err(GateError::WithdrawalsDisabled(format!(
                "Withdrawals are disabled until {}",
                self.cfg.open_from.format("%B %-d, %Y")
            )));
        }
        Ok(())
    }

    fn check_meets_minimum(&self, amount: i64) -> Result<(), GateError> {
        if amount > self.cfg.minimum {
            return Ok(());
        }
        let message = if amount > 0 {
            format!(
                "Balance {} is below the withdrawal minimum of {}",
                amount, self.cfg.minimum
            )
        } else {
            format!("Insufficient balance of {}", amount)
        };
        Err(GateError::InsufficientBalance(message))
    }

    fn check_balance(&self, user: UserId, amount: i64) -> Result<(), GateError> {
        let balance = self.store.balance(user)?;
        if amount > balance {
            return Err(GateError::InsufficientBalance(format!(
                "Insufficient balance of {}",
                balance
            )));
        }
        Ok(())
    }

    fn check_agreed_to_terms(&mut self, user: UserId, agreed_in_request: bool) -> Result<(), GateError> {
        let record = self
            .store
            .user(user)?
            .ok_or_else(|| GateError::UnknownFailure(format!("user {} not found", user)))?;
        if record.agreed_to_terms {
            return Ok(());
        }
        if !agreed_in_request {
            return Err(GateError::TermsNotAgreed("User has not agreed to terms".to_string()));
        }
        self.store.set_agreed_to_terms(user)?;
        Ok(())
    }

    /// Only applies once the user, or the destination address, has history.
    /// Address history never rejects on its own: both limits measure the
    /// user's own requests. Any prior request starts the short cooldown;
    /// PAID/PENDING history starts the long window.
    fn check_interval(&self, user: UserId, to_address: &str, now: DateTime<Utc>) -> Result<(), GateError> {
        let address_used = self
            .store
            .last_withdrawal_to_address(to_address, &WithdrawalStatus::ACTIVE)?
            .is_some();
        if self.store.count_withdrawals(user)? == 0 && !address_used {
            return Ok(());
        }

        let cooldown_cutoff = now - self.cfg.cooldown;
        if let Some(last) = self.store.last_withdrawal_for_user(user, &[])? {
            if last.created_at >= cooldown_cutoff {
                let wait = last.created_at - cooldown_cutoff;
                let minutes = (wait.num_seconds() as f64 / 60.0).round() as i64;
                return Err(GateError::RateLimited(format!(
                    "The next time you're able to withdraw is in {} minutes",
                    minutes
                )));
            }
        }

        let window_cutoff = now - self.cfg.window;
        let blocking = self
            .store
            .last_withdrawal_for_user(user, &WithdrawalStatus::ACTIVE)?
            .filter(|w| w.created_at >= window_cutoff);
        if let Some(last) = blocking {
            let wait = last.created_at - window_cutoff;
            let days = (wait.num_seconds() + 86_399) / 86_400;
            return Err(GateError::RateLimited(format!(
                "The next time you're able to withdraw is in {} days",
                days
            )));
        }
        Ok(())
    }

    /// Address/account age limit. Disabled: it measures and logs the gaps
    /// but always passes. Re-enabling needs a product decision.
    fn check_time_limit(&self, user: UserId, to_address: &str, now: DateTime<Utc>) -> Result<(), GateError> {
        let account_age = self
            .store
            .user(user)?
            .map(|u| now - u.created_at)
            .unwrap_or_else(Duration::zero);
        let since_address = self
            .store
            .last_withdrawal_to_address(to_address, &WithdrawalStatus::ACTIVE)?
            .map(|w| now - w.created_at)
            .unwrap_or(account_age);
        let since_user = self
            .store
            .last_withdrawal_for_user(user, &WithdrawalStatus::ACTIVE)?
            .map(|w| now - w.created_at)
            .unwrap_or(account_age);
        log(
            Level::Debug,
            Domain::Withdrawal,
            "time_limit_observed",
            obj(&[
                ("user_id", json!(user)),
                ("account_age_secs", json!(account_age.num_seconds())),
                ("since_address_secs", json!(since_address.num_seconds())),
                ("since_user_secs", json!(since_user.num_seconds())),
            ]),
        );
        Ok(())
    }

    fn check_amount(&self, amount: i64) -> Result<i64, GateError> {
        let fee = self.cfg.transaction_fee;
        if fee <= 0 {
            return Err(GateError::InvalidFeeConfiguration(
                "Transaction fee can't be zero".to_string(),
            ));
        }
        let net_amount = amount - fee;
        if net_amount < 0 {
            return Err(GateError::InvalidWithdrawalAmount("Invalid withdrawal".to_string()));
        }
        Ok(net_amount)
    }

    // ---------------------------------------------------------------------
    // Payout
    // ---------------------------------------------------------------------

    async fn pay(
        &mut self,
        withdrawal: Withdrawal,
        placeholder: LedgerEntry,
        net_amount: i64,
    ) -> Result<WithdrawalReceipt, GateError> {
        let outcome = match tokio::time::timeout(
            self.cfg.payout_timeout,
            self.transfer.transfer(&withdrawal, net_amount),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "token transfer timed out after {}s",
                self.cfg.payout_timeout.as_secs()
            )),
        };

        match outcome {
            Ok(_) => {
                let entry = match self.store.reserve_entry(placeholder.id, -net_amount) {
                    Ok(entry) => entry,
                    Err(err) => {
                        self.reporter.report(
                            &ErrorReport::new("reservation_failed", err.to_string())
                                .with("withdrawal_id", json!(withdrawal.id))
                                .with("entry_id", json!(placeholder.id))
                                .with("amount", json!(net_amount)),
                        );
                        return Err(GateError::UnknownFailure(err.to_string()));
                    }
                };
                self.outbox.push(DomainEvent::WithdrawalReserved {
                    withdrawal_id: withdrawal.id,
                    user_id: withdrawal.user_id,
                    entry_id: entry.id,
                    amount: entry.amount,
                });
                Ok(WithdrawalReceipt { withdrawal, entry })
            }
            Err(err) => {
                log_payout(withdrawal.id, net_amount, "failed", None);
                let reason = err.to_string();
                if let Err(mark_err) = self.mark_failed(&withdrawal, &reason) {
                    self.reporter.report(
                        &ErrorReport::new("mark_failed_failed", mark_err.to_string())
                            .with("withdrawal_id", json!(withdrawal.id)),
                    );
                }
                self.reporter.report(
                    &ErrorReport::new(
                        "payout_transfer_failed",
                        format!("Failed to pay withdrawal {}", withdrawal.id),
                    )
                    .with("withdrawal_id", json!(withdrawal.id))
                    .with("user_id", json!(withdrawal.user_id))
                    .with("amount", json!(net_amount))
                    .with("error", v_str(&reason)),
                );
                Err(GateError::PayoutTransferFailed(reason))
            }
        }
    }

    fn mark_failed(&mut self, withdrawal: &Withdrawal, reason: &str) -> Result<(), GateError> {
        self.apply(withdrawal, Event::PayoutFailed, Some(reason)).map(|_| ())
    }

    fn transition(
        &mut self,
        withdrawal_id: i64,
        event: Event,
        reason: Option<&str>,
    ) -> Result<Withdrawal, GateError> {
        let withdrawal = self.store.withdrawal(withdrawal_id)?.ok_or_else(|| {
            GateError::UnknownFailure(format!("withdrawal {} not found", withdrawal_id))
        })?;
        self.apply(&withdrawal, event, reason)
    }

    fn apply(
        &mut self,
        withdrawal: &Withdrawal,
        event: Event,
        reason: Option<&str>,
    ) -> Result<Withdrawal, GateError> {
        let next = apply_event(withdrawal.status, event)
            .map_err(|e| GateError::UnknownFailure(e.to_string()))?;
        if next == withdrawal.status {
            return Ok(withdrawal.clone());
        }
        self.store.set_withdrawal_status(withdrawal.id, next)?;
        log_withdrawal_status(withdrawal.id, withdrawal.status.as_str(), next.as_str());

        self.outbox.push(match next {
            WithdrawalStatus::Paid => DomainEvent::WithdrawalPaid {
                withdrawal_id: withdrawal.id,
                user_id: withdrawal.user_id,
            },
            _ => DomainEvent::WithdrawalFailed {
                withdrawal_id: withdrawal.id,
                user_id: withdrawal.user_id,
                reason: reason.unwrap_or("payout failed").to_string(),
            },
        });
        Ok(Withdrawal { status: next, ..withdrawal.clone() })
    }
}

fn gate(user: UserId, check: &str, result: Result<(), GateError>) -> Result<(), GateError> {
    match &result {
        Ok(()) => log_gate_check(user, check, true, None),
        Err(err) => log_gate_check(user, check, false, Some(&err.to_string())),
    }
    result
}
