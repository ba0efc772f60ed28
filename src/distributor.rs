//! Balance crediting for deposits, rewards and referrals.
//!
//! `distribute` does not deduplicate. Retrying the same
//! (kind, from, to, timestamp) credits twice; callers that retry must
//! dedupe themselves. Deposits are the exception: a deposit record can
//! only be credited once.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::events::DomainEvent;
use crate::logging::{log, log_distribution, obj, v_str, Domain, Level};
use crate::models::{Deposit, LedgerEntry, NewLedgerEntry, SourceRef, UserId};
use crate::store::BalanceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DistributionKind {
    Deposit,
    Reward,
    Referral,
}

impl DistributionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionKind::Deposit => "DEPOSIT",
            DistributionKind::Reward => "REWARD",
            DistributionKind::Referral => "REFERRAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Distribution {
    pub kind: DistributionKind,
    pub amount: i64,
}

impl Distribution {
    pub fn deposit(amount: i64) -> Self {
        Self { kind: DistributionKind::Deposit, amount }
    }

    pub fn reward(amount: i64) -> Self {
        Self { kind: DistributionKind::Reward, amount }
    }

    pub fn referral(cfg: &Config) -> Self {
        Self { kind: DistributionKind::Referral, amount: cfg.referral_amount }
    }
}

#[derive(Debug, Clone)]
pub struct Credit {
    pub entry: LedgerEntry,
    pub events: Vec<DomainEvent>,
}

/// Appends one entry crediting `to_user`.
pub fn distribute<S: BalanceStore + ?Sized>(
    store: &mut S,
    distribution: Distribution,
    from_user: UserId,
    to_user: UserId,
    timestamp: DateTime<Utc>,
) -> Result<Credit> {
    in_transaction(store, |store| credit(store, distribution, from_user, to_user, timestamp))
}

/// Credits both sides of a referral: the referred user and the referrer.
/// Either both entries land or neither does.
pub fn credit_referral<S: BalanceStore + ?Sized>(
    store: &mut S,
    cfg: &Config,
    referred: UserId,
    referrer: UserId,
    timestamp: DateTime<Utc>,
) -> Result<Vec<Credit>> {
    let referral = Distribution::referral(cfg);
    in_transaction(store, |store| {
        let referred_credit = credit(store, referral, referrer, referred, timestamp)?;
        let referrer_credit = credit(store, referral, referrer, referrer, timestamp)?;
        Ok(vec![referred_credit, referrer_credit])
    })
}

pub fn record_deposit<S: BalanceStore + ?Sized>(
    store: &mut S,
    user: UserId,
    amount: i64,
    from_address: &str,
    transaction_hash: &str,
    now: DateTime<Utc>,
) -> Result<Deposit> {
    if amount <= 0 {
        bail!("deposit amount must be positive, got {}", amount);
    }
    store.insert_deposit(user, amount, from_address, transaction_hash, now)
}

/// Credits a recorded deposit after the chain transfer is confirmed.
pub fn confirm_deposit<S: BalanceStore + ?Sized>(
    store: &mut S,
    deposit_id: i64,
    now: DateTime<Utc>,
) -> Result<Credit> {
    let deposit = store
        .deposit(deposit_id)?
        .ok_or_else(|| anyhow!("deposit {} not found", deposit_id))?;
    in_transaction(store, |store| {
        if !store.mark_deposit_credited(deposit.id)? {
            bail!("deposit {} was already credited", deposit.id);
        }
        credit(
            store,
            Distribution::deposit(deposit.amount),
            deposit.user_id,
            deposit.user_id,
            now,
        )
    })
}

fn credit<S: BalanceStore + ?Sized>(
    store: &mut S,
    distribution: Distribution,
    from_user: UserId,
    to_user: UserId,
    timestamp: DateTime<Utc>,
) -> Result<Credit> {
    if distribution.amount < 0 {
        bail!(
            "{} distribution amount must be non-negative, got {}",
            distribution.kind.as_str(),
            distribution.amount
        );
    }
    let kind = distribution.kind.as_str();
    let distribution_id =
        store.insert_distribution(kind, distribution.amount, from_user, to_user, timestamp)?;
    let entry = store.append_entry(&NewLedgerEntry {
        user_id: to_user,
        amount: distribution.amount,
        source: SourceRef::Distribution(distribution_id),
        created_at: timestamp,
    })?;
    log_distribution(kind, from_user, to_user, distribution.amount);

    let events = vec![DomainEvent::BalanceCredited {
        user_id: to_user,
        entry_id: entry.id,
        amount: entry.amount,
        kind: kind.to_string(),
    }];
    Ok(Credit { entry, events })
}

fn in_transaction<S, T, F>(store: &mut S, f: F) -> Result<T>
where
    S: BalanceStore + ?Sized,
    F: FnOnce(&mut S) -> Result<T>,
{
    store.begin()?;
    let result = f(&mut *store).and_then(|value| store.commit().map(|()| value));
    if let Err(err) = &result {
        if let Err(rb) = store.rollback() {
            log(
                Level::Error,
                Domain::Distribution,
                "rollback_failed",
                obj(&[("error", v_str(&rb.to_string())), ("cause", v_str(&err.to_string()))]),
            );
        }
    }
    result
}
