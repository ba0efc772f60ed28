//! Operator CLI for the ledger.
//!
//! Usage:
//!   hubledger init
//!   hubledger add-user <id> [invited_by]
//!   hubledger balance <user>
//!   hubledger reward <user> <amount>
//!   hubledger referral <referred> <referrer>
//!   hubledger deposit <user> <amount> <from_address> <tx_hash>
//!   hubledger confirm-deposit <deposit_id>
//!   hubledger withdraw <user> <amount> <address> [--agree]
//!   hubledger confirm <withdrawal_id>
//!   hubledger fee
//!   hubledger hot-score <items.json>

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde_json::json;

use hubledger::config::Config;
use hubledger::distributor::{confirm_deposit, credit_referral, distribute, record_deposit, Distribution};
use hubledger::events::DomainEvent;
use hubledger::hot_score::{rank, ContentItem};
use hubledger::logging::{log, obj, v_str, Domain, Level};
use hubledger::models::User;
use hubledger::notify::{dispatch, LogNotifier};
use hubledger::payout;
use hubledger::report::LogReporter;
use hubledger::store::{BalanceStore, SqliteStore};
use hubledger::withdrawal::{GateConfig, WithdrawalGate, WithdrawalRequest};

fn arg<T: std::str::FromStr>(args: &[String], idx: usize, name: &str) -> Result<T> {
    args.get(idx)
        .ok_or_else(|| anyhow!("missing <{}>", name))?
        .parse::<T>()
        .map_err(|_| anyhow!("invalid <{}>: {}", name, args[idx]))
}

fn deliver(events: &[DomainEvent]) {
    dispatch(events, &LogNotifier, &LogReporter);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str).unwrap_or("help");

    let mut store = SqliteStore::new(&cfg.sqlite_path)
        .with_context(|| format!("open {}", cfg.sqlite_path))?;
    store.init()?;
    log(
        Level::Info,
        Domain::System,
        "start",
        obj(&[("command", v_str(cmd)), ("sqlite_path", v_str(&cfg.sqlite_path))]),
    );

    match cmd {
        "init" => println!("{}", json!({"ok": true})),
        "add-user" => {
            let mut user = User::new(arg(&args, 1, "id")?, Utc::now());
            if args.len() > 2 {
                user.invited_by = Some(arg(&args, 2, "invited_by")?);
            }
            store.upsert_user(&user)?;
            println!("{}", serde_json::to_string(&user)?);
        }
        "balance" => {
            let user: i64 = arg(&args, 1, "user")?;
            println!("{}", json!({"user_id": user, "balance": store.balance(user)?}));
        }
        "reward" => {
            let user: i64 = arg(&args, 1, "user")?;
            let amount: i64 = arg(&args, 2, "amount")?;
            let credit = distribute(&mut store, Distribution::reward(amount), user, user, Utc::now())?;
            deliver(&credit.events);
            println!("{}", serde_json::to_string(&credit.entry)?);
        }
        "referral" => {
            let referred: i64 = arg(&args, 1, "referred")?;
            let referrer: i64 = arg(&args, 2, "referrer")?;
            for credit in credit_referral(&mut store, &cfg, referred, referrer, Utc::now())? {
                deliver(&credit.events);
                println!("{}", serde_json::to_string(&credit.entry)?);
            }
        }
        "deposit" => {
            let user: i64 = arg(&args, 1, "user")?;
            let amount: i64 = arg(&args, 2, "amount")?;
            let from: String = arg(&args, 3, "from_address")?;
            let tx_hash: String = arg(&args, 4, "tx_hash")?;
            let deposit = record_deposit(&mut store, user, amount, &from, &tx_hash, Utc::now())?;
            println!("{}", serde_json::to_string(&deposit)?);
        }
        "confirm-deposit" => {
            let id: i64 = arg(&args, 1, "deposit_id")?;
            let credit = confirm_deposit(&mut store, id, Utc::now())?;
            deliver(&credit.events);
            println!("{}", serde_json::to_string(&credit.entry)?);
        }
        "withdraw" | "confirm" | "fee" => {
            let transfer = payout::build(&cfg)?;
            let mut gate = WithdrawalGate::new(GateConfig::from_config(&cfg), store, transfer, LogReporter);
            let outcome = match cmd {
                "fee" => Ok(json!({"transaction_fee": gate.transaction_fee()})),
                "confirm" => {
                    let id: i64 = arg(&args, 1, "withdrawal_id")?;
                    gate.confirm_payout(id).map(|w| json!(w))
                }
                _ => {
                    let req = WithdrawalRequest {
                        user_id: arg(&args, 1, "user")?,
                        amount: arg(&args, 2, "amount")?,
                        to_address: arg(&args, 3, "address")?,
                        agreed_to_terms: args.iter().any(|a| a == "--agree"),
                    };
                    gate.request_withdrawal(&req, Utc::now())
                        .await
                        .map(|r| json!({"withdrawal": r.withdrawal, "entry": r.entry}))
                }
            };
            deliver(&gate.drain_events());
            match outcome {
                Ok(body) => println!("{}", body),
                Err(err) => {
                    println!(
                        "{}",
                        json!({"error": err.kind(), "message": err.to_string(), "status": err.status_code()})
                    );
                    std::process::exit(1);
                }
            }
        }
        "hot-score" => {
            let path: String = arg(&args, 1, "items.json")?;
            let raw = std::fs::read_to_string(&path).with_context(|| format!("read {}", path))?;
            let items: Vec<ContentItem> = serde_json::from_str(&raw)?;
            let ranked: Vec<_> = rank(&items, Utc::now())
                .into_iter()
                .map(|(id, score)| json!({"id": id, "hot_score": score}))
                .collect();
            println!("{}", serde_json::to_string_pretty(&ranked)?);
        }
        "help" | "--help" | "-h" => {
            println!("usage: hubledger <init|add-user|balance|reward|referral|deposit|confirm-deposit|withdraw|confirm|fee|hot-score> ...");
        }
        other => bail!("unknown command {}", other),
    }
    Ok(())
}
