//! Structured logging for the ledger and ranking services.
//!
//! Every record is a single JSON line with a run id, a monotonically
//! increasing sequence number and a `data` object. Records always go to
//! stderr, keeping stdout for command output; when `LOG_DIR` is set they
//! are also appended to per-run files so a withdrawal can be audited after
//! the fact.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Ranking,      // Hot score computation
    Withdrawal,   // Gate checks, request lifecycle
    Ledger,       // Balance entries
    Payout,       // Token transfer calls
    Distribution, // Rewards, deposits, referrals
    Notify,       // Side-effect delivery
    System,       // Startup, shutdown
    Audit,        // Error reports
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Ranking => "ranking",
            Domain::Withdrawal => "withdrawal",
            Domain::Ledger => "ledger",
            Domain::Payout => "payout",
            Domain::Distribution => "distribution",
            Domain::Notify => "notify",
            Domain::System => "system",
            Domain::Audit => "audit",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS is a comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunFiles {
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    files: Option<RunFiles>,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let files = std::env::var("LOG_DIR").ok().and_then(|base| open_run_files(&base, &run_id));
        RunContext { run_id, files }
    })
}

fn open_run_files(base: &str, run_id: &str) -> Option<RunFiles> {
    let mut run_dir = PathBuf::from(base);
    run_dir.push(run_id);
    if let Err(err) = create_dir_all(&run_dir) {
        eprintln!("[log] failed to create run dir: {}", err);
        return None;
    }
    let events = File::create(run_dir.join("events.jsonl"))
        .map_err(|err| eprintln!("[log] failed to create events log: {}", err))
        .ok()?;
    let trace = File::create(run_dir.join("trace.jsonl"))
        .map_err(|err| eprintln!("[log] failed to create trace log: {}", err))
        .ok()?;
    Some(RunFiles {
        events: Mutex::new(BufWriter::new(events)),
        trace: Mutex::new(BufWriter::new(trace)),
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["authorization", "Authorization", "shared_secret", "signature"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["user_id", "withdrawal_id", "entry_id", "item_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if let Some(files) = &ctx.files {
        match level {
            Level::Trace | Level::Debug => write_line(&files.trace, &line),
            _ => write_line(&files.events, &line),
        }
    }
    eprintln!("{}", line);
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_gate_check(user_id: i64, check: &str, passed: bool, reason: Option<&str>) {
    log(
        if passed { Level::Debug } else { Level::Info },
        Domain::Withdrawal,
        "gate_check",
        obj(&[
            ("user_id", json!(user_id)),
            ("check", v_str(check)),
            ("result", v_str(if passed { "pass" } else { "reject" })),
            ("reason", reason.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_withdrawal_created(withdrawal_id: i64, user_id: i64, amount: i64, to_address: &str) {
    log(
        Level::Info,
        Domain::Withdrawal,
        "withdrawal_created",
        obj(&[
            ("withdrawal_id", json!(withdrawal_id)),
            ("user_id", json!(user_id)),
            ("amount", json!(amount)),
            ("to_address", v_str(to_address)),
        ]),
    );
}

pub fn log_withdrawal_status(withdrawal_id: i64, from: &str, to: &str) {
    log(
        Level::Info,
        Domain::Withdrawal,
        "withdrawal_status",
        obj(&[
            ("withdrawal_id", json!(withdrawal_id)),
            ("from", v_str(from)),
            ("to", v_str(to)),
        ]),
    );
}

pub fn log_ledger_entry(entry_id: i64, user_id: i64, amount: i64, source: &str) {
    log(
        Level::Info,
        Domain::Ledger,
        "entry",
        obj(&[
            ("entry_id", json!(entry_id)),
            ("user_id", json!(user_id)),
            ("amount", json!(amount)),
            ("source", v_str(source)),
        ]),
    );
}

pub fn log_payout(withdrawal_id: i64, amount: i64, outcome: &str, payload_hash: Option<&str>) {
    log(
        if outcome == "ok" { Level::Info } else { Level::Warn },
        Domain::Payout,
        "transfer",
        obj(&[
            ("withdrawal_id", json!(withdrawal_id)),
            ("amount", json!(amount)),
            ("outcome", v_str(outcome)),
            ("payload_hash", payload_hash.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_distribution(kind: &str, from_user: i64, to_user: i64, amount: i64) {
    log(
        Level::Info,
        Domain::Distribution,
        "distribute",
        obj(&[
            ("kind", v_str(kind)),
            ("from_user", json!(from_user)),
            ("user_id", json!(to_user)),
            ("amount", json!(amount)),
        ]),
    );
}

pub fn log_hot_score(item_id: i64, score: f64) {
    log(
        Level::Trace,
        Domain::Ranking,
        "hot_score",
        obj(&[("item_id", json!(item_id)), ("score", v_num(score))]),
    );
}

// =============================================================================
// Helpers
// =============================================================================

/// Short stable hash of a payload for correlating log lines with requests.
pub fn params_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

// =============================================================================
// Tests
// =============================================================================
