use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::logging::log_ledger_entry;
use crate::models::{
    Deposit, LedgerEntry, NewLedgerEntry, NewWithdrawal, SourceRef, User, UserId, Withdrawal,
    WithdrawalStatus,
};

/// Persistence seam for balances, withdrawals and their history.
///
/// Reads issued between `begin` and `commit` observe one consistent view
/// and no other writer can interleave.
pub trait BalanceStore {
    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;

    fn user(&self, id: UserId) -> Result<Option<User>>;
    fn upsert_user(&mut self, user: &User) -> Result<()>;
    fn set_agreed_to_terms(&mut self, id: UserId) -> Result<()>;

    fn withdrawal(&self, id: i64) -> Result<Option<Withdrawal>>;
    fn count_withdrawals(&self, user: UserId) -> Result<u64>;
    /// Most recent withdrawal by the user; an empty filter matches any status.
    fn last_withdrawal_for_user(
        &self,
        user: UserId,
        statuses: &[WithdrawalStatus],
    ) -> Result<Option<Withdrawal>>;
    /// Most recent withdrawal to the address, compared case-insensitively.
    fn last_withdrawal_to_address(
        &self,
        address: &str,
        statuses: &[WithdrawalStatus],
    ) -> Result<Option<Withdrawal>>;
    fn insert_withdrawal(&mut self, new: &NewWithdrawal) -> Result<Withdrawal>;
    fn set_withdrawal_status(&mut self, id: i64, status: WithdrawalStatus) -> Result<()>;

    fn append_entry(&mut self, new: &NewLedgerEntry) -> Result<LedgerEntry>;
    /// Sets a zero-amount withdrawal placeholder to its reserved amount.
    /// Fails for any other entry, so each placeholder is reserved at most once.
    fn reserve_entry(&mut self, id: i64, amount: i64) -> Result<LedgerEntry>;
    fn entries_for_user(&self, user: UserId) -> Result<Vec<LedgerEntry>>;
    /// Sum of the user's entries, skipping entries of FAILED withdrawals.
    fn balance(&self, user: UserId) -> Result<i64>;

    fn insert_distribution(
        &mut self,
        kind: &str,
        amount: i64,
        from_user: UserId,
        to_user: UserId,
        ts: DateTime<Utc>,
    ) -> Result<i64>;

    fn insert_deposit(
        &mut self,
        user: UserId,
        amount: i64,
        from_address: &str,
        transaction_hash: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Deposit>;
    fn deposit(&self, id: i64) -> Result<Option<Deposit>>;
    /// Returns false when the deposit was already credited.
    fn mark_deposit_credited(&mut self, id: i64) -> Result<bool>;
}

pub struct SqliteStore {
    conn: Connection,
}

const WITHDRAWAL_COLUMNS: &str = "id, user_id, token_address, to_address, amount, status, created_at";
const ENTRY_COLUMNS: &str = "id, user_id, amount, source_type, source_id, created_at";
const DEPOSIT_COLUMNS: &str = "id, user_id, amount, from_address, transaction_hash, credited, created_at";

fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn status_filter(statuses: &[WithdrawalStatus]) -> String {
    if statuses.is_empty() {
        return String::new();
    }
    let list: Vec<String> = statuses.iter().map(|s| format!("'{}'", s.as_str())).collect();
    format!(" AND status IN ({})", list.join(", "))
}

fn withdrawal_from_row(row: &Row<'_>) -> rusqlite::Result<Withdrawal> {
    let status: String = row.get(5)?;
    Ok(Withdrawal {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token_address: row.get(2)?,
        to_address: row.get(3)?,
        amount: row.get(4)?,
        status: WithdrawalStatus::parse(&status)
            .ok_or_else(|| rusqlite::Error::InvalidColumnType(5, "status".to_string(), Type::Text))?,
        created_at: from_ms(row.get(6)?),
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let source_type: String = row.get(3)?;
    let source_id: i64 = row.get(4)?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        source: SourceRef::from_parts(&source_type, source_id).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(3, "source_type".to_string(), Type::Text)
        })?,
        created_at: from_ms(row.get(5)?),
    })
}

fn deposit_from_row(row: &Row<'_>) -> rusqlite::Result<Deposit> {
    Ok(Deposit {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        from_address: row.get(3)?,
        transaction_hash: row.get(4)?,
        credited: row.get::<_, i64>(5)? != 0,
        created_at: from_ms(row.get(6)?),
    })
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    /// How long `begin` waits on another connection's write lock before
    /// failing as busy.
    pub fn set_busy_timeout(&self, timeout: std::time::Duration) -> Result<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                agreed_to_terms INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                invited_by INTEGER
            );
            CREATE TABLE IF NOT EXISTS withdrawals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                token_address TEXT NOT NULL,
                to_address TEXT NOT NULL,
                amount INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS withdrawals_user ON withdrawals (user_id);
            CREATE INDEX IF NOT EXISTS withdrawals_address ON withdrawals (lower(to_address));
            CREATE TABLE IF NOT EXISTS ledger_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                source_type TEXT NOT NULL,
                source_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS ledger_entries_user ON ledger_entries (user_id);
            CREATE TABLE IF NOT EXISTS distributions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                amount INTEGER NOT NULL,
                from_user INTEGER NOT NULL,
                to_user INTEGER NOT NULL,
                ts INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS deposits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                from_address TEXT NOT NULL,
                transaction_hash TEXT NOT NULL,
                credited INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    fn entry(&self, id: i64) -> Result<LedgerEntry> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM ledger_entries WHERE id = ?1", ENTRY_COLUMNS),
                params![id],
                entry_from_row,
            )
            .optional()?
            .ok_or_else(|| anyhow!("ledger entry {} not found", id))
    }
}

impl BalanceStore for SqliteStore {
    fn begin(&mut self) -> Result<()> {
        // IMMEDIATE takes the write lock up front so a concurrent request
        // cannot pass the same history checks before this one commits.
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT;")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK;")?;
        Ok(())
    }

    fn user(&self, id: UserId) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                "SELECT id, agreed_to_terms, created_at, invited_by FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        agreed_to_terms: row.get::<_, i64>(1)? != 0,
                        created_at: from_ms(row.get(2)?),
                        invited_by: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn upsert_user(&mut self, user: &User) -> Result<()> {
        self.conn.execute(
            "INSERT INTO users (id, agreed_to_terms, created_at, invited_by)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                agreed_to_terms = excluded.agreed_to_terms,
                invited_by = excluded.invited_by",
            params![
                user.id,
                user.agreed_to_terms as i64,
                to_ms(user.created_at),
                user.invited_by
            ],
        )?;
        Ok(())
    }

    fn set_agreed_to_terms(&mut self, id: UserId) -> Result<()> {
        let changed = self
            .conn
            .execute("UPDATE users SET agreed_to_terms = 1 WHERE id = ?1", params![id])?;
        if changed == 0 {
            bail!("user {} not found", id);
        }
        Ok(())
    }

    fn withdrawal(&self, id: i64) -> Result<Option<Withdrawal>> {
        let w = self
            .conn
            .query_row(
                &format!("SELECT {} FROM withdrawals WHERE id = ?1", WITHDRAWAL_COLUMNS),
                params![id],
                withdrawal_from_row,
            )
            .optional()?;
        Ok(w)
    }

    fn count_withdrawals(&self, user: UserId) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM withdrawals WHERE user_id = ?1",
            params![user],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    fn last_withdrawal_for_user(
        &self,
        user: UserId,
        statuses: &[WithdrawalStatus],
    ) -> Result<Option<Withdrawal>> {
        let sql = format!(
            "SELECT {} FROM withdrawals WHERE user_id = ?1{} ORDER BY id DESC LIMIT 1",
            WITHDRAWAL_COLUMNS,
            status_filter(statuses)
        );
        Ok(self.conn.query_row(&sql, params![user], withdrawal_from_row).optional()?)
    }

    fn last_withdrawal_to_address(
        &self,
        address: &str,
        statuses: &[WithdrawalStatus],
    ) -> Result<Option<Withdrawal>> {
        let sql = format!(
            "SELECT {} FROM withdrawals WHERE lower(to_address) = lower(?1){} ORDER BY id DESC LIMIT 1",
            WITHDRAWAL_COLUMNS,
            status_filter(statuses)
        );
        Ok(self.conn.query_row(&sql, params![address], withdrawal_from_row).optional()?)
    }

    fn insert_withdrawal(&mut self, new: &NewWithdrawal) -> Result<Withdrawal> {
        self.conn.execute(
            "INSERT INTO withdrawals (user_id, token_address, to_address, amount, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new.user_id,
                new.token_address,
                new.to_address,
                new.amount,
                WithdrawalStatus::Pending.as_str(),
                to_ms(new.created_at)
            ],
        )?;
        Ok(Withdrawal {
            id: self.conn.last_insert_rowid(),
            user_id: new.user_id,
            token_address: new.token_address.clone(),
            to_address: new.to_address.clone(),
            amount: new.amount,
            status: WithdrawalStatus::Pending,
            created_at: new.created_at,
        })
    }

    fn set_withdrawal_status(&mut self, id: i64, status: WithdrawalStatus) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE withdrawals SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        if changed == 0 {
            bail!("withdrawal {} not found", id);
        }
        Ok(())
    }

    fn append_entry(&mut self, new: &NewLedgerEntry) -> Result<LedgerEntry> {
        self.conn.execute(
            "INSERT INTO ledger_entries (user_id, amount, source_type, source_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new.user_id,
                new.amount,
                new.source.kind(),
                new.source.id(),
                to_ms(new.created_at)
            ],
        )?;
        let entry = LedgerEntry {
            id: self.conn.last_insert_rowid(),
            user_id: new.user_id,
            amount: new.amount,
            source: new.source,
            created_at: new.created_at,
        };
        log_ledger_entry(entry.id, entry.user_id, entry.amount, entry.source.kind());
        Ok(entry)
    }

    fn reserve_entry(&mut self, id: i64, amount: i64) -> Result<LedgerEntry> {
        let changed = self.conn.execute(
            "UPDATE ledger_entries SET amount = ?2
             WHERE id = ?1 AND amount = 0 AND source_type = 'withdrawal'",
            params![id, amount],
        )?;
        if changed != 1 {
            bail!("ledger entry {} is not an unreserved withdrawal placeholder", id);
        }
        let entry = self.entry(id)?;
        log_ledger_entry(entry.id, entry.user_id, entry.amount, "reservation");
        Ok(entry)
    }

    fn entries_for_user(&self, user: UserId) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM ledger_entries WHERE user_id = ?1 ORDER BY id",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user], entry_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn balance(&self, user: UserId) -> Result<i64> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(e.amount), 0) FROM ledger_entries e
             WHERE e.user_id = ?1
               AND NOT (e.source_type = 'withdrawal'
                        AND e.source_id IN (SELECT id FROM withdrawals WHERE status = 'FAILED'))",
            params![user],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    fn insert_distribution(
        &mut self,
        kind: &str,
        amount: i64,
        from_user: UserId,
        to_user: UserId,
        ts: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO distributions (kind, amount, from_user, to_user, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![kind, amount, from_user, to_user, to_ms(ts)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn insert_deposit(
        &mut self,
        user: UserId,
        amount: i64,
        from_address: &str,
        transaction_hash: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Deposit> {
        self.conn.execute(
            "INSERT INTO deposits (user_id, amount, from_address, transaction_hash, credited, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![user, amount, from_address, transaction_hash, to_ms(created_at)],
        )?;
        Ok(Deposit {
            id: self.conn.last_insert_rowid(),
            user_id: user,
            amount,
            from_address: from_address.to_string(),
            transaction_hash: transaction_hash.to_string(),
            credited: false,
            created_at,
        })
    }

    fn deposit(&self, id: i64) -> Result<Option<Deposit>> {
        let d = self
            .conn
            .query_row(
                &format!("SELECT {} FROM deposits WHERE id = ?1", DEPOSIT_COLUMNS),
                params![id],
                deposit_from_row,
            )
            .optional()?;
        Ok(d)
    }

    fn mark_deposit_credited(&mut self, id: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE deposits SET credited = 1 WHERE id = ?1 AND credited = 0",
            params![id],
        )?;
        Ok(changed == 1)
    }
}
