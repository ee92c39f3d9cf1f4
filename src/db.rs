use chrono::{DateTime, FixedOffset, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::StoreError;
use crate::models::{AccountSnapshot, Coin, MonthlyAggregateRecord, Rewards, Transaction, TxType};
use crate::period::day_window;

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS account_snapshots (
  id                  INTEGER PRIMARY KEY AUTOINCREMENT,
  address             TEXT NOT NULL,
  denom               TEXT NOT NULL,
  delegation          TEXT NOT NULL, -- Decimal stored as string
  delegations_rewards TEXT NOT NULL DEFAULT '[]', -- JSON list of rewards
  commission          TEXT NOT NULL DEFAULT '[]', -- JSON list of rewards
  sample_at           INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_account_snapshots_sample
  ON account_snapshots (sample_at, address);

CREATE TABLE IF NOT EXISTS txs (
  tx_hash      TEXT PRIMARY KEY,
  tx_type      TEXT NOT NULL,
  time         INTEGER NOT NULL,
  from_address TEXT NOT NULL DEFAULT '',
  to_address   TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_txs_time ON txs (time);

CREATE TABLE IF NOT EXISTS ex_static_delegator_month (
  id                              TEXT PRIMARY KEY,
  address                         TEXT NOT NULL,
  date                            TEXT NOT NULL,
  terminal_delegation_denom       TEXT NOT NULL,
  terminal_delegation_amount      TEXT NOT NULL,
  period_delegation_times         INTEGER NOT NULL,
  period_withdraw_rewards_iris    REAL NOT NULL,
  period_withdraw_rewards_atto    TEXT NOT NULL,
  increment_delegation_denom      TEXT NOT NULL,
  increment_delegation_amount     TEXT NOT NULL,
  period_increment_rewards_iris   REAL NOT NULL,
  period_increment_rewards_atto   TEXT NOT NULL,
  terminal_rewards_iris           REAL NOT NULL,
  terminal_rewards_atto           TEXT NOT NULL,
  period_withdraw_commission_iris REAL NOT NULL,
  period_withdraw_commission_atto TEXT NOT NULL,
  increment_commission_iris       REAL NOT NULL,
  increment_commission_atto       TEXT NOT NULL,
  create_at                       INTEGER NOT NULL,
  update_at                       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_delegator_month_date
  ON ex_static_delegator_month (date, address);

CREATE TABLE IF NOT EXISTS task_control (
  task_name     TEXT PRIMARY KEY,
  last_run_at   INTEGER,
  claimed_until INTEGER,
  last_status   TEXT,
  last_error    TEXT,
  last_period   TEXT -- "YYYY.MM" of the last written month
);
"#;

/// Connect to SQLite (with WAL mode for performance)
pub fn connect(path: &str) -> eyre::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

/// Run schema migrations
pub fn run_migrations(conn: &Connection) -> eyre::Result<()> {
    conn.execute_batch(INIT_SQL)?;

    // Databases created before `last_period` existed
    let has_last_period = conn
        .prepare("SELECT 1 FROM pragma_table_info('task_control') WHERE name = 'last_period'")?
        .exists([])?;
    if !has_last_period {
        conn.execute_batch("ALTER TABLE task_control ADD COLUMN last_period TEXT")?;
    }
    Ok(())
}

/// Last recorded state of a scheduled task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
    pub task_name: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub last_error: Option<String>,
    pub last_period: Option<String>,
}

/// Shared handle over the SQLite connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Opens `path`, runs migrations and wraps the connection.
    pub fn open(path: &str) -> eyre::Result<Self> {
        let conn = connect(path)?;
        run_migrations(&conn)?;
        Ok(Self::new(conn))
    }

    pub fn open_in_memory() -> eyre::Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self::new(conn))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // ---------- account snapshots ----------

    pub fn insert_snapshot(&self, snapshot: &AccountSnapshot) -> Result<(), StoreError> {
        let rewards = encode_rewards(&snapshot.delegations_rewards)?;
        let commission = encode_rewards(&snapshot.commission)?;
        self.lock()?.execute(
            r#"
            INSERT INTO account_snapshots (
                address, denom, delegation, delegations_rewards, commission, sample_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                snapshot.address,
                snapshot.delegation.denom,
                snapshot.delegation.amount.to_string(),
                rewards,
                commission,
                snapshot.date.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Latest sample time strictly before `before`.
    pub fn terminal_date(&self, before: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<i64> = self.lock()?.query_row(
            "SELECT MAX(sample_at) FROM account_snapshots WHERE sample_at < ?1",
            [before.timestamp()],
            |r| r.get(0),
        )?;
        latest.map(from_timestamp).transpose()
    }

    /// All snapshots sampled on the civil day of `date`, one per address.
    pub fn get_by_date(&self, date: DateTime<FixedOffset>) -> Result<Vec<AccountSnapshot>, StoreError> {
        let (start, end) = day_window(date).map_err(|e| StoreError::Malformed {
            column: "sample_at",
            value: e.to_string(),
        })?;

        let raws = {
            let db = self.lock()?;
            let mut stmt = db.prepare(
                "SELECT address, denom, delegation, delegations_rewards, commission, sample_at
                 FROM account_snapshots
                 WHERE sample_at >= ?1 AND sample_at < ?2
                 ORDER BY address, sample_at DESC",
            )?;
            let rows = stmt.query_map([start.timestamp(), end.timestamp()], RawSnapshot::from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut out: Vec<AccountSnapshot> = Vec::with_capacity(raws.len());
        for raw in raws {
            // latest sample of the day wins
            if out.last().map(|s| s.address == raw.address).unwrap_or(false) {
                continue;
            }
            out.push(raw.into_snapshot()?);
        }
        Ok(out)
    }

    /// The snapshot of `address` sampled on the civil day of `date`.
    pub fn get_one_day(
        &self,
        date: DateTime<FixedOffset>,
        address: &str,
    ) -> Result<AccountSnapshot, StoreError> {
        let (start, end) = day_window(date).map_err(|e| StoreError::Malformed {
            column: "sample_at",
            value: e.to_string(),
        })?;

        let raw = self
            .lock()?
            .query_row(
                "SELECT address, denom, delegation, delegations_rewards, commission, sample_at
                 FROM account_snapshots
                 WHERE address = ?1 AND sample_at >= ?2 AND sample_at < ?3
                 ORDER BY sample_at DESC
                 LIMIT 1",
                params![address, start.timestamp(), end.timestamp()],
                RawSnapshot::from_row,
            )
            .optional()?;

        match raw {
            Some(raw) => raw.into_snapshot(),
            None => Err(StoreError::NotFound(format!(
                "snapshot for {} on {}",
                address,
                date.date_naive()
            ))),
        }
    }

    // ---------- transactions ----------

    pub fn insert_tx(&self, tx: &Transaction) -> Result<(), StoreError> {
        self.lock()?.execute(
            r#"
            INSERT INTO txs (tx_hash, tx_type, time, from_address, to_address)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(tx_hash) DO UPDATE SET
                tx_type      = excluded.tx_type,
                time         = excluded.time,
                from_address = excluded.from_address,
                to_address   = excluded.to_address
            "#,
            params![
                tx.tx_hash,
                tx.tx_type.as_str(),
                tx.time.timestamp(),
                tx.from_address,
                tx.to_address
            ],
        )?;
        Ok(())
    }

    /// Transactions in `[start, end)`, optionally restricted to one address.
    pub fn get_by_duration_and_address(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        address: Option<&str>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let raws = {
            let db = self.lock()?;
            let mut stmt = db.prepare(
                "SELECT tx_hash, tx_type, time, from_address, to_address
                 FROM txs
                 WHERE time >= ?1 AND time < ?2
                   AND (?3 IS NULL OR from_address = ?3 OR to_address = ?3)
                 ORDER BY time, tx_hash",
            )?;
            let rows = stmt.query_map(params![start.timestamp(), end.timestamp(), address], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        raws.into_iter()
            .map(|(tx_hash, tx_type, time, from_address, to_address)| {
                Ok(Transaction {
                    tx_hash,
                    tx_type: TxType::from(tx_type.as_str()),
                    time: from_timestamp(time)?,
                    from_address,
                    to_address,
                })
            })
            .collect()
    }

    // ---------- monthly records ----------

    /// Inserts every record in one transaction; nothing is kept on failure.
    pub fn insert_monthly_records(&self, records: &[MonthlyAggregateRecord]) -> Result<usize, StoreError> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO ex_static_delegator_month (
                    id, address, date,
                    terminal_delegation_denom, terminal_delegation_amount,
                    period_delegation_times,
                    period_withdraw_rewards_iris, period_withdraw_rewards_atto,
                    increment_delegation_denom, increment_delegation_amount,
                    period_increment_rewards_iris, period_increment_rewards_atto,
                    terminal_rewards_iris, terminal_rewards_atto,
                    period_withdraw_commission_iris, period_withdraw_commission_atto,
                    increment_commission_iris, increment_commission_atto,
                    create_at, update_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                        ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
                "#,
            )?;
            for r in records {
                stmt.execute(params![
                    r.id,
                    r.address,
                    r.date,
                    r.terminal_delegation.denom,
                    r.terminal_delegation.amount.to_string(),
                    r.period_delegation_times,
                    r.period_withdraw_rewards.iris,
                    r.period_withdraw_rewards.iris_atto,
                    r.increment_delegation.denom,
                    r.increment_delegation.amount.to_string(),
                    r.period_increment_rewards.iris,
                    r.period_increment_rewards.iris_atto,
                    r.terminal_rewards.iris,
                    r.terminal_rewards.iris_atto,
                    r.period_withdraw_commission.iris,
                    r.period_withdraw_commission.iris_atto,
                    r.increment_commission.iris,
                    r.increment_commission.iris_atto,
                    r.create_at,
                    r.update_at,
                ])?;
            }
        }
        tx.commit()?; // commit batch
        Ok(records.len())
    }

    pub fn query_monthly_records(
        &self,
        period: Option<&str>,
        address: Option<&str>,
        limit: u32,
    ) -> Result<Vec<MonthlyAggregateRecord>, StoreError> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT id, address, date,
                    terminal_delegation_denom, terminal_delegation_amount,
                    period_delegation_times,
                    period_withdraw_rewards_iris, period_withdraw_rewards_atto,
                    increment_delegation_denom, increment_delegation_amount,
                    period_increment_rewards_iris, period_increment_rewards_atto,
                    terminal_rewards_iris, terminal_rewards_atto,
                    period_withdraw_commission_iris, period_withdraw_commission_atto,
                    increment_commission_iris, increment_commission_atto,
                    create_at, update_at
             FROM ex_static_delegator_month
             WHERE (?1 IS NULL OR date = ?1) AND (?2 IS NULL OR address = ?2)
             ORDER BY date DESC, address, create_at
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![period, address, limit as i64], |r| {
            let rewards = |iris: usize, atto: usize| -> rusqlite::Result<Rewards> {
                Ok(Rewards {
                    iris: r.get(iris)?,
                    iris_atto: r.get(atto)?,
                })
            };
            Ok((
                MonthlyAggregateRecord {
                    id: r.get(0)?,
                    address: r.get(1)?,
                    date: r.get(2)?,
                    terminal_delegation: Coin::zero(r.get::<_, String>(3)?),
                    period_delegation_times: r.get(5)?,
                    period_withdraw_rewards: rewards(6, 7)?,
                    increment_delegation: Coin::zero(r.get::<_, String>(8)?),
                    period_increment_rewards: rewards(10, 11)?,
                    terminal_rewards: rewards(12, 13)?,
                    period_withdraw_commission: rewards(14, 15)?,
                    increment_commission: rewards(16, 17)?,
                    create_at: r.get(18)?,
                    update_at: r.get(19)?,
                },
                r.get::<_, String>(4)?,
                r.get::<_, String>(9)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (mut record, terminal, increment) = row?;
            record.terminal_delegation.amount = parse_decimal("terminal_delegation_amount", &terminal)?;
            record.increment_delegation.amount = parse_decimal("increment_delegation_amount", &increment)?;
            out.push(record);
        }
        Ok(out)
    }

    // ---------- task control ----------

    /// Claims `task_name` for a run if `interval_secs` have passed since the
    /// last successful run and no unexpired claim is held. The check and the
    /// claim happen in one immediate transaction.
    pub fn try_claim_task(
        &self,
        task_name: &str,
        interval_secs: i64,
        lease_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut db = self.lock()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO task_control (task_name) VALUES (?1)",
            [task_name],
        )?;
        let (last_run_at, claimed_until): (Option<i64>, Option<i64>) = tx.query_row(
            "SELECT last_run_at, claimed_until FROM task_control WHERE task_name = ?1",
            [task_name],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        let now_ts = now.timestamp();
        let due = last_run_at
            .map(|last| now_ts.saturating_sub(last) >= interval_secs)
            .unwrap_or(true);
        let free = claimed_until.map(|until| until <= now_ts).unwrap_or(true);
        if !(due && free) {
            return Ok(false); // dropping `tx` rolls back
        }

        tx.execute(
            "UPDATE task_control SET claimed_until = ?2 WHERE task_name = ?1",
            params![task_name, now_ts.saturating_add(lease_secs)],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Releases the claim after a successful run and advances `last_run_at`.
    /// `period` is the month written, if any; `None` keeps the previous one.
    pub fn complete_task(
        &self,
        task_name: &str,
        now: DateTime<Utc>,
        period: Option<&str>,
    ) -> Result<(), StoreError> {
        self.lock()?.execute(
            "UPDATE task_control
             SET last_run_at = ?2, claimed_until = NULL, last_status = 'ok', last_error = NULL,
                 last_period = COALESCE(?3, last_period)
             WHERE task_name = ?1",
            params![task_name, now.timestamp(), period],
        )?;
        Ok(())
    }

    /// Releases the claim after a failed run; `last_run_at` is left as is.
    pub fn fail_task(&self, task_name: &str, error: &str) -> Result<(), StoreError> {
        self.lock()?.execute(
            "UPDATE task_control
             SET claimed_until = NULL, last_status = 'failed', last_error = ?2
             WHERE task_name = ?1",
            params![task_name, error],
        )?;
        Ok(())
    }

    /// Releases the claim without recording a run.
    pub fn release_task(&self, task_name: &str) -> Result<(), StoreError> {
        self.lock()?.execute(
            "UPDATE task_control SET claimed_until = NULL WHERE task_name = ?1",
            [task_name],
        )?;
        Ok(())
    }

    pub fn task_status(&self, task_name: &str) -> Result<Option<TaskStatus>, StoreError> {
        let raw = self
            .lock()?
            .query_row(
                "SELECT last_run_at, claimed_until, last_status, last_error, last_period
                 FROM task_control WHERE task_name = ?1",
                [task_name],
                |r| {
                    Ok((
                        r.get::<_, Option<i64>>(0)?,
                        r.get::<_, Option<i64>>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;

        raw.map(|(last_run_at, claimed_until, last_status, last_error, last_period)| {
            Ok(TaskStatus {
                task_name: task_name.to_string(),
                last_run_at: last_run_at.map(from_timestamp).transpose()?,
                claimed_until: claimed_until.map(from_timestamp).transpose()?,
                last_status,
                last_error,
                last_period,
            })
        })
        .transpose()
    }
}

struct RawSnapshot {
    address: String,
    denom: String,
    delegation: String,
    delegations_rewards: String,
    commission: String,
    sample_at: i64,
}

impl RawSnapshot {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            address: r.get(0)?,
            denom: r.get(1)?,
            delegation: r.get(2)?,
            delegations_rewards: r.get(3)?,
            commission: r.get(4)?,
            sample_at: r.get(5)?,
        })
    }

    fn into_snapshot(self) -> Result<AccountSnapshot, StoreError> {
        Ok(AccountSnapshot {
            delegation: Coin::new(self.denom, parse_decimal("delegation", &self.delegation)?),
            delegations_rewards: decode_rewards("delegations_rewards", &self.delegations_rewards)?,
            commission: decode_rewards("commission", &self.commission)?,
            date: from_timestamp(self.sample_at)?,
            address: self.address,
        })
    }
}

fn parse_decimal(column: &'static str, value: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(value).map_err(|_| StoreError::Malformed {
        column,
        value: value.to_string(),
    })
}

fn encode_rewards(rewards: &[Rewards]) -> Result<String, StoreError> {
    serde_json::to_string(rewards).map_err(|e| StoreError::Malformed {
        column: "rewards",
        value: e.to_string(),
    })
}

fn decode_rewards(column: &'static str, value: &str) -> Result<Vec<Rewards>, StoreError> {
    serde_json::from_str(value).map_err(|_| StoreError::Malformed {
        column,
        value: value.to_string(),
    })
}

fn from_timestamp(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp(secs, 0).ok_or(StoreError::Malformed {
        column: "timestamp",
        value: secs.to_string(),
    })
}
