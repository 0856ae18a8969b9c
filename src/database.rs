//! database.rs – SQLite operation journal using rusqlite.
//!
//! Every orchestrated operation is recorded here with its status so that a
//! stake whose approval landed but whose settlement was never confirmed
//! survives a restart and can be retried or reconciled later.
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::str::FromStr;
use std::sync::Mutex;

use crate::models::{OperationRecord, OperationStatus};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS operations (
    operation_id    TEXT PRIMARY KEY,
    kind            TEXT NOT NULL,
    account         TEXT NOT NULL,
    token_address   TEXT NOT NULL,
    chain           TEXT NOT NULL,
    amount          TEXT,
    vault_address   TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'IN_FLIGHT',
    approval_tx     TEXT,
    settlement_tx   TEXT,
    borrowed        TEXT,
    detail          TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_operations_status  ON operations(status);
CREATE INDEX IF NOT EXISTS idx_operations_account ON operations(account);
";

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

pub struct Journal {
    conn: Mutex<Connection>,
}

impl Journal {
    /// Open (or create) the journal at *path* and apply the schema.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("opening SQLite journal")?;
        conn.execute_batch(SCHEMA).context("applying schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("journal mutex poisoned"))?;
        f(&conn)
    }

    pub fn upsert_operation(&self, op: &OperationRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO operations
                    (operation_id, kind, account, token_address, chain, amount,
                     vault_address, status, approval_tx, settlement_tx, borrowed,
                     detail, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
                 ON CONFLICT(operation_id) DO UPDATE SET
                    status        = excluded.status,
                    approval_tx   = excluded.approval_tx,
                    settlement_tx = excluded.settlement_tx,
                    borrowed      = excluded.borrowed,
                    detail        = excluded.detail,
                    updated_at    = excluded.updated_at",
                params![
                    op.operation_id,
                    op.kind.as_str(),
                    op.account.to_checksum(None),
                    op.token_address.to_checksum(None),
                    op.chain,
                    op.amount.map(|a| a.to_string()),
                    op.vault_address.to_checksum(None),
                    op.status.as_str(),
                    op.approval_tx.map(|h| h.to_string()),
                    op.settlement_tx,
                    op.borrowed.map(|b| b.to_string()),
                    op.detail,
                    op.created_at.to_rfc3339(),
                    op.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_operation(&self, operation_id: &str) -> Result<Option<OperationRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM operations WHERE operation_id = ?1",
                params![operation_id],
                |row| Self::row_to_operation(row),
            )
            .optional()
            .map_err(anyhow::Error::from)
        })
    }

    /// Stakes whose approval is on-chain but whose settlement is unconfirmed.
    pub fn pending_reconciliation(&self) -> Result<Vec<OperationRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM operations WHERE status = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(
                params![OperationStatus::PendingReconciliation.as_str()],
                |row| Self::row_to_operation(row),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(anyhow::Error::from)
        })
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<OperationRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM operations ORDER BY created_at DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| Self::row_to_operation(row))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(anyhow::Error::from)
        })
    }

    /// Close out a pending stake that was settled by other means.
    /// Returns `false` when no pending operation has that id.
    pub fn mark_reconciled(&self, operation_id: &str, note: Option<&str>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE operations
                    SET status = ?1,
                        detail = COALESCE(?2, detail),
                        updated_at = ?3
                  WHERE operation_id = ?4 AND status = ?5",
                params![
                    OperationStatus::Reconciled.as_str(),
                    note,
                    Utc::now().to_rfc3339(),
                    operation_id,
                    OperationStatus::PendingReconciliation.as_str(),
                ],
            )?;
            Ok(changed > 0)
        })
    }

    fn row_to_operation(row: &rusqlite::Row<'_>) -> Result<OperationRecord, rusqlite::Error> {
        Ok(OperationRecord {
            operation_id: row.get("operation_id")?,
            kind: parse_col(row, "kind")?,
            account: parse_col(row, "account")?,
            token_address: parse_col(row, "token_address")?,
            chain: row.get("chain")?,
            amount: parse_opt_col(row, "amount")?,
            vault_address: parse_col(row, "vault_address")?,
            status: parse_col(row, "status")?,
            approval_tx: parse_opt_col(row, "approval_tx")?,
            settlement_tx: row.get("settlement_tx")?,
            borrowed: parse_opt_col(row, "borrowed")?,
            detail: row.get("detail")?,
            created_at: parse_dt(row.get::<_, String>("created_at")?),
            updated_at: parse_dt(row.get::<_, String>("updated_at")?),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn parse_col<T>(row: &rusqlite::Row<'_>, name: &str) -> Result<T, rusqlite::Error>
where
    T: FromStr,
    T::Err: Into<BoxError>,
{
    let text: String = row.get(name)?;
    parse_text(row, name, &text)
}

fn parse_opt_col<T>(row: &rusqlite::Row<'_>, name: &str) -> Result<Option<T>, rusqlite::Error>
where
    T: FromStr,
    T::Err: Into<BoxError>,
{
    row.get::<_, Option<String>>(name)?
        .map(|text| parse_text(row, name, &text))
        .transpose()
}

fn parse_text<T>(row: &rusqlite::Row<'_>, name: &str, text: &str) -> Result<T, rusqlite::Error>
where
    T: FromStr,
    T::Err: Into<BoxError>,
{
    T::from_str(text).map_err(|e| {
        let idx = row.as_ref().column_index(name).unwrap_or(0);
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn parse_dt(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
