//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Engine components call store methods; they never execute SQL directly.

use crate::{
    error::BillingResult,
    event::{BillingEvent, EventLogEntry},
    types::Timestamp,
};
use rusqlite::{params, Connection, Row, TransactionBehavior};

mod batch;
mod invoice;
mod job;
mod profile;
mod reminder;

pub use batch::BatchWatermark;
pub use job::JobRunRecord;
pub use reminder::{PaymentReminder, ReminderStatus};

pub struct BillingStore {
    conn: Connection,
}

impl BillingStore {
    pub fn open(path: &str) -> BillingResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> BillingResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> BillingResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_invoices.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_reminders_and_batches.sql"))?;
        Ok(())
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction, committing on `Ok` and
    /// rolling back on `Err`. Nested calls join the outer transaction.
    pub fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Self) -> BillingResult<T>,
    ) -> BillingResult<T> {
        if !self.conn.is_autocommit() {
            return f(self);
        }
        let tx = rusqlite::Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, at: Timestamp, event: &BillingEvent) -> BillingResult<()> {
        let payload = serde_json::to_string(event)?;
        self.conn.execute(
            "INSERT INTO event_log (client_id, occurred_at, event_type, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![event.client_id(), at, event.event_type(), payload],
        )?;
        Ok(())
    }

    pub fn events_for_client(&self, client_id: &str) -> BillingResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, client_id, occurred_at, event_type, payload
             FROM event_log WHERE client_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![client_id], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn events_of_type(&self, event_type: &str) -> BillingResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, client_id, occurred_at, event_type, payload
             FROM event_log WHERE event_type = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![event_type], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventLogEntry> {
    Ok(EventLogEntry {
        id:          Some(row.get(0)?),
        client_id:   row.get(1)?,
        occurred_at: row.get(2)?,
        event_type:  row.get(3)?,
        payload:     row.get(4)?,
    })
}

// ── Column helpers ─────────────────────────────────────────────

/// Read a TEXT column holding one of the engine's `as_str()` enum values.
pub(crate) fn text_enum<T>(
    row: &Row<'_>,
    idx: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value '{raw}'").into(),
        )
    })
}

/// Read a TEXT column holding a JSON document.
pub(crate) fn json_column<T>(
    row: &Row<'_>,
    idx: usize,
    decode: fn(&str) -> serde_json::Result<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    decode(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
