use super::{text_enum, BillingStore};
use crate::{
    error::BillingResult,
    types::{ClientId, Timestamp},
};
use chrono::NaiveDate;
use rusqlite::params;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Pending,
    Sent,
    Failed,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderStatus::Pending => "pending",
            ReminderStatus::Sent => "sent",
            ReminderStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReminderStatus::Pending),
            "sent" => Some(ReminderStatus::Sent),
            "failed" => Some(ReminderStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentReminder {
    pub reminder_id:  String,
    pub client_id:    ClientId,
    pub channel:      String,
    pub days_overdue: i64,
    pub status:       ReminderStatus,
    pub created_at:   Timestamp,
}

impl BillingStore {
    // ── Payment reminders ──────────────────────────────────────

    pub fn insert_reminder(
        &self,
        reminder_id:  &str,
        client_id:    &str,
        channel:      &str,
        days_overdue: i64,
        at:           Timestamp,
    ) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO payment_reminder (
                reminder_id, client_id, channel, days_overdue, status, created_at, created_on
            ) VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
            params![reminder_id, client_id, channel, days_overdue, at, at.date_naive()],
        )?;
        Ok(())
    }

    /// Reminders queued on `day` and not yet dispatched.
    pub fn has_pending_reminder(&self, client_id: &str, day: NaiveDate) -> BillingResult<bool> {
        let pending: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM payment_reminder
             WHERE client_id = ?1 AND status = 'pending' AND created_on = ?2",
            params![client_id, day],
            |row| row.get(0),
        )?;
        Ok(pending)
    }

    /// Mark reminders still pending from before `day` as failed; their
    /// dispatch never happened. Returns how many were expired.
    pub fn expire_pending_reminders(&self, day: NaiveDate) -> BillingResult<usize> {
        let expired = self.conn.execute(
            "UPDATE payment_reminder SET status = 'failed'
             WHERE status = 'pending' AND created_on < ?1",
            params![day],
        )?;
        Ok(expired)
    }

    pub fn reminder_sent_on(&self, client_id: &str, day: NaiveDate) -> BillingResult<bool> {
        let sent: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM payment_reminder
             WHERE client_id = ?1 AND status = 'sent' AND created_on = ?2",
            params![client_id, day],
            |row| row.get(0),
        )?;
        Ok(sent)
    }

    pub fn update_reminder_status(&self, reminder_id: &str, status: ReminderStatus) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE payment_reminder SET status = ?2 WHERE reminder_id = ?1",
            params![reminder_id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn reminders_for_client(&self, client_id: &str) -> BillingResult<Vec<PaymentReminder>> {
        let mut stmt = self.conn.prepare(
            "SELECT reminder_id, client_id, channel, days_overdue, status, created_at
             FROM payment_reminder WHERE client_id = ?1
             ORDER BY created_at ASC, reminder_id ASC",
        )?;
        let rows = stmt
            .query_map(params![client_id], |row| {
                Ok(PaymentReminder {
                    reminder_id:  row.get(0)?,
                    client_id:    row.get(1)?,
                    channel:      row.get(2)?,
                    days_overdue: row.get(3)?,
                    status:       text_enum(row, 4, ReminderStatus::parse)?,
                    created_at:   row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
