use super::BillingStore;
use crate::{error::BillingResult, types::Timestamp};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

/// Durable record that the daily batch for `watermark` (YYYY-MM-DD) ran.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchWatermark {
    pub watermark:          String,
    pub completed_at:       Timestamp,
    pub processed:          u32,
    pub skipped:            u32,
    pub invoices_generated: u32,
    pub status_changes:     u32,
    pub errors:             u32,
}

impl BillingStore {
    // ── Batch watermark ────────────────────────────────────────

    pub fn watermark_exists(&self, watermark: &str) -> BillingResult<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM batch_watermark WHERE watermark = ?1",
            params![watermark],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Seal a day. Returns false if the watermark was already recorded.
    pub fn record_watermark(&self, w: &BatchWatermark) -> BillingResult<bool> {
        let inserted = self.conn.execute(
            "INSERT INTO batch_watermark (
                watermark, completed_at, processed, skipped,
                invoices_generated, status_changes, errors
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(watermark) DO NOTHING",
            params![
                w.watermark,
                w.completed_at,
                w.processed,
                w.skipped,
                w.invoices_generated,
                w.status_changes,
                w.errors,
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn get_watermark(&self, watermark: &str) -> BillingResult<Option<BatchWatermark>> {
        let row = self
            .conn
            .query_row(
                "SELECT watermark, completed_at, processed, skipped,
                        invoices_generated, status_changes, errors
                 FROM batch_watermark WHERE watermark = ?1",
                params![watermark],
                |row| {
                    Ok(BatchWatermark {
                        watermark:          row.get(0)?,
                        completed_at:       row.get(1)?,
                        processed:          row.get(2)?,
                        skipped:            row.get(3)?,
                        invoices_generated: row.get(4)?,
                        status_changes:     row.get(5)?,
                        errors:             row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}
