use super::{json_column, text_enum, BillingStore};
use crate::{
    calculator::{BillingPeriod, OpenBalance},
    error::BillingResult,
    ledger::{Invoice, InvoiceKind, InvoiceStatus},
    types::{ClientId, Timestamp},
};
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension, Row};

const INVOICE_COLUMNS: &str = "invoice_id, client_id, invoice_number, kind, period_start,
    period_end, amount, tax_amount, total_amount, due_date, status, audit, created_at, paid_at";

impl BillingStore {
    // ── Invoices ───────────────────────────────────────────────

    pub fn insert_invoice(&self, inv: &Invoice) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO invoice (
                invoice_id, client_id, invoice_number, kind, period_start,
                period_end, amount, tax_amount, total_amount, due_date, status,
                audit, created_at, paid_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                inv.invoice_id,
                inv.client_id,
                inv.invoice_number,
                inv.kind.as_str(),
                inv.period.start,
                inv.period.end,
                inv.amount,
                inv.tax_amount,
                inv.total_amount,
                inv.due_date,
                inv.status.as_str(),
                serde_json::to_string(&inv.audit)?,
                inv.created_at,
                inv.paid_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_invoice_by_number(&self, invoice_number: &str) -> BillingResult<Option<Invoice>> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoice WHERE invoice_number = ?1");
        let invoice = self
            .conn
            .query_row(&sql, params![invoice_number], invoice_from_row)
            .optional()?;
        Ok(invoice)
    }

    /// The non-cancelled invoice covering exactly `period`, if any.
    pub fn live_invoice_for_period(
        &self,
        client_id: &str,
        period:    &BillingPeriod,
    ) -> BillingResult<Option<Invoice>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoice
             WHERE client_id = ?1 AND period_start = ?2 AND period_end = ?3
               AND status != 'cancelled'"
        );
        let invoice = self
            .conn
            .query_row(&sql, params![client_id, period.start, period.end], invoice_from_row)
            .optional()?;
        Ok(invoice)
    }

    /// A live penalty invoice issued within `[from, to]`.
    pub fn penalty_invoice_between(
        &self,
        client_id: &str,
        from:      NaiveDate,
        to:        NaiveDate,
    ) -> BillingResult<Option<Invoice>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoice
             WHERE client_id = ?1 AND kind = 'penalty' AND status != 'cancelled'
               AND period_start BETWEEN ?2 AND ?3
             ORDER BY period_start LIMIT 1"
        );
        let invoice = self
            .conn
            .query_row(&sql, params![client_id, from, to], invoice_from_row)
            .optional()?;
        Ok(invoice)
    }

    pub fn invoices_for_client(&self, client_id: &str) -> BillingResult<Vec<Invoice>> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoice WHERE client_id = ?1
             ORDER BY invoice_number ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![client_id], invoice_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_invoices(&self) -> BillingResult<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM invoice", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn max_invoice_number_with_prefix(&self, prefix: &str) -> BillingResult<Option<String>> {
        let pattern = format!("{prefix}%");
        let max = self.conn.query_row(
            "SELECT MAX(invoice_number) FROM invoice WHERE invoice_number LIKE ?1",
            params![pattern],
            |row| row.get::<_, Option<String>>(0),
        )?;
        Ok(max)
    }

    /// Sum, count and oldest due date of pending/overdue invoices.
    pub fn open_balance(&self, client_id: &str) -> BillingResult<OpenBalance> {
        let balance = self.conn.query_row(
            "SELECT COALESCE(SUM(total_amount), 0.0), COUNT(*), MIN(due_date)
             FROM invoice
             WHERE client_id = ?1 AND status IN ('pending', 'overdue')",
            params![client_id],
            |row| {
                Ok(OpenBalance {
                    total:      row.get(0)?,
                    count:      row.get(1)?,
                    oldest_due: row.get(2)?,
                })
            },
        )?;
        Ok(balance)
    }

    pub fn mark_invoice_paid(&self, invoice_id: &str, paid_at: Timestamp) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE invoice SET status = 'paid', paid_at = ?2
             WHERE invoice_id = ?1 AND status IN ('pending', 'overdue')",
            params![invoice_id, paid_at],
        )?;
        Ok(())
    }

    pub fn cancel_invoice(&self, invoice_id: &str, audit: &serde_json::Value) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE invoice SET status = 'cancelled', audit = ?2
             WHERE invoice_id = ?1 AND status IN ('pending', 'overdue')",
            params![invoice_id, serde_json::to_string(audit)?],
        )?;
        Ok(())
    }

    pub fn mark_invoices_overdue(&self, as_of: NaiveDate) -> BillingResult<usize> {
        let n = self.conn.execute(
            "UPDATE invoice SET status = 'overdue'
             WHERE status = 'pending' AND due_date < ?1",
            params![as_of],
        )?;
        Ok(n)
    }

    // ── Payments ───────────────────────────────────────────────

    pub fn insert_payment(
        &self,
        payment_id: &str,
        client_id:  &str,
        invoice_id: &str,
        amount:     f64,
        method:     &str,
        paid_at:    Timestamp,
    ) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO payment (payment_id, client_id, invoice_id, amount, method, paid_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![payment_id, client_id, invoice_id, amount, method, paid_at],
        )?;
        Ok(())
    }

    /// Enabled, non-active clients with a payment at or after `since`.
    /// `paid_at` is always written as UTC in one format, so text order is
    /// time order.
    pub fn non_active_clients_paid_since(&self, since: Timestamp) -> BillingResult<Vec<ClientId>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT pay.client_id
             FROM payment pay
             JOIN client_profile p ON p.client_id = pay.client_id
             WHERE pay.paid_at >= ?1
               AND p.account_active = 1 AND p.client_status != 'active'
             ORDER BY pay.client_id",
        )?;
        let ids = stmt
            .query_map(params![since], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

fn invoice_from_row(row: &Row<'_>) -> rusqlite::Result<Invoice> {
    Ok(Invoice {
        invoice_id:     row.get(0)?,
        client_id:      row.get(1)?,
        invoice_number: row.get(2)?,
        kind:           text_enum(row, 3, InvoiceKind::parse)?,
        period: BillingPeriod {
            start: row.get(4)?,
            end:   row.get(5)?,
        },
        amount:         row.get(6)?,
        tax_amount:     row.get(7)?,
        total_amount:   row.get(8)?,
        due_date:       row.get(9)?,
        status:         text_enum(row, 10, InvoiceStatus::parse)?,
        audit:          json_column(row, 11, |raw| serde_json::from_str(raw))?,
        created_at:     row.get(12)?,
        paid_at:        row.get(13)?,
    })
}
