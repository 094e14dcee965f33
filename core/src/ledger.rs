//! Invoice ledger: creates, numbers, settles and cancels invoices.
//!
//! RULES:
//!   - At most one non-cancelled invoice per (client, period_start, period_end).
//!     Checked before insert and backed by a partial unique index.
//!   - Invoice numbers are `YYYYMM` + a 4-digit month-scoped sequence, derived
//!     inside the same write transaction as the insert.
//!   - A paid invoice never changes again.

use crate::{
    calculator::{add_days, anchored_date, last_day_of_month, BillingCalculator, BillingPeriod, BillingSnapshot},
    config::EngineConfig,
    error::{BillingError, BillingResult},
    event::BillingEvent,
    store::BillingStore,
    types::{round_cents, ClientId, Timestamp},
};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Highest sequence a month can hold with four digits.
const MAX_MONTHLY_SEQUENCE: u32 = 9999;

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InvoiceStatus::Pending),
            "paid" => Some(InvoiceStatus::Paid),
            "overdue" => Some(InvoiceStatus::Overdue),
            "cancelled" => Some(InvoiceStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, InvoiceStatus::Pending | InvoiceStatus::Overdue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceKind {
    Service,
    Penalty,
}

impl InvoiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceKind::Service => "service",
            InvoiceKind::Penalty => "penalty",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "service" => Some(InvoiceKind::Service),
            "penalty" => Some(InvoiceKind::Penalty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Invoice {
    pub invoice_id:     String,
    pub client_id:      ClientId,
    pub invoice_number: String,
    pub kind:           InvoiceKind,
    pub period:         BillingPeriod,
    pub amount:         f64,
    pub tax_amount:     f64,
    pub total_amount:   f64,
    pub due_date:       NaiveDate,
    pub status:         InvoiceStatus,
    pub audit:          serde_json::Value,
    pub created_at:     Timestamp,
    pub paid_at:        Option<Timestamp>,
}

#[derive(Debug, Clone)]
pub enum PenaltyOutcome {
    Applied(Invoice),
    /// A penalty invoice already exists for this calendar month.
    AlreadyApplied { invoice_number: String },
    /// The resolved penalty amount is zero.
    Waived,
}

// ── Numbering ────────────────────────────────────────────────────────────────

pub fn invoice_prefix(date: NaiveDate) -> String {
    format!("{:04}{:02}", date.year(), date.month())
}

pub fn format_invoice_number(date: NaiveDate, sequence: u32) -> String {
    format!("{}{:04}", invoice_prefix(date), sequence)
}

/// Month-scoped sequence of a well-formed invoice number.
pub fn invoice_sequence(number: &str) -> Option<u32> {
    if number.len() != 10 || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    number[6..].parse().ok()
}

/// Next free number for the month of `date`. Call inside a write transaction.
pub fn next_invoice_number(store: &BillingStore, date: NaiveDate) -> BillingResult<String> {
    let prefix = invoice_prefix(date);
    let last = store
        .max_invoice_number_with_prefix(&prefix)?
        .and_then(|n| invoice_sequence(&n))
        .unwrap_or(0);
    if last >= MAX_MONTHLY_SEQUENCE {
        return Err(BillingError::SequenceExhausted { month: prefix });
    }
    Ok(format_invoice_number(date, last + 1))
}

// ── Operations ───────────────────────────────────────────────────────────────

/// Invoice the period resolved in `snapshot`, then advance the client's
/// `next_due_date` to the following cycle.
///
/// Fails with `DuplicateInvoice` when a live invoice already covers the
/// period; callers treat that as an idempotent no-op.
pub fn generate(
    store:    &BillingStore,
    snapshot: &BillingSnapshot,
    at:       Timestamp,
) -> BillingResult<Invoice> {
    let client_id = snapshot.client_id.as_str();
    store.in_transaction(|s| {
        if let Some(existing) = s.live_invoice_for_period(client_id, &snapshot.period)? {
            return Err(BillingError::DuplicateInvoice {
                client_id:    client_id.to_string(),
                period_start: snapshot.period.start,
                period_end:   snapshot.period.end,
                existing:     existing.invoice_number,
            });
        }

        let invoice = Invoice {
            invoice_id:     uuid::Uuid::new_v4().to_string(),
            client_id:      client_id.to_string(),
            invoice_number: next_invoice_number(s, snapshot.as_of)?,
            kind:           InvoiceKind::Service,
            period:         snapshot.period,
            amount:         snapshot.base_amount,
            tax_amount:     snapshot.tax_amount,
            total_amount:   snapshot.total_amount(),
            due_date:       snapshot.period.start,
            status:         InvoiceStatus::Pending,
            audit: serde_json::json!({
                "source":         "billing_batch",
                "as_of":          snapshot.as_of,
                "overdue_days":   snapshot.overdue_days,
                "open_balance":   snapshot.open_balance,
                "open_invoices":  snapshot.open_invoices,
            }),
            created_at: at,
            paid_at:    None,
        };
        s.insert_invoice(&invoice)?;
        s.advance_next_due_date(client_id, snapshot.next_due_date)?;
        s.append_event(
            at,
            &BillingEvent::InvoiceGenerated {
                client_id:      client_id.to_string(),
                invoice_number: invoice.invoice_number.clone(),
                period_start:   invoice.period.start,
                period_end:     invoice.period.end,
                total_amount:   invoice.total_amount,
            },
        )?;

        log::info!(
            "day={} ledger: invoice {} for {client_id} {}..{} total={:.2}",
            snapshot.as_of,
            invoice.invoice_number,
            invoice.period.start,
            invoice.period.end,
            invoice.total_amount
        );
        Ok(invoice)
    })
}

/// Issue a late-payment invoice, at most one per client per calendar month.
pub fn apply_penalty(
    store:     &BillingStore,
    config:    &EngineConfig,
    client_id: &str,
    at:        Timestamp,
) -> BillingResult<PenaltyOutcome> {
    let today = at.date_naive();
    store.in_transaction(|s| {
        let month_start = anchored_date(today.year(), today.month(), 1);
        let month_end = anchored_date(
            today.year(),
            today.month(),
            last_day_of_month(today.year(), today.month()),
        );
        if let Some(existing) = s.penalty_invoice_between(client_id, month_start, month_end)? {
            return Ok(PenaltyOutcome::AlreadyApplied {
                invoice_number: existing.invoice_number,
            });
        }

        let profile = s
            .get_profile(client_id)?
            .ok_or_else(|| BillingError::ProfileMissing {
                client_id: client_id.to_string(),
            })?;
        let package = s
            .get_package(&profile.package_id)?
            .ok_or_else(|| BillingError::PackageMissing {
                client_id:  client_id.to_string(),
                package_id: profile.package_id.clone(),
            })?;
        let monthly_charge = BillingCalculator::new(config).monthly_charge(&profile, &package);
        let amount = crate::calculator::resolve_penalty(&profile, monthly_charge, config);
        if amount <= 0.0 {
            return Ok(PenaltyOutcome::Waived);
        }

        let due_date = add_days(today, config.penalty.due_days);
        let invoice = Invoice {
            invoice_id:     uuid::Uuid::new_v4().to_string(),
            client_id:      client_id.to_string(),
            invoice_number: next_invoice_number(s, today)?,
            kind:           InvoiceKind::Penalty,
            period:         BillingPeriod { start: today, end: due_date },
            amount,
            tax_amount:     0.0,
            total_amount:   round_cents(amount),
            due_date,
            status:         InvoiceStatus::Pending,
            audit: serde_json::json!({
                "source":         "late_payment_penalty",
                "penalty_fee":    profile.penalty_fee,
                "monthly_charge": monthly_charge,
            }),
            created_at: at,
            paid_at:    None,
        };
        s.insert_invoice(&invoice)?;
        s.append_event(
            at,
            &BillingEvent::PenaltyApplied {
                client_id:      client_id.to_string(),
                invoice_number: invoice.invoice_number.clone(),
                amount,
            },
        )?;
        log::info!(
            "day={today} ledger: penalty {} for {client_id} amount={amount:.2}",
            invoice.invoice_number
        );
        Ok(PenaltyOutcome::Applied(invoice))
    })
}

/// Settle an open invoice and record the payment against its client.
pub fn confirm_payment(
    store:          &BillingStore,
    invoice_number: &str,
    method:         &str,
    paid_at:        Timestamp,
) -> BillingResult<Invoice> {
    store.in_transaction(|s| {
        let mut invoice = s
            .get_invoice_by_number(invoice_number)?
            .ok_or_else(|| BillingError::InvoiceNotFound {
                invoice_number: invoice_number.to_string(),
            })?;
        if !invoice.status.is_open() {
            return Err(BillingError::InvoiceImmutable {
                invoice_number: invoice_number.to_string(),
                status:         invoice.status.as_str().to_string(),
            });
        }

        s.mark_invoice_paid(&invoice.invoice_id, paid_at)?;
        s.insert_payment(
            &uuid::Uuid::new_v4().to_string(),
            &invoice.client_id,
            &invoice.invoice_id,
            invoice.total_amount,
            method,
            paid_at,
        )?;
        s.set_last_payment_date(&invoice.client_id, paid_at.date_naive())?;
        s.append_event(
            paid_at,
            &BillingEvent::InvoicePaid {
                client_id:      invoice.client_id.clone(),
                invoice_number: invoice.invoice_number.clone(),
                amount:         invoice.total_amount,
            },
        )?;

        invoice.status = InvoiceStatus::Paid;
        invoice.paid_at = Some(paid_at);
        Ok(invoice)
    })
}

/// Cancel an unpaid invoice, freeing its period for regeneration.
/// Cancelling an already cancelled invoice is a no-op.
pub fn cancel(
    store:          &BillingStore,
    invoice_number: &str,
    reason:         &str,
    at:             Timestamp,
) -> BillingResult<Invoice> {
    store.in_transaction(|s| {
        let mut invoice = s
            .get_invoice_by_number(invoice_number)?
            .ok_or_else(|| BillingError::InvoiceNotFound {
                invoice_number: invoice_number.to_string(),
            })?;
        match invoice.status {
            InvoiceStatus::Cancelled => return Ok(invoice),
            InvoiceStatus::Paid => {
                return Err(BillingError::InvoiceImmutable {
                    invoice_number: invoice_number.to_string(),
                    status:         invoice.status.as_str().to_string(),
                })
            }
            InvoiceStatus::Pending | InvoiceStatus::Overdue => {}
        }

        if let serde_json::Value::Object(map) = &mut invoice.audit {
            map.insert("cancel_reason".into(), reason.into());
            map.insert("cancelled_at".into(), at.to_rfc3339().into());
        }
        s.cancel_invoice(&invoice.invoice_id, &invoice.audit)?;
        s.append_event(
            at,
            &BillingEvent::InvoiceCancelled {
                client_id:      invoice.client_id.clone(),
                invoice_number: invoice.invoice_number.clone(),
                reason:         reason.to_string(),
            },
        )?;
        invoice.status = InvoiceStatus::Cancelled;
        Ok(invoice)
    })
}

/// Flag pending invoices whose due date has passed. Returns how many flipped.
pub fn mark_overdue(store: &BillingStore, as_of: NaiveDate) -> BillingResult<usize> {
    store.in_transaction(|s| s.mark_invoices_overdue(as_of))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_month_prefixed_and_zero_padded() {
        let d = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        assert_eq!(format_invoice_number(d, 7), "2026030007");
        assert_eq!(invoice_sequence("2026030007"), Some(7));
        assert_eq!(invoice_sequence("INV-1"), None);
    }
}
