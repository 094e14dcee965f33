//! Audit trail of everything the engine changes.
//!
//! RULE: every state change the engine makes appends one BillingEvent,
//! written in the same transaction as the change itself.

use crate::{
    lifecycle::{ClientStatus, PoolType},
    types::{ClientId, Timestamp},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Variants are only ever added, never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingEvent {
    InvoiceGenerated {
        client_id:      ClientId,
        invoice_number: String,
        period_start:   NaiveDate,
        period_end:     NaiveDate,
        total_amount:   f64,
    },
    PenaltyApplied {
        client_id:      ClientId,
        invoice_number: String,
        amount:         f64,
    },
    InvoicePaid {
        client_id:      ClientId,
        invoice_number: String,
        amount:         f64,
    },
    InvoiceCancelled {
        client_id:      ClientId,
        invoice_number: String,
        reason:         String,
    },
    StatusChanged {
        client_id: ClientId,
        from:      ClientStatus,
        to:        ClientStatus,
        reason:    String,
    },
    PoolMoveFailed {
        client_id: ClientId,
        from:      PoolType,
        to:        PoolType,
        reason:    String,
    },
    ReminderQueued {
        client_id:    ClientId,
        reminder_id:  String,
        days_overdue: i64,
    },
    BatchCompleted {
        watermark:          String,
        processed:          u32,
        invoices_generated: u32,
        errors:             u32,
    },
}

impl BillingEvent {
    /// Stable name for the event_type column.
    pub fn event_type(&self) -> &'static str {
        match self {
            BillingEvent::InvoiceGenerated { .. } => "invoice_generated",
            BillingEvent::PenaltyApplied { .. }   => "penalty_applied",
            BillingEvent::InvoicePaid { .. }      => "invoice_paid",
            BillingEvent::InvoiceCancelled { .. } => "invoice_cancelled",
            BillingEvent::StatusChanged { .. }    => "status_changed",
            BillingEvent::PoolMoveFailed { .. }   => "pool_move_failed",
            BillingEvent::ReminderQueued { .. }   => "reminder_queued",
            BillingEvent::BatchCompleted { .. }   => "batch_completed",
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        match self {
            BillingEvent::InvoiceGenerated { client_id, .. }
            | BillingEvent::PenaltyApplied { client_id, .. }
            | BillingEvent::InvoicePaid { client_id, .. }
            | BillingEvent::InvoiceCancelled { client_id, .. }
            | BillingEvent::StatusChanged { client_id, .. }
            | BillingEvent::PoolMoveFailed { client_id, .. }
            | BillingEvent::ReminderQueued { client_id, .. } => Some(client_id),
            BillingEvent::BatchCompleted { .. } => None,
        }
    }
}

/// A persisted row of the event_log table.
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub id:          Option<i64>,
    pub client_id:   Option<ClientId>,
    pub occurred_at: Timestamp,
    pub event_type:  String,
    pub payload:     String,
}

impl EventLogEntry {
    pub fn decode(&self) -> serde_json::Result<BillingEvent> {
        serde_json::from_str(&self.payload)
    }
}
