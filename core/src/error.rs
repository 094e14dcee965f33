use chrono::NaiveDate;
use thiserror::Error;

use crate::types::ClientId;

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("Persistence failure: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Client '{client_id}' has no billing profile")]
    ProfileMissing { client_id: ClientId },

    #[error("Client '{client_id}' references missing service package '{package_id}'")]
    PackageMissing { client_id: ClientId, package_id: String },

    #[error("Invoice {existing} already covers {period_start}..{period_end} for client '{client_id}'")]
    DuplicateInvoice {
        client_id:    ClientId,
        period_start: NaiveDate,
        period_end:   NaiveDate,
        existing:     String,
    },

    #[error("Daily batch already recorded for {watermark}")]
    DuplicateBatchRun { watermark: String },

    #[error("Pool move failed for client '{client_id}': {reason}")]
    ExternalPoolMoveFailed { client_id: ClientId, reason: String },

    #[error("Invoice '{invoice_number}' not found")]
    InvoiceNotFound { invoice_number: String },

    #[error("Invoice '{invoice_number}' is {status} and can no longer change")]
    InvoiceImmutable { invoice_number: String, status: String },

    #[error("Invoice sequence exhausted for month {month}")]
    SequenceExhausted { month: String },

    #[error("Invalid schedule expression '{expression}': {reason}")]
    InvalidTrigger { expression: String, reason: String },

    #[error("Job '{name}' is not registered")]
    JobNotFound { name: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BillingError {
    /// True for outcomes that mean "already done", not "went wrong".
    pub fn is_idempotent_noop(&self) -> bool {
        matches!(
            self,
            BillingError::DuplicateInvoice { .. } | BillingError::DuplicateBatchRun { .. }
        )
    }

    /// Short machine-readable kind, used in batch reports.
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::Database(_) => "persistence_failure",
            BillingError::Serialization(_) => "serialization",
            BillingError::ProfileMissing { .. } => "profile_missing",
            BillingError::PackageMissing { .. } => "package_missing",
            BillingError::DuplicateInvoice { .. } => "duplicate_invoice",
            BillingError::DuplicateBatchRun { .. } => "duplicate_batch_run",
            BillingError::ExternalPoolMoveFailed { .. } => "external_pool_move_failed",
            BillingError::InvoiceNotFound { .. } => "invoice_not_found",
            BillingError::InvoiceImmutable { .. } => "invoice_immutable",
            BillingError::SequenceExhausted { .. } => "sequence_exhausted",
            BillingError::InvalidTrigger { .. } => "invalid_trigger",
            BillingError::JobNotFound { .. } => "job_not_found",
            BillingError::Config(_) => "config",
            BillingError::Other(_) => "other",
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
