//! The engine's scheduled jobs, each a thin wrapper over the orchestrator.

use crate::{
    error::BillingResult,
    orchestrator::BillingOrchestrator,
    scheduler::{ScheduledJob, AUTO_REACTIVATE_JOB, DAILY_BILLING_JOB, OVERDUE_SWEEP_JOB},
    types::Timestamp,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Bills the UTC calendar day the job fires on.
pub struct DailyBillingJob {
    orchestrator: Arc<BillingOrchestrator>,
}

impl DailyBillingJob {
    pub fn new(orchestrator: Arc<BillingOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl ScheduledJob for DailyBillingJob {
    fn name(&self) -> &'static str {
        DAILY_BILLING_JOB
    }

    async fn run(&self, now: Timestamp) -> BillingResult<String> {
        let report = self.orchestrator.run_daily_batch(now.date_naive()).await?;
        Ok(report.to_string())
    }

    /// The day's batch is missed while its watermark is absent.
    async fn missed_run(&self, scheduled_at: Timestamp) -> BillingResult<bool> {
        Ok(!self.orchestrator.is_sealed(scheduled_at.date_naive()).await?)
    }
}

pub struct OverdueSweepJob {
    orchestrator: Arc<BillingOrchestrator>,
}

impl OverdueSweepJob {
    pub fn new(orchestrator: Arc<BillingOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl ScheduledJob for OverdueSweepJob {
    fn name(&self) -> &'static str {
        OVERDUE_SWEEP_JOB
    }

    async fn run(&self, now: Timestamp) -> BillingResult<String> {
        let report = self.orchestrator.run_overdue_sweep(now).await?;
        Ok(report.to_string())
    }
}

pub struct AutoReactivateJob {
    orchestrator: Arc<BillingOrchestrator>,
}

impl AutoReactivateJob {
    pub fn new(orchestrator: Arc<BillingOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl ScheduledJob for AutoReactivateJob {
    fn name(&self) -> &'static str {
        AUTO_REACTIVATE_JOB
    }

    async fn run(&self, now: Timestamp) -> BillingResult<String> {
        let report = self.orchestrator.run_auto_reactivate(now).await?;
        Ok(report.to_string())
    }
}
