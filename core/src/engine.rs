//! The billing engine. Wires store, ports, orchestrator and scheduler.
//!
//! JOBS (registered by `build`, triggers from config unless overridden):
//!   1. daily_billing    : invoice clients due today, seal the day
//!   2. overdue_sweep    : flag late invoices, escalate, penalise, remind
//!   3. auto_reactivate  : restore clients who paid recently
//!
//! RULES:
//!   - One store connection, shared behind an async mutex.
//!   - Every status change goes through the orchestrator.

use crate::{
    calculator::{first_cycle_start, ClientBillingProfile, ServicePackage},
    clock::{Clock, ManualClock},
    config::EngineConfig,
    error::BillingResult,
    jobs::{AutoReactivateJob, DailyBillingJob, OverdueSweepJob},
    orchestrator::BillingOrchestrator,
    ports::{EffectDispatcher, NetworkPoolPort, RecordingNetworkPool, RecordingReminders, ReminderPort},
    scheduler::Scheduler,
    store::BillingStore,
};
use chrono::NaiveDate;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct BillingEngine {
    pub store:        Arc<Mutex<BillingStore>>,
    pub orchestrator: Arc<BillingOrchestrator>,
    pub scheduler:    Scheduler,
}

impl BillingEngine {
    /// Build a fully wired engine with all jobs registered.
    /// `store` must already be migrated.
    pub async fn build(
        store:     BillingStore,
        config:    EngineConfig,
        clock:     Arc<dyn Clock>,
        network:   Arc<dyn NetworkPoolPort>,
        reminders: Arc<dyn ReminderPort>,
    ) -> BillingResult<Self> {
        config.validate()?;
        let store = Arc::new(Mutex::new(store));
        let dispatcher = EffectDispatcher::new(network, reminders, config.port_timeout());
        let schedule = config.schedule.clone();
        let orchestrator = Arc::new(BillingOrchestrator::new(
            store.clone(),
            config,
            clock.clone(),
            dispatcher,
        ));

        let scheduler = Scheduler::new(store.clone(), clock);
        scheduler
            .register(
                Arc::new(DailyBillingJob::new(orchestrator.clone())),
                &schedule.daily_billing,
            )
            .await?;
        scheduler
            .register(
                Arc::new(OverdueSweepJob::new(orchestrator.clone())),
                &schedule.overdue_sweep,
            )
            .await?;
        scheduler
            .register(
                Arc::new(AutoReactivateJob::new(orchestrator.clone())),
                &schedule.auto_reactivate,
            )
            .await?;

        Ok(Self {
            store,
            orchestrator,
            scheduler,
        })
    }

    /// In-memory engine at midnight UTC of `as_of`, with a manual clock and
    /// recording ports. Used by tests.
    pub async fn build_test(as_of: NaiveDate) -> BillingResult<TestEngine> {
        Self::build_test_with(as_of, EngineConfig::default_test()).await
    }

    pub async fn build_test_with(as_of: NaiveDate, config: EngineConfig) -> BillingResult<TestEngine> {
        let store = BillingStore::in_memory()?;
        store.migrate()?;
        let clock = Arc::new(ManualClock::at_date(as_of));
        let network = Arc::new(RecordingNetworkPool::new());
        let reminders = Arc::new(RecordingReminders::new());
        let engine = Self::build(
            store,
            config,
            clock.clone(),
            network.clone(),
            reminders.clone(),
        )
        .await?;
        Ok(TestEngine {
            engine,
            clock,
            network,
            reminders,
        })
    }

    pub async fn register_package(&self, package: &ServicePackage) -> BillingResult<()> {
        self.store.lock().await.upsert_package(package)
    }

    /// Create a client's billing profile at subscription time. A profile
    /// without a due date is first due on its next billing day.
    pub async fn subscribe(&self, profile: &ClientBillingProfile) -> BillingResult<()> {
        let mut profile = profile.clone();
        if profile.next_due_date.is_none() {
            profile.next_due_date = Some(first_cycle_start(profile.created_at.date_naive(), profile.billing_day));
        }
        log::info!(
            "engine: subscribed {} on package {} (billing day {})",
            profile.client_id,
            profile.package_id,
            profile.billing_day
        );
        self.store.lock().await.insert_profile(&profile)
    }
}

/// A test engine plus handles to its clock and recording ports.
pub struct TestEngine {
    pub engine:    BillingEngine,
    pub clock:     Arc<ManualClock>,
    pub network:   Arc<RecordingNetworkPool>,
    pub reminders: Arc<RecordingReminders>,
}

impl Deref for TestEngine {
    type Target = BillingEngine;

    fn deref(&self) -> &BillingEngine {
        &self.engine
    }
}
