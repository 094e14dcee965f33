//! Integration tests for the job scheduler.
//!
//! Tests verify:
//! 1. Engine jobs are registered with their configured triggers
//! 2. A failing or panicking job is marked failed and the scheduler keeps firing
//! 3. Trigger overrides are persisted and win over configuration
//! 4. Running a job on demand records its run
//! 5. Starting after the daily trigger runs the day's batch if it never ran

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use netbill_core::{
    calculator::{BillingCycle, ClientBillingProfile, ServicePackage},
    clock::Clock,
    engine::{BillingEngine, TestEngine},
    error::{BillingError, BillingResult},
    jobs::{DailyBillingJob, OverdueSweepJob},
    scheduler::{JobStatus, ScheduledJob, Scheduler, AUTO_REACTIVATE_JOB, DAILY_BILLING_JOB, OVERDUE_SWEEP_JOB},
    types::Timestamp,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

async fn build() -> TestEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    BillingEngine::build_test(date(2026, 3, 1)).await.expect("build_test failed")
}

/// One client on a 500/month package, billed on the 1st.
async fn add_client(rig: &TestEngine) {
    rig.register_package(&ServicePackage {
        package_id: "fiber-100".into(),
        name: "Fiber 100".into(),
        price: 500.0,
        billing_cycle: BillingCycle::Monthly,
        active: true,
    })
    .await
    .unwrap();
    rig.subscribe(&ClientBillingProfile::new("c1", "fiber-100", 1, rig.clock.now()))
        .await
        .unwrap();
}

struct FailingJob;

#[async_trait]
impl ScheduledJob for FailingJob {
    fn name(&self) -> &'static str {
        "always_fails"
    }

    async fn run(&self, _now: Timestamp) -> BillingResult<String> {
        Err(BillingError::Config("collaborator unreachable".into()))
    }
}

struct PanickingJob;

#[async_trait]
impl ScheduledJob for PanickingJob {
    fn name(&self) -> &'static str {
        "always_panics"
    }

    async fn run(&self, _now: Timestamp) -> BillingResult<String> {
        panic!("job blew up");
    }
}

#[derive(Default)]
struct CountingJob {
    runs: AtomicU32,
}

#[async_trait]
impl ScheduledJob for CountingJob {
    fn name(&self) -> &'static str {
        "counter"
    }

    async fn run(&self, _now: Timestamp) -> BillingResult<String> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("run {n}"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: default registration
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn engine_registers_its_three_jobs() {
    let rig = build().await;
    let states = rig.scheduler.states().await;
    let names: Vec<&str> = states.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec![AUTO_REACTIVATE_JOB, DAILY_BILLING_JOB, OVERDUE_SWEEP_JOB]);

    let daily = rig.scheduler.state(DAILY_BILLING_JOB).await.unwrap();
    assert_eq!(daily.trigger, "daily at 02:00");
    assert_eq!(daily.status, JobStatus::Pending);
    assert_eq!(daily.next_due, rig.clock.now() + Duration::hours(2));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: failures are contained
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn failing_jobs_do_not_stop_the_scheduler() {
    let rig = build().await;
    let counter = Arc::new(CountingJob::default());
    rig.scheduler.register(Arc::new(FailingJob), "every 1 hours").await.unwrap();
    rig.scheduler.register(Arc::new(PanickingJob), "every 1 hours").await.unwrap();
    rig.scheduler.register(counter.clone(), "every 1 hours").await.unwrap();

    // Nothing is due at midnight.
    assert!(rig.scheduler.run_due().await.is_empty());

    for hour in 1..=2 {
        rig.clock.advance(Duration::hours(1));
        let ran = rig.scheduler.run_due().await;
        for name in ["always_fails", "always_panics", "counter"] {
            assert!(ran.iter().any(|r| r == name), "{name} should run at hour {hour}");
        }
    }

    assert_eq!(counter.runs.load(Ordering::SeqCst), 2);

    let failing = rig.scheduler.state("always_fails").await.unwrap();
    assert_eq!(failing.status, JobStatus::Failed);
    assert!(failing.last_detail.unwrap().contains("collaborator unreachable"));

    let panicking = rig.scheduler.state("always_panics").await.unwrap();
    assert_eq!(panicking.status, JobStatus::Failed);
    assert!(panicking.last_detail.unwrap().contains("panicked"));

    let counting = rig.scheduler.state("counter").await.unwrap();
    assert_eq!(counting.status, JobStatus::Completed);
    assert_eq!(counting.last_detail.as_deref(), Some("run 2"));

    let store = rig.store.lock().await;
    let runs = store.job_runs("always_fails").unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == "failed" && r.duration_ms.is_some()));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: persisted overrides
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn trigger_override_survives_reregistration() {
    let rig = build().await;
    rig.scheduler.set_trigger(OVERDUE_SWEEP_JOB, "every 2 hours").await.unwrap();
    let state = rig.scheduler.state(OVERDUE_SWEEP_JOB).await.unwrap();
    assert_eq!(state.trigger, "every 2 hours");
    assert_eq!(state.next_due, rig.clock.now() + Duration::hours(2));

    // A fresh scheduler on the same store picks the override over the default.
    let fresh = Scheduler::new(rig.store.clone(), rig.clock.clone());
    fresh
        .register(Arc::new(OverdueSweepJob::new(rig.orchestrator.clone())), "every 6 hours")
        .await
        .unwrap();
    assert_eq!(fresh.state(OVERDUE_SWEEP_JOB).await.unwrap().trigger, "every 2 hours");

    let unknown = rig.scheduler.set_trigger("no_such_job", "every 1 hours").await.unwrap_err();
    assert!(matches!(unknown, BillingError::JobNotFound { .. }));
    let invalid = rig.scheduler.set_trigger(OVERDUE_SWEEP_JOB, "fortnightly").await.unwrap_err();
    assert!(matches!(invalid, BillingError::InvalidTrigger { .. }));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: the daily billing job end to end
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn daily_billing_job_runs_the_batch() {
    let rig = build().await;
    add_client(&rig).await;

    // Fires at 02:00 via its trigger.
    rig.clock.advance(Duration::hours(2));
    let ran = rig.scheduler.run_due().await;
    assert_eq!(ran, vec![DAILY_BILLING_JOB.to_string()]);

    let state = rig.scheduler.state(DAILY_BILLING_JOB).await.unwrap();
    assert_eq!(state.status, JobStatus::Completed);
    assert!(state.last_detail.unwrap().contains("invoices=1"));
    assert_eq!(state.next_due, rig.clock.now() + Duration::days(1));

    // On demand the same day: the watermark makes it a no-op.
    let again = rig.scheduler.run_now(DAILY_BILLING_JOB).await.unwrap();
    assert_eq!(again.status, JobStatus::Completed);
    assert!(again.last_detail.unwrap().contains("already recorded"));

    let store = rig.store.lock().await;
    assert_eq!(store.count_invoices().unwrap(), 1);
    assert_eq!(store.job_runs(DAILY_BILLING_JOB).unwrap().len(), 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: a process started after 02:00 still bills the day
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn late_start_runs_the_missed_daily_batch() {
    let rig = build().await;
    add_client(&rig).await;
    rig.clock.advance(Duration::hours(3));

    let restarted = Scheduler::new(rig.store.clone(), rig.clock.clone());
    restarted
        .register(Arc::new(DailyBillingJob::new(rig.orchestrator.clone())), "daily at 02:00")
        .await
        .unwrap();
    assert_eq!(restarted.state(DAILY_BILLING_JOB).await.unwrap().next_due, rig.clock.now());

    assert_eq!(restarted.run_due().await, vec![DAILY_BILLING_JOB.to_string()]);
    let state = restarted.state(DAILY_BILLING_JOB).await.unwrap();
    assert_eq!(state.status, JobStatus::Completed);
    assert!(state.last_detail.unwrap().contains("invoices=1"));
    let tomorrow = Utc.with_ymd_and_hms(2026, 3, 2, 2, 0, 0).unwrap();
    assert_eq!(state.next_due, tomorrow);

    // Once the day is sealed a further restart waits for tomorrow.
    rig.clock.advance(Duration::hours(1));
    let again = Scheduler::new(rig.store.clone(), rig.clock.clone());
    again
        .register(Arc::new(DailyBillingJob::new(rig.orchestrator.clone())), "daily at 02:00")
        .await
        .unwrap();
    assert_eq!(again.state(DAILY_BILLING_JOB).await.unwrap().next_due, tomorrow);
    assert!(again.run_due().await.is_empty());
}
