//! Integration tests for the overdue sweep and auto-reactivation.
//!
//! Tests verify:
//! 1. A client 30 days late with five grace days is cut, moved and reminded
//! 2. Penalties are charged at most once per calendar month
//! 3. Reminders are suppressed while one queued today is pending or one was
//!    already sent today; undelivered reminders expire the next day
//! 4. The sweep only escalates
//! 5. Recent payments reactivate; older ones do not
//! 6. A partial payment does not make a cut client flap between pools

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use netbill_core::{
    calculator::{BillingCycle, ClientBillingProfile, ServicePackage},
    clock::Clock,
    config::EngineConfig,
    engine::{BillingEngine, TestEngine},
    ledger::{self, InvoiceKind, PenaltyOutcome},
    lifecycle::{self, ClientStatus, PoolType, StatusTarget},
    ports::PoolMove,
    store::ReminderStatus,
};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

async fn build(as_of: NaiveDate) -> TestEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    let rig = BillingEngine::build_test(as_of).await.expect("build_test failed");
    rig.register_package(&ServicePackage {
        package_id: "fiber-100".into(),
        name: "Fiber 100".into(),
        price: 350.0,
        billing_cycle: BillingCycle::Monthly,
        active: true,
    })
    .await
    .unwrap();
    rig
}

/// Client on a negotiated 500/month with five grace days, due on `due`.
async fn add_late_client(rig: &TestEngine, client_id: &str, due: NaiveDate) {
    let mut profile = ClientBillingProfile::new(client_id, "fiber-100", 1, rig.clock.now());
    profile.monthly_fee = 500.0;
    profile.grace_days = 5;
    profile.next_due_date = Some(due);
    rig.subscribe(&profile).await.unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: fee 500, grace 5, due 30 days ago
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn thirty_days_late_is_cut_moved_and_reminded() {
    let rig = build(date(2026, 3, 31)).await;
    add_late_client(&rig, "c1", date(2026, 3, 1)).await;

    let report = rig.orchestrator.run_overdue_sweep(rig.clock.now()).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.status_changes, 1);
    assert_eq!(report.penalties_applied, 1);
    assert_eq!(report.reminders_queued, 1);
    assert!(report.errors.is_empty());

    let profile = rig.store.lock().await.get_profile("c1").unwrap().unwrap();
    assert_eq!(profile.client_status, ClientStatus::CutService);
    assert_eq!(profile.current_pool, PoolType::CutService);

    assert_eq!(
        rig.network.moves_for("c1"),
        vec![PoolMove { client_id: "c1".into(), from: PoolType::Active, to: PoolType::CutService }]
    );
    let sent = rig.reminders.sent_to("c1");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].days_overdue, 30);

    let store = rig.store.lock().await;
    let penalty = store
        .invoices_for_client("c1")
        .unwrap()
        .into_iter()
        .find(|i| i.kind == InvoiceKind::Penalty)
        .expect("penalty invoice");
    // No flat fee on the profile: 5 % of the 500 monthly charge.
    assert_eq!(penalty.total_amount, 25.0);
    assert_eq!(penalty.due_date, date(2026, 4, 7));
    assert_eq!(store.reminders_for_client("c1").unwrap()[0].status, ReminderStatus::Sent);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: one penalty per client per month
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn penalty_is_charged_once_per_month() {
    let rig = build(date(2026, 3, 20)).await;
    add_late_client(&rig, "c1", date(2026, 3, 1)).await;

    let first = rig.orchestrator.run_overdue_sweep(rig.clock.now()).await.unwrap();
    assert_eq!(first.penalties_applied, 1);

    rig.clock.advance(Duration::hours(6));
    let second = rig.orchestrator.run_overdue_sweep(rig.clock.now()).await.unwrap();
    assert_eq!(second.penalties_applied, 0);

    {
        let store = rig.store.lock().await;
        let outcome = ledger::apply_penalty(&store, &EngineConfig::default_test(), "c1", rig.clock.now()).unwrap();
        assert!(matches!(outcome, PenaltyOutcome::AlreadyApplied { .. }));
    }

    // A new month allows a new penalty.
    rig.clock.set(Utc.with_ymd_and_hms(2026, 4, 2, 0, 0, 0).unwrap());
    let april = rig.orchestrator.run_overdue_sweep(rig.clock.now()).await.unwrap();
    assert_eq!(april.penalties_applied, 1);

    let store = rig.store.lock().await;
    let numbers: Vec<String> = store
        .invoices_for_client("c1")
        .unwrap()
        .into_iter()
        .filter(|i| i.kind == InvoiceKind::Penalty)
        .map(|i| i.invoice_number)
        .collect();
    assert_eq!(numbers, vec!["2026030001", "2026040001"]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: reminder suppression
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reminders_are_not_repeated() {
    let rig = build(date(2026, 3, 4)).await;
    add_late_client(&rig, "pending", date(2026, 3, 1)).await;
    add_late_client(&rig, "sent", date(2026, 3, 1)).await;

    // A reminder for "pending" is already queued and not yet delivered.
    {
        let store = rig.store.lock().await;
        let queued =
            lifecycle::request_reminder(&store, &EngineConfig::default_test(), "pending", 3, rig.clock.now())
                .unwrap();
        assert!(queued.is_some());
    }

    let first = rig.orchestrator.run_overdue_sweep(rig.clock.now()).await.unwrap();
    assert_eq!(first.examined, 2);
    // Only "sent" gets a new reminder; its suspension queued it.
    assert_eq!(first.reminders_queued, 1);
    assert!(rig.reminders.sent_to("pending").is_empty());
    assert_eq!(rig.reminders.sent_to("sent").len(), 1);

    // Later the same day: "sent" already heard from us today.
    rig.clock.advance(Duration::hours(6));
    let second = rig.orchestrator.run_overdue_sweep(rig.clock.now()).await.unwrap();
    assert_eq!(second.reminders_queued, 0);
    assert_eq!(rig.reminders.sent_to("sent").len(), 1);

    // Next day the reminder goes out again, and the undelivered one from
    // yesterday no longer holds "pending" back.
    rig.clock.advance(Duration::days(1));
    let third = rig.orchestrator.run_overdue_sweep(rig.clock.now()).await.unwrap();
    assert_eq!(third.reminders_expired, 1);
    assert_eq!(rig.reminders.sent_to("sent").len(), 2);
    assert_eq!(rig.reminders.sent_to("pending").len(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3b: a reminder whose dispatch never happened does not silence the client
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn undelivered_reminder_does_not_block_later_days() {
    let rig = build(date(2026, 3, 4)).await;
    add_late_client(&rig, "c1", date(2026, 3, 1)).await;
    {
        // Queued and committed, but the process stopped before dispatch.
        let store = rig.store.lock().await;
        lifecycle::request_reminder(&store, &EngineConfig::default_test(), "c1", 3, rig.clock.now())
            .unwrap()
            .expect("reminder queued");
    }

    rig.orchestrator.run_overdue_sweep(rig.clock.now()).await.unwrap();
    assert!(rig.reminders.sent_to("c1").is_empty());

    for _ in 0..30 {
        rig.clock.advance(Duration::days(1));
        rig.orchestrator.run_overdue_sweep(rig.clock.now()).await.unwrap();
    }

    assert_eq!(rig.reminders.sent_to("c1").len(), 30);
    let store = rig.store.lock().await;
    assert_eq!(store.get_profile("c1").unwrap().unwrap().client_status, ClientStatus::CutService);
    let reminders = store.reminders_for_client("c1").unwrap();
    assert_eq!(reminders[0].status, ReminderStatus::Failed);
    assert!(reminders[1..].iter().all(|r| r.status == ReminderStatus::Sent));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: a cut client who is only a few days late is not eased back
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn sweep_never_de_escalates() {
    let rig = build(date(2026, 3, 4)).await;
    add_late_client(&rig, "c1", date(2026, 3, 1)).await;
    {
        let store = rig.store.lock().await;
        lifecycle::transition(
            &store,
            &EngineConfig::default_test(),
            "c1",
            StatusTarget::new(ClientStatus::CutService, "manual cut", 3),
            rig.clock.now(),
        )
        .unwrap();
    }

    let report = rig.orchestrator.run_overdue_sweep(rig.clock.now()).await.unwrap();
    assert_eq!(report.status_changes, 0);
    let profile = rig.store.lock().await.get_profile("c1").unwrap().unwrap();
    assert_eq!(profile.client_status, ClientStatus::CutService);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: auto-reactivation window
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn recent_payment_reactivates_old_one_does_not() {
    let rig = build(date(2026, 3, 1)).await;
    for id in ["recent", "stale"] {
        let mut profile = ClientBillingProfile::new(id, "fiber-100", 1, rig.clock.now());
        profile.grace_days = 5;
        rig.subscribe(&profile).await.unwrap();
    }
    rig.orchestrator.run_daily_batch(date(2026, 3, 1)).await.unwrap();

    rig.clock.set(Utc.with_ymd_and_hms(2026, 3, 4, 0, 0, 0).unwrap());
    rig.orchestrator.run_overdue_sweep(rig.clock.now()).await.unwrap();

    // Payments recorded straight on the ledger, outside the orchestrator.
    {
        let store = rig.store.lock().await;
        for (id, paid_at) in [
            ("recent", Utc.with_ymd_and_hms(2026, 3, 4, 5, 0, 0).unwrap()),
            ("stale", Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()),
        ] {
            let number = store.invoices_for_client(id).unwrap()[0].invoice_number.clone();
            ledger::confirm_payment(&store, &number, "cash", paid_at).unwrap();
            assert_eq!(
                store.get_profile(id).unwrap().unwrap().client_status,
                ClientStatus::Suspended
            );
        }
    }

    let now = Utc.with_ymd_and_hms(2026, 3, 4, 6, 0, 0).unwrap();
    let report = rig.orchestrator.run_auto_reactivate(now).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.status_changes, 1);

    let store = rig.store.lock().await;
    assert_eq!(store.get_profile("recent").unwrap().unwrap().client_status, ClientStatus::Active);
    assert_eq!(store.get_profile("stale").unwrap().unwrap().client_status, ClientStatus::Suspended);
    assert_eq!(
        rig.network.moves_for("recent").last(),
        Some(&PoolMove { client_id: "recent".into(), from: PoolType::Suspended, to: PoolType::Active })
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: paying the newest invoice while an older one stays open
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn partial_payment_does_not_flap_status() {
    let rig = build(date(2026, 3, 1)).await;
    add_late_client(&rig, "c1", date(2026, 1, 1)).await;
    // Two catch-up runs issue the January and February invoices.
    rig.orchestrator.run_daily_batch(date(2026, 3, 1)).await.unwrap();
    rig.orchestrator.run_daily_batch(date(2026, 3, 2)).await.unwrap();
    rig.clock.set(Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap());

    let february = rig.store.lock().await.invoices_for_client("c1").unwrap()[1]
        .invoice_number
        .clone();
    let receipt = rig.orchestrator.confirm_payment(&february, "transfer").await.unwrap();
    assert_eq!(receipt.status_after, ClientStatus::Active);

    // A day of 6-hourly sweeps and 4-hourly reactivation passes.
    let (mut cuts, mut reactivations) = (0, 0);
    for hour in 1..=24 {
        rig.clock.advance(Duration::hours(1));
        if hour % 6 == 0 {
            cuts += rig.orchestrator.run_overdue_sweep(rig.clock.now()).await.unwrap().status_changes;
        }
        if hour % 4 == 0 {
            reactivations += rig.orchestrator.run_auto_reactivate(rig.clock.now()).await.unwrap().status_changes;
        }
    }

    // January is still open: cut once, never brought back.
    assert_eq!(cuts, 1);
    assert_eq!(reactivations, 0);
    assert_eq!(
        rig.network.moves_for("c1"),
        vec![
            PoolMove { client_id: "c1".into(), from: PoolType::Active, to: PoolType::CutService },
            PoolMove { client_id: "c1".into(), from: PoolType::CutService, to: PoolType::Active },
            PoolMove { client_id: "c1".into(), from: PoolType::Active, to: PoolType::CutService },
        ]
    );
    let profile = rig.store.lock().await.get_profile("c1").unwrap().unwrap();
    assert_eq!(profile.client_status, ClientStatus::CutService);
}
