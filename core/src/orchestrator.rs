//! Batch driver: daily billing, overdue sweep, auto-reactivation, payments.
//!
//! RULES:
//!   - Each client is handled in its own transaction; a failure rolls back
//!     that client only and is reported, never propagated.
//!   - The daily batch seals its day with a durable watermark. A sealed day
//!     is a no-op.
//!   - Effects are dispatched after the client's transaction commits, with
//!     the store lock released.

use crate::{
    calculator::BillingCalculator,
    clock::Clock,
    config::EngineConfig,
    error::{BillingError, BillingResult},
    event::BillingEvent,
    ledger::{self, Invoice, PenaltyOutcome},
    lifecycle::{self, pool_drift, target_status, ClientStatus, Effect, StatusTarget, TransitionOutcome},
    ports::{DispatchReport, EffectDispatcher},
    store::{BatchWatermark, BillingStore},
    types::{ClientId, Timestamp},
};
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

// ── Reports ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ClientFailure {
    pub client_id: ClientId,
    pub kind:      &'static str,
    pub message:   String,
}

impl ClientFailure {
    fn new(client_id: &str, err: &BillingError) -> Self {
        Self {
            client_id: client_id.to_string(),
            kind:      err.code(),
            message:   err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub watermark:          String,
    /// True when the day was already sealed and nothing was touched.
    pub duplicate_run:      bool,
    pub processed:          u32,
    pub skipped:            u32,
    pub invoices_generated: u32,
    pub status_changes:     u32,
    #[serde(skip)]
    pub dispatch:           DispatchReport,
    pub errors:             Vec<ClientFailure>,
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.duplicate_run {
            return write!(f, "batch {} already recorded", self.watermark);
        }
        write!(
            f,
            "batch {}: processed={} skipped={} invoices={} status_changes={} pool_failures={} errors={}",
            self.watermark,
            self.processed,
            self.skipped,
            self.invoices_generated,
            self.status_changes,
            self.dispatch.pool_moves_failed,
            self.errors.len()
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub examined:          u32,
    pub invoices_overdue:  u32,
    pub status_changes:    u32,
    pub penalties_applied: u32,
    pub reminders_queued:  u32,
    pub reminders_expired: u32,
    pub pools_resynced:    u32,
    #[serde(skip)]
    pub dispatch:          DispatchReport,
    pub errors:            Vec<ClientFailure>,
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "examined={} overdue_invoices={} status_changes={} penalties={} reminders={} expired_reminders={} pool_retries={} errors={}",
            self.examined,
            self.invoices_overdue,
            self.status_changes,
            self.penalties_applied,
            self.reminders_queued,
            self.reminders_expired,
            self.pools_resynced,
            self.errors.len()
        )
    }
}

#[derive(Debug, Clone)]
pub struct PaymentReceipt {
    pub invoice:       Invoice,
    pub status_before: ClientStatus,
    pub status_after:  ClientStatus,
}

/// Result of one client's unit of work inside the daily batch.
struct BilledClient {
    invoice:        Option<Invoice>,
    status_changed: bool,
    effects:        Vec<Effect>,
}

#[derive(Default)]
struct SweptClient {
    status_changed: bool,
    penalty:        bool,
    reminded:       bool,
    effects:        Vec<Effect>,
}

// ── Orchestrator ─────────────────────────────────────────────────────────────

pub struct BillingOrchestrator {
    store:      Arc<Mutex<BillingStore>>,
    config:     EngineConfig,
    clock:      Arc<dyn Clock>,
    dispatcher: EffectDispatcher,
    batch_lock: Mutex<()>,
}

impl BillingOrchestrator {
    pub fn new(
        store:      Arc<Mutex<BillingStore>>,
        config:     EngineConfig,
        clock:      Arc<dyn Clock>,
        dispatcher: EffectDispatcher,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            dispatcher,
            batch_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Mutex<BillingStore>> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ── Daily batch ────────────────────────────────────────────

    /// True once the batch for `day` has recorded its watermark.
    pub async fn is_sealed(&self, day: NaiveDate) -> BillingResult<bool> {
        let watermark = day.format("%Y-%m-%d").to_string();
        self.store.lock().await.watermark_exists(&watermark)
    }

    /// Bill every client due on `as_of`, then seal the day.
    pub async fn run_daily_batch(&self, as_of: NaiveDate) -> BillingResult<BatchReport> {
        let _serial = self.batch_lock.lock().await;
        let watermark = as_of.format("%Y-%m-%d").to_string();
        let now = self.clock.now();

        let candidates = {
            let store = self.store.lock().await;
            match ensure_unsealed(&store, &watermark) {
                Err(e) if e.is_idempotent_noop() => {
                    log::info!("day={as_of} batch: {e}, nothing to do");
                    return Ok(BatchReport {
                        watermark,
                        duplicate_run: true,
                        ..BatchReport::default()
                    });
                }
                other => other?,
            }
            store.billing_candidates(as_of)?
        };
        log::info!("day={as_of} batch: {} candidate client(s)", candidates.len());

        let mut report = BatchReport {
            watermark: watermark.clone(),
            ..BatchReport::default()
        };
        for client_id in candidates {
            let result = {
                let store = self.store.lock().await;
                self.bill_client(&store, &client_id, as_of, now)
            };
            match result {
                Ok(billed) => {
                    report.processed += 1;
                    if billed.invoice.is_some() {
                        report.invoices_generated += 1;
                    } else {
                        report.skipped += 1;
                    }
                    if billed.status_changed {
                        report.status_changes += 1;
                    }
                    let dispatched = self.dispatcher.dispatch(&self.store, billed.effects, now).await;
                    report.dispatch.absorb(dispatched);
                }
                Err(e) => {
                    log::warn!("day={as_of} batch: client {client_id} failed: {e}");
                    report.errors.push(ClientFailure::new(&client_id, &e));
                }
            }
        }

        let seal = BatchWatermark {
            watermark:          watermark.clone(),
            completed_at:       self.clock.now(),
            processed:          report.processed,
            skipped:            report.skipped,
            invoices_generated: report.invoices_generated,
            status_changes:     report.status_changes,
            errors:             report.errors.len() as u32,
        };
        {
            let store = self.store.lock().await;
            store.in_transaction(|s| {
                if !s.record_watermark(&seal)? {
                    // Another process sealed the day while this pass ran.
                    log::warn!("day={as_of} batch: watermark {watermark} was recorded concurrently");
                    return Ok(());
                }
                s.append_event(
                    seal.completed_at,
                    &BillingEvent::BatchCompleted {
                        watermark:          watermark.clone(),
                        processed:          seal.processed,
                        invoices_generated: seal.invoices_generated,
                        errors:             seal.errors,
                    },
                )
            })?;
        }

        log::info!("day={as_of} {report}");
        Ok(report)
    }

    fn bill_client(
        &self,
        store:     &BillingStore,
        client_id: &str,
        as_of:     NaiveDate,
        now:       Timestamp,
    ) -> BillingResult<BilledClient> {
        let calculator = BillingCalculator::new(&self.config);
        store.in_transaction(|s| {
            let snapshot = calculator.snapshot(s, client_id, as_of)?;
            let invoice = if snapshot.is_due() {
                match ledger::generate(s, &snapshot, now) {
                    Ok(invoice) => Some(invoice),
                    Err(e) if e.is_idempotent_noop() => {
                        log::debug!("day={as_of} batch: {e}");
                        None
                    }
                    Err(e) => return Err(e),
                }
            } else {
                log::debug!(
                    "day={as_of} batch: client {client_id} not due until {}",
                    snapshot.period.start
                );
                None
            };

            // Re-evaluate with the invoice in place.
            let fresh = calculator.snapshot(s, client_id, as_of)?;
            let target = StatusTarget::new(
                target_status(fresh.overdue_days, fresh.grace_days),
                format!("daily billing: {} day(s) overdue", fresh.overdue_days),
                fresh.overdue_days,
            );
            let outcome = lifecycle::transition(s, &self.config, client_id, target, now)?;

            Ok(BilledClient {
                invoice,
                status_changed: outcome.changed,
                effects: outcome.effects,
            })
        })
    }

    // ── Overdue sweep ──────────────────────────────────────────

    /// Flag late invoices and escalate late clients. Never de-escalates;
    /// only payments bring a client back.
    pub async fn run_overdue_sweep(&self, now: Timestamp) -> BillingResult<SweepReport> {
        let today = now.date_naive();
        let mut report = SweepReport::default();

        // Retry moves that failed on earlier runs before producing new ones.
        let drifted = {
            let store = self.store.lock().await;
            report.invoices_overdue = ledger::mark_overdue(&store, today)? as u32;
            report.reminders_expired = store.expire_pending_reminders(today)? as u32;
            if report.reminders_expired > 0 {
                log::warn!("day={today} sweep: {} undelivered reminder(s) expired", report.reminders_expired);
            }
            let mut drift = Vec::new();
            for client_id in store.drifted_pool_client_ids()? {
                if let Some(profile) = store.get_profile(&client_id)? {
                    drift.extend(pool_drift(&client_id, profile.client_status, profile.current_pool));
                }
            }
            drift
        };
        report.pools_resynced = drifted.len() as u32;
        if !drifted.is_empty() {
            log::info!("day={today} sweep: retrying {} drifted pool(s)", drifted.len());
            let dispatched = self.dispatcher.dispatch(&self.store, drifted, now).await;
            report.dispatch.absorb(dispatched);
        }

        let overdue = {
            let store = self.store.lock().await;
            store.overdue_client_ids(today)?
        };
        for client_id in overdue {
            report.examined += 1;
            let result = {
                let store = self.store.lock().await;
                self.sweep_client(&store, &client_id, now)
            };
            match result {
                Ok(swept) => {
                    report.status_changes += swept.status_changed as u32;
                    report.penalties_applied += swept.penalty as u32;
                    report.reminders_queued += swept.reminded as u32;
                    let dispatched = self.dispatcher.dispatch(&self.store, swept.effects, now).await;
                    report.dispatch.absorb(dispatched);
                }
                Err(e) => {
                    log::warn!("day={today} sweep: client {client_id} failed: {e}");
                    report.errors.push(ClientFailure::new(&client_id, &e));
                }
            }
        }

        log::info!("day={today} sweep: {report}");
        Ok(report)
    }

    fn sweep_client(&self, store: &BillingStore, client_id: &str, now: Timestamp) -> BillingResult<SweptClient> {
        let today = now.date_naive();
        store.in_transaction(|s| {
            let profile = s
                .get_profile(client_id)?
                .ok_or_else(|| BillingError::ProfileMissing {
                    client_id: client_id.to_string(),
                })?;
            let package = s.get_package(&profile.package_id)?;
            let open = s.open_balance(client_id)?;
            let snapshot = BillingCalculator::new(&self.config).compute(&profile, package.as_ref(), &open, today)?;

            let mut swept = SweptClient::default();
            if snapshot.overdue_days == 0 {
                return Ok(swept);
            }

            let target = target_status(snapshot.overdue_days, snapshot.grace_days);
            if target.severity() > profile.client_status.severity() {
                let outcome = lifecycle::transition(
                    s,
                    &self.config,
                    client_id,
                    StatusTarget::new(
                        target,
                        format!("overdue sweep: {} day(s) overdue", snapshot.overdue_days),
                        snapshot.overdue_days,
                    ),
                    now,
                )?;
                swept.status_changed = outcome.changed;
                swept.effects.extend(outcome.effects);
            }

            if snapshot.past_grace() {
                swept.penalty = matches!(
                    ledger::apply_penalty(s, &self.config, client_id, now)?,
                    PenaltyOutcome::Applied(_)
                );
            }

            if let Some(remind) =
                lifecycle::request_reminder(s, &self.config, client_id, snapshot.overdue_days, now)?
            {
                swept.effects.push(remind);
            }
            swept.reminded = swept.effects.iter().any(|e| matches!(e, Effect::Remind { .. }));
            Ok(swept)
        })
    }

    // ── Auto-reactivate ────────────────────────────────────────

    /// Bring back clients who paid within the reactivation window and are no
    /// longer overdue.
    pub async fn run_auto_reactivate(&self, now: Timestamp) -> BillingResult<SweepReport> {
        let since = now - Duration::hours(self.config.reactivation_window_hours);
        let paid = {
            let store = self.store.lock().await;
            store.non_active_clients_paid_since(since)?
        };

        let mut report = SweepReport::default();
        for client_id in paid {
            report.examined += 1;
            let result = {
                let store = self.store.lock().await;
                self.reactivate_client(&store, &client_id, now)
            };
            match result {
                Ok(Some(outcome)) => {
                    report.status_changes += outcome.changed as u32;
                    let dispatched = self.dispatcher.dispatch(&self.store, outcome.effects, now).await;
                    report.dispatch.absorb(dispatched);
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("reactivate: client {client_id} failed: {e}");
                    report.errors.push(ClientFailure::new(&client_id, &e));
                }
            }
        }

        log::info!("reactivate: {report}");
        Ok(report)
    }

    /// Reactivate only a client with nothing overdue left; a partial payment
    /// leaves an escalated client where the sweep put it.
    fn reactivate_client(
        &self,
        store:     &BillingStore,
        client_id: &str,
        now:       Timestamp,
    ) -> BillingResult<Option<TransitionOutcome>> {
        store.in_transaction(|s| {
            let snapshot = BillingCalculator::new(&self.config).snapshot(s, client_id, now.date_naive())?;
            if snapshot.overdue_days > 0 {
                log::debug!(
                    "reactivate: client {client_id} paid but is still {} day(s) overdue",
                    snapshot.overdue_days
                );
                return Ok(None);
            }
            lifecycle::transition(
                s,
                &self.config,
                client_id,
                StatusTarget::new(ClientStatus::Active, "payment received", 0),
                now,
            )
            .map(Some)
        })
    }

    // ── Payments ───────────────────────────────────────────────

    /// Settle an invoice and move its client back to active.
    pub async fn confirm_payment(&self, invoice_number: &str, method: &str) -> BillingResult<PaymentReceipt> {
        let now = self.clock.now();
        let (receipt, effects) = {
            let store = self.store.lock().await;
            store.in_transaction(|s| {
                let invoice = ledger::confirm_payment(s, invoice_number, method, now)?;
                let outcome = lifecycle::transition(
                    s,
                    &self.config,
                    &invoice.client_id,
                    StatusTarget::payment_confirmed(),
                    now,
                )?;
                let receipt = PaymentReceipt {
                    invoice,
                    status_before: outcome.from,
                    status_after:  outcome.to,
                };
                Ok((receipt, outcome.effects))
            })?
        };
        self.dispatcher.dispatch(&self.store, effects, now).await;
        Ok(receipt)
    }
}

fn ensure_unsealed(store: &BillingStore, watermark: &str) -> BillingResult<()> {
    if store.watermark_exists(watermark)? {
        return Err(BillingError::DuplicateBatchRun {
            watermark: watermark.to_string(),
        });
    }
    Ok(())
}
