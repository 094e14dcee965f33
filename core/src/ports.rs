//! Boundaries to the network-control system and the notification channel.
//!
//! Both collaborators are fire-and-forget from the engine's point of view:
//! every call is bounded by the configured port timeout, and a failure is
//! logged and recorded but never undoes a committed state change.

use crate::{
    error::BillingError,
    event::BillingEvent,
    lifecycle::{Effect, PoolType},
    store::{BillingStore, ReminderStatus},
    types::{ClientId, Timestamp},
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

/// Moves a client's connection between address pools. Must be idempotent.
#[async_trait]
pub trait NetworkPoolPort: Send + Sync {
    async fn move_client(&self, client_id: &str, from: PoolType, to: PoolType) -> anyhow::Result<()>;
}

/// Sends payment-overdue notifications.
#[async_trait]
pub trait ReminderPort: Send + Sync {
    async fn notify_overdue(&self, client_id: &str, days_overdue: i64) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolMoveOutcome {
    Ok,
    PoolMoveFailed(String),
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReminderOutcome {
    Sent,
    Failed(String),
    Timeout,
}

/// Tally of one `dispatch` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub pool_moves:        u32,
    pub pool_moves_failed: u32,
    pub reminders_sent:    u32,
    pub reminders_failed:  u32,
}

impl DispatchReport {
    pub fn absorb(&mut self, other: DispatchReport) {
        self.pool_moves += other.pool_moves;
        self.pool_moves_failed += other.pool_moves_failed;
        self.reminders_sent += other.reminders_sent;
        self.reminders_failed += other.reminders_failed;
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

pub struct EffectDispatcher {
    network:   Arc<dyn NetworkPoolPort>,
    reminders: Arc<dyn ReminderPort>,
    timeout:   Duration,
}

impl EffectDispatcher {
    pub fn new(
        network:   Arc<dyn NetworkPoolPort>,
        reminders: Arc<dyn ReminderPort>,
        timeout:   Duration,
    ) -> Self {
        Self {
            network,
            reminders,
            timeout,
        }
    }

    pub async fn move_client(&self, client_id: &str, from: PoolType, to: PoolType) -> PoolMoveOutcome {
        match tokio::time::timeout(self.timeout, self.network.move_client(client_id, from, to)).await {
            Ok(Ok(())) => PoolMoveOutcome::Ok,
            Ok(Err(e)) => PoolMoveOutcome::PoolMoveFailed(format!("{e:#}")),
            Err(_) => PoolMoveOutcome::Timeout,
        }
    }

    pub async fn notify(&self, client_id: &str, days_overdue: i64) -> ReminderOutcome {
        match tokio::time::timeout(self.timeout, self.reminders.notify_overdue(client_id, days_overdue)).await {
            Ok(Ok(())) => ReminderOutcome::Sent,
            Ok(Err(e)) => ReminderOutcome::Failed(format!("{e:#}")),
            Err(_) => ReminderOutcome::Timeout,
        }
    }

    /// Run effects produced by a committed transaction, recording each
    /// outcome. The store lock is taken only between external calls.
    pub async fn dispatch(
        &self,
        store:   &Mutex<BillingStore>,
        effects: Vec<Effect>,
        at:      Timestamp,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        for effect in effects {
            match effect {
                Effect::MovePool { client_id, from, to } => {
                    let outcome = self.move_client(&client_id, from, to).await;
                    let store = store.lock().await;
                    if self.record_pool_move(&store, &client_id, from, to, outcome, at) {
                        report.pool_moves += 1;
                    } else {
                        report.pool_moves_failed += 1;
                    }
                }
                Effect::Remind { client_id, reminder_id, days_overdue } => {
                    let outcome = self.notify(&client_id, days_overdue).await;
                    let status = match &outcome {
                        ReminderOutcome::Sent => {
                            report.reminders_sent += 1;
                            ReminderStatus::Sent
                        }
                        ReminderOutcome::Failed(reason) => {
                            log::warn!("ports: reminder for {client_id} failed: {reason}");
                            report.reminders_failed += 1;
                            ReminderStatus::Failed
                        }
                        ReminderOutcome::Timeout => {
                            log::warn!("ports: reminder for {client_id} timed out");
                            report.reminders_failed += 1;
                            ReminderStatus::Failed
                        }
                    };
                    let store = store.lock().await;
                    if let Err(e) = store.update_reminder_status(&reminder_id, status) {
                        log::warn!("ports: could not record reminder {reminder_id}: {e}");
                    }
                }
            }
        }
        report
    }

    /// Returns true when the move went through.
    fn record_pool_move(
        &self,
        store:     &BillingStore,
        client_id: &ClientId,
        from:      PoolType,
        to:        PoolType,
        outcome:   PoolMoveOutcome,
        at:        Timestamp,
    ) -> bool {
        let reason = match outcome {
            PoolMoveOutcome::Ok => {
                log::info!("ports: client {client_id} moved {from} -> {to}");
                if let Err(e) = store.set_current_pool(client_id, to) {
                    log::warn!("ports: could not record pool for {client_id}: {e}");
                }
                return true;
            }
            PoolMoveOutcome::PoolMoveFailed(reason) => reason,
            PoolMoveOutcome::Timeout => format!("timed out after {} ms", self.timeout.as_millis()),
        };

        let err = BillingError::ExternalPoolMoveFailed {
            client_id: client_id.clone(),
            reason:    reason.clone(),
        };
        log::warn!("ports: {err}");
        let event = BillingEvent::PoolMoveFailed {
            client_id: client_id.clone(),
            from,
            to,
            reason,
        };
        if let Err(e) = store.append_event(at, &event) {
            log::warn!("ports: could not record pool failure for {client_id}: {e}");
        }
        false
    }
}

// ── Logging adapters ─────────────────────────────────────────────────────────

/// Pool port that only logs. Used by the runner when no network controller
/// is wired in.
#[derive(Debug, Default)]
pub struct LoggingNetworkPool;

#[async_trait]
impl NetworkPoolPort for LoggingNetworkPool {
    async fn move_client(&self, client_id: &str, from: PoolType, to: PoolType) -> anyhow::Result<()> {
        log::info!("network: move {client_id} from pool {from} to {to}");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LoggingReminders;

#[async_trait]
impl ReminderPort for LoggingReminders {
    async fn notify_overdue(&self, client_id: &str, days_overdue: i64) -> anyhow::Result<()> {
        log::info!("reminders: {client_id} is {days_overdue} day(s) overdue");
        Ok(())
    }
}

// ── Recording adapters ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMove {
    pub client_id: ClientId,
    pub from:      PoolType,
    pub to:        PoolType,
}

/// In-memory pool port for tests and dry runs. Records successful moves and
/// can be told to fail or stall for given clients.
#[derive(Debug, Default)]
pub struct RecordingNetworkPool {
    moves:   StdMutex<Vec<PoolMove>>,
    failing: StdMutex<HashSet<ClientId>>,
    stall:   StdMutex<Option<Duration>>,
}

impl RecordingNetworkPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, client_id: &str) {
        lock(&self.failing).insert(client_id.to_string());
    }

    pub fn recover(&self, client_id: &str) {
        lock(&self.failing).remove(client_id);
    }

    /// Delay every call by `by` before answering.
    pub fn stall(&self, by: Option<Duration>) {
        *lock(&self.stall) = by;
    }

    pub fn moves(&self) -> Vec<PoolMove> {
        lock(&self.moves).clone()
    }

    pub fn moves_for(&self, client_id: &str) -> Vec<PoolMove> {
        lock(&self.moves)
            .iter()
            .filter(|m| m.client_id == client_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NetworkPoolPort for RecordingNetworkPool {
    async fn move_client(&self, client_id: &str, from: PoolType, to: PoolType) -> anyhow::Result<()> {
        let stall = *lock(&self.stall);
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.failing).contains(client_id) {
            anyhow::bail!("controller rejected move for {client_id}");
        }
        lock(&self.moves).push(PoolMove {
            client_id: client_id.to_string(),
            from,
            to,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReminder {
    pub client_id:    ClientId,
    pub days_overdue: i64,
}

#[derive(Debug, Default)]
pub struct RecordingReminders {
    sent:    StdMutex<Vec<SentReminder>>,
    failing: StdMutex<HashSet<ClientId>>,
}

impl RecordingReminders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, client_id: &str) {
        lock(&self.failing).insert(client_id.to_string());
    }

    pub fn sent(&self) -> Vec<SentReminder> {
        lock(&self.sent).clone()
    }

    pub fn sent_to(&self, client_id: &str) -> Vec<SentReminder> {
        lock(&self.sent)
            .iter()
            .filter(|r| r.client_id == client_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ReminderPort for RecordingReminders {
    async fn notify_overdue(&self, client_id: &str, days_overdue: i64) -> anyhow::Result<()> {
        if lock(&self.failing).contains(client_id) {
            anyhow::bail!("channel unavailable for {client_id}");
        }
        lock(&self.sent).push(SentReminder {
            client_id: client_id.to_string(),
            days_overdue,
        });
        Ok(())
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
