//! Client service-state machine.
//!
//! States: active → suspended → cut_service, and back to active on payment.
//! There is no terminal state.
//!
//! RULES:
//!   - `client_status` is written only by `transition()`.
//!   - A transition persists first and emits effects second. Effects (pool
//!     moves, reminders) are dispatched by the caller after commit, so an
//!     external call never runs inside a database transaction and its
//!     failure never rolls the status back.

use crate::{
    config::EngineConfig,
    error::{BillingError, BillingResult},
    event::BillingEvent,
    store::BillingStore,
    types::{ClientId, Timestamp},
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Entries kept per profile; older ones fall off the ring.
pub const STATUS_HISTORY_CAPACITY: usize = 10;

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Active,
    Suspended,
    CutService,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Active => "active",
            ClientStatus::Suspended => "suspended",
            ClientStatus::CutService => "cut_service",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ClientStatus::Active),
            "suspended" => Some(ClientStatus::Suspended),
            "cut_service" => Some(ClientStatus::CutService),
            _ => None,
        }
    }

    /// Network pool a client in this state must live in.
    pub fn pool_type(&self) -> PoolType {
        match self {
            ClientStatus::Active => PoolType::Active,
            ClientStatus::Suspended => PoolType::Suspended,
            ClientStatus::CutService => PoolType::CutService,
        }
    }

    /// Ordering used by sweeps that may only escalate.
    pub fn severity(&self) -> u8 {
        match self {
            ClientStatus::Active => 0,
            ClientStatus::Suspended => 1,
            ClientStatus::CutService => 2,
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    Active,
    Suspended,
    CutService,
}

impl PoolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolType::Active => "active",
            PoolType::Suspended => "suspended",
            PoolType::CutService => "cut_service",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(PoolType::Active),
            "suspended" => Some(PoolType::Suspended),
            "cut_service" => Some(PoolType::CutService),
            _ => None,
        }
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub at:     Timestamp,
    pub from:   ClientStatus,
    pub to:     ClientStatus,
    pub reason: String,
}

/// Fixed-capacity ring of the most recent status changes, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusHistory {
    entries: VecDeque<StatusChange>,
}

impl StatusHistory {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(STATUS_HISTORY_CAPACITY),
        }
    }

    /// Rebuild from persisted entries, keeping only the newest ones.
    pub fn from_entries(entries: Vec<StatusChange>) -> Self {
        let mut history = Self::new();
        for entry in entries {
            history.push(entry);
        }
        history
    }

    pub fn push(&mut self, change: StatusChange) {
        if self.entries.len() == STATUS_HISTORY_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(change);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&StatusChange> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StatusChange> {
        self.entries.iter()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.entries)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let entries: Vec<StatusChange> = serde_json::from_str(json)?;
        Ok(Self::from_entries(entries))
    }
}

impl Default for StatusHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Requested destination of a transition.
#[derive(Debug, Clone)]
pub struct StatusTarget {
    pub status:       ClientStatus,
    pub reason:       String,
    /// Overdue days at decision time; carried onto any reminder.
    pub days_overdue: i64,
}

impl StatusTarget {
    pub fn new(status: ClientStatus, reason: impl Into<String>, days_overdue: i64) -> Self {
        Self {
            status,
            reason: reason.into(),
            days_overdue,
        }
    }

    /// Payment confirmation moves any state back to active.
    pub fn payment_confirmed() -> Self {
        Self::new(ClientStatus::Active, "payment confirmed", 0)
    }
}

/// Work for external collaborators, dispatched after commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    MovePool {
        client_id: ClientId,
        from:      PoolType,
        to:        PoolType,
    },
    Remind {
        client_id:    ClientId,
        reminder_id:  String,
        days_overdue: i64,
    },
}

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub client_id: ClientId,
    pub from:      ClientStatus,
    pub to:        ClientStatus,
    pub changed:   bool,
    pub effects:   Vec<Effect>,
}

// ── Policy ───────────────────────────────────────────────────────────────────

/// Status a client should hold given how late they are.
pub fn target_status(overdue_days: i64, grace_days: i64) -> ClientStatus {
    if overdue_days <= 0 {
        ClientStatus::Active
    } else if overdue_days <= grace_days {
        ClientStatus::Suspended
    } else {
        ClientStatus::CutService
    }
}

// ── Transitions ──────────────────────────────────────────────────────────────

/// Move a client to `target.status`.
///
/// No-op when the client already holds that status. Otherwise persists the
/// new status with a history entry, and returns a pool-move effect plus, for
/// suspensions, a reminder effect (unless one is suppressed).
pub fn transition(
    store:     &BillingStore,
    config:    &EngineConfig,
    client_id: &str,
    target:    StatusTarget,
    at:        Timestamp,
) -> BillingResult<TransitionOutcome> {
    store.in_transaction(|s| {
        let profile = s
            .get_profile(client_id)?
            .ok_or_else(|| BillingError::ProfileMissing {
                client_id: client_id.to_string(),
            })?;

        let from = profile.client_status;
        if from == target.status {
            return Ok(TransitionOutcome {
                client_id: client_id.to_string(),
                from,
                to: from,
                changed: false,
                effects: Vec::new(),
            });
        }

        let mut history = profile.status_history;
        history.push(StatusChange {
            at,
            from,
            to: target.status,
            reason: target.reason.clone(),
        });
        s.update_profile_status(client_id, target.status, &history)?;
        s.append_event(
            at,
            &BillingEvent::StatusChanged {
                client_id: client_id.to_string(),
                from,
                to: target.status,
                reason: target.reason.clone(),
            },
        )?;

        log::info!(
            "lifecycle: client {client_id} {from} -> {} ({})",
            target.status,
            target.reason
        );

        let mut effects = vec![Effect::MovePool {
            client_id: client_id.to_string(),
            from:      profile.current_pool,
            to:        target.status.pool_type(),
        }];

        if target.status == ClientStatus::Suspended {
            if let Some(remind) = request_reminder(s, config, client_id, target.days_overdue, at)? {
                effects.push(remind);
            }
        }

        Ok(TransitionOutcome {
            client_id: client_id.to_string(),
            from,
            to: target.status,
            changed: true,
            effects,
        })
    })
}

/// Queue an overdue reminder for `client_id`.
///
/// Suppressed (returns `None`) while another reminder queued today is still
/// pending, or when one was already sent today.
pub fn request_reminder(
    store:        &BillingStore,
    config:       &EngineConfig,
    client_id:    &str,
    days_overdue: i64,
    at:           Timestamp,
) -> BillingResult<Option<Effect>> {
    store.in_transaction(|s| {
        let today = at.date_naive();
        if s.has_pending_reminder(client_id, today)? || s.reminder_sent_on(client_id, today)? {
            log::debug!("lifecycle: reminder for {client_id} suppressed");
            return Ok(None);
        }

        let reminder_id = uuid::Uuid::new_v4().to_string();
        s.insert_reminder(
            &reminder_id,
            client_id,
            &config.reminder_channel,
            days_overdue,
            at,
        )?;
        s.append_event(
            at,
            &BillingEvent::ReminderQueued {
                client_id: client_id.to_string(),
                reminder_id: reminder_id.clone(),
                days_overdue,
            },
        )?;

        Ok(Some(Effect::Remind {
            client_id: client_id.to_string(),
            reminder_id,
            days_overdue,
        }))
    })
}

/// Pool-move effect for a client whose recorded pool no longer matches its
/// status, typically left behind by an earlier failed move.
pub fn pool_drift(client_id: &str, status: ClientStatus, current_pool: PoolType) -> Option<Effect> {
    let wanted = status.pool_type();
    (wanted != current_pool).then(|| Effect::MovePool {
        client_id: client_id.to_string(),
        from:      current_pool,
        to:        wanted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn policy_table_with_five_grace_days() {
        assert_eq!(target_status(0, 5), ClientStatus::Active);
        assert_eq!(target_status(3, 5), ClientStatus::Suspended);
        assert_eq!(target_status(5, 5), ClientStatus::Suspended);
        assert_eq!(target_status(6, 5), ClientStatus::CutService);
    }

    #[test]
    fn zero_grace_cuts_on_first_overdue_day() {
        assert_eq!(target_status(1, 0), ClientStatus::CutService);
    }

    #[test]
    fn history_ring_keeps_newest_entries() {
        let mut history = StatusHistory::new();
        for i in 0..15u32 {
            history.push(StatusChange {
                at: Utc.with_ymd_and_hms(2026, 1, 1, 0, i, 0).unwrap(),
                from: ClientStatus::Active,
                to: ClientStatus::Suspended,
                reason: format!("change {i}"),
            });
        }
        assert_eq!(history.len(), STATUS_HISTORY_CAPACITY);
        assert_eq!(history.iter().next().unwrap().reason, "change 5");
        assert_eq!(history.latest().unwrap().reason, "change 14");

        let restored = StatusHistory::from_json(&history.to_json().unwrap()).unwrap();
        assert_eq!(restored, history);
    }

    #[test]
    fn drift_only_when_pool_disagrees() {
        assert!(pool_drift("c1", ClientStatus::Active, PoolType::Active).is_none());
        assert_eq!(
            pool_drift("c1", ClientStatus::CutService, PoolType::Suspended),
            Some(Effect::MovePool {
                client_id: "c1".into(),
                from: PoolType::Suspended,
                to: PoolType::CutService,
            })
        );
    }
}
