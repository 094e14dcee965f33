//! Job scheduler: named jobs bound to time triggers.
//!
//! The registry owns every job and its run state. Triggers come from the
//! configuration file unless an override was persisted in `job_schedule`.
//! A job that is still running is never fired again; a job that fails or
//! panics is marked failed and the scheduler keeps going.

use crate::{
    clock::Clock,
    error::{BillingError, BillingResult},
    store::BillingStore,
    types::Timestamp,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub const DAILY_BILLING_JOB: &str = "daily_billing";
pub const OVERDUE_SWEEP_JOB: &str = "overdue_sweep";
pub const AUTO_REACTIVATE_JOB: &str = "auto_reactivate";

// ── Triggers ─────────────────────────────────────────────────────────────────

/// Longest accepted `every N ...` interval.
const MAX_INTERVAL_DAYS: i64 = 366;

/// When a job fires. All times are UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// `daily at HH:MM`
    DailyAt { hour: u32, minute: u32 },
    /// `every N hours` / `every N minutes`, aligned to the Unix epoch.
    Every(Duration),
}

impl Trigger {
    pub fn parse(expression: &str) -> BillingResult<Self> {
        let invalid = |reason: &str| BillingError::InvalidTrigger {
            expression: expression.to_string(),
            reason:     reason.to_string(),
        };
        let lowered = expression.trim().to_ascii_lowercase();
        let words: Vec<&str> = lowered.split_whitespace().collect();

        match words.as_slice() {
            ["daily", "at", time] => {
                let (h, m) = time.split_once(':').ok_or_else(|| invalid("expected HH:MM"))?;
                let hour: u32 = h.parse().map_err(|_| invalid("hour is not a number"))?;
                let minute: u32 = m.parse().map_err(|_| invalid("minute is not a number"))?;
                if hour > 23 || minute > 59 {
                    return Err(invalid("time of day out of range"));
                }
                Ok(Trigger::DailyAt { hour, minute })
            }
            ["every", n, unit] => {
                let n: i64 = n.parse().map_err(|_| invalid("interval is not a number"))?;
                if n < 1 {
                    return Err(invalid("interval must be at least 1"));
                }
                let interval = match *unit {
                    "hour" | "hours" => Duration::try_hours(n),
                    "minute" | "minutes" => Duration::try_minutes(n),
                    _ => return Err(invalid("unit must be hours or minutes")),
                };
                match interval {
                    Some(interval) if interval <= Duration::days(MAX_INTERVAL_DAYS) => Ok(Trigger::Every(interval)),
                    _ => Err(invalid("interval too large")),
                }
            }
            _ => Err(invalid("expected 'daily at HH:MM' or 'every N hours|minutes'")),
        }
    }

    /// Latest firing at or before `at`.
    pub fn last_at_or_before(&self, at: Timestamp) -> Timestamp {
        match *self {
            Trigger::DailyAt { hour, minute } => {
                let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
                let today = at.date_naive().and_time(time).and_utc();
                if today <= at {
                    today
                } else {
                    today - Duration::days(1)
                }
            }
            Trigger::Every(interval) => {
                let step = interval.num_seconds().max(1);
                let last = at.timestamp().div_euclid(step) * step;
                DateTime::<Utc>::from_timestamp(last, 0).unwrap_or(at)
            }
        }
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: Timestamp) -> Timestamp {
        match *self {
            Trigger::DailyAt { hour, minute } => {
                let at = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
                let today = after.date_naive().and_time(at).and_utc();
                if today > after {
                    today
                } else {
                    today + Duration::days(1)
                }
            }
            Trigger::Every(interval) => {
                let step = interval.num_seconds().max(1);
                let next = (after.timestamp().div_euclid(step) + 1) * step;
                DateTime::<Utc>::from_timestamp(next, 0).unwrap_or_else(|| after + interval)
            }
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::DailyAt { hour, minute } => write!(f, "daily at {hour:02}:{minute:02}"),
            Trigger::Every(interval) => {
                let minutes = interval.num_minutes();
                if minutes % 60 == 0 {
                    write!(f, "every {} hours", minutes / 60)
                } else {
                    write!(f, "every {minutes} minutes")
                }
            }
        }
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &'static str;

    /// Execute once. The returned string is a short summary for the run log.
    async fn run(&self, now: Timestamp) -> BillingResult<String>;

    /// True when the firing due at `scheduled_at` never happened and should
    /// run as soon as the job is registered.
    async fn missed_run(&self, _scheduled_at: Timestamp) -> BillingResult<bool> {
        Ok(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Observable state of one registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobState {
    pub name:        String,
    pub trigger:     String,
    pub status:      JobStatus,
    pub last_run:    Option<Timestamp>,
    pub duration_ms: Option<i64>,
    pub last_detail: Option<String>,
    pub next_due:    Timestamp,
}

struct RegisteredJob {
    job:     Arc<dyn ScheduledJob>,
    trigger: Trigger,
    state:   JobState,
}

#[derive(Default)]
struct JobRegistry {
    jobs: BTreeMap<String, RegisteredJob>,
}

// ── Scheduler ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Scheduler {
    store:    Arc<Mutex<BillingStore>>,
    clock:    Arc<dyn Clock>,
    registry: Arc<Mutex<JobRegistry>>,
}

impl Scheduler {
    pub fn new(store: Arc<Mutex<BillingStore>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            registry: Arc::new(Mutex::new(JobRegistry::default())),
        }
    }

    /// Register `job` under its own name. A persisted override wins over
    /// `default_expression`. A firing missed earlier the same UTC day is due
    /// immediately.
    pub async fn register(&self, job: Arc<dyn ScheduledJob>, default_expression: &str) -> BillingResult<()> {
        let name = job.name().to_string();
        let expression = {
            let store = self.store.lock().await;
            store
                .job_schedule_overrides()?
                .remove(&name)
                .unwrap_or_else(|| default_expression.to_string())
        };
        let trigger = Trigger::parse(&expression)?;
        let now = self.clock.now();
        let mut next_due = trigger.next_after(now);
        let last = trigger.last_at_or_before(now);
        if last.date_naive() == now.date_naive() && job.missed_run(last).await? {
            log::warn!("scheduler: {name} missed its run at {last}, due now");
            next_due = now;
        }

        log::info!("scheduler: registered {name} ({trigger}), next run {next_due}");
        let state = JobState {
            name: name.clone(),
            trigger: trigger.to_string(),
            status: JobStatus::Pending,
            last_run: None,
            duration_ms: None,
            last_detail: None,
            next_due,
        };
        self.registry
            .lock()
            .await
            .jobs
            .insert(name, RegisteredJob { job, trigger, state });
        Ok(())
    }

    /// Change a job's trigger and persist the override.
    pub async fn set_trigger(&self, name: &str, expression: &str) -> BillingResult<()> {
        let trigger = Trigger::parse(expression)?;
        let now = self.clock.now();
        let mut registry = self.registry.lock().await;
        let entry = registry
            .jobs
            .get_mut(name)
            .ok_or_else(|| BillingError::JobNotFound { name: name.to_string() })?;
        {
            let store = self.store.lock().await;
            store.upsert_job_schedule(name, &trigger.to_string(), now)?;
        }
        entry.trigger = trigger;
        entry.state.trigger = trigger.to_string();
        entry.state.next_due = trigger.next_after(now);
        log::info!("scheduler: {name} now runs {trigger}");
        Ok(())
    }

    pub async fn states(&self) -> Vec<JobState> {
        self.registry
            .lock()
            .await
            .jobs
            .values()
            .map(|j| j.state.clone())
            .collect()
    }

    pub async fn state(&self, name: &str) -> Option<JobState> {
        self.registry.lock().await.jobs.get(name).map(|j| j.state.clone())
    }

    /// Start every job whose trigger is due and that is not already running.
    /// Returns the spawned runs by job name.
    pub async fn fire_due(&self) -> Vec<(String, JoinHandle<()>)> {
        let now = self.clock.now();
        let mut due = Vec::new();
        {
            let mut registry = self.registry.lock().await;
            for (name, entry) in registry.jobs.iter_mut() {
                if entry.state.next_due > now {
                    continue;
                }
                if entry.state.status == JobStatus::Running {
                    log::debug!("scheduler: {name} still running, not fired");
                    continue;
                }
                entry.state.status = JobStatus::Running;
                entry.state.next_due = entry.trigger.next_after(now);
                due.push((name.clone(), entry.job.clone()));
            }
        }

        due.into_iter()
            .map(|(name, job)| {
                let this = self.clone();
                let task_name = name.clone();
                (name, tokio::spawn(async move { this.execute(task_name, job, now).await }))
            })
            .collect()
    }

    /// Fire due jobs and wait for them. Returns the names that ran.
    pub async fn run_due(&self) -> Vec<String> {
        let mut ran = Vec::new();
        for (name, handle) in self.fire_due().await {
            if let Err(e) = handle.await {
                log::error!("scheduler: task for {name} aborted: {e}");
            }
            ran.push(name);
        }
        ran
    }

    /// Run one job immediately, regardless of its trigger.
    pub async fn run_now(&self, name: &str) -> BillingResult<JobState> {
        let now = self.clock.now();
        let job = {
            let mut registry = self.registry.lock().await;
            let entry = registry
                .jobs
                .get_mut(name)
                .ok_or_else(|| BillingError::JobNotFound { name: name.to_string() })?;
            if entry.state.status == JobStatus::Running {
                log::warn!("scheduler: {name} already running");
                return Ok(entry.state.clone());
            }
            entry.state.status = JobStatus::Running;
            entry.job.clone()
        };
        self.execute(name.to_string(), job, now).await;
        self.state(name)
            .await
            .ok_or_else(|| BillingError::JobNotFound { name: name.to_string() })
    }

    /// Poll triggers every `poll` until shutdown is requested.
    pub fn start(&self, poll: std::time::Duration) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let this = self.clone();
        let task = tokio::spawn(async move {
            log::info!("scheduler: started");
            let mut ticker = tokio::time::interval(poll);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        this.fire_due().await;
                    }
                }
            }
            log::info!("scheduler: stopped");
        });
        SchedulerHandle { shutdown_tx, task }
    }

    async fn execute(&self, name: String, job: Arc<dyn ScheduledJob>, now: Timestamp) {
        let run_id = {
            let store = self.store.lock().await;
            match store.insert_job_run(&name, now) {
                Ok(id) => Some(id),
                Err(e) => {
                    log::warn!("scheduler: could not record start of {name}: {e}");
                    None
                }
            }
        };

        log::info!("scheduler: {name} started");
        let started = std::time::Instant::now();
        // A panic inside the job surfaces as a JoinError here.
        let outcome = tokio::spawn(async move { job.run(now).await }).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let (status, detail) = match outcome {
            Ok(Ok(detail)) => {
                log::info!("scheduler: {name} completed in {duration_ms} ms: {detail}");
                (JobStatus::Completed, detail)
            }
            Ok(Err(e)) => {
                log::error!("scheduler: {name} failed after {duration_ms} ms: {e}");
                (JobStatus::Failed, e.to_string())
            }
            Err(e) => {
                log::error!("scheduler: {name} panicked after {duration_ms} ms: {e}");
                (JobStatus::Failed, format!("panicked: {e}"))
            }
        };

        if let Some(id) = run_id {
            let store = self.store.lock().await;
            if let Err(e) = store.finish_job_run(id, status.as_str(), duration_ms, &detail) {
                log::warn!("scheduler: could not record end of {name}: {e}");
            }
        }

        let mut registry = self.registry.lock().await;
        if let Some(entry) = registry.jobs.get_mut(&name) {
            entry.state.status = status;
            entry.state.last_run = Some(now);
            entry.state.duration_ms = Some(duration_ms);
            entry.state.last_detail = Some(detail);
        }
    }
}

pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    task:        JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop polling and wait for the loop to exit. Jobs already running
    /// finish on their own tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            log::error!("scheduler: loop ended abnormally: {e}");
        }
    }
}
