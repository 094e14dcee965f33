use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{BillingError, BillingResult};

/// How penalties are priced when a client runs past grace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenaltyConfig {
    /// Share of the monthly charge used when a profile has no penalty fee.
    pub fallback_rate: f64,
    /// Days between issuing a penalty invoice and its due date.
    pub due_days: i64,
}

/// Default trigger expressions, keyed by job name.
/// Overrides persisted in the job_schedule table win over these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub daily_billing:   String,
    pub overdue_sweep:   String,
    pub auto_reactivate: String,
}

impl ScheduleConfig {
    pub fn as_map(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            (crate::scheduler::DAILY_BILLING_JOB, self.daily_billing.clone()),
            (crate::scheduler::OVERDUE_SWEEP_JOB, self.overdue_sweep.clone()),
            (crate::scheduler::AUTO_REACTIVATE_JOB, self.auto_reactivate.clone()),
        ])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tax applied on top of every invoice amount (0.16 = 16 %).
    pub tax_rate: f64,
    /// Weekly package price multiplier giving a monthly-equivalent charge.
    pub weekly_to_monthly_factor: f64,
    pub penalty: PenaltyConfig,
    /// Channel recorded on payment reminders ("sms", "email", ...).
    pub reminder_channel: String,
    /// Upper bound for any single NetworkPoolPort / ReminderPort call.
    pub port_timeout_ms: u64,
    /// Look-back window of the auto-reactivate sweep.
    pub reactivation_window_hours: i64,
    pub schedule: ScheduleConfig,
}

impl EngineConfig {
    /// Load from `<data_dir>/billing.json`.
    /// In tests, use EngineConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/billing.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BillingResult<()> {
        if !(0.0..=1.0).contains(&self.tax_rate) {
            return Err(BillingError::Config(format!(
                "tax_rate must be within 0..=1, got {}",
                self.tax_rate
            )));
        }
        if self.weekly_to_monthly_factor <= 0.0 {
            return Err(BillingError::Config(
                "weekly_to_monthly_factor must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.penalty.fallback_rate) {
            return Err(BillingError::Config(
                "penalty.fallback_rate must be within 0..=1".into(),
            ));
        }
        if self.penalty.due_days < 1 {
            return Err(BillingError::Config("penalty.due_days must be >= 1".into()));
        }
        if self.port_timeout_ms == 0 {
            return Err(BillingError::Config("port_timeout_ms must be >= 1".into()));
        }
        for (job, expression) in self.schedule.as_map() {
            crate::scheduler::Trigger::parse(&expression).map_err(|e| {
                BillingError::Config(format!("schedule for {job}: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn port_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.port_timeout_ms)
    }

    /// Config with hardcoded defaults for use in tests.
    pub fn default_test() -> Self {
        Self {
            tax_rate: 0.0,
            weekly_to_monthly_factor: 4.33,
            penalty: PenaltyConfig {
                fallback_rate: 0.05,
                due_days: 7,
            },
            reminder_channel: "sms".into(),
            port_timeout_ms: 200,
            reactivation_window_hours: 24,
            schedule: ScheduleConfig {
                daily_billing: "daily at 02:00".into(),
                overdue_sweep: "every 6 hours".into(),
                auto_reactivate: "every 4 hours".into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(EngineConfig::default_test().validate().is_ok());
    }

    #[test]
    fn oversized_interval_is_a_config_error() {
        let mut config = EngineConfig::default_test();
        config.schedule.overdue_sweep = "every 9999999999999 hours".into();
        assert!(matches!(config.validate(), Err(BillingError::Config(_))));
    }
}
