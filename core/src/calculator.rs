//! Billing calculator: what a client owes, for which period, as of a date.
//!
//! Pure computation: `compute()` takes every input explicitly and never
//! touches storage. `snapshot()` is the read-only convenience that loads
//! those inputs from the store first.

use crate::{
    config::EngineConfig,
    error::{BillingError, BillingResult},
    lifecycle::{ClientStatus, PoolType, StatusHistory},
    store::BillingStore,
    types::{round_cents, ClientId, PackageId, Timestamp},
};
use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Weekly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Weekly => "weekly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(BillingCycle::Monthly),
            "weekly" => Some(BillingCycle::Weekly),
            _ => None,
        }
    }
}

/// Catalog entry; read-only from the engine's point of view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePackage {
    pub package_id:    PackageId,
    pub name:          String,
    pub price:         f64,
    pub billing_cycle: BillingCycle,
    pub active:        bool,
}

impl ServicePackage {
    /// Price of one month of service under this package.
    pub fn monthly_equivalent(&self, weekly_factor: f64) -> f64 {
        match self.billing_cycle {
            BillingCycle::Monthly => self.price,
            BillingCycle::Weekly => round_cents(self.price * weekly_factor),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientBillingProfile {
    pub client_id:         ClientId,
    pub billing_day:       u32,
    /// Negotiated monthly price; 0 means "use the package price".
    pub monthly_fee:       f64,
    pub payment_method:    String,
    pub grace_days:        i64,
    /// Flat late fee; 0 means "use the configured fallback rate".
    pub penalty_fee:       f64,
    pub client_status:     ClientStatus,
    pub next_due_date:     Option<NaiveDate>,
    pub last_payment_date: Option<NaiveDate>,
    pub current_pool:      PoolType,
    pub package_id:        PackageId,
    pub account_active:    bool,
    pub status_history:    StatusHistory,
    pub created_at:        Timestamp,
}

impl ClientBillingProfile {
    /// A freshly subscribed client: active, in the active pool, first due on
    /// the billing day on or after the subscription date.
    pub fn new(
        client_id:   impl Into<ClientId>,
        package_id:  impl Into<PackageId>,
        billing_day: u32,
        created_at:  Timestamp,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            billing_day,
            next_due_date: Some(first_cycle_start(created_at.date_naive(), billing_day)),
            monthly_fee: 0.0,
            payment_method: "cash".into(),
            grace_days: 0,
            penalty_fee: 0.0,
            client_status: ClientStatus::Active,
            last_payment_date: None,
            current_pool: PoolType::Active,
            package_id: package_id.into(),
            account_active: true,
            status_history: StatusHistory::new(),
            created_at,
        }
    }
}

/// Inclusive date range an invoice covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    pub end:   NaiveDate,
}

/// Invoices a client has not settled yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenBalance {
    pub total:      f64,
    pub count:      u32,
    pub oldest_due: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingSnapshot {
    pub client_id:      ClientId,
    pub as_of:          NaiveDate,
    pub period:         BillingPeriod,
    /// Where `next_due_date` moves once this period is invoiced.
    pub next_due_date:  NaiveDate,
    pub base_amount:    f64,
    pub tax_amount:     f64,
    /// Date overdue days are counted from.
    pub due_anchor:     Option<NaiveDate>,
    pub overdue_days:   i64,
    pub grace_days:     i64,
    pub penalty_amount: f64,
    pub open_balance:   f64,
    pub open_invoices:  u32,
}

impl BillingSnapshot {
    pub fn total_amount(&self) -> f64 {
        round_cents(self.base_amount + self.tax_amount)
    }

    /// False when the resolved period starts after the as-of date.
    pub fn is_due(&self) -> bool {
        self.period.start <= self.as_of
    }

    pub fn past_grace(&self) -> bool {
        self.overdue_days > self.grace_days
    }
}

// ── Calendar ─────────────────────────────────────────────────────────────────

/// `day` of the given month, clamped to the month's last day.
pub fn anchored_date(year: i32, month: u32, day: u32) -> NaiveDate {
    let last = last_day_of_month(year, month);
    NaiveDate::from_ymd_opt(year, month, day.clamp(1, last))
        .unwrap_or(NaiveDate::MIN)
}

pub fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

pub fn is_last_day_of_month(date: NaiveDate) -> bool {
    date.day() == last_day_of_month(date.year(), date.month())
}

/// Latest billing-day occurrence on or before `as_of`.
pub fn cycle_start_on_or_before(as_of: NaiveDate, billing_day: u32) -> NaiveDate {
    let this_month = anchored_date(as_of.year(), as_of.month(), billing_day);
    if this_month <= as_of {
        return this_month;
    }
    let (year, month) = previous_month(as_of.year(), as_of.month());
    anchored_date(year, month, billing_day)
}

/// First billing-day occurrence on or after `from`.
pub fn first_cycle_start(from: NaiveDate, billing_day: u32) -> NaiveDate {
    let start = cycle_start_on_or_before(from, billing_day);
    if start == from {
        start
    } else {
        next_cycle_start(start, billing_day)
    }
}

/// Start of the cycle after the one starting at `start`, re-anchored on
/// `billing_day` so a clamped February start returns to the 31st in March.
pub fn next_cycle_start(start: NaiveDate, billing_day: u32) -> NaiveDate {
    let (year, month) = if start.month() == 12 {
        (start.year() + 1, 1)
    } else {
        (start.year(), start.month() + 1)
    };
    anchored_date(year, month, billing_day)
}

pub fn period_starting(start: NaiveDate, billing_day: u32) -> BillingPeriod {
    let next = next_cycle_start(start, billing_day);
    BillingPeriod {
        start,
        end: next.pred_opt().unwrap_or(start).max(start),
    }
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

/// Days after `date` as a plain offset, saturating at the calendar edge.
pub fn add_days(date: NaiveDate, days: i64) -> NaiveDate {
    if days >= 0 {
        date.checked_add_days(Days::new(days as u64)).unwrap_or(NaiveDate::MAX)
    } else {
        date.checked_sub_days(Days::new(days.unsigned_abs())).unwrap_or(NaiveDate::MIN)
    }
}

// ── Penalty rule ─────────────────────────────────────────────────────────────

/// The one penalty rule: the profile's flat fee when set, otherwise the
/// configured share of the monthly charge.
pub fn resolve_penalty(profile: &ClientBillingProfile, monthly_charge: f64, config: &EngineConfig) -> f64 {
    if profile.penalty_fee > 0.0 {
        round_cents(profile.penalty_fee)
    } else {
        round_cents(monthly_charge * config.penalty.fallback_rate)
    }
}

// ── Calculator ───────────────────────────────────────────────────────────────

pub struct BillingCalculator<'a> {
    config: &'a EngineConfig,
}

impl<'a> BillingCalculator<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// Monthly charge before tax.
    pub fn monthly_charge(&self, profile: &ClientBillingProfile, package: &ServicePackage) -> f64 {
        if profile.monthly_fee > 0.0 {
            round_cents(profile.monthly_fee)
        } else {
            package.monthly_equivalent(self.config.weekly_to_monthly_factor)
        }
    }

    pub fn compute(
        &self,
        profile: &ClientBillingProfile,
        package: Option<&ServicePackage>,
        open:    &OpenBalance,
        as_of:   NaiveDate,
    ) -> BillingResult<BillingSnapshot> {
        let package = package.ok_or_else(|| BillingError::PackageMissing {
            client_id:  profile.client_id.clone(),
            package_id: profile.package_id.clone(),
        })?;

        let start = profile
            .next_due_date
            .unwrap_or_else(|| cycle_start_on_or_before(as_of, profile.billing_day));
        let period = period_starting(start, profile.billing_day);
        let next_due_date = next_cycle_start(start, profile.billing_day);

        let base_amount = self.monthly_charge(profile, package);
        let tax_amount = round_cents(base_amount * self.config.tax_rate);

        let due_anchor = match (profile.next_due_date, open.oldest_due) {
            (Some(next), Some(oldest)) => Some(next.min(oldest)),
            (next, oldest) => next.or(oldest),
        };
        let overdue_days = due_anchor
            .map(|anchor| (as_of - anchor).num_days().max(0))
            .unwrap_or(0);

        let penalty_amount = if overdue_days > profile.grace_days {
            resolve_penalty(profile, base_amount, self.config)
        } else {
            0.0
        };

        Ok(BillingSnapshot {
            client_id: profile.client_id.clone(),
            as_of,
            period,
            next_due_date,
            base_amount,
            tax_amount,
            due_anchor,
            overdue_days,
            grace_days: profile.grace_days,
            penalty_amount,
            open_balance: round_cents(open.total),
            open_invoices: open.count,
        })
    }

    /// Load the client's inputs and compute. Reads only.
    pub fn snapshot(
        &self,
        store:     &BillingStore,
        client_id: &str,
        as_of:     NaiveDate,
    ) -> BillingResult<BillingSnapshot> {
        let profile = store
            .get_profile(client_id)?
            .ok_or_else(|| BillingError::ProfileMissing {
                client_id: client_id.to_string(),
            })?;
        let package = store.get_package(&profile.package_id)?;
        let open = store.open_balance(client_id)?;
        self.compute(&profile, package.as_ref(), &open, as_of)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn profile(billing_day: u32) -> ClientBillingProfile {
        let mut p = ClientBillingProfile::new(
            "c1",
            "fiber-50",
            billing_day,
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        );
        p.grace_days = 5;
        p
    }

    fn package(cycle: BillingCycle, price: f64) -> ServicePackage {
        ServicePackage {
            package_id: "fiber-50".into(),
            name: "Fiber 50".into(),
            price,
            billing_cycle: cycle,
            active: true,
        }
    }

    #[test]
    fn short_months_clamp_and_reanchor() {
        assert_eq!(anchored_date(2026, 2, 31), date(2026, 2, 28));
        assert_eq!(next_cycle_start(date(2026, 2, 28), 31), date(2026, 3, 31));
        assert_eq!(cycle_start_on_or_before(date(2026, 3, 10), 31), date(2026, 2, 28));
        assert_eq!(first_cycle_start(date(2026, 2, 28), 31), date(2026, 2, 28));
        assert_eq!(first_cycle_start(date(2026, 2, 27), 31), date(2026, 2, 28));
        assert_eq!(first_cycle_start(date(2026, 3, 10), 1), date(2026, 4, 1));

        let period = period_starting(date(2026, 1, 31), 31);
        assert_eq!(period.end, date(2026, 2, 27));
        assert!(is_last_day_of_month(date(2028, 2, 29)));
    }

    #[test]
    fn weekly_packages_bill_monthly_equivalent() {
        let config = EngineConfig::default_test();
        let calc = BillingCalculator::new(&config);
        let snap = calc
            .compute(&profile(1), Some(&package(BillingCycle::Weekly, 100.0)), &OpenBalance::default(), date(2026, 3, 1))
            .unwrap();
        assert_eq!(snap.base_amount, 433.0);
        assert_eq!(snap.period, BillingPeriod { start: date(2026, 3, 1), end: date(2026, 3, 31) });
        assert_eq!(snap.next_due_date, date(2026, 4, 1));
    }

    #[test]
    fn negotiated_fee_overrides_package_price() {
        let config = EngineConfig::default_test();
        let calc = BillingCalculator::new(&config);
        let mut p = profile(1);
        p.monthly_fee = 500.0;
        let snap = calc
            .compute(&p, Some(&package(BillingCycle::Monthly, 350.0)), &OpenBalance::default(), date(2026, 3, 1))
            .unwrap();
        assert_eq!(snap.base_amount, 500.0);
        assert_eq!(snap.total_amount(), snap.base_amount + snap.tax_amount);
    }

    #[test]
    fn overdue_counts_from_oldest_open_invoice() {
        let config = EngineConfig::default_test();
        let calc = BillingCalculator::new(&config);
        let mut p = profile(1);
        p.monthly_fee = 500.0;
        p.next_due_date = Some(date(2026, 4, 1));
        let open = OpenBalance { total: 500.0, count: 1, oldest_due: Some(date(2026, 3, 1)) };
        let snap = calc
            .compute(&p, Some(&package(BillingCycle::Monthly, 500.0)), &open, date(2026, 3, 9))
            .unwrap();
        assert_eq!(snap.overdue_days, 8);
        assert!(snap.past_grace());
        // No flat fee configured: 5 % of the monthly charge.
        assert_eq!(snap.penalty_amount, 25.0);
        assert!(!snap.is_due());
    }

    #[test]
    fn flat_penalty_fee_wins_and_only_past_grace() {
        let config = EngineConfig::default_test();
        let calc = BillingCalculator::new(&config);
        let mut p = profile(1);
        p.penalty_fee = 40.0;
        p.next_due_date = Some(date(2026, 3, 1));
        let pkg = package(BillingCycle::Monthly, 300.0);

        let within = calc.compute(&p, Some(&pkg), &OpenBalance::default(), date(2026, 3, 4)).unwrap();
        assert_eq!(within.overdue_days, 3);
        assert_eq!(within.penalty_amount, 0.0);

        let past = calc.compute(&p, Some(&pkg), &OpenBalance::default(), date(2026, 3, 7)).unwrap();
        assert_eq!(past.penalty_amount, 40.0);
    }

    #[test]
    fn dangling_package_is_reported() {
        let config = EngineConfig::default_test();
        let calc = BillingCalculator::new(&config);
        let err = calc
            .compute(&profile(1), None, &OpenBalance::default(), date(2026, 3, 1))
            .unwrap_err();
        assert!(matches!(err, BillingError::PackageMissing { .. }));
    }
}
