use super::{json_column, text_enum, BillingStore};
use crate::{
    calculator::{is_last_day_of_month, BillingCycle, ClientBillingProfile, ServicePackage},
    error::BillingResult,
    lifecycle::{ClientStatus, PoolType, StatusHistory},
    types::ClientId,
};
use chrono::{Datelike, NaiveDate};
use rusqlite::{params, OptionalExtension, Row};

const PROFILE_COLUMNS: &str = "client_id, billing_day, monthly_fee, payment_method, grace_days,
    penalty_fee, client_status, next_due_date, last_payment_date, current_pool,
    package_id, account_active, status_history, created_at";

impl BillingStore {
    // ── Package catalog ────────────────────────────────────────

    pub fn upsert_package(&self, package: &ServicePackage) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO service_package (package_id, name, price, billing_cycle, active)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(package_id) DO UPDATE SET
                name = excluded.name,
                price = excluded.price,
                billing_cycle = excluded.billing_cycle,
                active = excluded.active",
            params![
                package.package_id,
                package.name,
                package.price,
                package.billing_cycle.as_str(),
                package.active,
            ],
        )?;
        Ok(())
    }

    pub fn get_package(&self, package_id: &str) -> BillingResult<Option<ServicePackage>> {
        let package = self
            .conn
            .query_row(
                "SELECT package_id, name, price, billing_cycle, active
                 FROM service_package WHERE package_id = ?1",
                params![package_id],
                |row| {
                    Ok(ServicePackage {
                        package_id:    row.get(0)?,
                        name:          row.get(1)?,
                        price:         row.get(2)?,
                        billing_cycle: text_enum(row, 3, BillingCycle::parse)?,
                        active:        row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(package)
    }

    /// Remove a catalog entry. Profiles pointing at it are left dangling.
    pub fn delete_package(&self, package_id: &str) -> BillingResult<()> {
        self.conn.execute(
            "DELETE FROM service_package WHERE package_id = ?1",
            params![package_id],
        )?;
        Ok(())
    }

    // ── Profiles ───────────────────────────────────────────────

    pub fn insert_profile(&self, p: &ClientBillingProfile) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO client_profile (
                client_id, billing_day, monthly_fee, payment_method, grace_days,
                penalty_fee, client_status, next_due_date, last_payment_date, current_pool,
                package_id, account_active, status_history, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                p.client_id,
                p.billing_day,
                p.monthly_fee,
                p.payment_method,
                p.grace_days,
                p.penalty_fee,
                p.client_status.as_str(),
                p.next_due_date,
                p.last_payment_date,
                p.current_pool.as_str(),
                p.package_id,
                p.account_active,
                p.status_history.to_json()?,
                p.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, client_id: &str) -> BillingResult<Option<ClientBillingProfile>> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM client_profile WHERE client_id = ?1");
        let profile = self
            .conn
            .query_row(&sql, params![client_id], profile_from_row)
            .optional()?;
        Ok(profile)
    }

    pub fn update_profile_status(
        &self,
        client_id: &str,
        status:    ClientStatus,
        history:   &StatusHistory,
    ) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE client_profile SET client_status = ?2, status_history = ?3
             WHERE client_id = ?1",
            params![client_id, status.as_str(), history.to_json()?],
        )?;
        Ok(())
    }

    /// Move `next_due_date` forward; never backward.
    pub fn advance_next_due_date(&self, client_id: &str, to: NaiveDate) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE client_profile SET next_due_date = ?2
             WHERE client_id = ?1 AND (next_due_date IS NULL OR next_due_date < ?2)",
            params![client_id, to],
        )?;
        Ok(())
    }

    /// Overwrite `next_due_date`, e.g. when importing a client mid-cycle.
    pub fn set_next_due_date(&self, client_id: &str, to: Option<NaiveDate>) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE client_profile SET next_due_date = ?2 WHERE client_id = ?1",
            params![client_id, to],
        )?;
        Ok(())
    }

    pub fn set_last_payment_date(&self, client_id: &str, date: NaiveDate) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE client_profile SET last_payment_date = ?2 WHERE client_id = ?1",
            params![client_id, date],
        )?;
        Ok(())
    }

    pub fn set_current_pool(&self, client_id: &str, pool: PoolType) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE client_profile SET current_pool = ?2 WHERE client_id = ?1",
            params![client_id, pool.as_str()],
        )?;
        Ok(())
    }

    pub fn set_account_active(&self, client_id: &str, active: bool) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE client_profile SET account_active = ?2 WHERE client_id = ?1",
            params![client_id, active],
        )?;
        Ok(())
    }

    /// Clients the daily batch should look at for `as_of`: billing day is
    /// today (or falls past the end of a short month), or the next due date
    /// has already arrived.
    ///
    /// Only enabled accounts are returned. Clients on an inactive package are
    /// left out; clients whose package row is missing are kept so the batch
    /// reports them.
    pub fn billing_candidates(&self, as_of: NaiveDate) -> BillingResult<Vec<ClientId>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.client_id
             FROM client_profile p
             LEFT JOIN service_package s ON s.package_id = p.package_id
             WHERE p.account_active = 1
               AND (s.package_id IS NULL OR s.active = 1)
               AND (p.billing_day = ?1
                    OR (?2 = 1 AND p.billing_day > ?1)
                    OR (p.next_due_date IS NOT NULL AND p.next_due_date <= ?3))
             ORDER BY p.client_id",
        )?;
        let ids = stmt
            .query_map(
                params![as_of.day(), is_last_day_of_month(as_of), as_of],
                |row| row.get(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Enabled clients that are behind: the next due date has passed or an
    /// invoice is still open past its due date. Input of the overdue sweep.
    pub fn overdue_client_ids(&self, today: NaiveDate) -> BillingResult<Vec<ClientId>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.client_id
             FROM client_profile p
             WHERE p.account_active = 1
               AND ((p.next_due_date IS NOT NULL AND p.next_due_date < ?1)
                    OR EXISTS (SELECT 1 FROM invoice i
                               WHERE i.client_id = p.client_id
                                 AND i.status IN ('pending', 'overdue')
                                 AND i.due_date < ?1))
             ORDER BY p.client_id",
        )?;
        let ids = stmt
            .query_map(params![today], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Enabled clients whose recorded pool disagrees with their status.
    pub fn drifted_pool_client_ids(&self) -> BillingResult<Vec<ClientId>> {
        let mut stmt = self.conn.prepare(
            "SELECT client_id FROM client_profile
             WHERE account_active = 1 AND current_pool != client_status
             ORDER BY client_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn count_profiles_by_status(&self, status: ClientStatus) -> BillingResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM client_profile WHERE client_status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<ClientBillingProfile> {
    Ok(ClientBillingProfile {
        client_id:         row.get(0)?,
        billing_day:       row.get(1)?,
        monthly_fee:       row.get(2)?,
        payment_method:    row.get(3)?,
        grace_days:        row.get(4)?,
        penalty_fee:       row.get(5)?,
        client_status:     text_enum(row, 6, ClientStatus::parse)?,
        next_due_date:     row.get(7)?,
        last_payment_date: row.get(8)?,
        current_pool:      text_enum(row, 9, PoolType::parse)?,
        package_id:        row.get(10)?,
        account_active:    row.get(11)?,
        status_history:    json_column(row, 12, StatusHistory::from_json)?,
        created_at:        row.get(13)?,
    })
}
