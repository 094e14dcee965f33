use super::BillingStore;
use crate::{error::BillingResult, types::Timestamp};
use rusqlite::params;
use serde::Serialize;
use std::collections::BTreeMap;

/// One persisted execution of a scheduled job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRunRecord {
    pub id:          i64,
    pub job_name:    String,
    pub started_at:  Timestamp,
    pub status:      String,
    pub duration_ms: Option<i64>,
    pub detail:      Option<String>,
}

impl BillingStore {
    // ── Job schedule overrides ─────────────────────────────────

    pub fn upsert_job_schedule(
        &self,
        job_name:   &str,
        expression: &str,
        at:         Timestamp,
    ) -> BillingResult<()> {
        self.conn.execute(
            "INSERT INTO job_schedule (job_name, expression, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(job_name) DO UPDATE SET
                expression = excluded.expression,
                updated_at = excluded.updated_at",
            params![job_name, expression, at],
        )?;
        Ok(())
    }

    pub fn job_schedule_overrides(&self) -> BillingResult<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT job_name, expression FROM job_schedule")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(rows)
    }

    // ── Job runs ───────────────────────────────────────────────

    pub fn insert_job_run(&self, job_name: &str, started_at: Timestamp) -> BillingResult<i64> {
        self.conn.execute(
            "INSERT INTO job_run (job_name, started_at, status) VALUES (?1, ?2, 'running')",
            params![job_name, started_at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn finish_job_run(
        &self,
        run_id:      i64,
        status:      &str,
        duration_ms: i64,
        detail:      &str,
    ) -> BillingResult<()> {
        self.conn.execute(
            "UPDATE job_run SET status = ?2, duration_ms = ?3, detail = ?4 WHERE id = ?1",
            params![run_id, status, duration_ms, detail],
        )?;
        Ok(())
    }

    pub fn job_runs(&self, job_name: &str) -> BillingResult<Vec<JobRunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, job_name, started_at, status, duration_ms, detail
             FROM job_run WHERE job_name = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![job_name], |row| {
                Ok(JobRunRecord {
                    id:          row.get(0)?,
                    job_name:    row.get(1)?,
                    started_at:  row.get(2)?,
                    status:      row.get(3)?,
                    duration_ms: row.get(4)?,
                    detail:      row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
