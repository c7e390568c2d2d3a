use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use lever_core::{Metric, Result};

use crate::store::{PolicyStore, db_err, ts};

impl PolicyStore {
    /// Atomically add `delta` to a shared budget counter and return the new total.
    /// The counter is created on first use.
    pub fn add_to_budget(
        &self,
        tenant: &str,
        policy_id: &str,
        metric: Metric,
        window_key: &str,
        delta: f64,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        let db = self.db.lock();
        db.query_row(
            "INSERT INTO budget_counters (tenant, policy_id, metric, window_key, total, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(tenant, policy_id, metric, window_key)
             DO UPDATE SET total = total + excluded.total, updated_at = excluded.updated_at
             RETURNING total",
            params![tenant, policy_id, metric.as_str(), window_key, delta, ts(now)],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    pub fn budget_total(
        &self,
        tenant: &str,
        policy_id: &str,
        metric: Metric,
        window_key: &str,
    ) -> Result<f64> {
        let db = self.db.lock();
        let total: Option<f64> = db
            .query_row(
                "SELECT total FROM budget_counters
                 WHERE tenant = ?1 AND policy_id = ?2 AND metric = ?3 AND window_key = ?4",
                params![tenant, policy_id, metric.as_str(), window_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(total.unwrap_or(0.0))
    }
}
