use rusqlite::{OptionalExtension, params};
use serde::de::DeserializeOwned;
use tracing::debug;

use lever_core::{
    AdmissionDenial, BreachId, EnforcementRecord, LeverError, PolicySnapshot, Result, RunId, ThresholdSignal,
};

use crate::store::{PolicyStore, checksum, db_err, parse_json, to_json, ts};

/// An audit row whose stored checksum no longer matches its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityViolation {
    pub table: &'static str,
    pub id: String,
}

/// Audit tables carrying a `(body, checksum)` pair, with their key column.
const CHECKSUMMED: &[(&str, &str)] = &[
    ("policy_override_records", "id"),
    ("threshold_signals", "id"),
    ("policy_snapshots", "run_id"),
    ("enforcement_actions", "id"),
    ("admission_denials", "id"),
];

impl PolicyStore {
    /// Append a threshold signal. Returns false if the id was already recorded.
    pub fn insert_signal(&self, signal: &ThresholdSignal) -> Result<bool> {
        let body = to_json(signal)?;
        let sum = checksum(&body);
        let db = self.db.lock();
        let rows = db
            .execute(
                "INSERT OR IGNORE INTO threshold_signals
                 (id, run_id, tenant, policy_id, metric, signal_type, created_at, body, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    signal.id.to_string(),
                    signal.run_id.to_string(),
                    signal.tenant,
                    signal.policy_id,
                    signal.metric.as_str(),
                    signal.signal_type.as_str(),
                    ts(signal.created_at),
                    body,
                    sum,
                ],
            )
            .map_err(db_err)?;
        Ok(rows == 1)
    }

    pub fn signals_for_run(&self, run_id: RunId) -> Result<Vec<ThresholdSignal>> {
        self.read_bodies(
            "SELECT body FROM threshold_signals WHERE run_id = ?1 ORDER BY rowid",
            &run_id.to_string(),
        )
    }

    pub fn signals_for_tenant(&self, tenant: &str) -> Result<Vec<ThresholdSignal>> {
        self.read_bodies(
            "SELECT body FROM threshold_signals WHERE tenant = ?1 ORDER BY rowid",
            tenant,
        )
    }

    /// Persist the binding snapshot. A run has at most one; a second insert
    /// for the same run is ignored and returns false.
    pub fn insert_snapshot(&self, snapshot: &PolicySnapshot) -> Result<bool> {
        let body = to_json(snapshot)?;
        let sum = checksum(&body);
        let db = self.db.lock();
        let rows = db
            .execute(
                "INSERT OR IGNORE INTO policy_snapshots
                 (run_id, tenant, policy_id, policy_version, bound_at, body, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    snapshot.run_id.to_string(),
                    snapshot.tenant(),
                    snapshot.policy_id,
                    snapshot.policy_version,
                    ts(snapshot.bound_at),
                    body,
                    sum,
                ],
            )
            .map_err(db_err)?;
        if rows == 0 {
            debug!(run_id = %snapshot.run_id, "snapshot already recorded");
        }
        Ok(rows == 1)
    }

    pub fn snapshot_for_run(&self, run_id: RunId) -> Result<Option<PolicySnapshot>> {
        Ok(self
            .read_bodies(
                "SELECT body FROM policy_snapshots WHERE run_id = ?1",
                &run_id.to_string(),
            )?
            .pop())
    }

    /// Append an enforcement decision. One row per breach id.
    pub fn insert_enforcement(&self, record: &EnforcementRecord) -> Result<bool> {
        let body = to_json(record)?;
        let sum = checksum(&body);
        let db = self.db.lock();
        let rows = db
            .execute(
                "INSERT OR IGNORE INTO enforcement_actions
                 (id, breach_id, run_id, tenant, applied, created_at, body, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.to_string(),
                    record.breach_id.to_string(),
                    record.run_id.to_string(),
                    record.tenant,
                    record.applied.as_str(),
                    ts(record.created_at),
                    body,
                    sum,
                ],
            )
            .map_err(db_err)?;
        Ok(rows == 1)
    }

    pub fn enforcement_for_run(&self, run_id: RunId) -> Result<Vec<EnforcementRecord>> {
        self.read_bodies(
            "SELECT body FROM enforcement_actions WHERE run_id = ?1 ORDER BY rowid",
            &run_id.to_string(),
        )
    }

    pub fn enforcement_for_breach(&self, breach_id: BreachId) -> Result<Option<EnforcementRecord>> {
        let db = self.db.lock();
        let body: Option<String> = db
            .query_row(
                "SELECT body FROM enforcement_actions WHERE breach_id = ?1",
                params![breach_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        body.map(|b| serde_json::from_str(&b).map_err(LeverError::from))
            .transpose()
    }

    pub fn insert_denial(&self, denial: &AdmissionDenial) -> Result<bool> {
        let body = to_json(denial)?;
        let sum = checksum(&body);
        let db = self.db.lock();
        let rows = db
            .execute(
                "INSERT OR IGNORE INTO admission_denials
                 (id, tenant, reason_code, created_at, body, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    denial.id.to_string(),
                    denial.identity.tenant,
                    denial.reason_code,
                    ts(denial.created_at),
                    body,
                    sum,
                ],
            )
            .map_err(db_err)?;
        Ok(rows == 1)
    }

    pub fn denials_for_tenant(&self, tenant: &str) -> Result<Vec<AdmissionDenial>> {
        self.read_bodies(
            "SELECT body FROM admission_denials WHERE tenant = ?1 ORDER BY rowid",
            tenant,
        )
    }

    /// Recompute every audit checksum and report rows that no longer match.
    pub fn verify_integrity(&self) -> Result<Vec<IntegrityViolation>> {
        let db = self.db.lock();
        let mut violations = Vec::new();
        for &(table, key) in CHECKSUMMED {
            let mut stmt = db
                .prepare(&format!("SELECT {key}, body, checksum FROM {table}"))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(db_err)?;
            for row in rows {
                let (id, body, stored) = row.map_err(db_err)?;
                if checksum(&body) != stored {
                    violations.push(IntegrityViolation { table, id });
                }
            }
        }
        Ok(violations)
    }

    fn read_bodies<T: DeserializeOwned>(&self, sql: &str, key: &str) -> Result<Vec<T>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![key], |row| parse_json(0, &row.get::<_, String>(0)?))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<T>>>()
            .map_err(db_err)?;
        Ok(rows)
    }
}
