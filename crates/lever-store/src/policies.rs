use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;
use tracing::info;
use uuid::Uuid;

use lever_core::{
    AlertConfig, ChannelType, Limit, LeverError, Metric, MonitorConfig, NegativeCapability,
    Policy, PolicyDraft, PolicyPrecedence, PolicyScope, Result,
};

use crate::store::{PolicyStore, db_err, parse_json, parse_text, parse_ts, to_json, ts};

/// Head pointer row: which version is current and whether the policy is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyHead {
    pub policy_id: String,
    pub tenant: String,
    pub current_version: u32,
    pub active: bool,
}

impl PolicyStore {
    /// Create version 1 of a new policy.
    ///
    /// Rejected when an active policy of the same tenant and scope type
    /// shares an identifier and a priority with it, since precedence could
    /// not order the two.
    pub fn create_policy(&self, draft: PolicyDraft, now: DateTime<Utc>) -> Result<Policy> {
        let policy = Policy {
            id: draft.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            version: 1,
            name: draft.name,
            scope: draft.scope,
            precedence: draft.precedence,
            monitor: draft.monitor,
            limits: draft.limits,
            alerts: draft.alerts,
            created_at: now,
        };
        if policy.name.trim().is_empty() {
            return Err(LeverError::invalid("name", "policy name is empty"));
        }
        policy.validate()?;

        let mut db = self.db.lock();
        let tx = db.transaction().map_err(db_err)?;
        if read_head(&tx, &policy.id).map_err(db_err)?.is_some() {
            return Err(LeverError::invalid(
                "id",
                format!("policy '{}' already exists", policy.id),
            ));
        }
        check_overlap(&tx, &policy)?;
        tx.execute(
            "INSERT INTO policy_heads (policy_id, tenant, current_version, active, created_at, updated_at)
             VALUES (?1, ?2, 1, 1, ?3, ?3)",
            params![policy.id, policy.tenant(), ts(now)],
        )
        .map_err(db_err)?;
        write_version(&tx, &policy)?;
        tx.commit().map_err(db_err)?;

        info!(policy_id = %policy.id, tenant = %policy.tenant(), "policy created");
        Ok(policy)
    }

    pub fn update_scope(&self, id: &str, scope: PolicyScope, now: DateTime<Utc>) -> Result<Policy> {
        self.revise(id, now, |p| p.scope = scope)
    }

    pub fn update_precedence(
        &self,
        id: &str,
        precedence: PolicyPrecedence,
        now: DateTime<Utc>,
    ) -> Result<Policy> {
        self.revise(id, now, |p| p.precedence = precedence)
    }

    pub fn update_monitor(
        &self,
        id: &str,
        monitor: MonitorConfig,
        now: DateTime<Utc>,
    ) -> Result<Policy> {
        self.revise(id, now, |p| p.monitor = monitor)
    }

    pub fn update_limits(&self, id: &str, limits: Vec<Limit>, now: DateTime<Utc>) -> Result<Policy> {
        self.revise(id, now, |p| p.limits = limits)
    }

    pub fn update_alerts(&self, id: &str, alerts: AlertConfig, now: DateTime<Utc>) -> Result<Policy> {
        self.revise(id, now, |p| p.alerts = alerts)
    }

    /// Write a new version derived from the current one and move the head.
    fn revise(&self, id: &str, now: DateTime<Utc>, edit: impl FnOnce(&mut Policy)) -> Result<Policy> {
        let mut db = self.db.lock();
        let tx = db.transaction().map_err(db_err)?;

        let head = read_head(&tx, id)
            .map_err(db_err)?
            .filter(|h| h.active)
            .ok_or_else(|| LeverError::PolicyNotFound(id.to_string()))?;
        let mut policy = read_policy(&tx, id, head.current_version)
            .map_err(db_err)?
            .ok_or_else(|| {
                LeverError::Store(format!("policy '{id}' v{} has no rows", head.current_version))
            })?;

        edit(&mut policy);
        if policy.scope.tenant != head.tenant {
            return Err(LeverError::invalid(
                "scope.tenant",
                "a policy cannot move between tenants",
            ));
        }
        policy.version = head.current_version + 1;
        policy.created_at = now;
        policy.validate()?;
        check_overlap(&tx, &policy)?;

        write_version(&tx, &policy)?;
        tx.execute(
            "UPDATE policy_heads SET current_version = ?2, updated_at = ?3 WHERE policy_id = ?1",
            params![id, policy.version, ts(now)],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        info!(policy_id = %id, version = policy.version, "policy revised");
        Ok(policy)
    }

    /// Take a policy out of resolution. Its versions stay for audit.
    pub fn retire_policy(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock();
        let rows = db
            .execute(
                "UPDATE policy_heads SET active = 0, updated_at = ?2 WHERE policy_id = ?1 AND active = 1",
                params![id, ts(now)],
            )
            .map_err(db_err)?;
        if rows == 0 {
            return Err(LeverError::PolicyNotFound(id.to_string()));
        }
        info!(policy_id = %id, "policy retired");
        Ok(())
    }

    /// Current version of an active policy.
    pub fn get_policy(&self, id: &str) -> Result<Option<Policy>> {
        let db = self.db.lock();
        match read_head(&db, id).map_err(db_err)? {
            Some(head) if head.active => read_policy(&db, id, head.current_version).map_err(db_err),
            _ => Ok(None),
        }
    }

    /// Any historical version, active or not.
    pub fn get_policy_version(&self, id: &str, version: u32) -> Result<Option<Policy>> {
        let db = self.db.lock();
        read_policy(&db, id, version).map_err(db_err)
    }

    /// Every version of a policy, oldest first.
    pub fn policy_history(&self, id: &str) -> Result<Vec<Policy>> {
        let db = self.db.lock();
        let versions: Vec<u32> = {
            let mut stmt = db
                .prepare("SELECT version FROM policy_versions WHERE policy_id = ?1 ORDER BY version")
                .map_err(db_err)?;
            stmt.query_map(params![id], |row| row.get(0))
                .map_err(db_err)?
                .collect::<rusqlite::Result<_>>()
                .map_err(db_err)?
        };
        let mut out = Vec::with_capacity(versions.len());
        for v in versions {
            if let Some(p) = read_policy(&db, id, v).map_err(db_err)? {
                out.push(p);
            }
        }
        Ok(out)
    }

    pub fn policy_head(&self, id: &str) -> Result<Option<PolicyHead>> {
        let db = self.db.lock();
        read_head(&db, id).map_err(db_err)
    }

    /// Active policies of one tenant, read fresh on every call.
    pub fn load_active_policies(&self, tenant: &str) -> Result<Vec<Policy>> {
        let db = self.db.lock();
        read_active(&db, Some(tenant)).map_err(db_err)
    }

    /// Active policies, optionally filtered by tenant.
    pub fn list_policies(&self, tenant: Option<&str>) -> Result<Vec<Policy>> {
        let db = self.db.lock();
        read_active(&db, tenant).map_err(db_err)
    }
}

fn check_overlap(conn: &Connection, policy: &Policy) -> Result<()> {
    let existing = read_active(conn, Some(policy.tenant())).map_err(db_err)?;
    let clash = existing.iter().find(|other| {
        other.id != policy.id
            && other.precedence.priority == policy.precedence.priority
            && other.scope.overlaps(&policy.scope)
    });
    match clash {
        Some(other) => Err(LeverError::invalid(
            "scope",
            format!(
                "overlaps active policy '{}' at the same priority {}",
                other.id, other.precedence.priority
            ),
        )),
        None => Ok(()),
    }
}

fn read_head(conn: &Connection, id: &str) -> rusqlite::Result<Option<PolicyHead>> {
    conn.query_row(
        "SELECT policy_id, tenant, current_version, active FROM policy_heads WHERE policy_id = ?1",
        params![id],
        |row| {
            Ok(PolicyHead {
                policy_id: row.get(0)?,
                tenant: row.get(1)?,
                current_version: row.get(2)?,
                active: row.get::<_, i32>(3)? != 0,
            })
        },
    )
    .optional()
}

fn read_active(conn: &Connection, tenant: Option<&str>) -> rusqlite::Result<Vec<Policy>> {
    let heads: Vec<(String, u32)> = {
        let mut stmt = conn.prepare(
            "SELECT policy_id, current_version FROM policy_heads
             WHERE active = 1 AND (?1 IS NULL OR tenant = ?1)
             ORDER BY policy_id",
        )?;
        stmt.query_map(params![tenant], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?
    };
    let mut out = Vec::with_capacity(heads.len());
    for (id, version) in heads {
        if let Some(p) = read_policy(conn, &id, version)? {
            out.push(p);
        }
    }
    Ok(out)
}

fn read_policy(conn: &Connection, id: &str, version: u32) -> rusqlite::Result<Option<Policy>> {
    let policy = conn
        .query_row(
            "SELECT v.name, v.created_at,
                    s.tenant, s.scope_type, s.identifiers,
                    p.priority, p.strategy, p.binding_moment,
                    m.signals, m.forbid,
                    a.channels, a.max_alerts_per_run, a.min_interval_secs
             FROM policy_versions v
             JOIN policy_scopes s ON s.policy_id = v.policy_id AND s.version = v.version
             JOIN policy_precedence p ON p.policy_id = v.policy_id AND p.version = v.version
             JOIN policy_monitor_configs m ON m.policy_id = v.policy_id AND m.version = v.version
             JOIN policy_alert_configs a ON a.policy_id = v.policy_id AND a.version = v.version
             WHERE v.policy_id = ?1 AND v.version = ?2",
            params![id, version],
            |row| {
                let identifiers: BTreeSet<String> = parse_json(4, &row.get::<_, String>(4)?)?;
                let signals: BTreeSet<Metric> = parse_json(8, &row.get::<_, String>(8)?)?;
                let forbid: BTreeSet<NegativeCapability> =
                    parse_json(9, &row.get::<_, String>(9)?)?;
                let channels: BTreeSet<ChannelType> = parse_json(10, &row.get::<_, String>(10)?)?;
                Ok(Policy {
                    id: id.to_string(),
                    version,
                    name: row.get(0)?,
                    created_at: parse_ts(1, &row.get::<_, String>(1)?)?,
                    scope: PolicyScope {
                        tenant: row.get(2)?,
                        scope_type: parse_text(3, &row.get::<_, String>(3)?)?,
                        identifiers,
                    },
                    precedence: PolicyPrecedence {
                        priority: row.get(5)?,
                        strategy: parse_text(6, &row.get::<_, String>(6)?)?,
                        binding_moment: parse_text(7, &row.get::<_, String>(7)?)?,
                    },
                    monitor: MonitorConfig { signals, forbid },
                    limits: Vec::new(),
                    alerts: AlertConfig {
                        channels,
                        max_alerts_per_run: row.get(11)?,
                        min_interval_secs: row.get::<_, i64>(12)? as u64,
                    },
                })
            },
        )
        .optional()?;

    let Some(mut policy) = policy else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(
        "SELECT metric, threshold, near_ratio, action, aggregate FROM policy_limits
         WHERE policy_id = ?1 AND version = ?2 ORDER BY metric",
    )?;
    policy.limits = stmt
        .query_map(params![id, version], |row| {
            let aggregate: Option<String> = row.get(4)?;
            Ok(Limit {
                metric: parse_text(0, &row.get::<_, String>(0)?)?,
                threshold: row.get(1)?,
                near_ratio: row.get(2)?,
                action: parse_text(3, &row.get::<_, String>(3)?)?,
                aggregate: aggregate.map(|a| parse_text(4, &a)).transpose()?,
            })
        })?
        .collect::<rusqlite::Result<_>>()?;
    Ok(Some(policy))
}

/// Insert every component row of one policy version.
fn write_version(conn: &Connection, policy: &Policy) -> Result<()> {
    let id = &policy.id;
    let v = policy.version;
    conn.execute(
        "INSERT INTO policy_versions (policy_id, version, name, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id, v, policy.name, ts(policy.created_at)],
    )
    .map_err(db_err)?;
    conn.execute(
        "INSERT INTO policy_scopes (policy_id, version, tenant, scope_type, identifiers)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id,
            v,
            policy.scope.tenant,
            policy.scope.scope_type.as_str(),
            to_json(&policy.scope.identifiers)?,
        ],
    )
    .map_err(db_err)?;
    conn.execute(
        "INSERT INTO policy_precedence (policy_id, version, priority, strategy, binding_moment)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id,
            v,
            policy.precedence.priority,
            policy.precedence.strategy.as_str(),
            policy.precedence.binding_moment.as_str(),
        ],
    )
    .map_err(db_err)?;
    conn.execute(
        "INSERT INTO policy_monitor_configs (policy_id, version, signals, forbid) VALUES (?1, ?2, ?3, ?4)",
        params![
            id,
            v,
            to_json(&policy.monitor.signals)?,
            to_json(&policy.monitor.forbid)?,
        ],
    )
    .map_err(db_err)?;
    for limit in &policy.limits {
        conn.execute(
            "INSERT INTO policy_limits (policy_id, version, metric, threshold, near_ratio, action, aggregate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                v,
                limit.metric.as_str(),
                limit.threshold,
                limit.near_ratio,
                limit.action.as_str(),
                limit.aggregate.map(|a| a.as_str()),
            ],
        )
        .map_err(db_err)?;
    }
    conn.execute(
        "INSERT INTO policy_alert_configs (policy_id, version, channels, max_alerts_per_run, min_interval_secs)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id,
            v,
            to_json(&policy.alerts.channels)?,
            policy.alerts.max_alerts_per_run,
            policy.alerts.min_interval_secs as i64,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}
