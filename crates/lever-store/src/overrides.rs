use chrono::{DateTime, Utc};
use rusqlite::params;
use std::collections::BTreeSet;

use lever_core::{OverrideAuthority, OverrideRecord, PolicyScope, Result};

use crate::store::{
    PolicyStore, checksum, db_err, parse_json, parse_text, parse_ts, to_json, ts,
};

impl PolicyStore {
    /// Register an override grant.
    pub fn insert_override_authority(&self, authority: &OverrideAuthority) -> Result<()> {
        authority.validate()?;
        let db = self.db.lock();
        db.execute(
            "INSERT INTO policy_override_authority
             (id, tenant, scope_type, identifiers, actors, max_duration_secs, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                authority.id,
                authority.scope.tenant,
                authority.scope.scope_type.as_str(),
                to_json(&authority.scope.identifiers)?,
                to_json(&authority.actors)?,
                authority.max_duration_secs as i64,
                ts(authority.created_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Grants, optionally limited to one tenant.
    pub fn override_authorities(&self, tenant: Option<&str>) -> Result<Vec<OverrideAuthority>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT id, tenant, scope_type, identifiers, actors, max_duration_secs, created_at
                 FROM policy_override_authority
                 WHERE (?1 IS NULL OR tenant = ?1)
                 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![tenant], |row| {
                let identifiers: BTreeSet<String> = parse_json(3, &row.get::<_, String>(3)?)?;
                Ok(OverrideAuthority {
                    id: row.get(0)?,
                    scope: PolicyScope {
                        tenant: row.get(1)?,
                        scope_type: parse_text(2, &row.get::<_, String>(2)?)?,
                        identifiers,
                    },
                    actors: parse_json(4, &row.get::<_, String>(4)?)?,
                    max_duration_secs: row.get::<_, i64>(5)? as u64,
                    created_at: parse_ts(6, &row.get::<_, String>(6)?)?,
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Append an exercised override.
    pub fn insert_override_record(&self, record: &OverrideRecord) -> Result<()> {
        let body = to_json(record)?;
        let sum = checksum(&body);
        let db = self.db.lock();
        db.execute(
            "INSERT INTO policy_override_records
             (id, tenant, authority_id, actor, scope, starts_at, expires_at, body, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id.to_string(),
                record.tenant,
                record.authority_id,
                record.actor,
                record.scope.to_string(),
                ts(record.starts_at),
                ts(record.expires_at),
                body,
                sum,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Override history of a tenant, oldest first.
    pub fn override_records(&self, tenant: &str) -> Result<Vec<OverrideRecord>> {
        self.query_overrides(
            "SELECT body FROM policy_override_records WHERE tenant = ?1 ORDER BY rowid",
            params![tenant],
        )
    }

    /// Overrides whose window has not closed at `now`, across tenants.
    pub fn unexpired_overrides(&self, now: DateTime<Utc>) -> Result<Vec<OverrideRecord>> {
        self.query_overrides(
            "SELECT body FROM policy_override_records WHERE expires_at > ?1 ORDER BY rowid",
            params![ts(now)],
        )
    }

    fn query_overrides(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<OverrideRecord>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(args, |row| parse_json(0, &row.get::<_, String>(0)?))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }
}
