use rusqlite::Connection;

/// Per-version policy component tables. Rows are written once per version.
pub const VERSIONED_TABLES: &[&str] = &[
    "policy_versions",
    "policy_scopes",
    "policy_precedence",
    "policy_monitor_configs",
    "policy_limits",
    "policy_alert_configs",
];

/// Run-scoped audit tables.
pub const APPEND_ONLY_TABLES: &[&str] = &[
    "policy_override_records",
    "threshold_signals",
    "policy_snapshots",
    "enforcement_actions",
    "admission_denials",
];

const TABLES: &str = "
    CREATE TABLE IF NOT EXISTS policy_heads (
        policy_id TEXT PRIMARY KEY,
        tenant TEXT NOT NULL,
        current_version INTEGER NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS policy_versions (
        policy_id TEXT NOT NULL REFERENCES policy_heads(policy_id),
        version INTEGER NOT NULL,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (policy_id, version)
    );

    CREATE TABLE IF NOT EXISTS policy_scopes (
        policy_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        tenant TEXT NOT NULL,
        scope_type TEXT NOT NULL,
        identifiers TEXT NOT NULL DEFAULT '[]',
        PRIMARY KEY (policy_id, version)
    );

    CREATE TABLE IF NOT EXISTS policy_precedence (
        policy_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        priority INTEGER NOT NULL,
        strategy TEXT NOT NULL,
        binding_moment TEXT NOT NULL,
        PRIMARY KEY (policy_id, version)
    );

    CREATE TABLE IF NOT EXISTS policy_monitor_configs (
        policy_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        signals TEXT NOT NULL,
        forbid TEXT NOT NULL DEFAULT '[]',
        PRIMARY KEY (policy_id, version)
    );

    CREATE TABLE IF NOT EXISTS policy_limits (
        policy_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        metric TEXT NOT NULL,
        threshold REAL NOT NULL,
        near_ratio REAL NOT NULL,
        action TEXT NOT NULL,
        aggregate TEXT,
        PRIMARY KEY (policy_id, version, metric)
    );

    CREATE TABLE IF NOT EXISTS policy_alert_configs (
        policy_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        channels TEXT NOT NULL,
        max_alerts_per_run INTEGER NOT NULL,
        min_interval_secs INTEGER NOT NULL,
        PRIMARY KEY (policy_id, version)
    );

    CREATE TABLE IF NOT EXISTS policy_override_authority (
        id TEXT PRIMARY KEY,
        tenant TEXT NOT NULL,
        scope_type TEXT NOT NULL,
        identifiers TEXT NOT NULL DEFAULT '[]',
        actors TEXT NOT NULL,
        max_duration_secs INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS policy_override_records (
        id TEXT PRIMARY KEY,
        tenant TEXT NOT NULL,
        authority_id TEXT NOT NULL,
        actor TEXT NOT NULL,
        scope TEXT NOT NULL,
        starts_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        body TEXT NOT NULL,
        checksum TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS threshold_signals (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL,
        tenant TEXT NOT NULL,
        policy_id TEXT NOT NULL,
        metric TEXT NOT NULL,
        signal_type TEXT NOT NULL,
        created_at TEXT NOT NULL,
        body TEXT NOT NULL,
        checksum TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS policy_snapshots (
        run_id TEXT PRIMARY KEY,
        tenant TEXT NOT NULL,
        policy_id TEXT NOT NULL,
        policy_version INTEGER NOT NULL,
        bound_at TEXT NOT NULL,
        body TEXT NOT NULL,
        checksum TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS enforcement_actions (
        id TEXT PRIMARY KEY,
        breach_id TEXT NOT NULL UNIQUE,
        run_id TEXT NOT NULL,
        tenant TEXT NOT NULL,
        applied TEXT NOT NULL,
        created_at TEXT NOT NULL,
        body TEXT NOT NULL,
        checksum TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS admission_denials (
        id TEXT PRIMARY KEY,
        tenant TEXT NOT NULL,
        reason_code TEXT NOT NULL,
        created_at TEXT NOT NULL,
        body TEXT NOT NULL,
        checksum TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS budget_counters (
        tenant TEXT NOT NULL,
        policy_id TEXT NOT NULL,
        metric TEXT NOT NULL,
        window_key TEXT NOT NULL,
        total REAL NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant, policy_id, metric, window_key)
    );

    CREATE INDEX IF NOT EXISTS idx_heads_tenant ON policy_heads(tenant, active);
    CREATE INDEX IF NOT EXISTS idx_authority_tenant ON policy_override_authority(tenant);
    CREATE INDEX IF NOT EXISTS idx_overrides_tenant ON policy_override_records(tenant, expires_at);
    CREATE INDEX IF NOT EXISTS idx_signals_run ON threshold_signals(run_id);
    CREATE INDEX IF NOT EXISTS idx_snapshots_tenant ON policy_snapshots(tenant);
    CREATE INDEX IF NOT EXISTS idx_enforcement_run ON enforcement_actions(run_id);
    CREATE INDEX IF NOT EXISTS idx_denials_tenant ON admission_denials(tenant);
";

/// Create tables, indexes and the write-once triggers.
pub(crate) fn create(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(TABLES)?;
    for table in VERSIONED_TABLES.iter().chain(APPEND_ONLY_TABLES) {
        conn.execute_batch(&format!(
            "CREATE TRIGGER IF NOT EXISTS {table}_no_update BEFORE UPDATE ON {table}
             BEGIN SELECT RAISE(ABORT, '{table} is append-only'); END;
             CREATE TRIGGER IF NOT EXISTS {table}_no_delete BEFORE DELETE ON {table}
             BEGIN SELECT RAISE(ABORT, '{table} is append-only'); END;"
        ))?;
    }
    Ok(())
}
