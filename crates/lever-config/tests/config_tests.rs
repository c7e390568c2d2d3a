#[cfg(test)]
mod tests {
    use chrono::Utc;
    use lever_config::ConfigLoader;
    use lever_config::schema::*;
    use lever_core::{ChannelType, ConflictStrategy, EnforcementAction, Metric, ScopeType};
    use std::collections::HashMap;
    use std::io::Write;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_lever_config_defaults() {
        let config = LeverConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:3710");
        assert!(config.server.api_key.is_none());
        assert!(!config.server.cors);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.evaluator.default_near_ratio, 0.8);
        assert!(config.default_policy.enabled);
        assert!(config.channels.is_empty());
    }

    #[test]
    fn test_default_config_validates() {
        let warnings = LeverConfig::default().validate().unwrap();
        // Only the "default policy has no limits" notice.
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].severity, WarningSeverity::Warning);
    }

    #[test]
    fn test_audit_config_defaults() {
        let config = AuditConfig::default();
        assert_eq!(config.queue_capacity, 4096);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay_ms, 50);
    }

    // ── TOML tests ─────────────────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let config = LeverConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: LeverConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.server.listen, config.server.listen);
        assert_eq!(restored.default_policy.priority, u32::MAX);
        assert_eq!(restored.alerts.channels, config.alerts.channels);
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[server]
listen = "0.0.0.0:9000"
api_key = "s3cret"

[[default_policy.limits]]
metric = "cost"
threshold = 25.0
action = "PAUSE"
"#;
        let config: LeverConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.default_policy.limits.len(), 1);
        assert_eq!(config.default_policy.limits[0].action, EnforcementAction::Pause);
        assert!(config.default_policy.limits[0].near_ratio.is_none());
        assert_eq!(config.audit.max_retries, 5);
        assert_eq!(config.default_policy.strategy, ConflictStrategy::MostRestrictive);
    }

    #[test]
    fn test_channel_config_deserialize() {
        let toml_str = r#"
[channels.ops]
type = "slack"
url = "https://hooks.slack.test/T000"
username = "lever"
"#;
        let config: LeverConfig = toml::from_str(toml_str).unwrap();
        let ops = &config.channels["ops"];
        assert_eq!(ops.kind(), Some(ChannelType::Slack));
        assert!(ops.enabled);
        assert_eq!(ops.url.as_deref(), Some("https://hooks.slack.test/T000"));
        assert_eq!(ops.setting_str("username"), Some("lever"));
    }

    // ── Default policy tests ───────────────────────────────────

    #[test]
    fn test_default_policy_materializes_per_tenant() {
        let mut config = LeverConfig::default();
        config.evaluator.default_near_ratio = 0.5;
        config.default_policy.limits.push(LimitConfig {
            metric: Metric::Tokens,
            threshold: 1000.0,
            near_ratio: None,
            action: EnforcementAction::Stop,
            aggregate: None,
        });
        let policy = config.default_policy_for("acme", Utc::now()).unwrap();
        assert_eq!(policy.id, DEFAULT_POLICY_ID);
        assert_eq!(policy.tenant(), "acme");
        assert_eq!(policy.scope.scope_type, ScopeType::AllRuns);
        let limit = policy.limit_for(Metric::Tokens).unwrap();
        assert_eq!(limit.near_ratio, 0.5);
        assert_eq!(limit.action, EnforcementAction::Stop);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_disabled_default_policy() {
        let mut config = LeverConfig::default();
        config.default_policy.enabled = false;
        assert!(config.default_policy_for("acme", Utc::now()).is_none());
        let err = config.validate().unwrap_err();
        assert!(err.contains("default_policy.enabled"));
    }

    // ── Validation tests ───────────────────────────────────────

    #[test]
    fn test_validate_rejects_bad_near_ratio() {
        let mut config = LeverConfig::default();
        config.evaluator.default_near_ratio = 1.5;
        assert!(config.validate().unwrap_err().contains("default_near_ratio"));
    }

    #[test]
    fn test_validate_rejects_empty_listen() {
        let mut config = LeverConfig::default();
        config.server.listen.clear();
        assert!(config.validate().unwrap_err().contains("server.listen"));
    }

    #[test]
    fn test_validate_rejects_nonpositive_threshold() {
        let mut config = LeverConfig::default();
        config.default_policy.limits.push(LimitConfig {
            metric: Metric::Cost,
            threshold: 0.0,
            near_ratio: None,
            action: EnforcementAction::Alert,
            aggregate: None,
        });
        assert!(config.validate().unwrap_err().contains("default_policy.limits.cost"));
    }

    #[test]
    fn test_validate_rejects_unknown_channel_type() {
        let mut config = LeverConfig::default();
        config.channels.insert(
            "pager".into(),
            ChannelConfig {
                channel_type: "pagerduty".into(),
                enabled: true,
                url: None,
                settings: HashMap::new(),
            },
        );
        assert!(config.validate().unwrap_err().contains("channels.pager.type"));
    }

    #[test]
    fn test_validate_requires_url_for_webhook() {
        let mut config = LeverConfig::default();
        config.channels.insert(
            "hook".into(),
            ChannelConfig {
                channel_type: "webhook".into(),
                enabled: true,
                url: None,
                settings: HashMap::new(),
            },
        );
        assert!(config.validate().unwrap_err().contains("channels.hook.url"));
    }

    #[test]
    fn test_public_listen_without_key_warns() {
        let mut config = LeverConfig::default();
        config.server.listen = "0.0.0.0:3710".into();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "server.api_key"));
    }

    // ── Env override tests ─────────────────────────────────────

    #[test]
    fn test_overrides_apply_from_source() {
        let vars: HashMap<&str, &str> = [
            ("LEVER_SERVER_LISTEN", "127.0.0.1:4000"),
            ("LEVER_LOG_LEVEL", "debug"),
            ("LEVER_DB_PATH", "/var/lib/lever/lever.db"),
            ("LEVER_API_KEY", "from-env"),
        ]
        .into_iter()
        .collect();
        let config = ConfigLoader::apply_overrides(LeverConfig::default(), |k| {
            vars.get(k).map(|v| v.to_string())
        });
        assert_eq!(config.server.listen, "127.0.0.1:4000");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.store.db_path,
            std::path::PathBuf::from("/var/lib/lever/lever.db")
        );
        assert_eq!(config.server.api_key.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_file_api_key_beats_env() {
        let mut base = LeverConfig::default();
        base.server.api_key = Some("from-file".into());
        let config = ConfigLoader::apply_overrides(base, |k| {
            (k == "LEVER_API_KEY").then(|| "from-env".to_string())
        });
        assert_eq!(config.server.api_key.as_deref(), Some("from-file"));
    }

    // ── ConfigLoader tests ─────────────────────────────────────

    #[test]
    fn test_config_loader_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("lever.toml");
        let mut f = std::fs::File::create(&config_path).unwrap();
        writeln!(
            f,
            r#"
[store]
db_path = "policies.db"

[audit]
max_retries = 2

[alerts]
channels = ["UI", "WEBHOOK"]
max_alerts_per_run = 3
"#
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        let config = loader.get();
        assert_eq!(config.store.db_path, std::path::PathBuf::from("policies.db"));
        assert_eq!(config.audit.max_retries, 2);
        assert_eq!(config.alerts.max_alerts_per_run, 3);
        assert!(config.alerts.channels.contains(&ChannelType::Webhook));
        assert_eq!(loader.path(), config_path.as_path());
    }

    #[test]
    fn test_config_loader_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("lever.toml");
        std::fs::write(&config_path, "[evaluator]\ndefault_near_ratio = 0.0\n").unwrap();
        let err = ConfigLoader::load(Some(config_path.as_path())).err().unwrap();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_config_loader_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("lever.toml");
        std::fs::write(&config_path, "[server\nlisten = ").unwrap();
        assert!(ConfigLoader::load(Some(config_path.as_path())).is_err());
    }

    #[test]
    fn test_config_loader_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("lever.toml");
        std::fs::write(&config_path, "[alerts]\nmin_interval_secs = 30\n").unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        assert_eq!(loader.get().alerts.min_interval_secs, 30);

        std::fs::write(&config_path, "[alerts]\nmin_interval_secs = 5\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().alerts.min_interval_secs, 5);

        // Invalid edit keeps the previous config.
        std::fs::write(&config_path, "[server]\nlisten = \"\"\n").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().alerts.min_interval_secs, 5);
    }
}
