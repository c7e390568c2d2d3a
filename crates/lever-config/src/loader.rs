use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use lever_core::{LeverError, Result};

use crate::schema::LeverConfig;

/// Loads the lever configuration and keeps the current copy shareable.
pub struct ConfigLoader {
    config: Arc<RwLock<LeverConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > LEVER_CONFIG env > ~/.lever/lever.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("LEVER_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".lever")
            .join("lever.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::parse_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            LeverConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Build a loader around an in-memory config (no file involved).
    pub fn from_config(config: LeverConfig) -> Result<Self> {
        Self::check(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::new(),
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> LeverConfig {
        self.config.read().clone()
    }

    pub fn shared(&self) -> Arc<RwLock<LeverConfig>> {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Re-read the file. The current config is kept if the new one is invalid.
    pub fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(LeverError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::parse_file(&self.config_path)?);
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    fn parse_file(path: &Path) -> Result<LeverConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<LeverConfig>(&raw).map_err(|e| {
            LeverError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Log warnings, fail on errors.
    fn check(config: &LeverConfig) -> Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(LeverError::Config(e)),
        }
    }

    /// Apply LEVER_* environment variable overrides.
    fn apply_env_overrides(config: LeverConfig) -> LeverConfig {
        Self::apply_overrides(config, |key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides(
        mut config: LeverConfig,
        var: impl Fn(&str) -> Option<String>,
    ) -> LeverConfig {
        if let Some(v) = var("LEVER_SERVER_LISTEN") {
            config.server.listen = v;
        }
        if let Some(v) = var("LEVER_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = var("LEVER_DB_PATH") {
            config.store.db_path = PathBuf::from(v);
        }
        // Config file takes priority, env is the fallback.
        if config.server.api_key.is_none() {
            if let Some(v) = var("LEVER_API_KEY") {
                config.server.api_key = Some(v);
            }
        }
        config
    }
}
