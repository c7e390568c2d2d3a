use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use lever_config::{ConfigLoader, LeverConfig};
use lever_core::{LeverError, Result};
use lever_engine::PolicyLever;
use lever_store::PolicyStore;

/// Policy control lever: runtime governance for multi-tenant agent execution
#[derive(Parser)]
#[command(name = "lever", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to lever.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine and its HTTP API
    Serve {
        /// Listen address, overriding [server] listen
        #[arg(short = 'L', long)]
        listen: Option<String>,
    },
    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List active policies in the store
    Policies {
        /// Only this tenant
        #[arg(short, long)]
        tenant: Option<String>,
    },
    /// Recheck audit rows against their checksums
    Verify,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and print warnings
    Validate,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > [logging] level; RUST_LOG beats all
        let log_level = if self.verbose {
            "debug".to_string()
        } else if self.quiet {
            "error".to_string()
        } else {
            self.log_level
                .clone()
                .unwrap_or_else(|| config.logging.level.clone())
        };
        init_logging(&log_level, &config.logging.format);

        match self.command {
            Commands::Serve { listen } => cmd_serve(config_loader, listen).await,
            Commands::Config { action } => match action {
                ConfigAction::Show { json } => cmd_config_show(&config, json),
                ConfigAction::Validate => cmd_config_validate(&config, &config_loader),
            },
            Commands::Policies { tenant } => cmd_policies(&config, tenant.as_deref()),
            Commands::Verify => cmd_verify(&config),
        }
    }
}

fn init_logging(level: &str, format: &str) {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level))
    };
    match format {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .json()
            .with_target(true)
            .init(),
        "compact" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .compact()
            .with_target(false)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .pretty()
            .with_target(false)
            .init(),
    }
}

fn open_store(config: &LeverConfig) -> Result<PolicyStore> {
    if let Some(parent) = config.store.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    PolicyStore::open(&config.store.db_path)
}

async fn cmd_serve(config_loader: ConfigLoader, listen: Option<String>) -> Result<()> {
    let shared = config_loader.shared();
    if let Some(listen) = listen {
        shared.write().server.listen = listen;
    }
    let config = shared.read().clone();

    println!("lever v{}", env!("CARGO_PKG_VERSION"));
    println!("   Store:  {}", config.store.db_path.display());
    println!("   Listen: {}", config.server.listen);
    println!();

    let store = open_store(&config)?;
    let lever = Arc::new(PolicyLever::builder(store, shared).build()?);

    tokio::select! {
        result = lever_server::start_server(config.server.clone(), Arc::clone(&lever)) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    lever.flush().await;
    info!(active_runs = lever.active_runs(), "audit queue drained, exiting");
    Ok(())
}

fn cmd_config_show(config: &LeverConfig, json: bool) -> Result<()> {
    let rendered = if json {
        serde_json::to_string_pretty(config)?
    } else {
        toml::to_string_pretty(config).map_err(|e| LeverError::Config(e.to_string()))?
    };
    println!("{rendered}");
    Ok(())
}

fn cmd_config_validate(config: &LeverConfig, loader: &ConfigLoader) -> Result<()> {
    let warnings = config.validate().map_err(LeverError::Config)?;
    println!("config: {}", loader.path().display());
    if warnings.is_empty() {
        println!("ok, no warnings");
    }
    for w in &warnings {
        println!("  {w}");
    }
    Ok(())
}

fn cmd_policies(config: &LeverConfig, tenant: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    let policies = store.list_policies(tenant)?;
    if policies.is_empty() {
        println!("No active policies.");
        return Ok(());
    }
    println!(
        "{:<24} {:>4} {:<12} {:<14} {:>8} {:<18}",
        "ID", "VER", "TENANT", "SCOPE", "PRIORITY", "STRATEGY"
    );
    for p in policies {
        println!(
            "{:<24} {:>4} {:<12} {:<14} {:>8} {:<18}",
            p.id,
            p.version,
            p.scope.tenant,
            p.scope.scope_type.as_str(),
            p.precedence.priority,
            p.precedence.strategy.as_str()
        );
    }
    Ok(())
}

fn cmd_verify(config: &LeverConfig) -> Result<()> {
    let store = open_store(config)?;
    let violations = store.verify_integrity()?;
    if violations.is_empty() {
        println!("audit integrity ok");
        return Ok(());
    }
    for v in &violations {
        warn!(table = v.table, id = %v.id, "checksum mismatch");
        println!("  {}: {}", v.table, v.id);
    }
    Err(LeverError::Store(format!(
        "{} audit rows failed the checksum check",
        violations.len()
    )))
}
