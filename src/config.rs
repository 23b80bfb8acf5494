use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for Conductor
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConductorConfig {
    /// GitHub configuration
    pub github: GitHubConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Outbox delivery settings
    pub outbox: OutboxConfig,
    /// Database settings
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    /// GitHub API token (can be set via env var)
    pub token: Option<String>,
    /// Default repository owner for CLI-driven writes
    pub owner: String,
    /// Default repository name for CLI-driven writes
    pub repo: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON-structured logs
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboxConfig {
    /// Max rows fetched per processing sweep
    pub batch_limit: i64,
    /// Retry budget before a write stays failed
    pub max_retries: u32,
    /// Base backoff in milliseconds (doubles per retry, capped at 60s)
    pub base_backoff_ms: u64,
    /// Minutes in `processing` before the janitor re-queues a write
    pub stalled_after_minutes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            github: GitHubConfig {
                token: None, // Read from env at load time
                owner: String::new(),
                repo: String::new(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: true,
            },
            outbox: OutboxConfig {
                batch_limit: 20,
                max_retries: 5,
                base_backoff_ms: 2000,
                stalled_after_minutes: 5,
            },
            database: DatabaseConfig {
                url: ".conductor/conductor.db".to_string(),
                max_connections: 10,
                auto_migrate: true,
            },
        }
    }
}

impl ConductorConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (conductor.toml)
    /// 3. Environment variables (prefixed with CONDUCTOR_)
    pub fn load() -> Result<Self> {
        let defaults = Config::try_from(&ConductorConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        if Path::new("conductor.toml").exists() {
            builder = builder.add_source(File::with_name("conductor"));
        }

        builder = builder.add_source(
            Environment::with_prefix("CONDUCTOR")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let mut conductor_config: ConductorConfig = config.try_deserialize()?;

        // GitHub token can come from the usual env vars as well.
        if conductor_config.github.token.is_none() {
            if let Ok(token) = std::env::var("GITHUB_TOKEN") {
                conductor_config.github.token = Some(token);
            } else if let Ok(token) = std::env::var("CONDUCTOR_GITHUB_TOKEN") {
                conductor_config.github.token = Some(token);
            }
        }

        Ok(conductor_config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<ConductorConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = ConductorConfig::load_env_file();
        ConductorConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static ConductorConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}
