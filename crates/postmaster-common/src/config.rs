//! Configuration for the postmaster

use crate::types::MailAccount;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Inbound polling configuration
    #[serde(default)]
    pub inbound: InboundConfig,

    /// Filter chain configuration
    #[serde(default)]
    pub filters: FilterConfig,

    /// Statically configured mail accounts
    #[serde(default)]
    pub accounts: Vec<MailAccount>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend, only "postgres" is supported
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Run embedded migrations at startup
    #[serde(default)]
    pub run_migrations: bool,
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Inbound mail polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    /// Enable the poller
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between poll cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Accounts polled concurrently
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Upper bound of accounts polled per cycle, 0 means unlimited
    #[serde(default)]
    pub max_accounts: usize,

    /// Delete messages from the server once handled
    #[serde(default = "default_true")]
    pub delete_after_fetch: bool,

    /// Sessions attempted per poll before giving up on transient errors
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff between attempts in milliseconds (multiplied by attempt)
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// TCP/TLS dial timeout in seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Timeout for a single protocol command in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Also load active accounts from the `mail_account` table
    #[serde(default)]
    pub accounts_from_database: bool,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval(),
            worker_count: default_worker_count(),
            max_accounts: 0,
            delete_after_fetch: true,
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            dial_timeout_secs: default_dial_timeout(),
            command_timeout_secs: default_command_timeout(),
            accounts_from_database: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    60
}

fn default_worker_count() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    60
}

/// Filter chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Evaluate database-sourced postmaster filters
    #[serde(default = "default_true")]
    pub database_rules: bool,

    /// Additional header names honored for trusted accounts
    #[serde(default)]
    pub trusted_extra_headers: Vec<String>,

    /// Bytes of the body visible to `Body` match rules
    #[serde(default = "default_body_match_limit")]
    pub body_match_limit: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            database_rules: true,
            trusted_extra_headers: Vec::new(),
            body_match_limit: default_body_match_limit(),
        }
    }
}

fn default_body_match_limit() -> usize {
    64 * 1024
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from a file with `POSTMASTER__*` environment overrides.
    ///
    /// `POSTMASTER__INBOUND__POLL_INTERVAL_SECS=30` overrides
    /// `inbound.poll_interval_secs`.
    pub fn load_with_env(path: &Path) -> crate::Result<Self> {
        config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .add_source(
                config::Environment::with_prefix("POSTMASTER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }

    /// Load configuration from the first default location that exists
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var("POSTMASTER_CONFIG") {
            return Self::load_with_env(Path::new(&path));
        }

        let paths = [
            PathBuf::from("./postmaster.toml"),
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/goatflow/postmaster.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::load_with_env(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> crate::Result<()> {
        if self.inbound.worker_count == 0 {
            return Err(crate::Error::Config(
                "inbound.worker_count must be at least 1".to_string(),
            ));
        }
        if self.inbound.max_attempts == 0 {
            return Err(crate::Error::Config(
                "inbound.max_attempts must be at least 1".to_string(),
            ));
        }
        for account in &self.accounts {
            if account.protocol().is_none() {
                return Err(crate::Error::Config(format!(
                    "account {} has unsupported type '{}'",
                    account.id, account.account_type
                )));
            }
        }
        Ok(())
    }
}
