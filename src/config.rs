use crate::core::db::SqliteConnectionFactory;
use crate::core::{TxconnError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration structure parsed from a TOML file.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: Option<LoggingConfig>,
}

/// Database connection settings.
#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub read_only: Option<bool>,
    pub busy_timeout_ms: Option<u64>,
    pub pragmas: Option<Vec<String>>,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
}

impl Config {
    /// Builds the connection factory described by the `[database]` section.
    pub fn connection_factory(&self) -> SqliteConnectionFactory {
        let database = &self.database;
        let mut factory = SqliteConnectionFactory::new(&database.path)
            .read_only(database.read_only.unwrap_or(false));
        if let Some(ms) = database.busy_timeout_ms {
            factory = factory.busy_timeout(Duration::from_millis(ms));
        }
        for pragma in database.pragmas.iter().flatten() {
            factory = factory.pragma(pragma.as_str());
        }
        factory
    }

    /// The configured log filter, if any.
    pub fn log_level(&self) -> Option<&str> {
        self.logging.as_ref()?.level.as_deref()
    }
}

/// Default configuration file location: `<config dir>/txconn/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("txconn").join("config.toml"))
}

/// Parses configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;
    if config.database.path.trim().is_empty() {
        return Err(TxconnError::Config("database.path must not be empty".to_string()));
    }
    Ok(config)
}

/// Loads configuration from a TOML file at the given path.
///
/// # Example
///
/// ```no_run
/// let config = txconn::config::load_config("config.toml").expect("Failed to load config");
/// println!("{:?}", config);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}
