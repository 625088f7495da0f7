//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::domain::locking::LockBackend;
use crate::storage::database::{DEFAULT_MAX_CONNECTIONS, DEFAULT_RETRY_COUNT};

/// Default lifetime of a token acquired from the command line
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Longest lifetime accepted for a token, ten years
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// tokenlock configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub locking: LockingSettings,
    pub database: DatabaseSettings,
    pub cluster: ClusterSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingSettings {
    /// Which token service to run
    pub backend: LockBackend,
    /// Name the current holder in conflict errors
    pub report_lock_owner_details: bool,
    pub default_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Lock store file; the platform data directory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub max_connections: u32,
    /// Attempts per lock store operation
    pub retry_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Id of this node; clustering is inactive when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<i64>,
}

impl Default for LockingSettings {
    fn default() -> Self {
        Self {
            backend: LockBackend::default(),
            report_lock_owner_details: false,
            default_ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }
}

/// Keys understood by `get`, `set` and `list`
const KEYS: [&str; 7] = [
    "locking.backend",
    "locking.report_lock_owner_details",
    "locking.default_ttl_secs",
    "database.path",
    "database.max_connections",
    "database.retry_count",
    "cluster.node_id",
];

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("TOKENLOCK_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("tokenlock")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or create default if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            // Return default config without creating file
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=MAX_TTL_SECS).contains(&self.locking.default_ttl_secs) {
            return Err(anyhow!(
                "locking.default_ttl_secs must be between 1 and {}",
                MAX_TTL_SECS
            ));
        }
        if self.database.max_connections == 0 {
            return Err(anyhow!("database.max_connections must be positive"));
        }
        if self.database.retry_count == 0 {
            return Err(anyhow!("database.retry_count must be positive"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "locking.backend" => Ok(self.locking.backend.to_string()),
            "locking.report_lock_owner_details" => {
                Ok(self.locking.report_lock_owner_details.to_string())
            }
            "locking.default_ttl_secs" => Ok(self.locking.default_ttl_secs.to_string()),

            "database.path" => Ok(match &self.database.path {
                Some(path) => path.display().to_string(),
                None => "(default)".to_string(),
            }),
            "database.max_connections" => Ok(self.database.max_connections.to_string()),
            "database.retry_count" => Ok(self.database.retry_count.to_string()),

            "cluster.node_id" => Ok(match self.cluster.node_id {
                Some(id) => id.to_string(),
                None => "(not clustered)".to_string(),
            }),

            _ => Err(unknown_key(key)),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "locking.backend" => {
                self.locking.backend = LockBackend::parse(value).ok_or_else(|| {
                    anyhow!(
                        "Invalid lock backend: {}. Valid options: ephemeral, persistent",
                        value
                    )
                })?;
            }
            "locking.report_lock_owner_details" => {
                self.locking.report_lock_owner_details = value
                    .parse()
                    .with_context(|| format!("Invalid boolean value: {}", value))?;
            }
            "locking.default_ttl_secs" => {
                let ttl: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid default_ttl_secs value: {}", value))?;
                if !(1..=MAX_TTL_SECS).contains(&ttl) {
                    return Err(anyhow!(
                        "Default TTL must be between 1 and {} seconds",
                        MAX_TTL_SECS
                    ));
                }
                self.locking.default_ttl_secs = ttl;
            }

            "database.path" => {
                self.database.path = match value {
                    "" | "default" => None,
                    path => Some(PathBuf::from(path)),
                };
            }
            "database.max_connections" => {
                let max: u32 = value
                    .parse()
                    .with_context(|| format!("Invalid max_connections value: {}", value))?;
                if max == 0 {
                    return Err(anyhow!("max_connections must be positive"));
                }
                self.database.max_connections = max;
            }
            "database.retry_count" => {
                let count: u32 = value
                    .parse()
                    .with_context(|| format!("Invalid retry_count value: {}", value))?;
                if count == 0 {
                    return Err(anyhow!("retry_count must be positive"));
                }
                self.database.retry_count = count;
            }

            "cluster.node_id" => {
                self.cluster.node_id = match value {
                    "" | "none" => None,
                    id => Some(
                        id.parse()
                            .with_context(|| format!("Invalid node_id value: {}", id))?,
                    ),
                };
            }

            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn unknown_key(key: &str) -> anyhow::Error {
    anyhow!(
        "Unknown configuration key: {}. Use `tokenlock config list` to see available keys.",
        key
    )
}
