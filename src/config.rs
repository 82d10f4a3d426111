use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_local_path")]
    pub local_path: String,
    /// Where uploads are spooled while being hashed. Defaults to the system temp dir.
    #[serde(default)]
    pub temp_path: Option<String>,
}

/// Rate limit and quota settings
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_rate_limit_calls")]
    pub rate_limit_calls: u32,
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_storage_quota_mb")]
    pub storage_quota_mb: u64,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> String {
    "data/filevault.db".to_string()
}

fn default_local_path() -> String {
    "data/blobs".to_string()
}

fn default_rate_limit_calls() -> u32 {
    2
}

fn default_rate_limit_window() -> u64 {
    1 // seconds
}

fn default_storage_quota_mb() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_path: default_local_path(),
            temp_path: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_limit_calls: default_rate_limit_calls(),
            rate_limit_window_secs: default_rate_limit_window(),
            storage_quota_mb: default_storage_quota_mb(),
        }
    }
}

impl StorageConfig {
    pub fn upload_temp_dir(&self) -> PathBuf {
        self.temp_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir)
    }
}

impl LimitsConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn storage_quota_bytes(&self) -> i64 {
        (self.storage_quota_mb as i64).saturating_mul(1024 * 1024)
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        config.ensure_directories()?;
        tracing::info!(
            "Limits: {} calls per {}s, quota {} MB",
            config.limits.rate_limit_calls,
            config.limits.rate_limit_window_secs,
            config.limits.storage_quota_mb
        );
        Ok(config)
    }

    /// Load configuration from conf.ini or config.toml
    fn load_from_file() -> anyhow::Result<Self> {
        let config_paths = ["conf.ini", "config.toml", "data/conf.ini", "data/config.toml"];

        for path in config_paths {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                tracing::info!("Loaded configuration from {}", path);
                return Ok(config);
            }
        }

        tracing::info!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    /// Apply environment variable overrides
    /// Format: FV_CONF_<SECTION>_<KEY>, plus the plain limit variables
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Server overrides
        if let Some(val) = lookup("FV_CONF_SERVER_HOST") {
            self.server.host = val;
        }
        if let Some(port) = lookup("FV_CONF_SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }

        // Database overrides
        if let Some(val) = lookup("FV_CONF_DATABASE_PATH") {
            self.database.path = val;
        }

        // Storage overrides
        if let Some(val) = lookup("FV_CONF_STORAGE_LOCAL_PATH") {
            self.storage.local_path = val;
        }
        if let Some(val) = lookup("FV_CONF_STORAGE_TEMP_PATH") {
            self.storage.temp_path = Some(val);
        }

        // Limit overrides
        if let Some(calls) = lookup("RATE_LIMIT_N_CALLS").and_then(|v| v.trim().parse().ok()) {
            self.limits.rate_limit_calls = calls;
        }
        if let Some(secs) = lookup("RATE_LIMIT_X_SECONDS").and_then(|v| v.trim().parse().ok()) {
            self.limits.rate_limit_window_secs = secs;
        }
        if let Some(mb) = lookup("TOTAL_STORAGE_LIMIT_Z_MB").and_then(|v| v.trim().parse().ok()) {
            self.limits.storage_quota_mb = mb;
        }
    }

    /// Ensure required directories exist
    fn ensure_directories(&self) -> anyhow::Result<()> {
        // Ensure database directory exists
        if let Some(parent) = Path::new(&self.database.path).parent() {
            fs::create_dir_all(parent)?;
        }

        // Ensure local storage directory exists
        fs::create_dir_all(&self.storage.local_path)?;
        if let Some(temp_path) = &self.storage.temp_path {
            fs::create_dir_all(temp_path)?;
        }

        Ok(())
    }
}
