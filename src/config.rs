//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChronoConfig {
    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub query_cache: QueryCacheSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub branches: BranchSettings,
}

/// Point-in-time read cache settings
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// When set, cached values may share their allocation with callers;
    /// otherwise every lookup hands out a private copy
    #[serde(default)]
    pub assume_immutable: bool,
}

fn default_cache_max_size() -> usize {
    10_000
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: default_cache_max_size(),
            assume_immutable: false,
        }
    }
}

/// Index query result cache settings
#[derive(Debug, Clone, Deserialize)]
pub struct QueryCacheSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_query_cache_max_size")]
    pub max_size: usize,
}

fn default_query_cache_max_size() -> usize {
    128
}

impl Default for QueryCacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: default_query_cache_max_size(),
        }
    }
}

/// Storage backend settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Page cache handed to each open chunk database
    #[serde(default = "default_backend_cache_bytes")]
    pub backend_cache_bytes: usize,

    /// Head chunk row count that triggers automatic rollover; 0 disables
    #[serde(default)]
    pub rollover_row_threshold: u64,
}

fn default_backend_cache_bytes() -> usize {
    64 * 1024 * 1024 // 64 MB
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend_cache_bytes: default_backend_cache_bytes(),
            rollover_row_threshold: 0,
        }
    }
}

/// Branch directory settings
#[derive(Debug, Clone, Deserialize)]
pub struct BranchSettings {
    /// Bound on concurrently open chunk files
    #[serde(default = "default_max_open_files")]
    pub max_open_files: usize,
}

fn default_max_open_files() -> usize {
    5
}

impl Default for BranchSettings {
    fn default() -> Self {
        Self {
            max_open_files: default_max_open_files(),
        }
    }
}

impl ChronoConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: ChronoConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = ChronoConfig::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("chronodb").join("config.toml")),
            Some(PathBuf::from("/etc/chronodb/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("CHRONODB_CACHE_ENABLED") {
            if let Ok(v) = enabled.parse() {
                self.cache.enabled = v;
            }
        }
        if let Ok(size) = std::env::var("CHRONODB_CACHE_MAX_SIZE") {
            if let Ok(v) = size.parse() {
                self.cache.max_size = v;
            }
        }
        if let Ok(immutable) = std::env::var("CHRONODB_CACHE_ASSUME_IMMUTABLE") {
            if let Ok(v) = immutable.parse() {
                self.cache.assume_immutable = v;
            }
        }
        if let Ok(enabled) = std::env::var("CHRONODB_QUERY_CACHE_ENABLED") {
            if let Ok(v) = enabled.parse() {
                self.query_cache.enabled = v;
            }
        }
        if let Ok(size) = std::env::var("CHRONODB_QUERY_CACHE_MAX_SIZE") {
            if let Ok(v) = size.parse() {
                self.query_cache.max_size = v;
            }
        }
        if let Ok(bytes) = std::env::var("CHRONODB_BACKEND_CACHE_BYTES") {
            if let Ok(v) = bytes.parse() {
                self.storage.backend_cache_bytes = v;
            }
        }
        if let Ok(threshold) = std::env::var("CHRONODB_ROLLOVER_ROW_THRESHOLD") {
            if let Ok(v) = threshold.parse() {
                self.storage.rollover_row_threshold = v;
            }
        }
        if let Ok(max) = std::env::var("CHRONODB_MAX_OPEN_FILES") {
            if let Ok(v) = max.parse() {
                self.branches.max_open_files = v;
            }
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# ChronoDB Configuration
#
# Environment variables override these settings:
# - CHRONODB_CACHE_ENABLED
# - CHRONODB_CACHE_MAX_SIZE
# - CHRONODB_CACHE_ASSUME_IMMUTABLE
# - CHRONODB_QUERY_CACHE_ENABLED
# - CHRONODB_QUERY_CACHE_MAX_SIZE
# - CHRONODB_BACKEND_CACHE_BYTES
# - CHRONODB_ROLLOVER_ROW_THRESHOLD
# - CHRONODB_MAX_OPEN_FILES

[cache]
# Cache point-in-time read results
enabled = false

# Maximum number of cached entries
max_size = 10000

# Treat stored values as immutable (lookups may share allocations)
assume_immutable = false

[query_cache]
# Cache index query results
enabled = false

# Maximum number of cached query results
max_size = 128

[storage]
# Page cache per open chunk database (bytes)
backend_cache_bytes = 67108864

# Head chunk row count triggering automatic rollover (0 = never)
rollover_row_threshold = 0

[branches]
# Bound on concurrently open chunk files
max_open_files = 5
"#
    .to_string()
}
