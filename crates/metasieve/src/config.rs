//! Configuration handling for the metasieve CLI.
//!
//! Loaded from `~/.config/metasieve/config.toml` (or the path given with
//! `--config`); every field has a default so a missing file is not an error.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use metasieve_dispatch::DispatchConfig;
use metasieve_memory::MemoryThresholds;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Module registry configuration
    #[serde(default)]
    pub modules: ModulesConfig,

    /// Dispatcher configuration
    #[serde(default)]
    pub dispatch: DispatchSection,

    /// Memory pressure configuration
    #[serde(default)]
    pub memory: MemorySection,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Module directory and hot reload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesConfig {
    /// Directory holding unit manifests (default: XDG data dir)
    pub dir: Option<PathBuf>,

    /// Debounce duration for the manifest watcher (ms)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    500
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            dir: None,
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl ModulesConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Dispatcher limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    /// Max concurrently executing units per file
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-unit timeout (seconds)
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_unit_timeout_secs() -> u64 {
    30
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            unit_timeout_secs: default_unit_timeout_secs(),
        }
    }
}

impl DispatchSection {
    pub fn to_dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_concurrent: self.max_concurrent,
            unit_timeout: Duration::from_secs(self.unit_timeout_secs),
        }
    }
}

/// Memory pressure thresholds and pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
    /// Used-memory percentage at which pressure becomes Warning
    #[serde(default = "default_warn_percent")]
    pub warn_percent: u8,

    /// Used-memory percentage at which pressure becomes Critical
    #[serde(default = "default_critical_percent")]
    pub critical_percent: u8,

    /// Max idle buffers kept per size class in the pool
    #[serde(default = "default_max_idle_buffers")]
    pub max_idle_buffers: usize,
}

fn default_warn_percent() -> u8 {
    75
}

fn default_critical_percent() -> u8 {
    90
}

fn default_max_idle_buffers() -> usize {
    8
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            warn_percent: default_warn_percent(),
            critical_percent: default_critical_percent(),
            max_idle_buffers: default_max_idle_buffers(),
        }
    }
}

impl MemorySection {
    pub fn thresholds(&self) -> MemoryThresholds {
        MemoryThresholds {
            warn_percent: self.warn_percent,
            critical_percent: self.critical_percent,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from the default config path; a missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path())
    }

    /// Load from an explicit path; `None` or a missing file yields defaults.
    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config: {}", path.display()))
    }

    /// Default config file location.
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Sample configuration file with all defaults spelled out.
    pub fn sample_toml() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# failed to render defaults\n"))
    }

    /// Resolve the module directory: CLI override, config value, XDG default.
    pub fn modules_dir(&self, cli_override: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(dir) = cli_override {
            return Ok(dir);
        }
        if let Some(dir) = &self.modules.dir {
            return Ok(dir.clone());
        }
        data_dir()
            .map(|dir| dir.join("modules"))
            .context("could not determine a module directory; pass --modules-dir")
    }
}

/// XDG data directory, overridable for tests.
pub fn data_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("METASIEVE_DATA_DIR") {
        return Some(PathBuf::from(dir));
    }

    ProjectDirs::from("", "", "metasieve").map(|dirs| dirs.data_dir().to_path_buf())
}

/// XDG config directory, overridable for tests.
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("METASIEVE_CONFIG_DIR") {
        return Some(PathBuf::from(dir));
    }

    ProjectDirs::from("", "", "metasieve").map(|dirs| dirs.config_dir().to_path_buf())
}
