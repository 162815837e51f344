use crate::counters::{CounterSettings, MIN_ENTRIES};
use crate::error::{GatewayError, Result};
use crate::hotreload::HotReloadConfig;
use crate::tiers::TierSources;
use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Tier source files
    #[serde(default)]
    pub tiers: TierFilesConfig,
    /// Credential extraction
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Rate counter table
    #[serde(default)]
    pub counters: CountersConfig,
    /// Tier source watching
    #[serde(default)]
    pub hot_reload: HotReloadConfig,
    /// Admitted response decoration
    #[serde(default)]
    pub response: ResponseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Where the identity map and the limits file live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierFilesConfig {
    #[serde(default = "default_mapping_path")]
    pub mapping_path: PathBuf,
    #[serde(default = "default_limits_path")]
    pub limits_path: PathBuf,
    /// Unmapped identities with this prefix resolve to `basic`; empty disables it
    #[serde(default = "default_test_prefix")]
    pub test_identity_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Headers consulted when no S3 credential is present
    #[serde(default = "default_fallback_headers")]
    pub fallback_headers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountersConfig {
    /// Entries idle for this many windows are evicted
    #[serde(default = "default_idle_windows")]
    pub idle_windows: u32,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// Add X-RateLimit-* headers to admitted responses
    #[serde(default = "default_true")]
    pub expose_headers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_mapping_path() -> PathBuf {
    PathBuf::from("config/identities.map")
}

fn default_limits_path() -> PathBuf {
    PathBuf::from("config/limits.yaml")
}

fn default_test_prefix() -> String {
    "test-".to_string()
}

fn default_fallback_headers() -> Vec<String> {
    vec!["X-Api-Key".to_string()]
}

fn default_idle_windows() -> u32 {
    2
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_max_entries() -> usize {
    100_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for TierFilesConfig {
    fn default() -> Self {
        Self {
            mapping_path: default_mapping_path(),
            limits_path: default_limits_path(),
            test_identity_prefix: default_test_prefix(),
        }
    }
}

impl TierFilesConfig {
    pub fn sources(&self) -> TierSources {
        TierSources::new(self.mapping_path.clone(), self.limits_path.clone())
    }

    pub fn test_prefix(&self) -> Option<String> {
        Some(self.test_identity_prefix.clone()).filter(|p| !p.is_empty())
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            fallback_headers: default_fallback_headers(),
        }
    }
}

impl Default for CountersConfig {
    fn default() -> Self {
        Self {
            idle_windows: default_idle_windows(),
            sweep_interval_secs: default_sweep_interval(),
            max_entries: default_max_entries(),
        }
    }
}

impl CountersConfig {
    pub fn settings(&self) -> CounterSettings {
        CounterSettings {
            idle_windows: self.idle_windows,
            max_entries: self.max_entries,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            expose_headers: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.tiers.mapping_path.as_os_str().is_empty() {
            return Err(GatewayError::Config(
                "tiers.mapping_path cannot be empty".to_string(),
            ));
        }
        if self.tiers.limits_path.as_os_str().is_empty() {
            return Err(GatewayError::Config(
                "tiers.limits_path cannot be empty".to_string(),
            ));
        }

        for name in &self.credentials.fallback_headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(GatewayError::Config(format!(
                    "Invalid fallback header name '{}'",
                    name
                )));
            }
        }

        if self.counters.idle_windows < 2 {
            return Err(GatewayError::Config(
                "counters.idle_windows must be at least 2".to_string(),
            ));
        }
        if self.counters.sweep_interval_secs == 0 {
            return Err(GatewayError::Config(
                "counters.sweep_interval_secs must be > 0".to_string(),
            ));
        }
        if self.counters.max_entries < MIN_ENTRIES {
            return Err(GatewayError::Config(format!(
                "counters.max_entries must be at least {}",
                MIN_ENTRIES
            )));
        }

        Ok(())
    }

    /// Create a default configuration for testing
    pub fn default_config() -> Self {
        Self {
            server: ServerConfig::default(),
            tiers: TierFilesConfig::default(),
            credentials: CredentialsConfig::default(),
            counters: CountersConfig::default(),
            hot_reload: HotReloadConfig::default(),
            response: ResponseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
