//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::ratelimit::rules::RuleTableConfig;

/// Main configuration for the Floodgate engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Only paths under this prefix are subject to limiting
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Rate limit rules
    #[serde(default)]
    pub rules: RuleTableConfig,

    /// Roles that bypass limiting entirely
    #[serde(default = "default_exempt_roles")]
    pub exempt_roles: Vec<String>,

    /// Addresses that bypass limiting entirely
    #[serde(default)]
    pub exempt_addresses: Vec<IpAddr>,

    /// Exponential backoff for repeat offenders
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Local-state housekeeping configuration
    #[serde(default)]
    pub sweep: SweepConfig,

    /// Name of the session cookie used for client keying
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_prefix: default_api_prefix(),
            rules: RuleTableConfig::default(),
            exempt_roles: default_exempt_roles(),
            exempt_addresses: Vec::new(),
            backoff: BackoffConfig::default(),
            store: StoreConfig::default(),
            sweep: SweepConfig::default(),
            session_cookie: default_session_cookie(),
        }
    }
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_exempt_roles() -> Vec<String> {
    vec!["admin".to_string()]
}

fn default_session_cookie() -> String {
    "session".to_string()
}

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Enable penalty escalation for repeat offenders
    #[serde(default = "default_backoff_enabled")]
    pub enabled: bool,

    /// Cap on the exponential multiplier
    #[serde(default = "default_max_multiplier")]
    pub max_multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: default_backoff_enabled(),
            max_multiplier: default_max_multiplier(),
        }
    }
}

fn default_backoff_enabled() -> bool {
    true
}

fn default_max_multiplier() -> u32 {
    8
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL; in-process counting only when absent
    pub redis_url: Option<String>,

    /// Prefix for store keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Time bound on a single store round trip, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout(),
        }
    }
}

fn default_key_prefix() -> String {
    "floodgate:".to_string()
}

fn default_store_timeout() -> u64 {
    500
}

/// Housekeeping sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Interval between sweeps, in seconds
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    /// Idle horizon after which local client state is dropped, in seconds
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            retention_secs: default_retention(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_retention() -> u64 {
    86400
}

impl EngineConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> crate::error::Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| crate::error::FloodgateError::Config(e.to_string()))
    }
}
