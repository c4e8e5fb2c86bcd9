//! Configuration system for pulse.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PULSE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/pulse/config.toml
//!   3. ~/.config/pulse/config.toml

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wire::MAX_TITLE_LEN;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// Title string stamped into every probe request. Identifies the game
    /// client to the probe fleet. Must be non-empty.
    pub title: String,
    pub probe: ProbeConfig,
    pub discovery: DiscoveryConfig,
    pub stats: StatsConfig,
    pub check: CheckConfig,
}

/// Knobs for a single probe run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Probes fired per endpoint in one run.
    pub requests_per_endpoint: u32,
    /// Wall-clock deadline for the whole run, milliseconds.
    pub timeout_ms: u64,
    /// Extra drain window after all sends complete, milliseconds.
    pub max_wait_ms: u64,
    /// Total sends between inter-packet pacing pauses.
    pub requests_between_pause: u32,
    /// Pacing pause duration, milliseconds.
    pub request_pause_ms: u64,
    /// Socket receive timeout during the drain phase, milliseconds.
    pub receive_wait_ms: u64,
}

/// Knobs for the discovery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// URL template; `{fleet}` is replaced with the escaped fleet id.
    pub discovery_service_uri: String,
    /// Fleet whose servers are discovered.
    pub fleet_id: String,
    /// Per-request HTTP timeout, seconds.
    pub request_timeout_sec: u64,
    /// Retries after the first attempt, for network errors and 5xx only.
    pub request_retries: u32,
    /// How long a failed discovery is remembered, milliseconds.
    pub failure_cache_time_ms: u64,
    /// Fallback list lifetime when the server sends no max-age, milliseconds.
    pub success_cache_time_ms: u64,
    /// Offer gzip transfer encoding.
    pub use_gzip: bool,
}

/// Knobs for the rolling statistics store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Samples kept per server.
    pub max_results: usize,
    /// Weight of the newest sample in the moving average, in [0, 1].
    pub weight_of_current_result: f32,
}

/// Knobs for the periodic QoS check loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Milliseconds between QoS cycles.
    pub qos_check_interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            title: "pulse".to_string(),
            probe: ProbeConfig::default(),
            discovery: DiscoveryConfig::default(),
            stats: StatsConfig::default(),
            check: CheckConfig::default(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            requests_per_endpoint: 5,
            timeout_ms: 10_000,
            max_wait_ms: 500,
            requests_between_pause: 10,
            request_pause_ms: 1,
            receive_wait_ms: 10,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_service_uri: "https://qos.multiplay.com/v1/fleets/{fleet}/servers"
                .to_string(),
            fleet_id: String::new(),
            request_timeout_sec: 5,
            request_retries: 2,
            failure_cache_time_ms: 1_000,
            success_cache_time_ms: 30_000,
            use_gzip: true,
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            max_results: 5,
            weight_of_current_result: 0.75,
        }
    }
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            qos_check_interval_ms: 60_000,
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl DiscoveryConfig {
    /// Worst-case wall-clock cost of one discovery: every attempt times out.
    pub fn worst_case(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec) * (self.request_retries + 1)
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

impl PulseConfig {
    /// Reject configurations a probe run cannot honor. Called once before
    /// the first cycle; the engine assumes a validated config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.title.is_empty() {
            return Err(ConfigError::Invalid("title must not be empty"));
        }
        if self.title.len() > MAX_TITLE_LEN {
            return Err(ConfigError::Invalid("title exceeds the wire format cap"));
        }
        if self.probe.requests_per_endpoint == 0 {
            return Err(ConfigError::Invalid("requests_per_endpoint must be > 0"));
        }
        // sequence is a single wire byte
        if self.probe.requests_per_endpoint > 256 {
            return Err(ConfigError::Invalid("requests_per_endpoint must be <= 256"));
        }
        if self.probe.timeout_ms == 0 {
            return Err(ConfigError::Invalid("probe timeout_ms must be > 0"));
        }
        let weight = self.stats.weight_of_current_result;
        if !(0.0..=1.0).contains(&weight) {
            return Err(ConfigError::Invalid(
                "weight_of_current_result must be within [0, 1]",
            ));
        }
        if self.stats.max_results == 0 {
            return Err(ConfigError::Invalid("stats max_results must be > 0"));
        }
        if self.check.qos_check_interval_ms == 0 {
            return Err(ConfigError::Invalid("qos_check_interval_ms must be > 0"));
        }
        Ok(())
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("pulse")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PulseConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            PulseConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PULSE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PulseConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PULSE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PULSE_TITLE") {
            self.title = v;
        }
        if let Ok(v) = std::env::var("PULSE_DISCOVERY__FLEET_ID") {
            self.discovery.fleet_id = v;
        }
        if let Ok(v) = std::env::var("PULSE_DISCOVERY__URI") {
            self.discovery.discovery_service_uri = v;
        }
        if let Ok(v) = std::env::var("PULSE_DISCOVERY__USE_GZIP") {
            self.discovery.use_gzip = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("PULSE_PROBE__TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.probe.timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("PULSE_CHECK__INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.check.qos_check_interval_ms = ms;
            }
        }
    }
}
