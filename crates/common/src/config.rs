//! Configuration structures for Expo
//!
//! This module defines the configuration types used by the dispatcher and by
//! stations. Configurations are loaded from YAML files or from environment
//! variables.

use crate::error::{ExpoError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for Expo components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpoConfig {
    /// Mode: either "dispatcher" or "station"
    pub mode: String,

    /// Server binding address
    pub bind_address: String,

    /// Server port
    pub port: u16,

    /// Dispatcher-specific configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatcher: Option<DispatcherConfig>,

    /// Station-specific configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station: Option<StationConfig>,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Dispatcher-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Upper bound on one order exchange; unset means wait indefinitely
    #[serde(default)]
    pub order_timeout_ms: Option<u64>,

    /// Stale rotation entries tolerated per speciality before compaction
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            order_timeout_ms: None,
            compaction_threshold: default_compaction_threshold(),
        }
    }
}

/// Station (reference worker) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Dispatcher address, `host:port`
    pub dispatcher_endpoint: String,

    /// Identifier announced on join
    pub worker_id: String,

    /// Specialities announced on join
    pub specialities: Vec<String>,

    /// Prefix prepended to string orders when answering
    #[serde(default = "default_response_prefix")]
    pub response_prefix: String,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: false,
        }
    }
}

/// Default value functions
fn default_compaction_threshold() -> usize {
    64
}

fn default_response_prefix() -> String {
    "cooked-".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

impl ExpoConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ExpoError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config = Self::from_yaml(&content).map_err(|e| {
            ExpoError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        Ok(config)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ExpoConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mode = env_or("EXPO_MODE", "dispatcher");

        let order_timeout_ms = match std::env::var("EXPO_ORDER_TIMEOUT_MS") {
            Ok(raw) => Some(
                raw.parse()
                    .map_err(|_| ExpoError::config("Invalid EXPO_ORDER_TIMEOUT_MS"))?,
            ),
            Err(_) => None,
        };

        let station = match std::env::var("EXPO_STATION_ID") {
            Ok(worker_id) => Some(StationConfig {
                dispatcher_endpoint: env_or("EXPO_DISPATCHER_ENDPOINT", "127.0.0.1:7878"),
                worker_id,
                specialities: env_or("EXPO_STATION_SPECIALITIES", "")
                    .split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .collect(),
                response_prefix: env_or("EXPO_STATION_PREFIX", &default_response_prefix()),
            }),
            Err(_) => None,
        };

        let config = ExpoConfig {
            mode,
            bind_address: env_or("EXPO_BIND_ADDRESS", "0.0.0.0"),
            port: env_or("EXPO_PORT", "7878")
                .parse()
                .map_err(|_| ExpoError::config("Invalid port number"))?,
            dispatcher: Some(DispatcherConfig {
                order_timeout_ms,
                ..DispatcherConfig::default()
            }),
            station,
            observability: Some(ObservabilityConfig {
                log_level: env_or("EXPO_LOG_LEVEL", &default_log_level()),
                structured_logging: std::env::var("EXPO_STRUCTURED_LOGGING").is_ok(),
            }),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.mode.as_str() {
            "dispatcher" => {
                if let Some(dispatcher) = &self.dispatcher {
                    if dispatcher.order_timeout_ms == Some(0) {
                        return Err(ExpoError::config("order_timeout_ms must be positive"));
                    }
                }
            }
            "station" => {
                let station = self
                    .station
                    .as_ref()
                    .ok_or_else(|| ExpoError::config("Station config required for station mode"))?;

                if station.worker_id.is_empty() {
                    return Err(ExpoError::config("Station worker_id must not be empty"));
                }
                if station.specialities.is_empty() {
                    return Err(ExpoError::config("Station needs at least one speciality"));
                }
            }
            _ => {
                return Err(ExpoError::config(format!("Invalid mode: {}", self.mode)));
            }
        }
        Ok(())
    }

    /// Dispatcher settings, defaulted when the section is absent
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        self.dispatcher.clone().unwrap_or_default()
    }

    /// Get the optional order timeout as Duration
    pub fn order_timeout(&self) -> Option<Duration> {
        self.dispatcher
            .as_ref()
            .and_then(|d| d.order_timeout_ms)
            .map(Duration::from_millis)
    }

    /// Address the dispatcher listens on
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Observability settings, defaulted when the section is absent
    pub fn observability_config(&self) -> ObservabilityConfig {
        self.observability.clone().unwrap_or_default()
    }
}
