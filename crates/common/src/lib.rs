//! Expo common library
//!
//! This crate contains shared code used across Expo components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{DispatcherConfig, ExpoConfig, ObservabilityConfig, StationConfig};
pub use error::{ExpoError, RelaySide, Result};
pub use metrics::{MetricsRegistry, METRICS};
