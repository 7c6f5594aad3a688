//! Common error types for Expo
//!
//! This module defines all error types used across the Expo system.
//! Errors that a caller should hear about convert to a [`Rejection`] payload.

use expo_proto::{Rejection, Speciality};
use std::fmt;
use thiserror::Error;

/// Which end of an order relay failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySide {
    /// The requesting client
    Client,

    /// The selected worker
    Worker,
}

impl fmt::Display for RelaySide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelaySide::Client => f.write_str("client"),
            RelaySide::Worker => f.write_str("worker"),
        }
    }
}

/// Main error type for Expo
#[derive(Error, Debug)]
pub enum ExpoError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A recognized request carried malformed data
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The request's `type` is not part of the vocabulary
    #[error("Unknown request type: {0}")]
    UnknownRequestType(String),

    /// Rotation for a speciality ran dry
    #[error("No available worker for speciality {0}")]
    NoAvailableWorker(Speciality),

    /// One side of an order exchange went away mid-relay
    #[error("Relay failure on {side} side: {reason}")]
    RelayFailure { side: RelaySide, reason: String },

    /// The peer of a channel is gone
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl ExpoError {
    /// Stable code sent to callers
    pub fn code(&self) -> &'static str {
        match self {
            ExpoError::Config(_) => "config",
            ExpoError::Serialization(_) => "serialization",
            ExpoError::Yaml(_) => "serialization",
            ExpoError::Io(_) => "io",
            ExpoError::InvalidInput(_) => "invalid_input",
            ExpoError::UnknownRequestType(_) => "unknown_request_type",
            ExpoError::NoAvailableWorker(_) => "no_available_worker",
            ExpoError::RelayFailure { .. } => "relay_failure",
            ExpoError::ChannelClosed(_) => "channel_closed",
            ExpoError::Timeout(_) => "timeout",
        }
    }

    /// Convert error to the rejection delivered to a caller
    pub fn to_rejection(&self) -> Rejection {
        Rejection::new(self.code(), self.to_string())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ExpoError::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ExpoError::InvalidInput(msg.into())
    }

    /// Create an unknown request type error
    pub fn unknown_request_type(kind: impl Into<String>) -> Self {
        ExpoError::UnknownRequestType(kind.into())
    }

    /// Create a relay failure attributed to `side`
    pub fn relay(side: RelaySide, reason: impl fmt::Display) -> Self {
        ExpoError::RelayFailure {
            side,
            reason: reason.to_string(),
        }
    }

    /// Create a channel closed error
    pub fn channel_closed(msg: impl Into<String>) -> Self {
        ExpoError::ChannelClosed(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        ExpoError::Timeout(msg.into())
    }

    /// Whether the failure is attributed to a worker's channel
    pub fn is_worker_failure(&self) -> bool {
        matches!(
            self,
            ExpoError::RelayFailure {
                side: RelaySide::Worker,
                ..
            }
        )
    }
}

/// Result type alias for Expo operations
pub type Result<T> = std::result::Result<T, ExpoError>;
