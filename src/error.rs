//! Crate-level error type.
//!
//! `NotFound` and `InvalidValue` are returned synchronously to the direct
//! caller of a core method. Failures on the asynchronous side-effect path
//! (telemetry recording, fan-out, pattern learning) are logged and never
//! surface here.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the tuning core, the gateway and the service shell.
#[derive(Debug, Error)]
pub enum TuneError {
    /// Unknown subject, knob, suggestion or connection.
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// Non-numeric or structurally malformed input. Out-of-range knob values
    /// are clamped, not reported through this variant.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// A dependent component is not running (stopped pipeline, poisoned lock).
    #[error("component unavailable: {0}")]
    Unavailable(String),

    /// An operation exceeded its cutoff.
    #[error("{operation} exceeded its cutoff of {}ms", cutoff.as_millis())]
    Timeout {
        operation: &'static str,
        cutoff: Duration,
    },

    /// Sending to a subscriber connection failed.
    #[error("connection {connection_id}: {detail}")]
    Connection { connection_id: String, detail: String },

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TuneError {
    pub fn subject_not_found(id: impl Into<String>) -> Self {
        TuneError::NotFound { what: "subject", id: id.into() }
    }

    pub fn knob_not_found(module: &str, knob: &str) -> Self {
        TuneError::NotFound { what: "knob", id: format!("{module}.{knob}") }
    }

    pub fn poisoned(what: &str) -> Self {
        TuneError::Unavailable(format!("{what} lock poisoned"))
    }

    /// Short machine-readable code, used in gateway error frames.
    pub fn code(&self) -> &'static str {
        match self {
            TuneError::NotFound { .. } => "not_found",
            TuneError::InvalidValue(_) => "invalid_value",
            TuneError::Unavailable(_) => "unavailable",
            TuneError::Timeout { .. } => "timeout",
            TuneError::Connection { .. } => "connection_error",
            TuneError::Config(_) => "config",
            TuneError::Io(_) => "io",
            TuneError::Json(_) => "invalid_value",
        }
    }
}

impl From<toml::de::Error> for TuneError {
    fn from(e: toml::de::Error) -> Self {
        TuneError::Config(e.to_string())
    }
}

pub type TuneResult<T> = Result<T, TuneError>;
