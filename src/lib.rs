//! Adaptive knob tuning service.
//!
//! Holds bounded numeric parameters ("knobs") for many simulated subjects,
//! records every adjustment and observed outcome, learns which adjustments
//! help, and pushes live state changes to WebSocket subscribers.
//!
//! - [`tuning`]: registry, telemetry, learning, event bus and orchestrator
//! - [`gateway`]: subscriber connections, real-time protocol, heartbeat
//! - [`web`]: the TCP listener serving HTTP status routes and WebSocket upgrades
//! - [`config`] / [`cli`]: TOML configuration and command-line flags

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod task;
pub mod tuning;
pub mod web;

use std::time::{SystemTime, UNIX_EPOCH};

pub use error::{TuneError, TuneResult};
pub use tuning::orchestrator::{Orchestrator, OrchestratorConfig};
pub use tuning::registry::{KnobDescriptor, KnobKey, KnobSchema, SubjectContext};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
