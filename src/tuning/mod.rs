//! # Module: tuning
//!
//! Tuning core: per-subject knob values, outcome telemetry, pattern learning
//! and the event bus that carries their state changes.
//!
//! ## Sub-modules
//! - [`registry`]: knob schema, subjects and bounded adjustments
//! - [`catalog`]: the built-in knob descriptors
//! - [`telemetry`]: append-only record streams and effectiveness scoring
//! - [`learning`]: learned patterns and optimization suggestions
//! - [`bus`]: closed-topic event bus
//! - [`orchestrator`]: composition root and pipeline worker

pub mod registry;
pub mod catalog;
pub mod telemetry;
pub mod learning;
pub mod bus;
pub mod orchestrator;
