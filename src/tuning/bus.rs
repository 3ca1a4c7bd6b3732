//! # Stage: Event Bus
//!
//! ## Responsibility
//! Carries every published state change on one of four closed topics. Each
//! [`BusEvent`] is handed synchronously to the registered [`EventSink`]s
//! (the gateway's connection registry) and then broadcast to in-process
//! subscribers.
//!
//! ## Guarantees
//! - Total order: events carry a strictly increasing sequence number
//! - Point-in-time fan-out: sinks see an event during `publish`, so the set of
//!   recipients is fixed at publish time
//! - Non-blocking: `publish` never waits on a slow subscriber; lagging
//!   broadcast receivers skip events
//!
//! ## NOT Responsible For
//! - Per-connection filtering (gateway)
//! - Delivery guarantees beyond best effort

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::TuneError;
use crate::now_ms;
use crate::tuning::learning::OptimizationSuggestion;
use crate::tuning::registry::{KnobAdjustment, Subject};
use crate::tuning::telemetry::{PerformanceMetric, TelemetryEvent};

/// Broadcast channel capacity (events in flight per receiver).
pub const BUS_CHANNEL_CAP: usize = 1024;

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    KnobAdjustments,
    SimulationEvents,
    PerformanceUpdates,
    Recommendations,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::KnobAdjustments,
        Topic::SimulationEvents,
        Topic::PerformanceUpdates,
        Topic::Recommendations,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::KnobAdjustments    => "knob_adjustments",
            Topic::SimulationEvents   => "simulation_events",
            Topic::PerformanceUpdates => "performance_updates",
            Topic::Recommendations    => "recommendations",
        }
    }

    /// Outbound message type used for events on this topic.
    pub fn message_type(self) -> &'static str {
        match self {
            Topic::KnobAdjustments    => "knob_adjustment",
            Topic::SimulationEvents   => "simulation_event",
            Topic::PerformanceUpdates => "performance_update",
            Topic::Recommendations    => "recommendations",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TuneError::InvalidValue(format!("unknown topic '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    SubjectRegistered(Subject),
    KnobAdjustment(KnobAdjustment),
    SimulationEvent(TelemetryEvent),
    PerformanceUpdate(PerformanceMetric),
    Recommendations(Vec<OptimizationSuggestion>),
}

impl EventPayload {
    pub fn topic(&self) -> Topic {
        match self {
            EventPayload::SubjectRegistered(_) | EventPayload::SimulationEvent(_) => {
                Topic::SimulationEvents
            }
            EventPayload::KnobAdjustment(_) => Topic::KnobAdjustments,
            EventPayload::PerformanceUpdate(_) => Topic::PerformanceUpdates,
            EventPayload::Recommendations(_) => Topic::Recommendations,
        }
    }

    /// Subject the payload belongs to, if any.
    pub fn subject_id(&self) -> Option<&str> {
        match self {
            EventPayload::SubjectRegistered(s) => Some(&s.id),
            EventPayload::KnobAdjustment(a) => Some(&a.subject_id),
            EventPayload::SimulationEvent(e) => Some(&e.subject_id),
            EventPayload::PerformanceUpdate(m) => Some(&m.subject_id),
            EventPayload::Recommendations(list) => list.first().map(|s| s.subject_id.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub seq: u64,
    pub topic: Topic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    pub payload: EventPayload,
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// EventSink
// ---------------------------------------------------------------------------

/// Synchronous receiver of every published event.
///
/// Implementations must not block: `deliver` runs inside `publish`.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &BusEvent);
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

pub struct EventBus {
    seq: AtomicU64,
    tx: broadcast::Sender<BusEvent>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        let (tx, _) = broadcast::channel(BUS_CHANNEL_CAP);
        Self { seq: AtomicU64::new(0), tx, sinks }
    }

    /// Stamp, fan out and broadcast one event.
    pub fn publish(&self, payload: EventPayload) -> BusEvent {
        let event = BusEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            topic: payload.topic(),
            subject_id: payload.subject_id().map(str::to_string),
            payload,
            timestamp_ms: now_ms(),
        };
        for sink in &self.sinks {
            sink.deliver(&event);
        }
        // No receivers is not an error.
        let _ = self.tx.send(event.clone());
        tracing::debug!(seq = event.seq, topic = %event.topic, "event published");
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn published(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
