//! # Stage: Connection Registry
//!
//! ## Responsibility
//! Tracks every live subscriber connection: its topic set, optional subject
//! affinity, last-seen time and bounded outbound queue. Implements
//! [`EventSink`] so the event bus fans out directly into the queues.
//!
//! ## Guarantees
//! - Point-in-time fan-out: an event reaches exactly the connections
//!   subscribed to its topic when it is delivered
//! - Non-blocking: delivery is `try_send`; a full or closed queue removes
//!   that connection only
//! - Affinity is write-once: it may be set, never changed to another subject
//!
//! ## NOT Responsible For
//! - Socket I/O (session)
//! - Deciding when a connection is stale (heartbeat supplies the threshold)

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{TuneError, TuneResult};
use crate::gateway::protocol::ServerMessage;
use crate::now_ms;
use crate::tuning::bus::{BusEvent, EventSink, Topic};

/// Item in a connection's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Liveness check, sent as a WebSocket ping frame.
    Ping,
}

#[derive(Debug)]
struct Connection {
    affinity: Option<String>,
    topics: BTreeSet<Topic>,
    connected_at_ms: u64,
    last_seen_ms: u64,
    tx: mpsc::Sender<Outbound>,
}

impl Connection {
    fn wants(&self, event: &BusEvent) -> bool {
        if !self.topics.contains(&event.topic) {
            return false;
        }
        match (&self.affinity, &event.subject_id) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => true,
        }
    }
}

/// Snapshot of one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub subject_id: Option<String>,
    pub topics: Vec<Topic>,
    pub connected_at_ms: u64,
    pub last_seen_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub active_connections: usize,
    pub topic_subscribers: BTreeMap<Topic, usize>,
    pub subject_connections: BTreeMap<String, usize>,
    /// Connections removed because their queue was full or closed.
    pub dropped_connections: u64,
}

pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Connection>>,
    queue_capacity: usize,
    dropped: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a connection. The returned receiver already holds the
    /// `connected` greeting.
    pub fn connect(
        &self,
        affinity: Option<String>,
    ) -> TuneResult<(String, mpsc::Receiver<Outbound>)> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let greeting =
            ServerMessage::Connected { topics: Topic::ALL.to_vec(), subject_id: affinity.clone() };
        tx.try_send(Outbound::Message(greeting)).map_err(|e| TuneError::Connection {
            connection_id: id.clone(),
            detail: e.to_string(),
        })?;

        let now = now_ms();
        let conn = Connection {
            affinity,
            topics: BTreeSet::new(),
            connected_at_ms: now,
            last_seen_ms: now,
            tx,
        };
        self.lock()?.insert(id.clone(), conn);
        debug!(connection = %id, "connection opened");
        Ok((id, rx))
    }

    /// Remove a connection. Dropping its sender ends the session's outbox.
    pub fn disconnect(&self, id: &str) -> bool {
        let removed = self.lock().map(|mut c| c.remove(id).is_some()).unwrap_or(false);
        if removed {
            debug!(connection = %id, "connection closed");
        }
        removed
    }

    /// Add topics (all of them when `topics` is empty) and optionally set the
    /// subject affinity. Validation happens before any change is applied.
    pub fn subscribe(
        &self,
        id: &str,
        topics: &[String],
        affinity: Option<String>,
    ) -> TuneResult<(Vec<Topic>, Option<String>)> {
        let parsed = parse_topics(topics)?;
        let parsed = if parsed.is_empty() { Topic::ALL.to_vec() } else { parsed };

        let mut conns = self.lock()?;
        let conn = conns.get_mut(id).ok_or_else(|| connection_not_found(id))?;
        if let Some(requested) = affinity {
            match &conn.affinity {
                Some(current) if *current != requested => {
                    return Err(TuneError::InvalidValue(format!(
                        "connection is bound to subject '{current}' \
                         and cannot switch to '{requested}'"
                    )));
                }
                Some(_) => {}
                None => conn.affinity = Some(requested),
            }
        }
        conn.topics.extend(parsed);
        conn.last_seen_ms = now_ms();
        Ok((conn.topics.iter().copied().collect(), conn.affinity.clone()))
    }

    /// Remove topics (all of them when `topics` is empty). Returns the topics
    /// still subscribed.
    pub fn unsubscribe(&self, id: &str, topics: &[String]) -> TuneResult<Vec<Topic>> {
        let parsed = parse_topics(topics)?;
        let parsed = if parsed.is_empty() { Topic::ALL.to_vec() } else { parsed };
        let mut conns = self.lock()?;
        let conn = conns.get_mut(id).ok_or_else(|| connection_not_found(id))?;
        for topic in &parsed {
            conn.topics.remove(topic);
        }
        conn.last_seen_ms = now_ms();
        Ok(conn.topics.iter().copied().collect())
    }

    pub fn affinity(&self, id: &str) -> TuneResult<Option<String>> {
        let conns = self.lock()?;
        let conn = conns.get(id).ok_or_else(|| connection_not_found(id))?;
        Ok(conn.affinity.clone())
    }

    /// Record inbound activity.
    pub fn touch(&self, id: &str) {
        self.touch_at(id, now_ms());
    }

    pub fn touch_at(&self, id: &str, now: u64) {
        if let Ok(mut conns) = self.lock() {
            if let Some(conn) = conns.get_mut(id) {
                conn.last_seen_ms = now;
            }
        }
    }

    /// Enqueue one item for a single connection. Failure removes it.
    pub fn send(&self, id: &str, item: Outbound) -> TuneResult<()> {
        let mut conns = self.lock()?;
        let conn = conns.get(id).ok_or_else(|| connection_not_found(id))?;
        if let Err(e) = conn.tx.try_send(item) {
            conns.remove(id);
            drop(conns);
            return Err(self.dropped_connection(id, &e.to_string()));
        }
        Ok(())
    }

    /// Queue a ping on every connection. Returns the number pinged.
    pub fn ping_all(&self) -> usize {
        let Ok(mut conns) = self.lock() else { return 0 };
        let mut failed = Vec::new();
        for (id, conn) in conns.iter() {
            if let Err(e) = conn.tx.try_send(Outbound::Ping) {
                failed.push((id.clone(), e.to_string()));
            }
        }
        for (id, _) in &failed {
            conns.remove(id);
        }
        let pinged = conns.len();
        drop(conns);
        for (id, detail) in failed {
            self.dropped_connection(&id, &detail);
        }
        pinged
    }

    /// Remove connections silent for longer than `threshold`.
    pub fn sweep_stale(&self, threshold: Duration) -> Vec<String> {
        self.sweep_stale_at(now_ms(), threshold)
    }

    pub fn sweep_stale_at(&self, now: u64, threshold: Duration) -> Vec<String> {
        let threshold_ms = threshold.as_millis() as u64;
        let Ok(mut conns) = self.lock() else { return Vec::new() };
        let stale: Vec<String> = conns
            .iter()
            .filter(|(_, c)| now.saturating_sub(c.last_seen_ms) > threshold_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            conns.remove(id);
        }
        stale
    }

    pub fn info(&self, id: &str) -> TuneResult<ConnectionInfo> {
        let conns = self.lock()?;
        let conn = conns.get(id).ok_or_else(|| connection_not_found(id))?;
        Ok(ConnectionInfo {
            id: id.to_string(),
            subject_id: conn.affinity.clone(),
            topics: conn.topics.iter().copied().collect(),
            connected_at_ms: conn.connected_at_ms,
            last_seen_ms: conn.last_seen_ms,
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        let mut status = ConnectionStatus {
            dropped_connections: self.dropped.load(Ordering::Relaxed),
            topic_subscribers: Topic::ALL.into_iter().map(|t| (t, 0)).collect(),
            ..ConnectionStatus::default()
        };
        if let Ok(conns) = self.lock() {
            status.active_connections = conns.len();
            for conn in conns.values() {
                for topic in &conn.topics {
                    *status.topic_subscribers.entry(*topic).or_default() += 1;
                }
                if let Some(subject) = &conn.affinity {
                    *status.subject_connections.entry(subject.clone()).or_default() += 1;
                }
            }
        }
        status
    }

    pub fn len(&self) -> usize {
        self.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- internal ---

    fn lock(&self) -> TuneResult<std::sync::MutexGuard<'_, HashMap<String, Connection>>> {
        self.connections.lock().map_err(|_| TuneError::poisoned("connections"))
    }

    fn dropped_connection(&self, id: &str, detail: &str) -> TuneError {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        let err =
            TuneError::Connection { connection_id: id.to_string(), detail: detail.to_string() };
        warn!(connection = %id, error = %err, "subscriber removed");
        err
    }
}

impl EventSink for ConnectionRegistry {
    fn deliver(&self, event: &BusEvent) {
        let Ok(mut conns) = self.lock() else { return };
        let mut failed = Vec::new();
        for (id, conn) in conns.iter() {
            if !conn.wants(event) {
                continue;
            }
            let item = Outbound::Message(ServerMessage::Event(event.clone()));
            if let Err(e) = conn.tx.try_send(item) {
                failed.push((id.clone(), e.to_string()));
            }
        }
        for (id, _) in &failed {
            conns.remove(id);
        }
        drop(conns);
        for (id, detail) in failed {
            self.dropped_connection(&id, &detail);
        }
    }
}

fn parse_topics(topics: &[String]) -> TuneResult<Vec<Topic>> {
    topics.iter().map(|t| t.parse::<Topic>()).collect()
}

fn connection_not_found(id: &str) -> TuneError {
    TuneError::NotFound { what: "connection", id: id.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::bus::EventPayload;
    use crate::tuning::registry::{Subject, SubjectContext};

    fn event(seq: u64, topic: Topic, subject: &str) -> BusEvent {
        BusEvent {
            seq,
            topic,
            subject_id: Some(subject.to_string()),
            payload: EventPayload::SubjectRegistered(Subject {
                id: subject.to_string(),
                registered_at_ms: 0,
                context: SubjectContext::default(),
            }),
            timestamp_ms: 0,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_connect_greets_with_topic_list() {
        let reg = ConnectionRegistry::new(8);
        let (_, mut rx) = reg.connect(None).unwrap();
        let items = drain(&mut rx);
        assert_eq!(items.len(), 1);
        let Outbound::Message(ServerMessage::Connected { topics, .. }) = &items[0] else {
            panic!("expected a greeting, got {:?}", items[0]);
        };
        assert_eq!(topics.len(), 4);
    }

    #[test]
    fn test_delivery_respects_topics() {
        let reg = ConnectionRegistry::new(8);
        let (a, mut rx_a) = reg.connect(None).unwrap();
        let (_b, mut rx_b) = reg.connect(None).unwrap();
        reg.subscribe(&a, &topics(&["simulation_events"]), None).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        reg.deliver(&event(1, Topic::SimulationEvents, "S1"));
        reg.deliver(&event(2, Topic::KnobAdjustments, "S1"));
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_unsubscribe_excludes_from_next_delivery() {
        let reg = ConnectionRegistry::new(8);
        let (a, mut rx) = reg.connect(None).unwrap();
        reg.subscribe(&a, &topics(&["simulation_events"]), None).unwrap();
        reg.unsubscribe(&a, &topics(&["simulation_events"])).unwrap();
        drain(&mut rx);
        reg.deliver(&event(1, Topic::SimulationEvents, "S1"));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_affinity_filters_other_subjects() {
        let reg = ConnectionRegistry::new(8);
        let (a, mut rx) = reg.connect(Some("S1".into())).unwrap();
        reg.subscribe(&a, &[], None).unwrap();
        drain(&mut rx);
        reg.deliver(&event(1, Topic::SimulationEvents, "S2"));
        reg.deliver(&event(2, Topic::SimulationEvents, "S1"));
        let got = drain(&mut rx);
        assert_eq!(got.len(), 1);
        assert!(matches!(&got[0], Outbound::Message(ServerMessage::Event(e)) if e.seq == 2));
    }

    #[test]
    fn test_affinity_cannot_change() {
        let reg = ConnectionRegistry::new(8);
        let (a, _rx) = reg.connect(None).unwrap();
        reg.subscribe(&a, &[], Some("S1".into())).unwrap();
        reg.subscribe(&a, &[], Some("S1".into())).unwrap();
        let rebind = reg.subscribe(&a, &[], Some("S2".into()));
        assert!(matches!(rebind, Err(TuneError::InvalidValue(_))));
        assert_eq!(reg.affinity(&a).unwrap().as_deref(), Some("S1"));
    }

    #[test]
    fn test_unknown_topic_rejected_without_partial_apply() {
        let reg = ConnectionRegistry::new(8);
        let (a, _rx) = reg.connect(None).unwrap();
        let err = reg.subscribe(&a, &topics(&["knob_adjustments", "gossip"]), None).unwrap_err();
        assert!(matches!(err, TuneError::InvalidValue(_)));
        assert!(reg.info(&a).unwrap().topics.is_empty());
    }

    #[test]
    fn test_full_queue_removes_only_that_connection() {
        let reg = ConnectionRegistry::new(2);
        let (slow, _rx_slow) = reg.connect(None).unwrap();
        let (fast, mut rx_fast) = reg.connect(None).unwrap();
        reg.subscribe(&slow, &[], None).unwrap();
        reg.subscribe(&fast, &[], None).unwrap();

        for seq in 1..=3 {
            reg.deliver(&event(seq, Topic::SimulationEvents, "S1"));
            drain(&mut rx_fast);
        }
        assert!(reg.info(&slow).is_err());
        assert!(reg.info(&fast).is_ok());
        assert_eq!(reg.status().dropped_connections, 1);
    }

    #[test]
    fn test_closed_receiver_removed_on_send() {
        let reg = ConnectionRegistry::new(4);
        let (a, rx) = reg.connect(None).unwrap();
        drop(rx);
        assert!(matches!(reg.send(&a, Outbound::Ping), Err(TuneError::Connection { .. })));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_sweep_stale_removes_silent_connections() {
        let reg = ConnectionRegistry::new(4);
        let (quiet, _rx1) = reg.connect(None).unwrap();
        let (chatty, _rx2) = reg.connect(None).unwrap();
        let now = now_ms();
        reg.touch_at(&quiet, now - 10_000);
        reg.touch_at(&chatty, now);
        let removed = reg.sweep_stale_at(now, Duration::from_secs(5));
        assert_eq!(removed, vec![quiet]);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_status_counts() {
        let reg = ConnectionRegistry::new(4);
        let (a, _rx1) = reg.connect(Some("S1".into())).unwrap();
        let (b, _rx2) = reg.connect(None).unwrap();
        reg.subscribe(&a, &topics(&["recommendations"]), None).unwrap();
        reg.subscribe(&b, &topics(&["recommendations", "knob_adjustments"]), None).unwrap();
        let status = reg.status();
        assert_eq!(status.active_connections, 2);
        assert_eq!(status.topic_subscribers[&Topic::Recommendations], 2);
        assert_eq!(status.topic_subscribers[&Topic::KnobAdjustments], 1);
        assert_eq!(status.topic_subscribers[&Topic::PerformanceUpdates], 0);
        assert_eq!(status.subject_connections["S1"], 1);
    }
}
