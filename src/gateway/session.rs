//! Per-connection request handling and the WebSocket session loop.
//!
//! [`GatewayService::handle_client_message`] holds all protocol logic and is
//! usable without a socket; [`GatewayService::run_session`] multiplexes one
//! socket between inbound frames and the connection's outbound queue.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::error::{TuneError, TuneResult};
use crate::gateway::connections::{ConnectionRegistry, Outbound};
use crate::gateway::protocol::{ClientMessage, ServerMessage};
use crate::tuning::orchestrator::Orchestrator;
use crate::tuning::registry::KnobAdjustment;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Outbound queue capacity per connection.
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    /// Connections silent for longer than this are purged.
    pub stale_after: Duration,
    /// Cutoff for a `knob_request` pull.
    pub request_timeout: Duration,
    /// Confidence attached to adjustments pushed by clients.
    pub push_confidence: f64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(90),
            request_timeout: Duration::from_secs(5),
            push_confidence: 0.95,
        }
    }
}

pub struct GatewayService {
    orchestrator: Arc<Orchestrator>,
    connections: Arc<ConnectionRegistry>,
    config: GatewayConfig,
}

impl GatewayService {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        connections: Arc<ConnectionRegistry>,
        config: GatewayConfig,
    ) -> Self {
        Self { orchestrator, connections, config }
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Open a connection, validating the initial affinity if one is given.
    pub fn open(
        &self,
        affinity: Option<String>,
    ) -> TuneResult<(String, tokio::sync::mpsc::Receiver<Outbound>)> {
        if let Some(subject) = &affinity {
            self.require_subject(subject)?;
        }
        self.connections.connect(affinity)
    }

    /// Apply one inbound frame. Returns the direct reply, if any.
    ///
    /// Accepted `knob_adjustment` pushes have no direct reply; the resulting
    /// event reaches the client through its subscriptions.
    pub async fn handle_client_message(
        &self,
        connection_id: &str,
        text: &str,
    ) -> Option<ServerMessage> {
        self.connections.touch(connection_id);
        let result = match ClientMessage::parse(text) {
            Ok(msg) => self.dispatch(connection_id, msg).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(reply) => reply,
            Err(e) => {
                debug!(connection = %connection_id, error = %e, "client request failed");
                Some(ServerMessage::error(&e))
            }
        }
    }

    async fn dispatch(
        &self,
        connection_id: &str,
        msg: ClientMessage,
    ) -> TuneResult<Option<ServerMessage>> {
        match msg {
            ClientMessage::Subscribe { topics, subject_id } => {
                if let Some(subject) = &subject_id {
                    self.require_subject(subject)?;
                }
                let (topics, subject_id) =
                    self.connections.subscribe(connection_id, &topics, subject_id)?;
                Ok(Some(ServerMessage::Subscribed { topics, subject_id }))
            }
            ClientMessage::Unsubscribe { topics } => {
                let topics = self.connections.unsubscribe(connection_id, &topics)?;
                Ok(Some(ServerMessage::Unsubscribed { topics }))
            }
            ClientMessage::KnobRequest => self.pull_knob_state(connection_id).await.map(Some),
            ClientMessage::KnobAdjustment { module, knob, value, reason } => {
                let reason = reason.unwrap_or_else(|| format!("client:{connection_id}"));
                self.push_adjustment(connection_id, &module, &knob, value, &reason)?;
                Ok(None)
            }
            ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
        }
    }

    /// Knob states and performance metrics of the connection's subject.
    pub async fn pull_knob_state(&self, connection_id: &str) -> TuneResult<ServerMessage> {
        let subject_id = self.bound_subject(connection_id)?;
        let orc = Arc::clone(&self.orchestrator);
        let subject = subject_id.clone();
        let work = tokio::task::spawn_blocking(move || -> TuneResult<_> {
            Ok((orc.knob_states(&subject)?, orc.performance_metrics(&subject)?))
        });
        let cutoff = self.config.request_timeout;
        let (knobs, metrics) = tokio::time::timeout(cutoff, work)
            .await
            .map_err(|_| TuneError::Timeout { operation: "knob_request", cutoff })?
            .map_err(|e| TuneError::Unavailable(format!("knob_request worker: {e}")))??;
        Ok(ServerMessage::KnobState { subject_id, knobs, metrics })
    }

    /// Adjust a knob of the connection's subject at the push confidence.
    pub fn push_adjustment(
        &self,
        connection_id: &str,
        module: &str,
        knob: &str,
        value: f64,
        reason: &str,
    ) -> TuneResult<KnobAdjustment> {
        let subject_id = self.bound_subject(connection_id)?;
        self.orchestrator
            .adjust_knob(&subject_id, module, knob, value, reason, self.config.push_confidence)
    }

    /// Drive one WebSocket until either side closes or the connection is
    /// removed from the registry.
    pub async fn run_session<S>(self: Arc<Self>, ws: WebSocketStream<S>, affinity: Option<String>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();
        let (connection_id, mut outbox) = match self.open(affinity) {
            Ok(pair) => pair,
            Err(e) => {
                let _ = sink.send(WsMessage::Text(ServerMessage::error(&e).to_json(""))).await;
                let _ = sink.close().await;
                return;
            }
        };
        info!(connection = %connection_id, "subscriber connected");

        loop {
            tokio::select! {
                item = outbox.recv() => {
                    let frame = match item {
                        Some(Outbound::Message(msg)) => {
                            WsMessage::Text(msg.to_json(&connection_id))
                        }
                        Some(Outbound::Ping) => WsMessage::Ping(Vec::new()),
                        // Removed by the registry (stale or overflowed).
                        None => break,
                    };
                    if let Err(e) = sink.send(frame).await {
                        warn!(connection = %connection_id, error = %e, "send failed");
                        break;
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            let reply = self.handle_client_message(&connection_id, &text).await;
                            if let Some(reply) = reply {
                                let frame = WsMessage::Text(reply.to_json(&connection_id));
                                if sink.send(frame).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Ping(_))) => {
                            self.connections.touch(&connection_id);
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(connection = %connection_id, error = %e, "socket error");
                            break;
                        }
                    }
                }
            }
        }

        self.connections.disconnect(&connection_id);
        let _ = sink.close().await;
        info!(connection = %connection_id, "subscriber disconnected");
    }

    // --- internal ---

    fn bound_subject(&self, connection_id: &str) -> TuneResult<String> {
        self.connections.affinity(connection_id)?.ok_or_else(|| {
            TuneError::InvalidValue(
                "connection has no subject affinity; subscribe with a subjectId first".into(),
            )
        })
    }

    fn require_subject(&self, subject_id: &str) -> TuneResult<()> {
        if self.orchestrator.registry().contains(subject_id) {
            Ok(())
        } else {
            Err(TuneError::subject_not_found(subject_id))
        }
    }
}
