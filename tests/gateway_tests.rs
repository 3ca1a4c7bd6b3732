//! Tests for the real-time gateway: topic fan-out, unsubscribe, stale
//! purging and a full WebSocket session over a loopback socket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use knob_tuner::gateway::heartbeat::Heartbeat;
use knob_tuner::gateway::{
    ConnectionRegistry, GatewayConfig, GatewayService, Outbound, ServerMessage,
};
use knob_tuner::tuning::bus::{EventBus, EventSink, Topic};
use knob_tuner::tuning::catalog::build_schema;
use knob_tuner::web::{self, AppState};
use knob_tuner::{Orchestrator, OrchestratorConfig, SubjectContext};

struct Harness {
    orchestrator: Arc<Orchestrator>,
    connections: Arc<ConnectionRegistry>,
    gateway: Arc<GatewayService>,
}

async fn harness() -> Harness {
    let connections = Arc::new(ConnectionRegistry::new(64));
    let bus = Arc::new(EventBus::new(vec![connections.clone() as Arc<dyn EventSink>]));
    let schema = Arc::new(build_schema(true, Vec::new()).unwrap());
    let orchestrator = Orchestrator::start(OrchestratorConfig::default(), schema, bus);
    orchestrator.register_subject("S1", SubjectContext::default()).unwrap();
    orchestrator.register_subject("S2", SubjectContext::default()).unwrap();
    orchestrator.flush().await.unwrap();
    let gateway = Arc::new(GatewayService::new(
        Arc::clone(&orchestrator),
        Arc::clone(&connections),
        GatewayConfig::default(),
    ));
    Harness { orchestrator, connections, gateway }
}

/// Drain every queued bus event of one connection.
fn drain_events(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Topic> {
    let mut topics = Vec::new();
    while let Ok(item) = rx.try_recv() {
        if let Outbound::Message(ServerMessage::Event(e)) = item {
            topics.push(e.topic);
        }
    }
    topics
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_publish_reaches_exactly_topic_subscribers() {
    let h = harness().await;
    let (adj_conn, mut adj_rx) = h.connections.connect(None).unwrap();
    let (sim_conn, mut sim_rx) = h.connections.connect(None).unwrap();
    let (_idle, mut idle_rx) = h.connections.connect(None).unwrap();
    h.connections.subscribe(&adj_conn, &["knob_adjustments".into()], None).unwrap();
    h.connections.subscribe(&sim_conn, &["simulation_events".into()], None).unwrap();

    h.orchestrator.adjust_knob("S1", "fiscal", "taxRate", 0.8, "test", 0.9).unwrap();
    h.orchestrator.flush().await.unwrap();

    assert_eq!(drain_events(&mut adj_rx), vec![Topic::KnobAdjustments]);
    assert!(drain_events(&mut sim_rx).is_empty());
    assert!(drain_events(&mut idle_rx).is_empty());
}

#[tokio::test]
async fn test_affinity_filters_other_subjects() {
    let h = harness().await;
    let (conn, mut rx) = h.gateway.open(Some("S1".into())).unwrap();
    h.connections.subscribe(&conn, &[], None).unwrap();

    h.orchestrator.adjust_knob("S2", "fiscal", "taxRate", 0.2, "test", 0.9).unwrap();
    h.orchestrator.adjust_knob("S1", "fiscal", "taxRate", 0.3, "test", 0.9).unwrap();
    h.orchestrator.flush().await.unwrap();

    assert_eq!(drain_events(&mut rx), vec![Topic::KnobAdjustments]);
}

#[tokio::test]
async fn test_unsubscribe_excludes_connection_from_next_broadcast() {
    let h = harness().await;
    let (a, mut a_rx) = h.connections.connect(None).unwrap();
    let (b, mut b_rx) = h.connections.connect(None).unwrap();
    for id in [&a, &b] {
        h.connections.subscribe(id, &["knob_adjustments".into()], None).unwrap();
    }
    h.connections.unsubscribe(&b, &["knob_adjustments".into()]).unwrap();

    h.orchestrator.adjust_knob("S1", "fiscal", "taxRate", 0.6, "test", 0.9).unwrap();
    h.orchestrator.flush().await.unwrap();

    assert_eq!(drain_events(&mut a_rx).len(), 1);
    assert!(drain_events(&mut b_rx).is_empty());
}

#[tokio::test]
async fn test_status_counts_subscribers_per_topic() {
    let h = harness().await;
    let (a, _a_rx) = h.connections.connect(None).unwrap();
    let (b, _b_rx) = h.gateway.open(Some("S1".into())).unwrap();
    h.connections.subscribe(&a, &["recommendations".into()], None).unwrap();
    let both = ["recommendations".into(), "performance_updates".into()];
    h.connections.subscribe(&b, &both, None).unwrap();

    let status = h.connections.status();
    assert_eq!(status.active_connections, 2);
    assert_eq!(status.topic_subscribers[&Topic::Recommendations], 2);
    assert_eq!(status.topic_subscribers[&Topic::PerformanceUpdates], 1);
    assert_eq!(status.subject_connections["S1"], 1);
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_silent_connection_purged_within_one_interval() {
    let h = harness().await;
    let (silent, _rx) = h.connections.connect(None).unwrap();
    let interval = Duration::from_millis(50);
    let heartbeat =
        Heartbeat::start(Arc::clone(&h.connections), interval, Duration::from_millis(10));

    // stale_after elapses, then at most one interval until the sweep.
    tokio::time::sleep(Duration::from_millis(10) + interval * 2).await;
    assert!(h.connections.info(&silent).is_err());
    heartbeat.stop().await;
}

// ---------------------------------------------------------------------------
// WebSocket over loopback
// ---------------------------------------------------------------------------

async fn spawn_server(h: &Harness) -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(AppState {
        orchestrator: Arc::clone(&h.orchestrator),
        gateway: Arc::clone(&h.gateway),
    });
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = web::serve(listener, state, async {
            let _ = stop_rx.await;
        })
        .await;
    });
    (addr.to_string(), stop_tx)
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_websocket_session_roundtrip() {
    let h = harness().await;
    let (addr, stop) = spawn_server(&h).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/S1")).await.unwrap();

    let greeting = next_json(&mut ws).await;
    assert_eq!(greeting["type"], "connected");
    assert_eq!(greeting["subjectId"], "S1");

    let subscribe = r#"{"type":"subscribe","payload":{"topics":["knob_adjustments"]}}"#;
    ws.send(Message::Text(subscribe.into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "subscribed");

    ws.send(Message::Text(r#"{"type":"knob_request"}"#.into())).await.unwrap();
    let state = next_json(&mut ws).await;
    assert_eq!(state["type"], "knob_state");
    assert_eq!(state["payload"]["knobs"]["fiscal.taxRate"]["value"], 0.5);

    let push =
        r#"{"type":"knob_adjustment","payload":{"module":"fiscal","knob":"taxRate","value":0.8}}"#;
    ws.send(Message::Text(push.into())).await.unwrap();
    let pushed = next_json(&mut ws).await;
    assert_eq!(pushed["type"], "knob_adjustment");
    assert_eq!(pushed["payload"]["event"]["data"]["new_value"], 0.8);
    assert_eq!(h.orchestrator.knob_states("S1").unwrap()["fiscal.taxRate"].value, 0.8);

    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "pong");

    ws.send(Message::Text("garbage".into())).await.unwrap();
    let err = next_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["payload"]["code"], "invalid_value");

    ws.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.connections.is_empty());
    let _ = stop.send(());
}

#[tokio::test]
async fn test_websocket_unknown_subject_gets_error() {
    let h = harness().await;
    let (addr, stop) = spawn_server(&h).await;
    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws/ghost")).await.unwrap();
    let err = next_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["payload"]["code"], "not_found");
    assert!(h.connections.is_empty());
    let _ = stop.send(());
}

#[tokio::test]
async fn test_http_status_route() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let h = harness().await;
    let (addr, stop) = spawn_server(&h).await;
    let mut stream = tokio::net::TcpStream::connect(&addr).await.unwrap();
    stream.write_all(b"GET /stats HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let v: Value = serde_json::from_str(body).unwrap();
    assert_eq!(v["registered_subjects"], 2);
    let _ = stop.send(());
}
