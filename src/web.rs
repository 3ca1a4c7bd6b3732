//! TCP listener for the gateway.
//!
//! One port serves both WebSocket upgrades and a few JSON status routes:
//!
//! | Route                     | Response                                  |
//! |---------------------------|-------------------------------------------|
//! | `GET /ws`, `GET /ws/<id>` | WebSocket session, optional subject bind  |
//! | `GET /health`             | liveness and pipeline status              |
//! | `GET /status`             | connection and topic counts               |
//! | `GET /stats`              | system statistics                         |
//! | `GET /subjects/<id>/knobs`| knob states of one subject                |
//!
//! `/ws?subjectId=<id>` is equivalent to `/ws/<id>`.

use std::future::Future;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::{TuneError, TuneResult};
use crate::gateway::session::GatewayService;
use crate::tuning::orchestrator::Orchestrator;

/// Shared state handed to every accepted socket.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub gateway: Arc<GatewayService>,
}

/// Percent-decoding for path segments and query values.
pub fn url_decode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let mut iter = s.bytes();
    while let Some(b) = iter.next() {
        match b {
            b'+' => bytes.push(b' '),
            b'%' => {
                let hex: Vec<u8> = iter.by_ref().take(2).collect();
                match std::str::from_utf8(&hex).ok().and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => bytes.push(byte),
                    None => {
                        bytes.push(b'%');
                        bytes.extend_from_slice(&hex);
                    }
                }
            }
            _ => bytes.push(b),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Parse a query string into key-value pairs. Later duplicates win.
pub fn parse_query(query: &str) -> std::collections::HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let val = parts.next().unwrap_or("");
            Some((url_decode(key), url_decode(val)))
        })
        .collect()
}

fn split_target(target: &str) -> (&str, &str) {
    match target.find('?') {
        Some(idx) => (&target[..idx], &target[idx + 1..]),
        None => (target, ""),
    }
}

/// Subject affinity requested by a WebSocket upgrade target, or `None` if
/// the target is not a WebSocket route.
pub fn ws_affinity(target: &str) -> Option<Option<String>> {
    let (path, query) = split_target(target);
    if path == "/ws" || path == "/ws/" {
        return Some(parse_query(query).remove("subjectId").filter(|s| !s.is_empty()));
    }
    path.strip_prefix("/ws/").map(|id| Some(url_decode(id)))
}

/// Accept connections until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> TuneResult<()>
where
    F: Future<Output = ()>,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "gateway listening");
    }
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        debug!(%peer, error = %e, "connection error");
                    }
                });
            }
        }
    }
}

struct RequestHead {
    method: String,
    target: String,
    upgrade_websocket: bool,
}

fn parse_head(buf: &[u8]) -> Option<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    // A partial parse still yields the request line.
    let _ = req.parse(buf);
    let method = req.method?.to_string();
    let target = req.path?.to_string();
    let upgrade_websocket = req
        .headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .any(|h| {
            h.name.eq_ignore_ascii_case("upgrade") && h.value.eq_ignore_ascii_case(b"websocket")
        });
    Some(RequestHead { method, target, upgrade_websocket })
}

async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) -> TuneResult<()> {
    // Peek so the WebSocket handshake still sees the full request.
    let mut peek_buf = [0u8; 2048];
    let peek_n = stream.peek(&mut peek_buf).await?;
    let Some(head) = parse_head(&peek_buf[..peek_n]) else {
        return Ok(());
    };

    if head.upgrade_websocket {
        if let Some(affinity) = ws_affinity(&head.target) {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => Arc::clone(&state.gateway).run_session(ws, affinity).await,
                Err(e) => warn!(error = %e, "websocket handshake failed"),
            }
            return Ok(());
        }
    }

    let mut buf = vec![0u8; 8192];
    let _ = stream.read(&mut buf).await?;
    let (status, body) = route(&state, &head.method, &head.target);
    let response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Connection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Resolve a plain HTTP request to a status line and JSON body.
pub fn route(state: &AppState, method: &str, target: &str) -> (&'static str, String) {
    if method != "GET" {
        return ("405 Method Not Allowed", json!({ "error": "method not allowed" }).to_string());
    }
    let (path, _) = split_target(target);
    let result: TuneResult<serde_json::Value> = match path {
        "/health" => Ok(json!({ "status": "ok", "pipeline": state.orchestrator.status() })),
        "/status" => {
            serde_json::to_value(state.gateway.connections().status()).map_err(TuneError::from)
        }
        "/stats" => serde_json::to_value(state.orchestrator.stats()).map_err(TuneError::from),
        p => match p.strip_prefix("/subjects/").and_then(|rest| rest.strip_suffix("/knobs")) {
            Some(id) => {
                let id = url_decode(id);
                state.orchestrator.knob_states(&id).and_then(|knobs| {
                    Ok(json!({ "subjectId": id, "knobs": serde_json::to_value(knobs)? }))
                })
            }
            None => return ("404 Not Found", json!({ "error": "not found" }).to_string()),
        },
    };
    match result {
        Ok(body) => ("200 OK", body.to_string()),
        Err(e @ TuneError::NotFound { .. }) => {
            ("404 Not Found", json!({ "error": e.to_string(), "code": e.code() }).to_string())
        }
        Err(e) => {
            let body = json!({ "error": e.to_string(), "code": e.code() });
            ("500 Internal Server Error", body.to_string())
        }
    }
}
