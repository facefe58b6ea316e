//! Local test server: httpbin-style endpoints plus a mock MCP server
//!
//! Spawned on an ephemeral port per test. The MCP mock implements enough of
//! the Streamable HTTP binding to exercise session initialization, buffered
//! and SSE response modes, and invalid-session rejection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// How the MCP mock answers `tools/list`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolsMode {
    /// Buffered JSON response
    Json,
    /// SSE stream carrying a progress notification then the response
    Sse,
}

/// One observed MCP exchange, for test assertions
#[derive(Debug, Clone)]
pub struct McpExchange {
    pub method: String,
    pub session: Option<String>,
}

#[derive(Debug)]
pub struct ServerState {
    pub sessions: Mutex<Vec<String>>,
    pub session_counter: AtomicUsize,
    pub exchanges: Mutex<Vec<McpExchange>>,
    pub tools_mode: Mutex<ToolsMode>,
    /// Answer every `tools/list` with 404 "Session not found"
    pub reject_tools: AtomicBool,
    /// Answer `initialize` with a JSON-RPC error
    pub fail_initialize: AtomicBool,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            session_counter: AtomicUsize::new(0),
            exchanges: Mutex::new(Vec::new()),
            tools_mode: Mutex::new(ToolsMode::Json),
            reject_tools: AtomicBool::new(false),
            fail_initialize: AtomicBool::new(false),
        }
    }
}

impl ServerState {
    pub fn exchange_methods(&self) -> Vec<String> {
        self.exchanges
            .lock()
            .iter()
            .map(|exchange| exchange.method.clone())
            .collect()
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn() -> TestServer {
    let state = Arc::new(ServerState::default());
    let app = Router::new()
        .route("/get", get(handle_get_args))
        .route("/delay/{secs}", get(handle_delay))
        .route("/chunks", get(handle_chunks))
        .route("/events", get(handle_events))
        .route("/mcp", post(handle_mcp))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
    let addr = listener.local_addr().expect("test server addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });

    TestServer {
        addr,
        state,
        handle,
    }
}

/// GET /get?... -> {"args": {...}} (httpbin style)
async fn handle_get_args(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    Json(json!({ "args": params }))
}

/// GET /delay/{secs} -> JSON after sleeping
async fn handle_delay(Path(secs): Path<u64>) -> impl IntoResponse {
    tokio::time::sleep(Duration::from_secs(secs)).await;
    Json(json!({ "delayed": secs }))
}

/// GET /chunks -> 20 KiB delivered as trickled 1 KiB chunks
async fn handle_chunks() -> Response {
    let stream = futures::stream::iter(0..20u8).then(|_| async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok::<_, std::convert::Infallible>(bytes::Bytes::from(vec![b'x'; 1024]))
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from_stream(stream))
        .expect("chunked response")
}

/// GET /events -> a short SSE stream, then end-of-stream
async fn handle_events() -> Response {
    let frames = "retry: 1500\n\n\
                  event: tick\nid: 1\ndata: one\n\n\
                  data: {\ndata:   \"n\": 2\ndata: }\n\n\
                  event: tick\nid: 3\ndata: three\n\n";
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from(frames))
        .expect("sse response")
}

/// POST /mcp -> mock Streamable HTTP MCP server
async fn handle_mcp(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let session = headers
        .get("mcp-session-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    state.exchanges.lock().push(McpExchange {
        method: method.clone(),
        session: session.clone(),
    });

    let id = request.get("id").cloned().unwrap_or(Value::Null);

    match method.as_str() {
        "initialize" => {
            if state.fail_initialize.load(Ordering::SeqCst) {
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32602, "message": "unsupported protocol version"},
                });
                return Json(body).into_response();
            }
            let n = state.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let session_id = format!("sess-{}", n);
            state.sessions.lock().push(session_id.clone());

            let body = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2025-06-18",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "volley-test-server", "version": "0.0.0"},
                },
            });
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .header("Mcp-Session-Id", session_id)
                .body(Body::from(body.to_string()))
                .expect("initialize response")
        }
        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
        _ => {
            let session_valid = session
                .as_ref()
                .map(|sid| state.sessions.lock().contains(sid))
                .unwrap_or(false);
            if state.reject_tools.load(Ordering::SeqCst) || !session_valid {
                return (StatusCode::NOT_FOUND, "Session not found").into_response();
            }

            let reply = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "tools": [
                        {"name": "echo", "description": "echoes its arguments"},
                        {"name": "add", "description": "adds two numbers"},
                    ],
                },
            });
            match *state.tools_mode.lock() {
                ToolsMode::Json => Json(reply).into_response(),
                ToolsMode::Sse => {
                    let progress = json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/progress",
                        "params": {"progress": 100, "total": 100},
                    });
                    let frames =
                        format!("data: {}\n\nid: evt-1\ndata: {}\n\n", progress, reply);
                    Response::builder()
                        .status(StatusCode::OK)
                        .header(header::CONTENT_TYPE, "text/event-stream")
                        .body(Body::from(frames))
                        .expect("sse tools response")
                }
            }
        }
    }
}
