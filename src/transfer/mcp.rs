//! MCP "Streamable HTTP" layer: JSON-RPC framing, sessions, auto-initialize
//!
//! An MCP transfer POSTs a single JSON-RPC message and interprets the
//! response in one of two modes chosen from the response head: a buffered
//! JSON body (single message or batch) parsed at completion, or an SSE stream
//! whose `data:` frames carry JSON-RPC messages parsed incrementally.
//!
//! Automatic initialization prepends an `initialize` request and a
//! `notifications/initialized` follow-up ahead of the main transfer,
//! capturing the server-assigned `Mcp-Session-Id` and propagating it along
//! the chain. When a pre-set session has expired (HTTP 404 or a
//! "no valid session" body), the session is cleared and the main transfer is
//! re-enqueued with the initialization chain re-attached, once per
//! submission.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::header::HeaderMap;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::buffer::StreamBuf;
use crate::engine::EngineHandle;
use crate::error::{VolleyError, VolleyResult};
use crate::rpc::{RequestId, RpcMessage};
use crate::transfer::http::Method;
use crate::transfer::sse::SseState;
use crate::transfer::{
    FailureKind, Flavor, TimeoutKind, Transfer, TransferFailure, TransferInfo,
};

/// MCP protocol revision spoken by this crate
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Capability fields that must serialize as objects even when empty
const OBJECT_CAPABILITY_FIELDS: [&str; 9] = [
    "experimental",
    "sampling",
    "logging",
    "completions",
    "roots",
    "prompts",
    "resources",
    "tools",
    "elicitation",
];

/// Server messages that indicate an expired or unknown session
static INVALID_SESSION_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)session.*?(not found|expired)|no valid session").ok());

/// Client identification sent in the initialize handshake
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
        }
    }
}

/// Message hook: returning `false` stops further messages from this response
/// (and aborts the stream in SSE mode)
pub type MessageHook = Box<dyn FnMut(&RpcMessage, &EngineHandle) -> bool + Send>;
/// Invoked with the server-assigned session id once initialization completes
pub type InitializedHook = Box<dyn FnMut(&str) + Send>;

/// Automatic-initialization configuration
pub(crate) struct AutoInit {
    pub client_info: ClientInfo,
    pub capabilities: Value,
    /// One recovery per submission: set once a re-initialization has run
    pub reinit_done: bool,
}

/// Position of a transfer within an initialization chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum McpRole {
    /// The application's transfer
    Main,
    /// The prepended `initialize` request
    Initialize,
    /// The `notifications/initialized` follow-up
    InitializedNote,
}

/// MCP protocol state embedded in an MCP-flavored transfer
pub struct McpState {
    pub(crate) rpc_message: Option<RpcMessage>,
    pub(crate) session_id: Option<String>,
    pub(crate) last_event_id: Option<String>,
    pub(crate) response_content_type: Option<String>,
    pub(crate) http_status: u16,
    /// SSE parser for the streaming response mode
    pub(crate) sse: SseState,
    pub(crate) on_message: Option<MessageHook>,
    pub(crate) on_initialized: Option<InitializedHook>,
    pub(crate) auto_init: Option<AutoInit>,
    pub(crate) role: McpRole,
    /// Id of the in-flight `initialize` request, on Initialize-role transfers
    pub(crate) init_request_id: Option<RequestId>,
    /// Messages collected by internal (non-Main) transfers
    pub(crate) collected: Vec<RpcMessage>,
}

impl std::fmt::Debug for McpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpState")
            .field("rpc_message", &self.rpc_message)
            .field("session_id", &self.session_id)
            .field("last_event_id", &self.last_event_id)
            .field("response_content_type", &self.response_content_type)
            .field("http_status", &self.http_status)
            .field("role", &self.role)
            .field("on_message", &self.on_message.as_ref().map(|_| "function"))
            .field("auto_init", &self.auto_init.as_ref().map(|_| "enabled"))
            .finish()
    }
}

impl McpState {
    pub(crate) fn new() -> Self {
        Self {
            rpc_message: None,
            session_id: None,
            last_event_id: None,
            response_content_type: None,
            http_status: 0,
            sse: SseState::new(),
            on_message: None,
            on_initialized: None,
            auto_init: None,
            role: McpRole::Main,
            init_request_id: None,
            collected: Vec::new(),
        }
    }

    /// State for a fresh request derived from this transfer: session identity
    /// carries over, response state and hooks do not
    pub(crate) fn clone_fresh(&self) -> Self {
        Self {
            session_id: self.session_id.clone(),
            last_event_id: self.last_event_id.clone(),
            ..Self::new()
        }
    }

    /// HTTP status of the final response head
    pub fn http_status(&self) -> u16 {
        self.http_status
    }

    /// `Content-Type` of the final response head
    pub fn response_content_type(&self) -> Option<&str> {
        self.response_content_type.as_deref()
    }

    /// Record the response head: status, content type, and session id
    pub(crate) fn note_response(
        &mut self,
        status: u16,
        content_type: Option<&str>,
        headers: &HeaderMap,
    ) {
        self.http_status = status;
        self.response_content_type = content_type.map(str::to_string);
        if let Some(session) = headers
            .get("mcp-session-id")
            .and_then(|value| value.to_str().ok())
        {
            debug!(session_id = session, "captured MCP session id from response");
            self.session_id = Some(session.to_string());
        }
    }

    /// Clear response state ahead of a re-submission
    pub(crate) fn reset_response(&mut self) {
        self.http_status = 0;
        self.response_content_type = None;
        self.collected.clear();
        let hook = self.sse.on_event.take();
        self.sse = SseState::new();
        self.sse.on_event = hook;
    }

    /// Frame SSE events into JSON-RPC messages and dispatch them
    ///
    /// Returns `false` to abort the stream: a hook asked to stop, or an
    /// Initialize-role transfer saw its response and the connection is done.
    pub(crate) fn process_stream(&mut self, buffer: &mut StreamBuf, handle: &EngineHandle) -> bool {
        let events = self.sse.feed(buffer);
        for event in events {
            if !self.sse.dispatch(&event, handle) {
                return false;
            }
            if let Some(id) = &event.id {
                self.last_event_id = Some(id.clone());
            }
            if event.data.is_empty() {
                continue;
            }
            let message = match RpcMessage::from_slice(event.data.as_bytes()) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, data = %event.data, "skipping unparsable SSE frame");
                    continue;
                }
            };
            if !self.accept_message(message, handle) {
                return false;
            }
        }
        true
    }

    /// Route one framed message according to the transfer's role
    fn accept_message(&mut self, message: RpcMessage, handle: &EngineHandle) -> bool {
        match self.role {
            McpRole::Main => match self.on_message.as_mut() {
                Some(hook) => hook(&message, handle),
                None => true,
            },
            McpRole::Initialize => {
                let is_reply = message.id().is_some() && message.id() == self.init_request_id.as_ref();
                self.collected.push(message);
                // the reply ends the initialize exchange; close the stream
                !is_reply
            }
            McpRole::InitializedNote => {
                self.collected.push(message);
                true
            }
        }
    }
}

impl Transfer {
    /// Create an MCP transfer carrying one JSON-RPC message
    pub fn mcp(url: &str, message: RpcMessage) -> VolleyResult<Self> {
        let mut transfer = Transfer::with_method(url, Method::Post)?;
        transfer.set_header("content-type", "application/json");
        transfer.set_header("accept", "application/json, text/event-stream");
        transfer.set_header("mcp-protocol-version", MCP_PROTOCOL_VERSION);
        transfer.streamable = true;
        transfer.stream_mode = true;
        transfer.flavor = Flavor::Mcp(Box::new(McpState::new()));
        transfer.set_rpc_message(message)?;
        Ok(transfer)
    }

    /// Replace the transfer's JSON-RPC message (re-serializes the body)
    pub fn set_rpc_message(&mut self, message: RpcMessage) -> VolleyResult<&mut Self> {
        self.body = Some(message.to_bytes()?);
        if let Some(state) = self.mcp_state_mut() {
            state.rpc_message = Some(message);
        }
        Ok(self)
    }

    /// The transfer's JSON-RPC message
    pub fn rpc_message(&self) -> Option<&RpcMessage> {
        self.mcp_state().and_then(|state| state.rpc_message.as_ref())
    }

    /// The MCP session id the transfer will send
    pub fn session_id(&self) -> Option<&str> {
        self.mcp_state().and_then(|state| state.session_id.as_deref())
    }

    /// Set or clear the MCP session id (kept in sync with the
    /// `Mcp-Session-Id` header)
    pub fn set_session_id(&mut self, session_id: Option<&str>) -> &mut Self {
        if let Some(state) = self.mcp_state_mut() {
            state.session_id = session_id.map(str::to_string);
        }
        match session_id {
            Some(session) => self.set_header("mcp-session-id", session),
            None => self.remove_header("mcp-session-id"),
        };
        self
    }

    /// Resume an interrupted stream from a previous event id
    pub fn set_last_event_id(&mut self, id: &str) -> &mut Self {
        if let Some(state) = self.mcp_state_mut() {
            state.last_event_id = Some(id.to_string());
        }
        self.set_header("last-event-id", id)
    }

    /// Set the RFC 8707 resource indicator header
    pub fn set_resource_indicator(&mut self, uri: &str) -> &mut Self {
        self.set_header("resource-indicator", uri)
    }

    /// Install the JSON-RPC message hook; returning `false` stops processing
    /// the remaining messages of the response
    pub fn on_mcp_message<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(&RpcMessage, &EngineHandle) -> bool + Send + 'static,
    {
        if let Some(state) = self.mcp_state_mut() {
            state.on_message = Some(Box::new(hook));
        } else {
            warn!("on_mcp_message installed on a non-MCP transfer; ignoring");
        }
        self
    }

    /// Invoke `hook` with the session id once automatic initialization
    /// completes
    pub fn on_initialized<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        if let Some(state) = self.mcp_state_mut() {
            state.on_initialized = Some(Box::new(hook));
        } else {
            warn!("on_initialized installed on a non-MCP transfer; ignoring");
        }
        self
    }

    /// Enable the automatic initialization protocol
    ///
    /// Without a session id at scheduling time the engine runs
    /// `initialize` → `notifications/initialized` → this transfer. With one,
    /// an expired-session failure (HTTP 404 or a matching body) transparently
    /// re-initializes and re-enqueues this transfer, once.
    pub fn enable_auto_initialize(
        &mut self,
        client_info: Option<ClientInfo>,
        capabilities: Option<Value>,
    ) -> &mut Self {
        if let Some(state) = self.mcp_state_mut() {
            state.auto_init = Some(AutoInit {
                client_info: client_info.unwrap_or_default(),
                capabilities: normalize_capabilities(capabilities.unwrap_or_else(|| json!({}))),
                reinit_done: false,
            });
        } else {
            warn!("enable_auto_initialize on a non-MCP transfer; ignoring");
        }
        self
    }
}

/// Force object-valued capability fields to `{}` when empty
///
/// MCP servers reject `[]` where the schema expects an object, which is what
/// generic encoders produce for empty maps.
pub(crate) fn normalize_capabilities(capabilities: Value) -> Value {
    let mut map = match capabilities {
        Value::Object(map) => map,
        Value::Array(items) if items.is_empty() => Map::new(),
        Value::Null => Map::new(),
        other => {
            warn!(value = %other, "capabilities is not an object; replacing with an empty one");
            Map::new()
        }
    };
    for field in OBJECT_CAPABILITY_FIELDS {
        if let Some(value) = map.get_mut(field) {
            if matches!(value, Value::Array(items) if items.is_empty()) {
                *value = Value::Object(Map::new());
            }
        }
    }
    Value::Object(map)
}

/// Attach the initialization chain ahead of a main transfer that has no
/// session yet
///
/// Called by the engine when the transfer is about to be scheduled, so the
/// derived transfers see every header and option set on the main transfer up
/// to that point.
pub(crate) fn prepare_for_schedule(transfer: &mut Transfer) -> VolleyResult<()> {
    let Some(state) = transfer.mcp_state() else {
        return Ok(());
    };
    if state.role != McpRole::Main
        || state.auto_init.is_none()
        || state.session_id.is_some()
        || transfer.before.is_some()
    {
        return Ok(());
    }

    let mut init = build_initialize_transfer(transfer)?;
    let notify = build_initialized_note(&init)?;
    init.append_next(notify);
    transfer.set_before(init);
    debug!(transfer = %transfer.describe(), "attached MCP initialization chain");
    Ok(())
}

/// Derive the `initialize` transfer from the main transfer's configuration
fn build_initialize_transfer(main: &Transfer) -> VolleyResult<Transfer> {
    let Some(main_state) = main.mcp_state() else {
        return Err(VolleyError::config("initialize requires an MCP transfer"));
    };
    let Some(auto) = main_state.auto_init.as_ref() else {
        return Err(VolleyError::config("auto-initialize is not enabled"));
    };

    let params = json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "clientInfo": auto.client_info,
        "capabilities": auto.capabilities,
    });
    let message = RpcMessage::request("initialize", params);

    let mut init = main.clone_request();
    init.set_method(Method::Post);
    if let Some(state) = init.mcp_state_mut() {
        state.role = McpRole::Initialize;
        state.init_request_id = message.id().cloned();
    }
    init.set_rpc_message(message)?;
    Ok(init)
}

/// Derive the `notifications/initialized` transfer from the initialize one
fn build_initialized_note(init: &Transfer) -> VolleyResult<Transfer> {
    let mut note = init.clone_request();
    note.set_method(Method::Post);
    if let Some(state) = note.mcp_state_mut() {
        state.role = McpRole::InitializedNote;
    }
    note.set_rpc_message(RpcMessage::notification(
        "notifications/initialized",
        Value::Null,
    ))?;
    Ok(note)
}

/// Parse a buffered JSON body into framed messages
///
/// A top-level array of objects is a batch; anything else is one message.
fn parse_buffered_messages(buffer: &StreamBuf) -> Result<Vec<RpcMessage>, String> {
    let value: Value =
        serde_json::from_slice(buffer.peek()).map_err(|err| format!("invalid JSON body: {}", err))?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| RpcMessage::from_value(item).map_err(|err| err.to_string()))
            .collect(),
        single => Ok(vec![
            RpcMessage::from_value(single).map_err(|err| err.to_string())?
        ]),
    }
}

/// Finish a buffered-mode MCP completion: frame and dispatch the body
///
/// Returns a failure to route through the error path (HTTP >= 400 or an
/// unparsable body); `None` means the ready hook should fire.
pub(crate) fn finish_buffered(
    transfer: &mut Transfer,
    info: &TransferInfo,
    handle: &EngineHandle,
) -> Option<TransferFailure> {
    let status = info.status;
    if status >= 400 {
        return Some(TransferFailure {
            kind: FailureKind::HttpStatus(status),
            message: format!("HTTP returned error: {}", status),
            info: info.clone(),
        });
    }
    if transfer.buffer.is_empty() {
        // notifications are commonly answered with 202 and no body
        return None;
    }

    let messages = match parse_buffered_messages(&transfer.buffer) {
        Ok(messages) => messages,
        Err(reason) => {
            return Some(TransferFailure {
                kind: FailureKind::Protocol,
                message: reason,
                info: info.clone(),
            });
        }
    };

    if let Some(state) = transfer.mcp_state_mut() {
        for message in messages {
            if !state.accept_message(message, handle) {
                break;
            }
        }
    }
    None
}

/// Resolve a completed Initialize-role transfer
///
/// On success the captured session id is propagated along the follow-up
/// chain and the main transfer's `on_initialized` hook runs; an RPC error is
/// formatted and forwarded to the main transfer's error hook, dropping the
/// rest of the chain.
pub(crate) fn finish_initialize(
    init: &mut Transfer,
    info: &TransferInfo,
    streamed: bool,
    handle: &EngineHandle,
) {
    if info.status >= 400 {
        let failure = TransferFailure {
            kind: FailureKind::HttpStatus(info.status),
            message: format!("MCP initialization error: HTTP {}", info.status),
            info: info.clone(),
        };
        forward_init_failure(init, &failure, handle);
        return;
    }

    if !streamed {
        if let Some(failure) = finish_buffered(init, info, handle) {
            forward_init_failure(init, &failure, handle);
            return;
        }
    }

    enum Resolution {
        Propagate(Option<String>),
        Fail(String),
    }

    let resolution = {
        let Some(state) = init.mcp_state() else {
            return;
        };
        let expected = state.init_request_id.as_ref();
        let reply = state
            .collected
            .iter()
            .find(|message| message.id().is_some() && message.id() == expected);
        match reply {
            Some(RpcMessage::Error { error, .. }) => Resolution::Fail(format!(
                "MCP initialization error: {} (Code: {})",
                error.message, error.code
            )),
            Some(RpcMessage::Response { .. }) => Resolution::Propagate(state.session_id.clone()),
            _ => Resolution::Fail(
                "MCP initialization error: no response to initialize".to_string(),
            ),
        }
    };

    match resolution {
        Resolution::Propagate(session) => {
            match &session {
                Some(session_id) => {
                    info!(session_id = %session_id, "MCP session initialized");
                }
                None => {
                    warn!("initialize response carried no Mcp-Session-Id header");
                }
            }
            for_each_chain(init.next.as_deref_mut(), &mut |follower| {
                if let Some(session_id) = &session {
                    follower.set_session_id(Some(session_id.as_str()));
                }
                let Some(follower_state) = follower.mcp_state_mut() else {
                    return;
                };
                if follower_state.role == McpRole::Main {
                    if let (Some(hook), Some(session_id)) =
                        (follower_state.on_initialized.as_mut(), &session)
                    {
                        hook(session_id);
                    }
                }
            });
        }
        Resolution::Fail(message) => {
            let failure = TransferFailure {
                kind: FailureKind::Protocol,
                message,
                info: info.clone(),
            };
            forward_init_failure(init, &failure, handle);
        }
    }
}

/// Forward a terminal outcome of the initialize transfer to the main
/// transfer's hooks, abandoning the rest of the chain
pub(crate) fn forward_init_failure(
    init: &mut Transfer,
    failure: &TransferFailure,
    handle: &EngineHandle,
) {
    let Some(mut main) = take_main(init.next.take()) else {
        warn!(
            message = %failure.message,
            "initialization failed with no main transfer attached"
        );
        return;
    };
    warn!(
        transfer = %main.describe(),
        message = %failure.message,
        "MCP initialization failed"
    );
    if let Some(hook) = main.hooks.error.as_mut() {
        hook(failure, handle);
    }
    if let Some(hook) = main.hooks.complete.as_mut() {
        hook(handle);
    }
}

/// Forward an initialize-transfer timeout to the main transfer's hooks
pub(crate) fn forward_init_timeout(
    init: &mut Transfer,
    kind: TimeoutKind,
    elapsed: std::time::Duration,
    handle: &EngineHandle,
) {
    let Some(mut main) = take_main(init.next.take()) else {
        warn!("initialization timed out with no main transfer attached");
        return;
    };
    if let Some(hook) = main.hooks.timeout.as_mut() {
        hook(kind, elapsed, handle);
    }
    if let Some(hook) = main.hooks.complete.as_mut() {
        hook(handle);
    }
}

/// Attempt transparent session recovery after a failed main transfer
///
/// Returns `true` when the transfer was reset and re-armed with the
/// initialization chain; the engine then re-enqueues it at the backlog front
/// instead of dispatching the error hook.
pub(crate) fn try_recover_session(
    transfer: &mut Transfer,
    failure: &TransferFailure,
) -> VolleyResult<bool> {
    {
        let Some(state) = transfer.mcp_state() else {
            return Ok(false);
        };
        if state.role != McpRole::Main || state.session_id.is_none() {
            return Ok(false);
        }
        let Some(auto) = state.auto_init.as_ref() else {
            return Ok(false);
        };
        if auto.reinit_done {
            return Ok(false);
        }

        let body = String::from_utf8_lossy(transfer.buffer.peek());
        let invalid_session = matches!(failure.kind, FailureKind::HttpStatus(404))
            || INVALID_SESSION_RE
                .as_ref()
                .is_some_and(|re| re.is_match(&body));
        if !invalid_session {
            return Ok(false);
        }
    }

    info!(
        transfer = %transfer.describe(),
        "MCP session rejected by server; re-initializing"
    );
    transfer.set_session_id(None);
    if let Some(state) = transfer.mcp_state_mut() {
        if let Some(auto) = state.auto_init.as_mut() {
            auto.reinit_done = true;
        }
    }
    transfer.reset_for_retry();
    prepare_for_schedule(transfer)?;
    Ok(true)
}

/// Run a closure over every transfer in a `next` chain
fn for_each_chain(mut cursor: Option<&mut Transfer>, visit: &mut impl FnMut(&mut Transfer)) {
    while let Some(transfer) = cursor {
        visit(transfer);
        cursor = transfer.next.as_deref_mut();
    }
}

/// Extract the Main-role transfer from a detached chain, dropping the rest
fn take_main(chain: Option<Box<Transfer>>) -> Option<Transfer> {
    let mut cursor = chain;
    while let Some(mut boxed) = cursor {
        let is_main = matches!(
            boxed.mcp_state().map(|state| state.role),
            Some(McpRole::Main)
        );
        if is_main {
            return Some(*boxed);
        }
        cursor = boxed.next.take();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    fn test_handle() -> EngineHandle {
        Engine::new(1).handle()
    }

    fn tools_list_transfer() -> Transfer {
        Transfer::mcp(
            "http://localhost:9000/mcp",
            RpcMessage::request("tools/list", Value::Null),
        )
        .unwrap()
    }

    #[test]
    fn test_mcp_transfer_wire_headers() {
        let t = tools_list_transfer();
        assert_eq!(t.method(), Method::Post);
        assert_eq!(t.header("content-type"), Some("application/json"));
        assert_eq!(
            t.header("accept"),
            Some("application/json, text/event-stream")
        );
        assert_eq!(t.header("mcp-protocol-version"), Some(MCP_PROTOCOL_VERSION));
        assert!(t.is_streamable());

        let body: Value = serde_json::from_slice(t.body().unwrap()).unwrap();
        assert_eq!(body["method"], "tools/list");
        assert_eq!(body["params"], json!({}));
    }

    #[test]
    fn test_session_id_tracks_header() {
        let mut t = tools_list_transfer();
        assert_eq!(t.header("mcp-session-id"), None);

        t.set_session_id(Some("sess-1"));
        assert_eq!(t.session_id(), Some("sess-1"));
        assert_eq!(t.header("mcp-session-id"), Some("sess-1"));

        t.set_session_id(None);
        assert_eq!(t.session_id(), None);
        assert_eq!(t.header("mcp-session-id"), None);
    }

    #[test]
    fn test_capabilities_normalization() {
        let normalized = normalize_capabilities(json!({
            "tools": [],
            "roots": {"listChanged": true},
            "custom": [],
        }));
        assert_eq!(normalized["tools"], json!({}));
        assert_eq!(normalized["roots"], json!({"listChanged": true}));
        // unnamed fields keep their shape
        assert_eq!(normalized["custom"], json!([]));

        assert_eq!(normalize_capabilities(Value::Null), json!({}));
        assert_eq!(normalize_capabilities(json!([])), json!({}));
    }

    #[test]
    fn test_prepare_for_schedule_builds_chain() {
        let mut main = tools_list_transfer();
        main.enable_auto_initialize(None, None);
        prepare_for_schedule(&mut main).unwrap();

        let init = main.pop_before().unwrap();
        let init_state = init.mcp_state().unwrap();
        assert_eq!(init_state.role, McpRole::Initialize);
        assert!(init_state.init_request_id.is_some());

        let init_body: Value = serde_json::from_slice(init.body().unwrap()).unwrap();
        assert_eq!(init_body["method"], "initialize");
        assert_eq!(init_body["params"]["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(init_body["params"]["capabilities"], json!({}));
        assert!(init_body["params"]["clientInfo"]["name"].is_string());

        // the notification follows the initialize transfer
        assert_eq!(init.next_chain_len(), 1);
        let note = init.next.as_ref().unwrap();
        assert_eq!(
            note.mcp_state().unwrap().role,
            McpRole::InitializedNote
        );
        let note_body: Value = serde_json::from_slice(note.body().unwrap()).unwrap();
        assert_eq!(note_body["method"], "notifications/initialized");
        assert!(note_body.get("id").is_none());
    }

    #[test]
    fn test_prepare_for_schedule_skips_with_session() {
        let mut main = tools_list_transfer();
        main.enable_auto_initialize(None, None);
        main.set_session_id(Some("sess-live"));
        prepare_for_schedule(&mut main).unwrap();
        assert!(main.before.is_none());
    }

    #[test]
    fn test_finish_initialize_propagates_session() {
        let handle = test_handle();

        let mut main = tools_list_transfer();
        main.enable_auto_initialize(None, None);
        prepare_for_schedule(&mut main).unwrap();

        let mut init = main.pop_before().unwrap();
        // scheduling links the main transfer behind the chain
        init.append_next(main);

        let init_id = init
            .mcp_state()
            .unwrap()
            .init_request_id
            .clone()
            .unwrap();

        // simulate the buffered initialize response with a session header
        let mut headers = HeaderMap::new();
        headers.insert("mcp-session-id", "sess-42".parse().unwrap());
        init.note_response(200, &headers);
        init.buffer.append(
            RpcMessage::response(init_id, json!({"capabilities": {}}))
                .to_bytes()
                .unwrap()
                .as_slice(),
        );

        let info = TransferInfo {
            status: 200,
            ..TransferInfo::default()
        };
        finish_initialize(&mut init, &info, false, &handle);

        let note = init.pop_next().unwrap();
        assert_eq!(note.session_id(), Some("sess-42"));
        assert_eq!(note.header("mcp-session-id"), Some("sess-42"));
        let main = note.next.as_ref().unwrap();
        assert_eq!(main.session_id(), Some("sess-42"));
    }

    #[test]
    fn test_finish_initialize_error_reaches_main_hook() {
        let handle = test_handle();
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));

        let mut main = tools_list_transfer();
        let seen_in_hook = seen.clone();
        main.on_error(move |failure, _| {
            seen_in_hook.lock().push(failure.message.clone());
        });
        main.enable_auto_initialize(None, None);
        prepare_for_schedule(&mut main).unwrap();

        let mut init = main.pop_before().unwrap();
        init.append_next(main);
        let init_id = init.mcp_state().unwrap().init_request_id.clone().unwrap();

        init.buffer.append(
            RpcMessage::error(
                Some(init_id),
                crate::rpc::RpcError::new(-32602, "unsupported protocol version"),
            )
            .to_bytes()
            .unwrap()
            .as_slice(),
        );
        let info = TransferInfo {
            status: 200,
            ..TransferInfo::default()
        };
        finish_initialize(&mut init, &info, false, &handle);

        let messages = seen.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0],
            "MCP initialization error: unsupported protocol version (Code: -32602)"
        );
    }

    #[test]
    fn test_recover_session_once() {
        let mut main = tools_list_transfer();
        main.enable_auto_initialize(None, None);
        main.set_session_id(Some("sess-old"));

        main.buffer.append(b"Session not found");
        let failure = TransferFailure {
            kind: FailureKind::HttpStatus(404),
            message: "HTTP returned error: 404".to_string(),
            info: TransferInfo::default(),
        };

        assert!(try_recover_session(&mut main, &failure).unwrap());
        assert_eq!(main.session_id(), None);
        assert!(main.before.is_some());
        assert!(main.buffer.is_empty());

        // a second failure is surfaced, not retried
        main.pop_before();
        main.set_session_id(Some("sess-new"));
        main.buffer.append(b"Session not found");
        assert!(!try_recover_session(&mut main, &failure).unwrap());
    }

    #[test]
    fn test_recover_session_body_pattern() {
        let failure = |status: u16| TransferFailure {
            kind: FailureKind::HttpStatus(status),
            message: format!("HTTP returned error: {}", status),
            info: TransferInfo::default(),
        };

        let mut main = tools_list_transfer();
        main.enable_auto_initialize(None, None);
        main.set_session_id(Some("s"));
        main.buffer.append(b"{\"error\": \"No valid session\"}");
        assert!(try_recover_session(&mut main, &failure(400)).unwrap());

        // unrelated failures do not trigger recovery
        let mut main = tools_list_transfer();
        main.enable_auto_initialize(None, None);
        main.set_session_id(Some("s"));
        main.buffer.append(b"internal server error");
        assert!(!try_recover_session(&mut main, &failure(500)).unwrap());

        // no pre-set session id: nothing to recover
        let mut main = tools_list_transfer();
        main.enable_auto_initialize(None, None);
        main.buffer.append(b"Session expired");
        assert!(!try_recover_session(&mut main, &failure(404)).unwrap());
    }

    #[test]
    fn test_buffered_batch_dispatch() {
        let handle = test_handle();
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));

        let mut t = tools_list_transfer();
        let seen_in_hook = seen.clone();
        t.on_mcp_message(move |message, _| {
            seen_in_hook
                .lock()
                .push(message.method().unwrap_or("reply").to_string());
            true
        });

        let batch = json!([
            {"jsonrpc": "2.0", "method": "notifications/progress", "params": {"progress": 1}},
            {"jsonrpc": "2.0", "id": 9, "result": {"tools": []}},
        ]);
        t.buffer.append(serde_json::to_vec(&batch).unwrap().as_slice());

        let info = TransferInfo {
            status: 200,
            ..TransferInfo::default()
        };
        assert!(finish_buffered(&mut t, &info, &handle).is_none());
        assert_eq!(*seen.lock(), vec!["notifications/progress", "reply"]);
    }

    #[test]
    fn test_buffered_error_status_and_bad_json() {
        let handle = test_handle();
        let info_with = |status: u16| TransferInfo {
            status,
            ..TransferInfo::default()
        };

        let mut t = tools_list_transfer();
        let failure = finish_buffered(&mut t, &info_with(404), &handle).unwrap();
        assert_eq!(failure.kind, FailureKind::HttpStatus(404));

        let mut t = tools_list_transfer();
        t.buffer.append(b"not json at all");
        let failure = finish_buffered(&mut t, &info_with(200), &handle).unwrap();
        assert_eq!(failure.kind, FailureKind::Protocol);

        // an empty 202 body is a clean completion
        let mut t = tools_list_transfer();
        assert!(finish_buffered(&mut t, &info_with(202), &handle).is_none());
    }

    #[test]
    fn test_message_hook_stops_batch() {
        let handle = test_handle();
        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut t = tools_list_transfer();
        let count_in_hook = count.clone();
        t.on_mcp_message(move |_, _| {
            count_in_hook.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 1
        });

        let batch = json!([
            {"jsonrpc": "2.0", "method": "a", "params": {}},
            {"jsonrpc": "2.0", "method": "b", "params": {}},
            {"jsonrpc": "2.0", "method": "c", "params": {}},
        ]);
        t.buffer.append(serde_json::to_vec(&batch).unwrap().as_slice());

        let info = TransferInfo {
            status: 200,
            ..TransferInfo::default()
        };
        finish_buffered(&mut t, &info, &handle);
        // the hook returned false on the second message; the third never ran
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clone_fresh_keeps_session_identity() {
        let mut t = tools_list_transfer();
        t.set_session_id(Some("sess-9"));
        t.set_last_event_id("evt-3");
        t.on_mcp_message(|_, _| true);

        let clone = t.clone_request();
        let state = clone.mcp_state().unwrap();
        assert_eq!(state.session_id.as_deref(), Some("sess-9"));
        assert_eq!(state.last_event_id.as_deref(), Some("evt-3"));
        assert!(state.on_message.is_none());
        assert!(state.rpc_message.is_none());
        assert_eq!(state.http_status, 0);
    }
}
