//! Server-Sent Events framing over a streaming transfer
//!
//! Frames are parsed incrementally from the transfer's stream buffer and
//! dispatched at blank-line boundaries. The parser follows the event-stream
//! field rules: `data:` lines accumulate with newline separators (one
//! trailing newline stripped at dispatch), `id:` persists across events,
//! `retry:` updates the reconnection hint when numeric, and comment lines
//! (leading `:`) are ignored.

use tracing::debug;

use crate::buffer::StreamBuf;
use crate::engine::EngineHandle;
use crate::error::VolleyResult;
use crate::transfer::{Flavor, Transfer};

/// Default reconnection delay per the event-stream specification
const DEFAULT_RETRY_MS: u64 = 3000;

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name from the `event:` field, if any
    pub name: Option<String>,
    /// Accumulated `data:` payload
    pub data: String,
    /// Last seen `id:` value (persists across events)
    pub id: Option<String>,
}

/// Event hook: returning `false` aborts the in-flight transfer
pub type EventHook = Box<dyn FnMut(&SseEvent, &EngineHandle) -> bool + Send>;

/// Incremental SSE parser state embedded in SSE-capable transfers
pub struct SseState {
    pending_name: Option<String>,
    pending_data: String,
    last_id: Option<String>,
    retry_ms: u64,
    pub(crate) on_event: Option<EventHook>,
}

impl std::fmt::Debug for SseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseState")
            .field("pending_name", &self.pending_name)
            .field("pending_data_len", &self.pending_data.len())
            .field("last_id", &self.last_id)
            .field("retry_ms", &self.retry_ms)
            .field("on_event", &self.on_event.as_ref().map(|_| "function"))
            .finish()
    }
}

impl Default for SseState {
    fn default() -> Self {
        Self::new()
    }
}

impl SseState {
    pub fn new() -> Self {
        Self {
            pending_name: None,
            pending_data: String::new(),
            last_id: None,
            retry_ms: DEFAULT_RETRY_MS,
            on_event: None,
        }
    }

    /// Id of the most recently dispatched event carrying one
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    /// Current reconnection hint in milliseconds
    pub fn retry_ms(&self) -> u64 {
        self.retry_ms
    }

    /// Consume complete lines from the buffer, returning dispatched events
    pub(crate) fn feed(&mut self, buffer: &mut StreamBuf) -> Vec<SseEvent> {
        let mut events = Vec::new();
        while let Some(line) = buffer.consume_line() {
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.handle_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Run the installed event hook, defaulting to "continue"
    pub(crate) fn dispatch(&mut self, event: &SseEvent, handle: &EngineHandle) -> bool {
        match self.on_event.as_mut() {
            Some(hook) => hook(event, handle),
            None => true,
        }
    }

    /// Apply one line's field rules; a blank line may yield an event
    fn handle_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.pending_data.is_empty() {
                self.pending_name = None;
                return None;
            }
            let mut data = std::mem::take(&mut self.pending_data);
            if data.ends_with('\n') {
                data.truncate(data.len() - 1);
            }
            return Some(SseEvent {
                name: self.pending_name.take(),
                data,
                id: self.last_id.clone(),
            });
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.pending_name = Some(value.to_string()),
            "data" => {
                self.pending_data.push_str(value);
                self.pending_data.push('\n');
            }
            "id" => {
                if !value.contains('\0') {
                    self.last_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry_ms = ms;
                }
            }
            other => {
                debug!(field = other, "ignoring unknown SSE field");
            }
        }
        None
    }
}

impl Transfer {
    /// Create an SSE transfer: a GET with event-stream framing
    ///
    /// The transfer streams when the final response actually is an event
    /// stream; otherwise the body is buffered and delivered at completion.
    pub fn sse(url: &str) -> VolleyResult<Self> {
        let mut transfer = Transfer::new(url)?;
        transfer.set_header("accept", "text/event-stream");
        transfer.set_header("cache-control", "no-cache");
        transfer.streamable = true;
        transfer.stream_mode = true;
        transfer.flavor = Flavor::Sse(SseState::new());
        Ok(transfer)
    }

    /// Install an SSE event hook
    ///
    /// A plain HTTP transfer gains SSE framing; on an MCP transfer the hook
    /// observes the raw frames alongside the JSON-RPC message hook.
    pub fn on_sse_event<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(&SseEvent, &EngineHandle) -> bool + Send + 'static,
    {
        match &mut self.flavor {
            Flavor::Sse(state) => state.on_event = Some(Box::new(hook)),
            Flavor::Mcp(state) => state.sse.on_event = Some(Box::new(hook)),
            Flavor::Http => {
                let mut state = SseState::new();
                state.on_event = Some(Box::new(hook));
                self.flavor = Flavor::Sse(state);
                self.streamable = true;
            }
        }
        self
    }
}
