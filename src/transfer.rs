//! Transfer descriptors: configuration, observer hooks, and follow-up chains
//!
//! A [`Transfer`] carries everything the engine needs to realize one outbound
//! request: URL, method, body, headers, backend options, the four observer
//! hooks, and the follow-up links (`before` runs in place of the transfer
//! when it is first scheduled; `next` is enqueued when it completes).
//!
//! Protocol behavior is layered through [`Flavor`]: a plain HTTP transfer, an
//! SSE transfer (adds incremental event framing), or an MCP transfer (adds
//! JSON-RPC framing, session handling, and automatic initialization on top of
//! the SSE parser).

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use reqwest::header::HeaderMap;
use tracing::warn;
use url::Url;

use crate::buffer::StreamBuf;
use crate::engine::EngineHandle;
use crate::error::VolleyResult;
use crate::transfer::http::Method;
use crate::transfer::mcp::McpState;
use crate::transfer::sse::SseState;

pub mod http;
pub mod mcp;
pub mod sse;

/// Total timeout assumed when none is configured, for reporting purposes
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Which timeout budget a transfer exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The connection could not be established in time
    Connect,
    /// The overall transfer exceeded its total budget
    Total,
}

/// Classification of a failed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection could not be established (refused, unreachable, TLS)
    Connect,
    /// Host name resolution failed
    Dns,
    /// The server answered with an error status and the transfer is
    /// configured to treat that as a failure
    HttpStatus(u16),
    /// The response body could not be framed (malformed JSON-RPC, bad batch)
    Protocol,
    /// The transfer could not be realized from its configuration
    Config,
    /// Any other transport-level failure
    Transport,
}

/// Failure details delivered to the error hook
#[derive(Debug, Clone)]
pub struct TransferFailure {
    pub kind: FailureKind,
    pub message: String,
    pub info: TransferInfo,
}

/// Info block describing a completed (or failed) exchange
#[derive(Debug, Clone, Default)]
pub struct TransferInfo {
    /// Final URL after any redirects
    pub url: String,
    /// HTTP status of the final response, `0` if none was received
    pub status: u16,
    /// `Content-Type` of the final response
    pub content_type: Option<String>,
    /// Response headers of the final response
    pub headers: HashMap<String, String>,
    /// Body bytes observed
    pub bytes_received: u64,
    /// Wall-clock time from scheduling to completion
    pub elapsed: Duration,
}

/// Ready hook: the transfer completed; the buffer holds the response body
pub type ReadyHook = Box<dyn FnMut(&TransferInfo, &mut StreamBuf, &EngineHandle) + Send>;
/// Timeout hook: which budget was exceeded and the elapsed wall-clock time
pub type TimeoutHook = Box<dyn FnMut(TimeoutKind, Duration, &EngineHandle) + Send>;
/// Error hook: transport or protocol failure details
pub type ErrorHook = Box<dyn FnMut(&TransferFailure, &EngineHandle) + Send>;
/// Stream hook: called per chunk after the bytes are appended to the buffer;
/// returning `false` aborts the in-flight transfer
pub type StreamHook = Box<dyn FnMut(&mut StreamBuf, &EngineHandle) -> bool + Send>;
/// Completion hook: fires exactly once, after the terminal hook
pub type CompleteHook = Box<dyn FnMut(&EngineHandle) + Send>;

/// Observer hooks installed on a transfer
#[derive(Default)]
pub(crate) struct Hooks {
    pub ready: Option<ReadyHook>,
    pub timeout: Option<TimeoutHook>,
    pub error: Option<ErrorHook>,
    pub stream: Option<StreamHook>,
    pub complete: Option<CompleteHook>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("ready", &self.ready.as_ref().map(|_| "function"))
            .field("timeout", &self.timeout.as_ref().map(|_| "function"))
            .field("error", &self.error.as_ref().map(|_| "function"))
            .field("stream", &self.stream.as_ref().map(|_| "function"))
            .field("complete", &self.complete.as_ref().map(|_| "function"))
            .finish()
    }
}

/// Proxy configuration for a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy URL, e.g. `http://proxy.internal:3128`
    pub url: String,
    /// Optional proxy credentials
    pub auth: Option<(String, String)>,
}

/// Typed backend-option vocabulary applied when the request is materialized
///
/// Connection-level options (redirect policy, proxy, TLS, pooling) require a
/// dedicated HTTP client; the engine derives one on demand for transfers
/// whose options deviate from its defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    /// Connection establishment budget; backend default when unset
    pub connect_timeout: Option<Duration>,
    /// Whole-transfer budget; backend default when unset
    pub total_timeout: Option<Duration>,
    /// Follow HTTP redirects (default true)
    pub follow_redirects: bool,
    /// Redirect hop limit (default 10)
    pub max_redirects: usize,
    /// Restrict the exchange to HTTP/1.1
    pub http1_only: bool,
    /// Basic authentication credentials
    pub basic_auth: Option<(String, String)>,
    /// Bearer token for the `Authorization` header
    pub bearer_token: Option<String>,
    /// Skip TLS certificate verification
    pub accept_invalid_certs: bool,
    /// Route through a proxy
    pub proxy: Option<ProxyConfig>,
    /// Keep cookies across redirects and follow-up transfers
    pub cookie_store: bool,
    /// Log connection-level events
    pub verbose: bool,
    /// Do not reuse a pooled connection after the transfer
    pub forbid_reuse: bool,
    /// Force a fresh connection for the transfer
    pub fresh_connect: bool,
    /// Deliver HTTP status >= 400 through the error hook
    pub fail_on_error: bool,
    /// Override the engine's user agent
    pub user_agent: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            total_timeout: None,
            follow_redirects: true,
            max_redirects: 10,
            http1_only: false,
            basic_auth: None,
            bearer_token: None,
            accept_invalid_certs: false,
            proxy: None,
            cookie_store: false,
            verbose: false,
            forbid_reuse: false,
            fresh_connect: false,
            fail_on_error: false,
            user_agent: None,
        }
    }
}

impl RequestOptions {
    /// Whether realizing these options requires a dedicated client
    pub(crate) fn needs_custom_client(&self) -> bool {
        self.connect_timeout.is_some()
            || !self.follow_redirects
            || self.max_redirects != 10
            || self.http1_only
            || self.accept_invalid_certs
            || self.proxy.is_some()
            || self.cookie_store
            || self.verbose
            || self.forbid_reuse
            || self.fresh_connect
            || self.user_agent.is_some()
    }
}

/// Protocol layering of a transfer
#[derive(Debug)]
pub enum Flavor {
    /// Plain HTTP exchange
    Http,
    /// Server-Sent Events stream
    Sse(SseState),
    /// MCP Streamable HTTP exchange (JSON-RPC over HTTP or SSE)
    Mcp(Box<McpState>),
}

/// A single outbound request with its observers and follow-ups
#[derive(Debug)]
pub struct Transfer {
    pub(crate) url: Url,
    pub(crate) method: Method,
    pub(crate) body: Option<Vec<u8>>,
    /// Header table with lower-cased names
    pub(crate) headers: BTreeMap<String, String>,
    pub(crate) options: RequestOptions,
    pub(crate) streamable: bool,
    /// Whether the flavor's incremental framing (SSE, MCP-over-SSE) is
    /// active for the current response; decided from the response head
    pub(crate) stream_mode: bool,
    pub(crate) stream_aborted: bool,
    pub(crate) buffer: StreamBuf,
    pub(crate) before: Option<Box<Transfer>>,
    pub(crate) next: Option<Box<Transfer>>,
    pub(crate) hooks: Hooks,
    pub(crate) flavor: Flavor,
}

impl Transfer {
    /// Create a GET transfer
    pub fn new(url: &str) -> VolleyResult<Self> {
        Self::with_method(url, Method::Get)
    }

    /// Create a transfer with an explicit method
    pub fn with_method(url: &str, method: Method) -> VolleyResult<Self> {
        Ok(Self {
            url: Url::parse(url)?,
            method,
            body: None,
            headers: BTreeMap::new(),
            options: RequestOptions::default(),
            streamable: false,
            stream_mode: false,
            stream_aborted: false,
            buffer: StreamBuf::new(),
            before: None,
            next: None,
            hooks: Hooks::default(),
            flavor: Flavor::Http,
        })
    }

    /// The transfer's URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Replace the transfer's URL
    pub fn set_url(&mut self, url: &str) -> VolleyResult<()> {
        self.url = Url::parse(url)?;
        Ok(())
    }

    /// Backend options for the transfer
    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Mutable access to the backend options
    pub fn options_mut(&mut self) -> &mut RequestOptions {
        &mut self.options
    }

    /// Set the connection establishment budget
    pub fn set_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.options.connect_timeout = Some(timeout);
        self
    }

    /// Set the whole-transfer budget
    pub fn set_total_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.options.total_timeout = Some(timeout);
        self
    }

    /// The total budget used for reporting: configured or the backend default
    pub fn effective_total_timeout(&self) -> Duration {
        self.options.total_timeout.unwrap_or(DEFAULT_TOTAL_TIMEOUT)
    }

    /// Whether the stream hook (or the transfer's flavor) requires chunk-wise
    /// delivery
    pub fn is_streamable(&self) -> bool {
        self.streamable
    }

    /// Response body buffered so far
    pub fn buffer(&self) -> &StreamBuf {
        &self.buffer
    }

    // --- observer hooks ---

    /// Install the ready hook
    pub fn on_ready<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(&TransferInfo, &mut StreamBuf, &EngineHandle) + Send + 'static,
    {
        self.hooks.ready = Some(Box::new(hook));
        self
    }

    /// Install the timeout hook
    pub fn on_timeout<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(TimeoutKind, Duration, &EngineHandle) + Send + 'static,
    {
        self.hooks.timeout = Some(Box::new(hook));
        self
    }

    /// Install the error hook
    pub fn on_error<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(&TransferFailure, &EngineHandle) + Send + 'static,
    {
        self.hooks.error = Some(Box::new(hook));
        self
    }

    /// Install the stream hook; the transfer becomes streamable
    pub fn on_stream<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(&mut StreamBuf, &EngineHandle) -> bool + Send + 'static,
    {
        self.hooks.stream = Some(Box::new(hook));
        self.streamable = true;
        self
    }

    /// Install the completion hook
    pub fn on_complete<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(&EngineHandle) + Send + 'static,
    {
        self.hooks.complete = Some(Box::new(hook));
        self
    }

    // --- follow-up chain ---

    /// Append a follow-up to the end of the `next` chain
    ///
    /// Chains are expected to stay short; this walks to the tail.
    pub fn append_next(&mut self, transfer: Transfer) {
        let mut slot = &mut self.next;
        loop {
            match slot {
                Some(link) => slot = &mut link.next,
                None => {
                    *slot = Some(Box::new(transfer));
                    return;
                }
            }
        }
    }

    /// Attach a predecessor that will run in place of this transfer when it
    /// is first scheduled
    ///
    /// At scheduling time the engine re-attaches this transfer to the tail of
    /// the predecessor's `next` chain, so control returns here after the
    /// predecessor and any successors it already carries.
    pub fn set_before(&mut self, predecessor: Transfer) {
        self.before = Some(Box::new(predecessor));
    }

    /// Detach and return the head of the `next` chain
    pub fn pop_next(&mut self) -> Option<Transfer> {
        self.next.take().map(|boxed| *boxed)
    }

    /// Detach and return the predecessor
    pub fn pop_before(&mut self) -> Option<Transfer> {
        self.before.take().map(|boxed| *boxed)
    }

    /// Number of transfers in the `next` chain
    pub fn next_chain_len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.next.as_deref();
        while let Some(link) = cursor {
            count += 1;
            cursor = link.next.as_deref();
        }
        count
    }

    /// The transfer's protocol flavor
    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    /// SSE parser state, for SSE-flavored transfers
    pub fn sse_state(&self) -> Option<&SseState> {
        match &self.flavor {
            Flavor::Sse(state) => Some(state),
            Flavor::Mcp(state) => Some(&state.sse),
            Flavor::Http => None,
        }
    }

    /// MCP state, for MCP-flavored transfers
    pub fn mcp_state(&self) -> Option<&McpState> {
        match &self.flavor {
            Flavor::Mcp(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn mcp_state_mut(&mut self) -> Option<&mut McpState> {
        match &mut self.flavor {
            Flavor::Mcp(state) => Some(state),
            _ => None,
        }
    }

    /// Clone the transfer as a fresh outgoing request
    ///
    /// Keeps URL, options, headers, and flavor identity; drops the body, the
    /// method override, the observer hooks, the buffered bytes, and both
    /// follow-up links. MCP clones keep their session id.
    pub fn clone_request(&self) -> Transfer {
        Transfer {
            url: self.url.clone(),
            method: Method::Get,
            body: None,
            headers: self.headers.clone(),
            options: self.options.clone(),
            streamable: matches!(self.flavor, Flavor::Sse(_) | Flavor::Mcp(_)),
            stream_mode: matches!(self.flavor, Flavor::Sse(_) | Flavor::Mcp(_)),
            stream_aborted: false,
            buffer: StreamBuf::new(),
            before: None,
            next: None,
            hooks: Hooks::default(),
            flavor: match &self.flavor {
                Flavor::Http => Flavor::Http,
                Flavor::Sse(_) => Flavor::Sse(SseState::new()),
                Flavor::Mcp(state) => Flavor::Mcp(Box::new(state.clone_fresh())),
            },
        }
    }

    // --- engine plumbing ---

    /// Record the response head once the backend delivers it
    pub(crate) fn note_response(&mut self, status: u16, headers: &HeaderMap) {
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        if let Flavor::Mcp(state) = &mut self.flavor {
            state.note_response(status, content_type.as_deref(), headers);
        }

        // SSE and MCP framing only applies when the final response actually
        // is an event stream
        let is_event_stream = content_type
            .as_deref()
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);
        self.stream_mode = match &self.flavor {
            Flavor::Sse(_) => is_event_stream,
            Flavor::Mcp(_) => is_event_stream && status < 400,
            Flavor::Http => false,
        };
        // a user stream hook keeps chunk-wise delivery regardless of flavor
        self.streamable = self.stream_mode || self.hooks.stream.is_some();
    }

    /// Process bytes just appended to the buffer while streaming
    ///
    /// Returns `false` when a hook asked to abort the in-flight transfer.
    pub(crate) fn process_chunk(&mut self, handle: &EngineHandle) -> bool {
        let Transfer {
            buffer,
            flavor,
            hooks,
            stream_mode,
            ..
        } = self;

        let mut keep_going = if !*stream_mode {
            true
        } else {
            match flavor {
                Flavor::Http => true,
                Flavor::Sse(state) => {
                    let events = state.feed(buffer);
                    let mut keep = true;
                    for event in &events {
                        if !state.dispatch(event, handle) {
                            keep = false;
                            break;
                        }
                    }
                    keep
                }
                Flavor::Mcp(state) => state.process_stream(buffer, handle),
            }
        };

        if keep_going {
            if let Some(hook) = hooks.stream.as_mut() {
                keep_going = hook(buffer, handle);
            }
        }

        if !keep_going {
            self.stream_aborted = true;
        }
        keep_going
    }

    /// Reset response state before a re-submission (session recovery)
    pub(crate) fn reset_for_retry(&mut self) {
        self.buffer.clear();
        self.stream_aborted = false;
        self.stream_mode = matches!(self.flavor, Flavor::Sse(_) | Flavor::Mcp(_));
        self.streamable = self.stream_mode || self.hooks.stream.is_some();
        if let Flavor::Mcp(state) = &mut self.flavor {
            state.reset_response();
        }
    }

    /// Warn-level diagnostic identity used in engine logs
    pub(crate) fn describe(&self) -> String {
        format!("{} {}", self.method.as_str(), self.url)
    }
}

#[allow(dead_code)]
fn _assert_transfer_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<Transfer>();
}

/// Log a hook-free terminal outcome so failures are never silent
pub(crate) fn log_unobserved_failure(transfer: &Transfer, failure: &TransferFailure) {
    warn!(
        transfer = %transfer.describe(),
        kind = ?failure.kind,
        message = %failure.message,
        "transfer failed with no error hook installed"
    );
}
