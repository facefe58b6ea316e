//! Bounded-concurrency scheduler for HTTP transfers
//!
//! The engine owns a FIFO backlog (with optional front insertion), a
//! time-ordered delay queue, and the in-flight set. [`Engine::run`] promotes
//! due delayed entries, tops the in-flight set up to the concurrency cap,
//! drives every response-body stream from a single task, and dispatches
//! observer hooks as transfers complete — looping until backlog, delay
//! queue, and in-flight set are all empty.
//!
//! Hooks may submit further transfers through the [`EngineHandle`] they
//! receive; such submissions become eligible on the very next scheduling
//! tick. When the backlog falls below `max_concurrency ×
//! low_watermark_factor`, the refill hook (if installed) is invited to top
//! it up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::{error_chain, VolleyError, VolleyResult};
use crate::transfer::mcp::{self, McpRole};
use crate::transfer::{
    FailureKind, RequestOptions, TimeoutKind, Transfer, TransferFailure, TransferInfo,
};

/// Concurrency cap used by [`Engine::default`]
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Wait bound per scheduling tick while delayed entries are outstanding
const DELAY_TICK: Duration = Duration::from_millis(100);
/// Wait bound per scheduling tick otherwise
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Submission placement controls
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    /// Insert at the backlog front instead of the tail
    pub front: bool,
    /// Hold the transfer in the delay queue for this long first
    pub delay: Duration,
}

/// Refill hook: `(backlog_len, max_concurrency, handle)`
pub type RefillHook = Box<dyn FnMut(usize, usize, &EngineHandle) + Send>;

struct Submission {
    transfer: Transfer,
    options: SubmitOptions,
}

/// State shared with hooks through [`EngineHandle`]
struct Shared {
    pending: Mutex<Vec<Submission>>,
    in_flight: AtomicUsize,
    backlog_len: AtomicUsize,
}

/// Hook-side view of the engine: submit transfers, observe load
///
/// Submissions made through a handle land in a pending queue the engine
/// drains at each scheduling tick.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    /// Submit a transfer to the backlog tail
    pub fn submit(&self, transfer: Transfer) {
        self.submit_with(transfer, SubmitOptions::default());
    }

    /// Submit with explicit placement
    pub fn submit_with(&self, transfer: Transfer, options: SubmitOptions) {
        self.shared.pending.lock().push(Submission { transfer, options });
    }

    /// Number of transfers currently in flight
    pub fn in_flight_len(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Number of transfers waiting in the backlog
    pub fn backlog_len(&self) -> usize {
        self.shared.backlog_len.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("in_flight", &self.in_flight_len())
            .field("backlog", &self.backlog_len())
            .finish()
    }
}

/// One delayed submission
#[derive(Debug)]
struct DelayEntry {
    transfer: Transfer,
    front: bool,
    due: Instant,
}

/// Delay queue: unordered rows plus a sorted flag invalidated on insert
#[derive(Default)]
struct DelayQueue {
    entries: Vec<DelayEntry>,
    sorted: bool,
}

impl DelayQueue {
    fn insert(&mut self, entry: DelayEntry) {
        self.entries.push(entry);
        self.sorted = false;
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Promote due entries into the backlog; returns the time until the
    /// earliest remaining entry
    fn process(&mut self, now: Instant, backlog: &mut VecDeque<Transfer>) -> Option<Duration> {
        if self.entries.is_empty() {
            return None;
        }
        if !self.sorted {
            self.entries.sort_by_key(|entry| entry.due);
            self.sorted = true;
        }
        while self.entries.first().is_some_and(|entry| entry.due <= now) {
            let entry = self.entries.remove(0);
            debug!(transfer = %entry.transfer.describe(), "delayed transfer due");
            if entry.front {
                backlog.push_front(entry.transfer);
            } else {
                backlog.push_back(entry.transfer);
            }
        }
        self.entries.first().map(|entry| entry.due - now)
    }
}

/// Per-transfer terminal outcome produced by the driver
enum Outcome {
    Done { info: TransferInfo, streamed: bool },
    TimedOut { kind: TimeoutKind, elapsed: Duration },
    Failed(TransferFailure),
}

type ActiveSet = FuturesUnordered<BoxFuture<'static, (Transfer, Outcome)>>;

/// Bounded-concurrency transfer scheduler
pub struct Engine {
    max_concurrency: usize,
    low_watermark_factor: usize,
    refill: Option<RefillHook>,
    backlog: VecDeque<Transfer>,
    delay: DelayQueue,
    client: Client,
    shared: Arc<Shared>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

impl Engine {
    /// Create an engine with the given concurrency cap (clamped to >= 1)
    pub fn new(max_concurrency: usize) -> Self {
        Self::with_client(max_concurrency, Client::new())
    }

    /// Create an engine driving transfers through a caller-supplied client
    pub fn with_client(max_concurrency: usize, client: Client) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            low_watermark_factor: 2,
            refill: None,
            backlog: VecDeque::new(),
            delay: DelayQueue::default(),
            client,
            shared: Arc::new(Shared {
                pending: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                backlog_len: AtomicUsize::new(0),
            }),
        }
    }

    /// The engine's concurrency cap
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Backlog size below `max_concurrency × factor` triggers the refill hook
    pub fn set_low_watermark_factor(&mut self, factor: usize) -> &mut Self {
        self.low_watermark_factor = factor.max(1);
        self
    }

    /// Install the refill hook
    pub fn set_refill_hook<F>(&mut self, hook: F) -> &mut Self
    where
        F: FnMut(usize, usize, &EngineHandle) + Send + 'static,
    {
        self.refill = Some(Box::new(hook));
        self
    }

    /// A hook-side handle onto this engine
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Submit a transfer to the backlog tail
    pub fn submit(&mut self, transfer: Transfer) {
        self.submit_with(transfer, SubmitOptions::default());
    }

    /// Submit with explicit placement: front insertion and/or a delay
    pub fn submit_with(&mut self, transfer: Transfer, options: SubmitOptions) {
        if options.delay > Duration::ZERO {
            self.delay.insert(DelayEntry {
                transfer,
                front: options.front,
                due: Instant::now() + options.delay,
            });
        } else if options.front {
            self.backlog.push_front(transfer);
        } else {
            self.backlog.push_back(transfer);
        }
        self.sync_backlog_len();
    }

    /// Number of transfers waiting in the backlog
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Number of transfers held in the delay queue
    pub fn delay_len(&self) -> usize {
        self.delay.len()
    }

    /// Number of transfers currently in flight
    pub fn in_flight_len(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Drive every submitted transfer to completion
    ///
    /// Returns once the backlog, the delay queue, and the in-flight set are
    /// all empty. Hooks run on this task; per-transfer outcomes are
    /// delivered through them, never as a return value.
    pub async fn run(&mut self) {
        let handle = self.handle();
        let mut active: ActiveSet = FuturesUnordered::new();
        debug!(max_concurrency = self.max_concurrency, "engine run starting");

        loop {
            self.drain_pending();
            let next_due = self.delay.process(Instant::now(), &mut self.backlog);
            self.sync_backlog_len();
            self.maybe_refill(&handle);
            self.top_up(&mut active, &handle);

            if active.is_empty() {
                if !self.backlog.is_empty() {
                    continue;
                }
                match next_due {
                    Some(delay) => {
                        debug!(delay_ms = delay.as_millis() as u64, "sleeping until next delayed transfer");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    None => {
                        if self.shared.pending.lock().is_empty() {
                            break;
                        }
                        continue;
                    }
                }
            }

            let wait = if self.delay.len() > 0 {
                next_due.map_or(DELAY_TICK, |due| due.min(DELAY_TICK))
            } else {
                IDLE_TICK
            };

            tokio::select! {
                completed = active.next() => {
                    if let Some((transfer, outcome)) = completed {
                        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                        self.finish(transfer, outcome, &handle);
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("engine run complete");
    }

    /// Move hook-side submissions into the backlog and delay queue
    fn drain_pending(&mut self) {
        let pending: Vec<Submission> = std::mem::take(&mut *self.shared.pending.lock());
        for submission in pending {
            self.submit_with(submission.transfer, submission.options);
        }
    }

    /// Invoke the refill hook when the backlog crosses the low watermark
    fn maybe_refill(&mut self, handle: &EngineHandle) {
        let Some(hook) = self.refill.as_mut() else {
            return;
        };
        let watermark = self.max_concurrency * self.low_watermark_factor;
        if self.backlog.len() < watermark {
            hook(self.backlog.len(), self.max_concurrency, handle);
            self.drain_pending();
        }
    }

    /// Promote backlog entries into flight up to the concurrency cap
    fn top_up(&mut self, active: &mut ActiveSet, handle: &EngineHandle) {
        while active.len() < self.max_concurrency {
            let Some(transfer) = self.backlog.pop_front() else {
                break;
            };
            self.sync_backlog_len();
            let transfer = resolve_chain(transfer);
            debug!(
                transfer = %transfer.describe(),
                in_flight = active.len() + 1,
                "transfer entering flight"
            );
            self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
            active.push(Box::pin(drive(
                transfer,
                self.client.clone(),
                handle.clone(),
            )));
        }
    }

    /// Dispatch the terminal hook for a completed transfer and close it
    fn finish(&mut self, mut transfer: Transfer, outcome: Outcome, handle: &EngineHandle) {
        let role = transfer.mcp_state().map(|state| state.role);
        match outcome {
            Outcome::TimedOut { kind, elapsed } => {
                debug!(
                    transfer = %transfer.describe(),
                    ?kind,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "transfer timed out"
                );
                if role == Some(McpRole::Initialize) {
                    mcp::forward_init_timeout(&mut transfer, kind, elapsed, handle);
                } else if let Some(hook) = transfer.hooks.timeout.as_mut() {
                    hook(kind, elapsed, handle);
                } else {
                    warn!(
                        transfer = %transfer.describe(),
                        ?kind,
                        "transfer timed out with no timeout hook installed"
                    );
                }
            }
            Outcome::Failed(failure) => {
                if role == Some(McpRole::Initialize) {
                    mcp::forward_init_failure(&mut transfer, &failure, handle);
                } else {
                    match mcp::try_recover_session(&mut transfer, &failure) {
                        Ok(true) => {
                            // re-enqueued; the transfer has not completed
                            self.submit_with(
                                transfer,
                                SubmitOptions {
                                    front: true,
                                    delay: Duration::ZERO,
                                },
                            );
                            return;
                        }
                        Ok(false) => dispatch_error(&mut transfer, &failure, handle),
                        Err(err) => {
                            warn!(error = %err, "session recovery failed; surfacing original error");
                            dispatch_error(&mut transfer, &failure, handle);
                        }
                    }
                }
            }
            Outcome::Done { info, streamed } => {
                debug!(
                    transfer = %transfer.describe(),
                    status = info.status,
                    bytes = info.bytes_received,
                    streamed,
                    aborted = transfer.stream_aborted,
                    "transfer complete"
                );
                match role {
                    Some(McpRole::Initialize) => {
                        mcp::finish_initialize(&mut transfer, &info, streamed, handle);
                    }
                    Some(_) if !streamed => {
                        match mcp::finish_buffered(&mut transfer, &info, handle) {
                            Some(failure) => match mcp::try_recover_session(&mut transfer, &failure)
                            {
                                Ok(true) => {
                                    self.submit_with(
                                        transfer,
                                        SubmitOptions {
                                            front: true,
                                            delay: Duration::ZERO,
                                        },
                                    );
                                    return;
                                }
                                Ok(false) => dispatch_error(&mut transfer, &failure, handle),
                                Err(err) => {
                                    warn!(
                                        error = %err,
                                        "session recovery failed; surfacing original error"
                                    );
                                    dispatch_error(&mut transfer, &failure, handle);
                                }
                            },
                            None => dispatch_ready(&mut transfer, &info, handle),
                        }
                    }
                    Some(_) => dispatch_ready(&mut transfer, &info, handle),
                    None => {
                        if transfer.options.fail_on_error
                            && info.status >= 400
                            && !transfer.stream_aborted
                        {
                            let failure = TransferFailure {
                                kind: FailureKind::HttpStatus(info.status),
                                message: format!("HTTP returned error: {}", info.status),
                                info: info.clone(),
                            };
                            dispatch_error(&mut transfer, &failure, handle);
                        } else {
                            dispatch_ready(&mut transfer, &info, handle);
                        }
                    }
                }
            }
        }
        self.close_transfer(transfer, handle);
    }

    /// Tear a completed transfer down: enqueue its follow-up, fire
    /// `on_complete`
    fn close_transfer(&mut self, mut transfer: Transfer, handle: &EngineHandle) {
        if let Some(next) = transfer.pop_next() {
            debug!(follow_up = %next.describe(), "enqueueing follow-up transfer");
            self.backlog.push_front(next);
            self.sync_backlog_len();
        }
        if let Some(hook) = transfer.hooks.complete.as_mut() {
            hook(handle);
        }
    }

    fn sync_backlog_len(&self) {
        self.shared
            .backlog_len
            .store(self.backlog.len(), Ordering::SeqCst);
    }
}

/// Replace a transfer with its predecessor chain head at scheduling time
///
/// The scheduled transfer is re-attached to the tail of its predecessor's
/// `next` chain, so it runs after the predecessor and any successors the
/// predecessor already carries. MCP auto-initialization attaches its chain
/// here, seeing the transfer's final configuration.
fn resolve_chain(mut transfer: Transfer) -> Transfer {
    if let Err(err) = mcp::prepare_for_schedule(&mut transfer) {
        warn!(
            transfer = %transfer.describe(),
            error = %err,
            "failed to attach MCP initialization chain"
        );
    }
    while let Some(mut predecessor) = transfer.pop_before() {
        debug!(
            predecessor = %predecessor.describe(),
            deferred = %transfer.describe(),
            "running predecessor in place of scheduled transfer"
        );
        predecessor.append_next(transfer);
        transfer = predecessor;
    }
    transfer
}

fn dispatch_ready(transfer: &mut Transfer, info: &TransferInfo, handle: &EngineHandle) {
    let Transfer { buffer, hooks, .. } = transfer;
    if let Some(hook) = hooks.ready.as_mut() {
        hook(info, buffer, handle);
    }
}

fn dispatch_error(transfer: &mut Transfer, failure: &TransferFailure, handle: &EngineHandle) {
    match transfer.hooks.error.as_mut() {
        Some(hook) => hook(failure, handle),
        None => crate::transfer::log_unobserved_failure(transfer, failure),
    }
}

/// Drive one transfer to its terminal outcome
async fn drive(mut transfer: Transfer, client: Client, handle: EngineHandle) -> (Transfer, Outcome) {
    let started = Instant::now();
    let outcome = drive_inner(&mut transfer, &client, &handle, started).await;
    (transfer, outcome)
}

async fn drive_inner(
    transfer: &mut Transfer,
    default_client: &Client,
    handle: &EngineHandle,
    started: Instant,
) -> Outcome {
    let client = if transfer.options.needs_custom_client() {
        match build_custom_client(&transfer.options) {
            Ok(client) => client,
            Err(err) => return config_failure(transfer, err, started),
        }
    } else {
        default_client.clone()
    };

    let request = match build_request(&client, transfer) {
        Ok(request) => request,
        Err(err) => return config_failure(transfer, err, started),
    };

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => return classify_send_error(transfer, &err, started),
    };

    let status = response.status().as_u16();
    transfer.note_response(status, response.headers());
    // flavor framing mode for completion handling; chunk hooks run whenever
    // the transfer is streamable
    let streamed = transfer.stream_mode;
    let chunk_hooks = transfer.streamable;

    let mut info = TransferInfo {
        url: response.url().to_string(),
        status,
        content_type: response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        headers: response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect(),
        bytes_received: 0,
        elapsed: Duration::ZERO,
    };

    let mut response = response;
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                info.bytes_received += chunk.len() as u64;
                transfer.buffer.append(&chunk);
                if chunk_hooks && !transfer.process_chunk(handle) {
                    debug!(transfer = %transfer.describe(), "stream aborted by hook");
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                // an abort surfaces as a mid-body error on some backends;
                // normalize it to a clean completion
                if transfer.stream_aborted {
                    break;
                }
                let elapsed = started.elapsed();
                if err.is_timeout() {
                    return Outcome::TimedOut {
                        kind: TimeoutKind::Total,
                        elapsed,
                    };
                }
                info.elapsed = elapsed;
                return Outcome::Failed(TransferFailure {
                    kind: FailureKind::Transport,
                    message: error_chain(&err),
                    info,
                });
            }
        }
    }

    info.elapsed = started.elapsed();
    Outcome::Done { info, streamed }
}

fn config_failure(transfer: &Transfer, err: VolleyError, started: Instant) -> Outcome {
    Outcome::Failed(TransferFailure {
        kind: FailureKind::Config,
        message: err.to_string(),
        info: TransferInfo {
            url: transfer.url().to_string(),
            elapsed: started.elapsed(),
            ..TransferInfo::default()
        },
    })
}

/// Classify a send-phase error into timeout kinds and failure kinds
fn classify_send_error(transfer: &Transfer, err: &reqwest::Error, started: Instant) -> Outcome {
    let elapsed = started.elapsed();
    if err.is_timeout() {
        let kind = if err.is_connect() {
            TimeoutKind::Connect
        } else {
            TimeoutKind::Total
        };
        return Outcome::TimedOut { kind, elapsed };
    }

    let chain = error_chain(err);
    let info = TransferInfo {
        url: transfer.url().to_string(),
        elapsed,
        ..TransferInfo::default()
    };
    if chain.contains("dns error") || chain.contains("failed to lookup") {
        Outcome::Failed(TransferFailure {
            kind: FailureKind::Dns,
            message: format!("failed to resolve host: {}", chain),
            info,
        })
    } else if err.is_connect() {
        Outcome::Failed(TransferFailure {
            kind: FailureKind::Connect,
            message: chain,
            info,
        })
    } else {
        Outcome::Failed(TransferFailure {
            kind: FailureKind::Transport,
            message: chain,
            info,
        })
    }
}

/// Build a dedicated client for options the shared client cannot express
fn build_custom_client(options: &RequestOptions) -> VolleyResult<Client> {
    let mut builder = Client::builder();
    if let Some(timeout) = options.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    builder = builder.redirect(if options.follow_redirects {
        Policy::limited(options.max_redirects)
    } else {
        Policy::none()
    });
    if options.http1_only {
        builder = builder.http1_only();
    }
    if options.accept_invalid_certs {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(proxy) = &options.proxy {
        let mut proxy_config = reqwest::Proxy::all(&proxy.url)?;
        if let Some((user, password)) = &proxy.auth {
            proxy_config = proxy_config.basic_auth(user, password);
        }
        builder = builder.proxy(proxy_config);
    }
    if options.cookie_store {
        builder = builder.cookie_store(true);
    }
    if options.verbose {
        builder = builder.connection_verbose(true);
    }
    if options.forbid_reuse || options.fresh_connect {
        builder = builder.pool_max_idle_per_host(0);
    }
    if let Some(agent) = &options.user_agent {
        builder = builder.user_agent(agent.clone());
    }
    Ok(builder.build()?)
}

/// Materialize the request from the transfer's configuration
fn build_request(client: &Client, transfer: &Transfer) -> VolleyResult<reqwest::RequestBuilder> {
    let mut request = client.request(transfer.method().into(), transfer.url().clone());
    if let Some(timeout) = transfer.options().total_timeout {
        request = request.timeout(timeout);
    }
    for (name, value) in transfer.headers() {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|err| VolleyError::Header {
                name: name.clone(),
                reason: err.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|err| VolleyError::Header {
            name: name.clone(),
            reason: err.to_string(),
        })?;
        request = request.header(header_name, header_value);
    }
    if let Some((user, password)) = &transfer.options().basic_auth {
        request = request.basic_auth(user, Some(password));
    }
    if let Some(token) = &transfer.options().bearer_token {
        request = request.bearer_auth(token);
    }
    if let Some(body) = transfer.body() {
        request = request.body(body.to_vec());
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_clamped_to_one() {
        assert_eq!(Engine::new(0).max_concurrency(), 1);
        assert_eq!(Engine::new(7).max_concurrency(), 7);
        assert_eq!(Engine::default().max_concurrency(), DEFAULT_MAX_CONCURRENCY);
    }

    #[test]
    fn test_submit_placement() {
        let mut engine = Engine::new(2);
        engine.submit(Transfer::new("http://localhost/a").unwrap());
        engine.submit(Transfer::new("http://localhost/b").unwrap());
        engine.submit_with(
            Transfer::new("http://localhost/c").unwrap(),
            SubmitOptions {
                front: true,
                delay: Duration::ZERO,
            },
        );

        assert_eq!(engine.backlog_len(), 3);
        assert_eq!(engine.backlog[0].url().path(), "/c");
        assert_eq!(engine.backlog[1].url().path(), "/a");
        assert_eq!(engine.backlog[2].url().path(), "/b");
    }

    #[test]
    fn test_delayed_submission_goes_to_delay_queue() {
        let mut engine = Engine::new(2);
        engine.submit_with(
            Transfer::new("http://localhost/later").unwrap(),
            SubmitOptions {
                front: false,
                delay: Duration::from_millis(200),
            },
        );
        assert_eq!(engine.backlog_len(), 0);
        assert_eq!(engine.delay_len(), 1);
    }

    #[test]
    fn test_delay_queue_promotes_in_due_order() {
        let mut queue = DelayQueue::default();
        let now = Instant::now();
        queue.insert(DelayEntry {
            transfer: Transfer::new("http://localhost/slow").unwrap(),
            front: false,
            due: now + Duration::from_millis(300),
        });
        queue.insert(DelayEntry {
            transfer: Transfer::new("http://localhost/fast").unwrap(),
            front: false,
            due: now + Duration::from_millis(100),
        });
        assert!(!queue.sorted);

        let mut backlog = VecDeque::new();
        // nothing due yet: the earliest remaining delay is reported
        let remaining = queue.process(now, &mut backlog).unwrap();
        assert!(remaining <= Duration::from_millis(100));
        assert!(backlog.is_empty());
        assert!(queue.sorted);

        // both due: promoted in ascending due order
        let after = now + Duration::from_millis(400);
        assert!(queue.process(after, &mut backlog).is_none());
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].url().path(), "/fast");
        assert_eq!(backlog[1].url().path(), "/slow");
    }

    #[test]
    fn test_delay_queue_front_flag() {
        let mut queue = DelayQueue::default();
        let now = Instant::now();
        let mut backlog = VecDeque::new();
        backlog.push_back(Transfer::new("http://localhost/existing").unwrap());

        queue.insert(DelayEntry {
            transfer: Transfer::new("http://localhost/urgent").unwrap(),
            front: true,
            due: now,
        });
        queue.process(now + Duration::from_millis(1), &mut backlog);
        assert_eq!(backlog[0].url().path(), "/urgent");
    }

    #[test]
    fn test_handle_submissions_drain_into_backlog() {
        let mut engine = Engine::new(2);
        let handle = engine.handle();
        handle.submit(Transfer::new("http://localhost/from-hook").unwrap());
        assert_eq!(engine.backlog_len(), 0);

        engine.drain_pending();
        assert_eq!(engine.backlog_len(), 1);
        assert_eq!(handle.backlog_len(), 1);
    }

    #[test]
    fn test_resolve_chain_runs_predecessor_first() {
        let mut main = Transfer::new("http://localhost/main").unwrap();
        let mut first = Transfer::new("http://localhost/first").unwrap();
        first.append_next(Transfer::new("http://localhost/second").unwrap());
        main.set_before(first);

        let scheduled = resolve_chain(main);
        assert_eq!(scheduled.url().path(), "/first");
        // the deferred transfer re-attaches after the predecessor's chain
        assert_eq!(scheduled.next_chain_len(), 2);
    }

    #[tokio::test]
    async fn test_run_with_empty_engine_returns() {
        let mut engine = Engine::new(3);
        engine.run().await;
        assert_eq!(engine.backlog_len(), 0);
        assert_eq!(engine.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_refill_hook_observes_watermark() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut engine = Engine::new(2);
        engine.set_low_watermark_factor(2);

        let calls_in_hook = calls.clone();
        engine.set_refill_hook(move |backlog_len, max_concurrency, _| {
            assert!(backlog_len < max_concurrency * 2);
            calls_in_hook.fetch_add(1, Ordering::SeqCst);
        });

        engine.run().await;
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_connection_refused_reaches_error_hook_once() {
        // bind-then-drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let errors = Arc::new(AtomicUsize::new(0));
        let completes = Arc::new(AtomicUsize::new(0));
        let readies = Arc::new(AtomicUsize::new(0));

        let mut transfer = Transfer::new(&format!("http://127.0.0.1:{}/", port)).unwrap();
        let errors_in_hook = errors.clone();
        transfer.on_error(move |failure, _| {
            assert!(matches!(
                failure.kind,
                FailureKind::Connect | FailureKind::Transport
            ));
            errors_in_hook.fetch_add(1, Ordering::SeqCst);
        });
        let readies_in_hook = readies.clone();
        transfer.on_ready(move |_, _, _| {
            readies_in_hook.fetch_add(1, Ordering::SeqCst);
        });
        let completes_in_hook = completes.clone();
        transfer.on_complete(move |_| {
            completes_in_hook.fetch_add(1, Ordering::SeqCst);
        });

        let mut engine = Engine::new(2);
        engine.submit(transfer);
        engine.run().await;

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(readies.load(Ordering::SeqCst), 0);
        assert_eq!(completes.load(Ordering::SeqCst), 1);
        assert_eq!(engine.in_flight_len(), 0);
    }
}
