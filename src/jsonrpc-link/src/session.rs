use crate::codec::{FrameDecoder, encode_frame};
use crate::config::SessionConfig;
use crate::error::{RpcError, RpcResult};
use crate::handler::HandlerRegistry;
use crate::message::{ErrorBody, Message, Request, Response, is_answerable_id};
use crate::sweep::spawn_sweeper;
use crate::transport::Transport;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub const METHOD_SUBSCRIBE: &str = "jsonrpc.subscribe";
pub const METHOD_UNSUBSCRIBE: &str = "jsonrpc.unsubscribe";
pub const METHOD_PING: &str = "jsonrpc.ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Init => "INIT",
            SessionState::Connecting => "CONNECTING",
            SessionState::Open => "OPEN",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Which end of a link a session sits on. Client sessions may reconnect
/// after CLOSED; server connections are done once closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Open,
    /// Emitted when a session that reached OPEN goes away.
    Close,
    Error(String),
}

type Completion = oneshot::Sender<RpcResult<Value>>;

struct PendingRequest {
    /// `None` for notifications, which never enter the in-flight table.
    id: Option<u64>,
    method: String,
    frame: Vec<u8>,
    enqueued_at: Instant,
    timeout: Duration,
    completion: Option<Completion>,
}

impl PendingRequest {
    fn settle(self, outcome: RpcResult<Value>) {
        if let Some(tx) = self.completion {
            // the caller may have stopped waiting
            let _ = tx.send(outcome);
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.enqueued_at) >= self.timeout
    }
}

struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

struct Core {
    state: SessionState,
    queue: VecDeque<PendingRequest>,
    in_flight: HashMap<u64, PendingRequest>,
    flush_scheduled: bool,
    subscriptions: BTreeSet<String>,
    last_activity: Instant,
    last_error: Option<String>,
    link: Option<Link>,
}

impl Core {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    fn drain_pending(&mut self) -> Vec<PendingRequest> {
        let mut pending: Vec<_> = self.queue.drain(..).collect();
        pending.extend(self.in_flight.drain().map(|(_, req)| req));
        pending
    }
}

struct SessionInner {
    label: String,
    role: Role,
    config: SessionConfig,
    handlers: Arc<HandlerRegistry>,
    next_request_id: AtomicU64,
    next_generation: AtomicU64,
    core: Mutex<Core>,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// One duplex JSON-RPC link.
///
/// Cloning is cheap and yields another handle to the same session. Outbound
/// requests are queued FIFO and written once the session is OPEN, at most
/// `max_in_flight` at a time; responses are matched by id only.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("label", &self.inner.label)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(
        role: Role,
        label: impl Into<String>,
        config: SessionConfig,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Init);
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(SessionInner {
                label: label.into(),
                role,
                config,
                handlers,
                next_request_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                core: Mutex::new(Core {
                    state: SessionState::Init,
                    queue: VecDeque::new(),
                    in_flight: HashMap::new(),
                    flush_scheduled: false,
                    subscriptions: BTreeSet::new(),
                    last_activity: Instant::now(),
                    last_error: None,
                    link: None,
                }),
                state_tx,
                events,
                sweeper: Mutex::new(None),
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, core: &mut Core, state: SessionState) {
        if core.state != state {
            trace!(session = %self.inner.label, from = %core.state, to = %state, "state change");
            core.state = state;
            self.inner.state_tx.send_replace(state);
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.inner.handlers
    }

    pub fn state(&self) -> SessionState {
        self.core().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn last_error(&self) -> Option<String> {
        self.core().last_error.clone()
    }

    /// Nothing queued and nothing awaiting a response.
    pub fn is_idle(&self) -> bool {
        self.core().is_idle()
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.core().last_activity)
    }

    /// `(queued, in_flight)` request counts.
    pub fn pending(&self) -> (usize, usize) {
        let core = self.core();
        (core.queue.len(), core.in_flight.len())
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once the session reaches `state`.
    pub async fn wait_for(&self, state: SessionState) {
        let mut rx = self.watch_state();
        // the sender lives as long as `self`
        let _ = rx.wait_for(|s| *s == state).await;
    }

    pub async fn closed(&self) {
        self.wait_for(SessionState::Closed).await
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        self.core().subscriptions.contains(key)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.core().subscriptions.iter().cloned().collect()
    }

    fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    /// INIT/CLOSED -> CONNECTING. Returns false from any other state.
    pub(crate) fn begin_connect(&self) -> bool {
        let mut core = self.core();
        match core.state {
            SessionState::Init | SessionState::Closed => {
                self.transition(&mut core, SessionState::Connecting);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn connect_failed(&self, err: &RpcError) {
        {
            let mut core = self.core();
            core.last_error = Some(err.to_string());
            if core.state == SessionState::Connecting {
                self.transition(&mut core, SessionState::Closed);
            }
        }
        self.emit(SessionEvent::Error(err.to_string()));
    }

    /// Binds `transport` and moves the session to OPEN, flushing anything
    /// queued while it was not.
    pub fn attach(&self, transport: Arc<dyn Transport>) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (outbound, rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(
            transport.clone(),
            rx,
            self.downgrade(),
            generation,
        ));
        let reader = tokio::spawn(read_loop(
            transport,
            self.downgrade(),
            generation,
            self.inner.config.max_message_size,
        ));

        {
            let mut core = self.core();
            if let Some(old) = core.link.replace(Link {
                generation,
                outbound,
                reader,
            }) {
                old.reader.abort();
            }
            core.last_activity = Instant::now();
            core.last_error = None;
            self.transition(&mut core, SessionState::Open);
        }

        debug!(session = %self.inner.label, "session open");
        self.emit(SessionEvent::Open);
        self.flush_request_queue();
    }

    /// Sends a request and waits for its response, the sweep's timeout, or
    /// cancellation by `close()`.
    ///
    /// A closed server-side session fails immediately with
    /// [`RpcError::Closed`]; a client-side one keeps the request queued until
    /// a reconnect or its timeout.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> RpcResult<Value> {
        self.ensure_usable()?;
        self.submit(method, params, timeout).await
    }

    pub(crate) async fn submit(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> RpcResult<Value> {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(id, method, params);
        let frame = self.encode(&request)?;
        let (tx, rx) = oneshot::channel();

        self.enqueue_request(PendingRequest {
            id: Some(id),
            method: request.method,
            frame,
            enqueued_at: Instant::now(),
            timeout: timeout.unwrap_or(self.inner.config.default_timeout),
            completion: Some(tx),
        })?;

        rx.await.unwrap_or(Err(RpcError::Cancelled))
    }

    /// Queues a notification: no id, no response, no completion.
    pub fn send_notify(&self, method: &str, params: Option<Value>) -> RpcResult<()> {
        self.ensure_usable()?;
        self.submit_notify(method, params)
    }

    pub(crate) fn submit_notify(&self, method: &str, params: Option<Value>) -> RpcResult<()> {
        let request = Request::notification(method, params);
        let frame = self.encode(&request)?;
        self.enqueue_request(PendingRequest {
            id: None,
            method: request.method,
            frame,
            enqueued_at: Instant::now(),
            timeout: self.inner.config.default_timeout,
            completion: None,
        })
    }

    fn ensure_usable(&self) -> RpcResult<()> {
        if self.inner.role == Role::Server && self.state() == SessionState::Closed {
            return Err(RpcError::Closed);
        }
        Ok(())
    }

    fn encode<T: Serialize>(&self, message: &T) -> RpcResult<Vec<u8>> {
        let payload = serde_json::to_vec(message).map_err(|e| RpcError::Encode(e.to_string()))?;
        encode_frame(&payload, self.inner.config.max_message_size)
            .map_err(|e| RpcError::Encode(e.to_string()))
    }

    fn enqueue_request(&self, request: PendingRequest) -> RpcResult<()> {
        let schedule = {
            let mut core = self.core();
            let depth = core.queue.len();
            if depth >= self.inner.config.max_queue_depth {
                warn!(
                    session = %self.inner.label,
                    method = %request.method,
                    depth,
                    "request queue full"
                );
                return Err(RpcError::QueueBusy { depth });
            }
            trace!(session = %self.inner.label, id = ?request.id, method = %request.method, "enqueue");
            core.queue.push_back(request);
            core.last_activity = Instant::now();
            !std::mem::replace(&mut core.flush_scheduled, true)
        };

        if schedule {
            let session = self.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                session.flush_request_queue();
            });
        }
        Ok(())
    }

    /// Moves queued requests onto the wire while the session is OPEN and the
    /// in-flight cap allows. Returns how many frames were handed over.
    pub fn flush_request_queue(&self) -> usize {
        let mut core = self.core();
        core.flush_scheduled = false;
        if core.state != SessionState::Open {
            return 0;
        }
        let Some(outbound) = core.link.as_ref().map(|link| link.outbound.clone()) else {
            return 0;
        };

        let max_in_flight = self.inner.config.max_in_flight;
        let mut written = 0;
        loop {
            let blocked = match core.queue.front() {
                None => break,
                Some(head) => head.id.is_some() && core.in_flight.len() >= max_in_flight,
            };
            if blocked {
                break;
            }
            let Some(mut request) = core.queue.pop_front() else {
                break;
            };

            let frame = std::mem::take(&mut request.frame);
            if let Err(mpsc::error::SendError(frame)) = outbound.send(frame) {
                request.frame = frame;
                core.queue.push_front(request);
                break;
            }

            written += 1;
            if let Some(id) = request.id {
                core.in_flight.insert(id, request);
            }
        }

        if written > 0 {
            core.last_activity = Instant::now();
            trace!(
                session = %self.inner.label,
                written,
                queued = core.queue.len(),
                in_flight = core.in_flight.len(),
                "flushed"
            );
        }
        written
    }

    /// One pass of the periodic sweep: retry the flush, then fail queued and
    /// in-flight requests that outlived their timeout.
    pub fn sweep(&self) {
        self.flush_request_queue();

        let now = Instant::now();
        let (queue_expired, response_expired) = {
            let mut core = self.core();
            let (expired, kept): (Vec<_>, Vec<_>) =
                core.queue.drain(..).partition(|req| req.expired(now));
            core.queue = VecDeque::from(kept);

            let ids: Vec<u64> = core
                .in_flight
                .iter()
                .filter(|(_, req)| req.expired(now))
                .map(|(id, _)| *id)
                .collect();
            let stale: Vec<_> = ids
                .into_iter()
                .filter_map(|id| core.in_flight.remove(&id))
                .collect();
            (expired, stale)
        };

        for req in queue_expired {
            debug!(session = %self.inner.label, id = ?req.id, method = %req.method, "request timed out in queue");
            let timeout = req.timeout;
            req.settle(Err(RpcError::QueueTimeout(timeout)));
        }
        for req in response_expired {
            debug!(session = %self.inner.label, id = ?req.id, method = %req.method, "request timed out awaiting response");
            let timeout = req.timeout;
            req.settle(Err(RpcError::ResponseTimeout(timeout)));
        }
    }

    /// Runs [`Session::sweep`] every `sweep_interval` until [`Session::close`]
    /// or the session is dropped. A no-op while a sweeper is already running.
    /// Servers and pools sweep their own sessions; this is for sessions wired
    /// up by hand and standalone clients.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        *sweeper = Some(spawn_sweeper(
            self.downgrade(),
            self.inner.config.sweep_interval,
            |inner: &Arc<SessionInner>| {
                Session {
                    inner: inner.clone(),
                }
                .sweep()
            },
        ));
    }

    fn stop_sweeper(&self) {
        let task = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_sweeping(&self) -> bool {
        self.inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn process_message(&self, raw: &[u8]) {
        let value: Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(session = %self.inner.label, error = %err, "dropping unparseable message");
                return;
            }
        };

        match value {
            // legacy batch: every element is handled and answered on its own
            Value::Array(items) => items.into_iter().for_each(|item| self.process_value(item)),
            other => self.process_value(other),
        }
    }

    fn process_value(&self, value: Value) {
        match Message::classify(value) {
            Ok(Message::Request(request)) => self.process_request(request),
            Ok(Message::Response(response)) => self.process_response(response),
            Err(raw) => {
                warn!(session = %self.inner.label, message = %raw, "malformed message");
                if raw.get("method").is_some() {
                    self.send_response(raw.get("id").cloned(), Err(ErrorBody::invalid_request()));
                }
            }
        }
    }

    fn process_request(&self, request: Request) {
        let session = self.clone();
        tokio::spawn(async move {
            let id = request.id.clone();
            let method = request.method.clone();
            let outcome = session.dispatch(request).await;

            if is_answerable_id(id.as_ref()) {
                session.send_response(id, outcome);
            } else if let Err(err) = outcome {
                debug!(session = %session.inner.label, method = %method, error = %err, "notification handler failed");
            }
        });
    }

    async fn dispatch(&self, request: Request) -> Result<Value, ErrorBody> {
        let params = request.params.unwrap_or(Value::Null);
        match request.method.as_str() {
            METHOD_SUBSCRIBE => {
                let key = subscription_key_from_params(&params)?;
                let added = self.core().subscriptions.insert(key.clone());
                debug!(session = %self.inner.label, key = %key, added, "subscribe");
                Ok(json!(true))
            }
            METHOD_UNSUBSCRIBE => {
                let key = subscription_key_from_params(&params)?;
                let removed = self.core().subscriptions.remove(&key);
                debug!(session = %self.inner.label, key = %key, removed, "unsubscribe");
                Ok(json!(removed))
            }
            METHOD_PING => Ok(json!("pong")),
            method => {
                self.inner
                    .handlers
                    .invoke(self.clone(), method, params)
                    .await
            }
        }
    }

    fn process_response(&self, response: Response) {
        let Some(id) = response.id.as_u64() else {
            debug!(session = %self.inner.label, id = %response.id, "response with foreign id dropped");
            return;
        };

        let entry = {
            let mut core = self.core();
            core.last_activity = Instant::now();
            let entry = core.in_flight.remove(&id);
            if entry.is_some() && core.is_idle() {
                trace!(session = %self.inner.label, "session idle");
            }
            entry
        };

        match entry {
            Some(request) => {
                trace!(session = %self.inner.label, id, method = %request.method, ok = response.is_ok(), "response");
                request.settle(response.into_result().map_err(RpcError::Remote));
                self.flush_request_queue();
            }
            None => {
                trace!(session = %self.inner.label, id, "response for unknown or expired request dropped")
            }
        }
    }

    /// Writes a response unless `id` is falsy (notifications are never
    /// answered) or the session is not OPEN.
    pub fn send_response(&self, id: Option<Value>, outcome: Result<Value, ErrorBody>) -> bool {
        let Some(id) = id.filter(|id| is_answerable_id(Some(id))) else {
            return false;
        };

        let response = match outcome {
            Ok(result) => Response::ok(id, result),
            Err(error) => Response::error(id, error),
        };
        let frame = match self.encode(&response) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(session = %self.inner.label, error = %err, "failed to encode response");
                let fallback = Response::error(response.id, ErrorBody::internal_error(err.to_string()));
                match self.encode(&fallback) {
                    Ok(frame) => frame,
                    Err(_) => return false,
                }
            }
        };
        self.write_frame(frame)
    }

    fn write_frame(&self, frame: Vec<u8>) -> bool {
        let core = self.core();
        if core.state != SessionState::Open {
            debug!(session = %self.inner.label, state = %core.state, "not open, frame dropped");
            return false;
        }
        match &core.link {
            Some(link) => link.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    /// Marks inbound activity; false once `generation` is no longer the
    /// attached link.
    fn touch(&self, generation: u64) -> bool {
        let mut core = self.core();
        if core.link.as_ref().map(|link| link.generation) != Some(generation) {
            return false;
        }
        core.last_activity = Instant::now();
        true
    }

    /// The transport of `generation` ended, with `error` if it failed.
    fn transport_closed(&self, generation: u64, error: Option<String>) {
        let (was_open, link, pending) = {
            let mut core = self.core();
            let link = match core.link.take() {
                Some(link) if link.generation == generation => link,
                other => {
                    core.link = other;
                    return;
                }
            };
            if let Some(err) = &error {
                core.last_error = Some(err.clone());
            }
            let was_open = core.state == SessionState::Open;
            self.transition(&mut core, SessionState::Closed);
            (was_open, link, core.drain_pending())
        };

        // dropping the link drops the outbound sender; the writer task then
        // closes the transport
        link.reader.abort();
        drop(link);

        match &error {
            Some(err) => warn!(session = %self.inner.label, error = %err, rejected = pending.len(), "transport failed"),
            None => debug!(session = %self.inner.label, rejected = pending.len(), "transport closed"),
        }

        for req in pending {
            req.settle(Err(RpcError::Cancelled));
        }
        if let Some(err) = error {
            self.emit(SessionEvent::Error(err));
        }
        if was_open {
            self.emit(SessionEvent::Close);
        }
    }

    /// Closes the session: every queued and in-flight request fails with
    /// [`RpcError::Cancelled`], the sweeper stops and the transport is
    /// detached and closed. Calling it again is a no-op.
    pub fn close(&self) {
        self.stop_sweeper();
        let (was_open, link, pending) = {
            let mut core = self.core();
            if core.state == SessionState::Closed && core.link.is_none() && core.is_idle() {
                return;
            }
            let was_open = core.state == SessionState::Open;
            self.transition(&mut core, SessionState::Closing);
            (was_open, core.link.take(), core.drain_pending())
        };

        debug!(session = %self.inner.label, rejected = pending.len(), "closing session");
        for req in pending {
            req.settle(Err(RpcError::Cancelled));
        }
        if let Some(link) = link {
            link.reader.abort();
        }

        {
            let mut core = self.core();
            self.transition(&mut core, SessionState::Closed);
        }
        if was_open {
            self.emit(SessionEvent::Close);
        }
    }
}

/// Registry key for a `jsonrpc.subscribe` path and optional name.
pub fn subscription_key(path: &str, name: Option<&str>) -> String {
    match name {
        Some(name) if !name.is_empty() => format!("{path}/{name}"),
        _ => path.to_string(),
    }
}

fn subscription_key_from_params(params: &Value) -> Result<String, ErrorBody> {
    let (path, name) = match params {
        Value::Array(items) => (items.first(), items.get(1)),
        Value::Object(map) => (map.get("path"), map.get("name")),
        _ => (None, None),
    };
    let path = path
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ErrorBody::invalid_params("subscription path must be a non-empty string"))?;
    Ok(subscription_key(path, name.and_then(Value::as_str)))
}

async fn write_loop(
    transport: Arc<dyn Transport>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    session: Weak<SessionInner>,
    generation: u64,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = transport.send(&frame).await {
            if let Some(inner) = session.upgrade() {
                Session { inner }.transport_closed(generation, Some(err.to_string()));
            }
            break;
        }
    }
    if let Err(err) = transport.close().await {
        trace!(error = %err, "transport close failed");
    }
}

async fn read_loop(
    transport: Arc<dyn Transport>,
    session: Weak<SessionInner>,
    generation: u64,
    max_message_size: usize,
) {
    let mut decoder = FrameDecoder::new(max_message_size);
    loop {
        let received = transport.receive().await;
        let Some(inner) = session.upgrade() else {
            break;
        };
        let session = Session { inner };

        match received {
            Ok(Some(bytes)) => {
                // a replaced link must not feed the current peer's session
                if !session.touch(generation) {
                    break;
                }
                for payload in decoder.push(&bytes) {
                    session.process_message(&payload);
                }
            }
            Ok(None) => {
                session.transport_closed(generation, None);
                break;
            }
            Err(err) => {
                session.transport_closed(generation, Some(err.to_string()));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MAX_MESSAGE_SIZE;
    use crate::handler::{MethodMap, method_fn};
    use crate::message::{ErrorCode, StandardErrorCode};
    use crate::transport::channel::{ChannelTransport, channel_transport_pair};

    /// A hand-driven peer speaking raw frames.
    struct RawPeer {
        transport: ChannelTransport,
        decoder: FrameDecoder,
        ready: VecDeque<Value>,
    }

    impl RawPeer {
        fn new(transport: ChannelTransport) -> Self {
            Self {
                transport,
                decoder: FrameDecoder::default(),
                ready: VecDeque::new(),
            }
        }

        async fn send(&self, value: &Value) {
            let payload = serde_json::to_vec(value).unwrap();
            let frame = encode_frame(&payload, MAX_MESSAGE_SIZE).unwrap();
            self.transport.send(&frame).await.unwrap();
        }

        async fn next(&mut self) -> Value {
            loop {
                if let Some(value) = self.ready.pop_front() {
                    return value;
                }
                let bytes = self.transport.receive().await.unwrap().expect("peer closed");
                for payload in self.decoder.push(&bytes) {
                    self.ready.push_back(serde_json::from_slice(&payload).unwrap());
                }
            }
        }
    }

    fn session(role: Role, config: SessionConfig, handlers: HandlerRegistry) -> Session {
        Session::new(role, format!("{role:?}"), config, Arc::new(handlers))
    }

    fn linked(handlers: HandlerRegistry) -> (Session, Session) {
        let (a, b) = channel_transport_pair(64);
        let client = session(Role::Client, SessionConfig::default(), HandlerRegistry::new());
        let server = session(Role::Server, SessionConfig::default(), handlers);
        client.attach(Arc::new(a));
        server.attach(Arc::new(b));
        (client, server)
    }

    fn with_raw_peer(config: SessionConfig) -> (Session, RawPeer) {
        let (a, b) = channel_transport_pair(64);
        let session = session(Role::Client, config, HandlerRegistry::new());
        session.attach(Arc::new(a));
        (session, RawPeer::new(b))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn call_roundtrip() {
        let handlers = HandlerRegistry::new();
        handlers.register_fn("add", |_, (a, b): (i64, i64)| async move {
            Ok::<_, ErrorBody>(a + b)
        });
        let (client, _server) = linked(handlers);

        let result = client.call("add", Some(json!([2, 3])), None).await.unwrap();
        assert_eq!(result, json!(5));
        assert!(client.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn responses_match_ids_regardless_of_order() {
        let handlers = HandlerRegistry::new();
        handlers.register_fn("echo_after", |_, (ms, tag): (u64, String)| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, ErrorBody>(tag)
        });
        let (client, _server) = linked(handlers);

        let calls = (0..8u64).map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let tag = format!("call-{i}");
                let delay = 800 - i * 100;
                let result = client
                    .call("echo_after", Some(json!([delay, tag])), None)
                    .await
                    .unwrap();
                (tag, result)
            })
        });

        for handle in futures::future::join_all(calls).await {
            let (tag, result) = handle.unwrap();
            assert_eq!(result, json!(tag));
        }
    }

    #[tokio::test]
    async fn unknown_method_wire_response() {
        let (a, b) = channel_transport_pair(16);
        let server = session(Role::Server, SessionConfig::default(), HandlerRegistry::new());
        server.attach(Arc::new(a));
        let mut peer = RawPeer::new(b);

        peer.send(&json!({"id": 5, "jsonrpc": "2.0", "method": "unknown.method"}))
            .await;
        assert_eq!(
            peer.next().await,
            json!({"id": 5, "jsonrpc": "2.0", "error": {"code": -32601, "message": "Method not found"}})
        );
    }

    #[tokio::test]
    async fn handler_errors_become_error_responses() {
        let handlers = HandlerRegistry::new();
        handlers.register_fn("fail", |_, _: Value| async move {
            Err::<Value, _>(ErrorBody::new(ErrorCode::Custom(42), "nope"))
        });
        handlers.register_fn("panic", |_, _: Value| async move {
            if true {
                panic!("handler bug");
            }
            Ok::<Value, ErrorBody>(Value::Null)
        });
        handlers.register_fn("ok", |_, _: Value| async move { Ok::<_, ErrorBody>("fine") });
        let (client, server) = linked(handlers);

        match client.call("fail", None, None).await {
            Err(RpcError::Remote(body)) => {
                assert_eq!(body.code, ErrorCode::Custom(42));
                assert_eq!(body.message, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
        match client.call("panic", None, None).await {
            Err(RpcError::Remote(body)) => assert_eq!(
                body.code,
                ErrorCode::Standard(StandardErrorCode::InternalError)
            ),
            other => panic!("unexpected {other:?}"),
        }

        assert!(server.is_open());
        assert_eq!(client.call("ok", None, None).await.unwrap(), json!("fine"));
    }

    #[tokio::test]
    async fn notifications_reach_handlers_without_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handlers = HandlerRegistry::new();
        let mut map = MethodMap::new();
        map.insert(
            "$event",
            method_fn(move |_, (value,): (i64,)| {
                let tx = tx.clone();
                async move {
                    tx.send(value).ok();
                    Ok::<_, ErrorBody>(())
                }
            }),
        );
        handlers.expose_map("shadow", map);

        let (a, b) = channel_transport_pair(16);
        let server = session(Role::Server, SessionConfig::default(), handlers);
        server.attach(Arc::new(b));
        let mut peer = RawPeer::new(a);

        peer.send(&json!({"jsonrpc": "2.0", "method": "$shadow.event", "params": [7]}))
            .await;
        assert_eq!(rx.recv().await, Some(7));

        // the only frame the peer sees is the answer to its ping
        peer.send(&json!({"id": 1, "jsonrpc": "2.0", "method": "jsonrpc.ping"}))
            .await;
        assert_eq!(
            peer.next().await,
            json!({"id": 1, "jsonrpc": "2.0", "result": "pong"})
        );
    }

    #[tokio::test]
    async fn subscribe_builtins_track_paths() {
        let (client, server) = linked(HandlerRegistry::new());

        let added = client
            .call(METHOD_SUBSCRIBE, Some(json!(["status", "wifi"])), None)
            .await
            .unwrap();
        assert_eq!(added, json!(true));
        client
            .call(METHOD_SUBSCRIBE, Some(json!({"path": "firmware"})), None)
            .await
            .unwrap();
        assert_eq!(server.subscriptions(), vec!["firmware", "status/wifi"]);

        let removed = client
            .call(METHOD_UNSUBSCRIBE, Some(json!(["status", "wifi"])), None)
            .await
            .unwrap();
        assert_eq!(removed, json!(true));
        assert!(!server.is_subscribed("status/wifi"));

        let err = client
            .call(METHOD_SUBSCRIBE, Some(json!([])), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(-32602));
    }

    #[tokio::test]
    async fn legacy_batch_is_answered_per_element() {
        let handlers = HandlerRegistry::new();
        handlers.register_fn("double", |_, (n,): (i64,)| async move { Ok::<_, ErrorBody>(n * 2) });
        let (a, b) = channel_transport_pair(16);
        let server = session(Role::Server, SessionConfig::default(), handlers);
        server.attach(Arc::new(a));
        let mut peer = RawPeer::new(b);

        peer.send(&json!([
            {"id": 1, "jsonrpc": "2.0", "method": "double", "params": [2]},
            {"id": 2, "jsonrpc": "2.0", "method": "double", "params": [5]},
            {"jsonrpc": "2.0", "method": "double", "params": [9]},
        ]))
        .await;

        let mut answers = vec![peer.next().await, peer.next().await];
        answers.sort_by_key(|v| v["id"].as_u64());
        assert_eq!(answers[0], json!({"id": 1, "jsonrpc": "2.0", "result": 4}));
        assert_eq!(answers[1], json!({"id": 2, "jsonrpc": "2.0", "result": 10}));
    }

    #[tokio::test]
    async fn nothing_is_written_before_open() {
        let session = session(Role::Client, SessionConfig::default(), HandlerRegistry::new());
        let caller = {
            let session = session.clone();
            tokio::spawn(async move { session.call("status", None, None).await })
        };
        settle().await;
        assert_eq!(session.pending(), (1, 0));
        assert_eq!(session.flush_request_queue(), 0);

        let (a, b) = channel_transport_pair(16);
        let mut peer = RawPeer::new(b);
        session.attach(Arc::new(a));

        let request = peer.next().await;
        assert_eq!(request["method"], "status");
        peer.send(&json!({"id": request["id"], "jsonrpc": "2.0", "result": "ready"}))
            .await;
        assert_eq!(caller.await.unwrap().unwrap(), json!("ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn unopened_session_times_out_in_queue() {
        let session = session(Role::Client, SessionConfig::default(), HandlerRegistry::new());
        session.start_sweeper();

        let started = Instant::now();
        let err = session.call("status", None, None).await.unwrap_err();
        assert_eq!(err, RpcError::QueueTimeout(Duration::from_millis(3000)));
        assert!(started.elapsed() <= Duration::from_millis(4000));
        assert!(session.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out_in_flight() {
        let (session, mut peer) = with_raw_peer(SessionConfig::default());
        session.start_sweeper();

        let started = Instant::now();
        let caller = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .call("slow", None, Some(Duration::from_millis(1500)))
                    .await
            })
        };
        let request = peer.next().await;
        assert_eq!(request["method"], "slow");

        let err = caller.await.unwrap().unwrap_err();
        assert_eq!(err, RpcError::ResponseTimeout(Duration::from_millis(1500)));
        assert!(started.elapsed() <= Duration::from_millis(2500));

        // a late answer is dropped silently
        peer.send(&json!({"id": request["id"], "jsonrpc": "2.0", "result": 1}))
            .await;
        settle().await;
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn full_queue_rejects_calls() {
        let config = SessionConfig::default().with_max_queue_depth(2);
        let session = session(Role::Client, config, HandlerRegistry::new());
        for _ in 0..2 {
            let session = session.clone();
            tokio::spawn(async move { session.call("queued", None, None).await });
        }
        settle().await;

        let err = session.call("overflow", None, None).await.unwrap_err();
        assert_eq!(err, RpcError::QueueBusy { depth: 2 });
    }

    #[tokio::test]
    async fn close_cancels_queued_and_in_flight() {
        let config = SessionConfig::default().with_max_in_flight(2);
        let (session, mut peer) = with_raw_peer(config);
        let mut events = session.events();

        let callers: Vec<_> = (0..5)
            .map(|i| {
                let session = session.clone();
                tokio::spawn(async move { session.call(&format!("m{i}"), None, None).await })
            })
            .collect();

        assert_eq!(peer.next().await["method"], "m0");
        assert_eq!(peer.next().await["method"], "m1");
        settle().await;
        assert_eq!(session.pending(), (3, 2));

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        for caller in callers {
            assert_eq!(caller.await.unwrap(), Err(RpcError::Cancelled));
        }

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Close);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_disconnect_closes_session() {
        let (session, peer) = with_raw_peer(SessionConfig::default());
        let mut events = session.events();

        let caller = {
            let session = session.clone();
            tokio::spawn(async move { session.call("never", None, None).await })
        };
        settle().await;
        peer.transport.close().await.unwrap();

        assert_eq!(caller.await.unwrap(), Err(RpcError::Cancelled));
        session.closed().await;
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Close);
    }

    /// Accepts every inbound chunk fed through `feed` but fails all writes.
    struct BrokenWriter {
        feed: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl Transport for BrokenWriter {
        async fn send(&self, _data: &[u8]) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("broken pipe"))
        }

        async fn receive(&self) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(self.feed.lock().await.recv().await)
        }
    }

    fn broken_writer() -> (BrokenWriter, mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(16);
        let transport = BrokenWriter {
            feed: tokio::sync::Mutex::new(rx),
        };
        (transport, tx)
    }

    #[tokio::test]
    async fn write_failure_closes_session() {
        let session = session(Role::Client, SessionConfig::default(), HandlerRegistry::new());
        let (transport, _feed) = broken_writer();
        session.attach(Arc::new(transport));
        let mut events = session.events();

        let result = session.call("status", None, None).await;
        assert_eq!(result, Err(RpcError::Cancelled));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.is_idle());
        assert!(session.last_error().unwrap().contains("broken pipe"));

        match events.recv().await.unwrap() {
            SessionEvent::Error(err) => assert!(err.contains("broken pipe")),
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Close);
    }

    #[tokio::test]
    async fn replaced_transport_no_longer_dispatches() {
        let reboots = Arc::new(AtomicU64::new(0));
        let handlers = HandlerRegistry::new();
        {
            let reboots = reboots.clone();
            handlers.register_fn("reboot", move |_, _: Value| {
                let reboots = reboots.clone();
                async move {
                    reboots.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ErrorBody>(true)
                }
            });
        }
        let session = session(Role::Server, SessionConfig::default(), handlers);
        let (transport, feed) = broken_writer();
        session.attach(Arc::new(transport));

        assert_eq!(
            session.call("status", None, None).await,
            Err(RpcError::Cancelled)
        );

        let (a, b) = channel_transport_pair(16);
        session.attach(Arc::new(a));
        let mut peer = RawPeer::new(b);

        // the dead link still delivers bytes
        let stale = serde_json::to_vec(&json!({"jsonrpc": "2.0", "method": "reboot"})).unwrap();
        let _ = feed
            .send(encode_frame(&stale, MAX_MESSAGE_SIZE).unwrap())
            .await;

        peer.send(&json!({"id": 1, "jsonrpc": "2.0", "method": "jsonrpc.ping"}))
            .await;
        assert_eq!(
            peer.next().await,
            json!({"id": 1, "jsonrpc": "2.0", "result": "pong"})
        );
        settle().await;
        assert_eq!(reboots.load(Ordering::SeqCst), 0);
        assert!(session.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_sweeper() {
        let session = session(Role::Client, SessionConfig::default(), HandlerRegistry::new());
        session.start_sweeper();
        session.start_sweeper();
        assert!(session.is_sweeping());

        session.close();
        assert!(!session.is_sweeping());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_unexpired_requests_in_order() {
        let session = session(Role::Client, SessionConfig::default(), HandlerRegistry::new());
        let short = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .call("short", None, Some(Duration::from_millis(100)))
                    .await
            })
        };
        let later: Vec<_> = ["first", "second"]
            .into_iter()
            .map(|method| {
                let session = session.clone();
                tokio::spawn(async move { session.call(method, None, None).await })
            })
            .collect();
        settle().await;
        assert_eq!(session.pending(), (3, 0));

        tokio::time::advance(Duration::from_millis(150)).await;
        session.sweep();
        assert_eq!(
            short.await.unwrap(),
            Err(RpcError::QueueTimeout(Duration::from_millis(100)))
        );
        assert_eq!(session.pending(), (2, 0));

        let (a, b) = channel_transport_pair(16);
        let mut peer = RawPeer::new(b);
        session.attach(Arc::new(a));
        for (expected, caller) in ["first", "second"].into_iter().zip(later) {
            let request = peer.next().await;
            assert_eq!(request["method"], expected);
            peer.send(&json!({"id": request["id"], "jsonrpc": "2.0", "result": expected}))
                .await;
            assert_eq!(caller.await.unwrap().unwrap(), json!(expected));
        }
    }

    #[tokio::test]
    async fn closed_server_session_refuses_work() {
        let (_client, server) = linked(HandlerRegistry::new());
        server.close();

        assert_eq!(server.call("x", None, None).await, Err(RpcError::Closed));
        assert_eq!(server.send_notify("x", None), Err(RpcError::Closed));
    }
}
