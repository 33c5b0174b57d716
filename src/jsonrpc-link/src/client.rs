use crate::config::ClientConfig;
use crate::error::{ErrorReply, RpcError, RpcResult};
use crate::handler::{HandlerRegistry, MethodMap, RpcMethod};
use crate::session::{Role, Session, SessionEvent, SessionState};
use crate::target::Target;
use crate::transport::{Connector, SocketConnector};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

type ConnectFuture = Shared<BoxFuture<'static, RpcResult<()>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ClientInner {
    session: Session,
    target: Target,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    connecting: Mutex<Option<ConnectFuture>>,
    /// Swept by a pool instead of its own timer.
    managed: bool,
    shut_down: AtomicBool,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.session.close();
    }
}

/// Client end of a link to one target.
///
/// Connecting is lazy and single-flight: the first `call` from INIT or
/// CLOSED dials the target, concurrent callers share that one attempt, and a
/// failed dial is returned to every caller waiting on it.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("target", &self.inner.target)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientSession {
    pub fn new(target: Target, config: ClientConfig) -> Self {
        Self::with_connector(target, config, Arc::new(SocketConnector))
    }

    /// Resolves `name` against `config.runtime_dir`.
    pub fn open(name: &str, config: ClientConfig) -> RpcResult<Self> {
        let target = Target::parse(name, &config.runtime_dir)?;
        Ok(Self::new(target, config))
    }

    pub fn with_connector(
        target: Target,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self::build(target, config, connector, false)
    }

    pub(crate) fn managed(
        target: Target,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self::build(target, config, connector, true)
    }

    fn build(
        target: Target,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        managed: bool,
    ) -> Self {
        let session = Session::new(
            Role::Client,
            target.to_string(),
            config.session.clone(),
            Arc::new(HandlerRegistry::new()),
        );
        Self {
            inner: Arc::new(ClientInner {
                session,
                target,
                config,
                connector,
                connecting: Mutex::new(None),
                managed,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.session.events()
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        self.inner.session.handlers()
    }

    pub fn expose(&self, name: impl Into<String>, method: Arc<dyn RpcMethod>) {
        self.handlers().expose(name, method);
    }

    pub fn expose_map(&self, name: &str, map: MethodMap) {
        self.handlers().expose_map(name, map);
    }

    /// Connects unless OPEN, joining an attempt already in progress.
    pub async fn reconnect(&self) -> RpcResult<()> {
        match self.start_connect()? {
            Some(attempt) => attempt.await,
            None => Ok(()),
        }
    }

    pub async fn connect(&self) -> RpcResult<()> {
        self.reconnect().await
    }

    /// Returns the in-progress attempt, starting one from INIT or CLOSED.
    /// `None` when the session is already OPEN.
    fn start_connect(&self) -> RpcResult<Option<ConnectFuture>> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }
        self.ensure_sweeper();

        let mut slot = lock(&self.inner.connecting);
        if let Some(attempt) = slot.as_ref() {
            return Ok(Some(attempt.clone()));
        }
        match self.inner.session.state() {
            SessionState::Open => return Ok(None),
            SessionState::Closing => return Err(RpcError::Closed),
            SessionState::Init | SessionState::Closed | SessionState::Connecting => {}
        }
        self.inner.session.begin_connect();

        let attempt = self.spawn_connect();
        *slot = Some(attempt.clone());
        Ok(Some(attempt))
    }

    fn spawn_connect(&self) -> ConnectFuture {
        let inner = self.inner.clone();
        let target = self.inner.target.to_string();
        let handle = tokio::spawn(async move {
            debug!(target = %inner.target, "connecting");
            let dial = inner.connector.connect(&inner.target);
            let dialed = match tokio::time::timeout(inner.config.connect_timeout, dial).await {
                Ok(Ok(transport)) if inner.shut_down.load(Ordering::Acquire) => {
                    let _ = transport.close().await;
                    Err(RpcError::Closed)
                }
                Ok(Ok(transport)) => Ok(transport),
                Ok(Err(err)) => Err(RpcError::connect(inner.target.to_string(), format!("{err:#}"))),
                Err(_) => Err(RpcError::connect(
                    inner.target.to_string(),
                    format!("timed out after {:?}", inner.config.connect_timeout),
                )),
            };

            // cleared together with the state change
            let mut slot = lock(&inner.connecting);
            slot.take();
            match dialed {
                Ok(transport) => {
                    inner.session.attach(transport);
                    Ok(())
                }
                Err(err) => {
                    warn!(target = %inner.target, error = %err, "connect failed");
                    inner.session.connect_failed(&err);
                    Err(err)
                }
            }
        });

        async move {
            handle
                .await
                .unwrap_or_else(|err| Err(RpcError::connect(target, err)))
        }
        .boxed()
        .shared()
    }

    fn ensure_sweeper(&self) {
        if !self.inner.managed {
            self.inner.session.start_sweeper();
        }
    }

    /// Invokes `method` on the peer, dialing first when needed. A failed dial
    /// is returned as [`RpcError::Connect`] and nothing is queued.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> RpcResult<Value> {
        if let Some(attempt) = self.start_connect()? {
            if let Err(err) = attempt.await {
                debug!(target = %self.inner.target, method, error = %err, "call without connection");
                return Err(err);
            }
        }
        self.inner.session.submit(method, params, timeout).await
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> RpcResult<()> {
        if let Err(err) = self.start_connect() {
            if self.inner.shut_down.load(Ordering::Acquire) {
                return Err(err);
            }
        }
        self.inner.session.submit_notify(method, params)
    }

    /// A caller bound to `method` that reports failures as values.
    pub fn method(&self, method: impl Into<String>) -> MethodCaller {
        MethodCaller {
            client: self.clone(),
            method: method.into(),
        }
    }

    pub fn sweep(&self) {
        self.inner.session.sweep();
    }

    /// CLOSED, or idle for longer than the configured expiry.
    pub fn is_expired(&self) -> bool {
        let session = &self.inner.session;
        match session.state() {
            SessionState::Closed => lock(&self.inner.connecting).is_none(),
            _ => session.is_idle() && session.idle_for() > self.inner.config.session.idle_expiry,
        }
    }

    /// Closes the session for good; later calls fail with
    /// [`RpcError::Closed`].
    pub fn close(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        self.inner.session.close();
    }

    pub(crate) fn same_as(&self, other: &ClientSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// See [`ClientSession::method`].
#[derive(Clone, Debug)]
pub struct MethodCaller {
    client: ClientSession,
    method: String,
}

impl MethodCaller {
    pub fn name(&self) -> &str {
        &self.method
    }

    pub async fn call(&self, params: Option<Value>) -> Result<Value, ErrorReply> {
        self.client
            .call(&self.method, params, None)
            .await
            .map_err(ErrorReply::from)
    }
}
