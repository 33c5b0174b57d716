//! Listening side: accepts connections and serves them from one shared
//! handler registry.

use crate::config::ServerConfig;
use crate::error::{RpcError, RpcResult};
use crate::handler::HandlerRegistry;
use crate::session::{Role, Session, SessionState, subscription_key};
use crate::sweep::spawn_sweeper;
use crate::target::Target;
use crate::transport::{StreamTransport, Transport};
use anyhow::{Context, bail};
use dashmap::DashMap;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<(Arc<dyn Transport>, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Arc::new(StreamTransport::new(stream)), addr.to_string()))
            }
            Listener::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok((Arc::new(StreamTransport::new(stream)), "unix".to_string()))
            }
        }
    }
}

/// One accepted peer.
#[derive(Clone, Debug)]
pub struct ServerConnection {
    id: u64,
    peer: String,
    session: Session,
}

impl ServerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> RpcResult<Value> {
        self.session.call(method, params, timeout).await
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> RpcResult<()> {
        self.session.send_notify(method, params)
    }

    pub fn close(&self) {
        self.session.close();
    }
}

struct ServerInner {
    listen: Target,
    config: ServerConfig,
    handlers: Arc<HandlerRegistry>,
    connections: DashMap<u64, ServerConnection>,
    next_connection_id: AtomicU64,
    local_addr: Option<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ServerInner {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
        if let Some(task) = lock(&self.sweeper).take() {
            task.abort();
        }

        let connections: Vec<_> = self.connections.iter().map(|c| c.value().clone()).collect();
        self.connections.clear();
        for connection in connections {
            connection.close();
        }

        if let Some(path) = self.listen.socket_path() {
            remove_socket_file(path);
        }
        info!(listen = %self.listen, "server closed");
    }

    fn register(self: &Arc<Self>, transport: Arc<dyn Transport>, peer: String) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(
            Role::Server,
            format!("{}#{id}", self.listen),
            self.config.session.clone(),
            self.handlers.clone(),
        );
        self.connections.insert(
            id,
            ServerConnection {
                id,
                peer: peer.clone(),
                session: session.clone(),
            },
        );
        session.attach(transport);
        debug!(connection = id, peer = %peer, "connection accepted");

        let server = Arc::downgrade(self);
        tokio::spawn(async move {
            session.closed().await;
            if let Some(server) = server.upgrade() {
                server.connections.remove(&id);
            }
            debug!(connection = id, "connection removed");
        });
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A bound listener plus its live connections.
///
/// Every accepted connection gets a fresh id and goes straight to OPEN,
/// sharing the server's [`HandlerRegistry`]. Dropping the last handle closes
/// the server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Binds `listen` (a [`Target`] string resolved against
    /// `config.runtime_dir`) and starts accepting.
    pub async fn bind(
        listen: &str,
        handlers: Arc<HandlerRegistry>,
        config: ServerConfig,
    ) -> anyhow::Result<Server> {
        let target = Target::parse(listen, &config.runtime_dir)?;
        Self::bind_target(target, handlers, config).await
    }

    pub async fn bind_target(
        target: Target,
        handlers: Arc<HandlerRegistry>,
        config: ServerConfig,
    ) -> anyhow::Result<Server> {
        let (listener, listen, local_addr) = match &target {
            Target::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .with_context(|| format!("failed to bind {target}"))?;
                let addr = listener.local_addr()?;
                let listen = Target::Tcp {
                    host: host.clone(),
                    port: addr.port(),
                };
                (Listener::Tcp(listener), listen, Some(addr))
            }
            Target::Unix(path) => {
                prepare_socket_path(path, config.cleanup_stale_socket).await?;
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("failed to bind {target}"))?;
                (Listener::Unix(listener), target.clone(), None)
            }
        };
        info!(listen = %listen, "server listening");

        let inner = Arc::new(ServerInner {
            listen,
            config,
            handlers,
            connections: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            local_addr,
            accept_task: Mutex::new(None),
            sweeper: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let accept = tokio::spawn(accept_loop(listener, Arc::downgrade(&inner)));
        *lock(&inner.accept_task) = Some(accept);

        let sweeper = spawn_sweeper(
            Arc::downgrade(&inner),
            inner.config.session.sweep_interval,
            |inner: &Arc<ServerInner>| {
                let sessions: Vec<_> = inner
                    .connections
                    .iter()
                    .map(|c| c.session.clone())
                    .collect();
                for session in sessions {
                    session.sweep();
                }
            },
        );
        *lock(&inner.sweeper) = Some(sweeper);

        Ok(Server { inner })
    }

    /// The bound target; for TCP the port is the one actually assigned.
    pub fn target(&self) -> &Target {
        &self.inner.listen
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.inner.handlers
    }

    pub fn connection(&self, id: u64) -> Option<ServerConnection> {
        self.inner.connections.get(&id).map(|c| c.value().clone())
    }

    /// Live connections ordered by id.
    pub fn connections(&self) -> Vec<ServerConnection> {
        let mut connections: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|c| c.value().clone())
            .collect();
        connections.sort_by_key(|c| c.id);
        connections
    }

    /// Notifies connection `id`, or every open connection when `id` is
    /// `None`. Returns how many connections were notified.
    pub fn notify(&self, id: Option<u64>, method: &str, params: Option<Value>) -> RpcResult<usize> {
        match id {
            Some(id) => {
                let connection = self.connection(id).ok_or(RpcError::UnknownConnection(id))?;
                connection.notify(method, params)?;
                Ok(1)
            }
            None => {
                let mut sent = 0;
                for connection in self.connections() {
                    if connection.session.state() != SessionState::Open {
                        continue;
                    }
                    match connection.notify(method, params.clone()) {
                        Ok(()) => sent += 1,
                        Err(err) => {
                            warn!(connection = connection.id, method, error = %err, "broadcast skipped connection")
                        }
                    }
                }
                Ok(sent)
            }
        }
    }

    /// Calls `method` on the peer behind connection `id`.
    pub async fn call(
        &self,
        id: u64,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> RpcResult<Value> {
        let connection = self.connection(id).ok_or(RpcError::UnknownConnection(id))?;
        connection.call(method, params, timeout).await
    }

    /// Notifies connections subscribed to `path/name` or to `path` as a
    /// whole. The notification method is the subscription key.
    pub fn publish(&self, path: &str, name: Option<&str>, params: Option<Value>) -> usize {
        let key = subscription_key(path, name);
        let mut sent = 0;
        for connection in self.connections() {
            let session = &connection.session;
            if !(session.is_subscribed(&key) || session.is_subscribed(path)) {
                continue;
            }
            match session.send_notify(&key, params.clone()) {
                Ok(()) => sent += 1,
                Err(err) => {
                    warn!(connection = connection.id, key = %key, error = %err, "publish skipped connection")
                }
            }
        }
        debug!(key = %key, sent, "published");
        sent
    }

    /// Stops accepting, closes every connection and removes the socket
    /// file. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

async fn accept_loop(listener: Listener, server: Weak<ServerInner>) {
    loop {
        let accepted = listener.accept().await;
        let Some(server) = server.upgrade() else {
            break;
        };
        match accepted {
            Ok((transport, peer)) => server.register(transport, peer),
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                // keep accepting; back off so a persistent error does not spin
                drop(server);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Makes `path` bindable: a stale socket file is removed when `cleanup` is
/// set, a live one is an error.
async fn prepare_socket_path(path: &Path, cleanup: bool) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        bail!("socket directory {} does not exist", parent.display());
    }
    if !path.exists() {
        return Ok(());
    }
    if !cleanup {
        bail!("socket {} already exists", path.display());
    }
    if UnixStream::connect(path).await.is_ok() {
        bail!("socket {} is in use by a running server", path.display());
    }
    info!(path = %path.display(), "Removing stale socket");
    std::fs::remove_file(path)
        .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    Ok(())
}

fn remove_socket_file(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove socket file");
    } else {
        debug!(path = %path.display(), "Removed socket file");
    }
}
