use crate::client::ClientSession;
use crate::config::{ClientConfig, SessionConfig};
use crate::error::{ErrorReply, RpcResult};
use crate::sweep::spawn_sweeper;
use crate::target::Target;
use crate::transport::{Connector, SocketConnector};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PoolInner {
    clients: DashMap<String, ClientSession>,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn close_expired_connections(&self) -> usize {
        let mut evicted = Vec::new();
        self.clients.retain(|name, client| {
            if client.is_expired() {
                evicted.push((name.clone(), client.clone()));
                false
            } else {
                true
            }
        });
        for (name, client) in &evicted {
            debug!(client = %name, "evicting expired client");
            client.close();
        }
        evicted.len()
    }

    fn sweep(&self) {
        let clients: Vec<_> = self.clients.iter().map(|c| c.value().clone()).collect();
        for client in clients {
            client.sweep();
        }
        self.close_expired_connections();
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.abort();
        }
        for client in self.clients.iter() {
            client.close();
        }
    }
}

/// Cache of client sessions keyed by target string.
///
/// Pooled clients are swept by one shared timer, started on the first
/// [`ClientPool::open`] inside a tokio runtime. Expired clients (closed, or
/// idle past the expiry) are evicted on each sweep and replaced on the next
/// `open`.
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl ClientPool {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(SocketConnector))
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                clients: DashMap::new(),
                config,
                connector,
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Process-wide pool, built on first use from the default client
    /// settings with `JSONRPC_LINK_*` overrides.
    ///
    /// Statics are never dropped, so the pool lives until
    /// [`ClientPool::close`] is called on it. Hold a guard in `main` to tear
    /// it down on the way out:
    ///
    /// ```no_run
    /// # async fn run() {
    /// let _pool = jsonrpc_link::ClientPool::global().close_on_drop();
    /// # }
    /// ```
    pub fn global() -> &'static ClientPool {
        static GLOBAL: OnceLock<ClientPool> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            ClientPool::new(ClientConfig::default().with_session(SessionConfig::from_env()))
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The live client for `name`, creating one if there is none or the
    /// cached one has expired.
    pub fn open(&self, name: &str) -> RpcResult<ClientSession> {
        self.ensure_sweeper();

        let client = match self.inner.clients.entry(name.to_string()) {
            Entry::Occupied(entry) if !entry.get().is_expired() => entry.get().clone(),
            Entry::Occupied(mut entry) => {
                let client = self.build(name)?;
                let stale = entry.insert(client.clone());
                debug!(client = %name, "replacing expired client");
                stale.close();
                client
            }
            Entry::Vacant(entry) => {
                let client = self.build(name)?;
                debug!(client = %name, target = %client.target(), "new pooled client");
                entry.insert(client.clone());
                client
            }
        };
        Ok(client)
    }

    fn build(&self, name: &str) -> RpcResult<ClientSession> {
        let target = Target::parse(name, &self.inner.config.runtime_dir)?;
        Ok(ClientSession::managed(
            target,
            self.inner.config.clone(),
            self.inner.connector.clone(),
        ))
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = lock(&self.inner.sweeper);
        if sweeper.is_some() || Handle::try_current().is_err() {
            return;
        }
        *sweeper = Some(spawn_sweeper(
            Arc::downgrade(&self.inner),
            self.inner.config.session.sweep_interval,
            |inner: &Arc<PoolInner>| inner.sweep(),
        ));
    }

    /// Evicts and closes every expired client. Returns how many went.
    pub fn close_expired_connections(&self) -> usize {
        self.inner.close_expired_connections()
    }

    /// One pass of the pool's timer: per-client timeouts, then eviction.
    pub fn sweep(&self) {
        self.inner.sweep();
    }

    pub fn len(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.clients.is_empty()
    }

    /// Calls `method` on `name` over a freshly (re)connected pooled client.
    /// Failures come back as `{code?, error}` values.
    pub async fn call(
        &self,
        name: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ErrorReply> {
        self.try_call(name, method, params)
            .await
            .map_err(ErrorReply::from)
    }

    async fn try_call(&self, name: &str, method: &str, params: Option<Value>) -> RpcResult<Value> {
        let client = self.open(name)?;
        client.reconnect().await?;
        client.call(method, params, None).await
    }

    /// Stub for `name` on which any method name can be called.
    pub fn proxy(&self, name: impl Into<String>) -> Proxy {
        Proxy {
            pool: self.clone(),
            name: name.into(),
        }
    }

    /// Stops the timer and closes every pooled client.
    pub fn close(&self) {
        if let Some(sweeper) = lock(&self.inner.sweeper).take() {
            sweeper.abort();
        }
        let clients: Vec<_> = self.inner.clients.iter().map(|c| c.value().clone()).collect();
        self.inner.clients.clear();
        for client in &clients {
            client.close();
        }
        info!(closed = clients.len(), "client pool closed");
    }

    /// A guard that calls [`ClientPool::close`] when dropped.
    #[must_use = "the pool is closed as soon as the guard is dropped"]
    pub fn close_on_drop(&self) -> PoolCloseGuard {
        PoolCloseGuard { pool: self.clone() }
    }
}

/// See [`ClientPool::close_on_drop`].
pub struct PoolCloseGuard {
    pool: ClientPool,
}

impl Drop for PoolCloseGuard {
    fn drop(&mut self) {
        self.pool.close();
    }
}

/// See [`ClientPool::proxy`].
#[derive(Clone)]
pub struct Proxy {
    pool: ClientPool,
    name: String,
}

impl Proxy {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ErrorReply> {
        self.pool.call(&self.name, method, params).await
    }

    pub fn method(&self, method: impl Into<String>) -> ProxyMethod {
        ProxyMethod {
            proxy: self.clone(),
            method: method.into(),
        }
    }
}

#[derive(Clone)]
pub struct ProxyMethod {
    proxy: Proxy,
    method: String,
}

impl ProxyMethod {
    pub async fn call(&self, params: Option<Value>) -> Result<Value, ErrorReply> {
        self.proxy.call(&self.method, params).await
    }
}
