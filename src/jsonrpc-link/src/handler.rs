use crate::message::ErrorBody;
use crate::session::Session;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, trace};

/// A method a peer may invoke. `params` is `null` when the request carried
/// none.
#[async_trait]
pub trait RpcMethod: Send + Sync + 'static {
    async fn call(&self, session: Session, params: Value) -> Result<Value, ErrorBody>;
}

/// Wraps a typed async fn as an [`RpcMethod`].
///
/// Params that do not decode into `Req` are answered with `InvalidParams`
/// without running `f`.
pub fn method_fn<Req, Res, Err, F, Fut>(f: F) -> Arc<dyn RpcMethod>
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    Err: Into<ErrorBody> + Send + 'static,
    F: Fn(Session, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res, Err>> + Send + 'static,
{
    Arc::new(TypedMethod {
        f,
        _phantom: PhantomData,
    })
}

struct TypedMethod<Req, Res, Err, F> {
    f: F,
    _phantom: PhantomData<fn() -> (Req, Res, Err)>,
}

#[async_trait]
impl<Req, Res, Err, F, Fut> RpcMethod for TypedMethod<Req, Res, Err, F>
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    Err: Into<ErrorBody> + Send + 'static,
    F: Fn(Session, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res, Err>> + Send + 'static,
{
    async fn call(&self, session: Session, params: Value) -> Result<Value, ErrorBody> {
        let input: Req = serde_json::from_value(params)
            .map_err(|e| ErrorBody::invalid_params(format!("Invalid params: {e}")))?;

        match (self.f)(session, input).await {
            Ok(output) => serde_json::to_value(output)
                .map_err(|e| ErrorBody::internal_error(format!("Serialization error: {e}"))),
            Err(e) => Err(e.into()),
        }
    }
}

/// A named group of methods, exposed together under a prefix.
#[derive(Default, Clone)]
pub struct MethodMap {
    methods: BTreeMap<String, Arc<dyn RpcMethod>>,
}

impl MethodMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, method: Arc<dyn RpcMethod>) {
        self.methods.insert(key.into(), method);
    }

    pub fn with(mut self, key: impl Into<String>, method: Arc<dyn RpcMethod>) -> Self {
        self.insert(key, method);
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Name a map entry is exposed under: `name.key`, or `$name.key` for keys
/// written as `$key`.
pub fn exposed_name(name: &str, key: &str) -> String {
    match key.strip_prefix('$') {
        Some(key) => format!("${name}.{key}"),
        None => format!("{name}.{key}"),
    }
}

/// Methods available to the peer of every session sharing the registry.
#[derive(Default)]
pub struct HandlerRegistry {
    methods: DashMap<String, Arc<dyn RpcMethod>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `method` under `name`, replacing any previous entry.
    pub fn expose(&self, name: impl Into<String>, method: Arc<dyn RpcMethod>) {
        let name = name.into();
        trace!(method = %name, "expose");
        self.methods.insert(name, method);
    }

    pub fn register_fn<Req, Res, Err, F, Fut>(&self, name: impl Into<String>, f: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        Err: Into<ErrorBody> + Send + 'static,
        F: Fn(Session, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Err>> + Send + 'static,
    {
        self.expose(name, method_fn(f));
    }

    pub fn expose_map(&self, name: &str, map: MethodMap) {
        for (key, method) in map.methods {
            self.expose(exposed_name(name, &key), method);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RpcMethod>> {
        self.methods.get(name).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.methods.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.methods.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Runs the method registered as `name`. Unknown names yield
    /// `MethodNotFound`; a panicking handler yields `InternalError` and
    /// leaves the session usable.
    pub async fn invoke(
        &self,
        session: Session,
        name: &str,
        params: Value,
    ) -> Result<Value, ErrorBody> {
        let Some(method) = self.get(name) else {
            trace!(method = %name, "method not found");
            return Err(ErrorBody::method_not_found());
        };

        match AssertUnwindSafe(method.call(session, params))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(method = %name, reason = %reason, "handler panicked");
                Err(ErrorBody::internal_error(reason))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
