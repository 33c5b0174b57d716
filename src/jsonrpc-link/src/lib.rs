//! Duplex JSON-RPC 2.0 sessions over length-prefixed byte streams.
//!
//! Frames are `<hex length>\r\n<json>\r\n`. Either side of a [`Session`] may
//! call the other; a [`Server`] accepts TCP or Unix-socket peers, and a
//! [`ClientPool`] keeps one lazily connected [`ClientSession`] per target.

pub mod codec;
mod client;
mod config;
mod error;
mod handler;
mod message;
mod pool;
mod server;
mod session;
mod sweep;
mod target;
pub mod transport;

pub use client::{ClientSession, MethodCaller};
pub use config::*;
pub use error::{ErrorReply, RpcError, RpcResult};
pub use handler::{HandlerRegistry, MethodMap, RpcMethod, exposed_name, method_fn};
pub use message::*;
pub use pool::{ClientPool, PoolCloseGuard, Proxy, ProxyMethod};
pub use server::{Server, ServerConnection};
pub use session::{
    METHOD_PING, METHOD_SUBSCRIBE, METHOD_UNSUBSCRIBE, Role, Session, SessionEvent, SessionState,
    subscription_key,
};
pub use target::Target;
pub use transport::channel::{ChannelTransport, channel_transport_pair};
pub use transport::{Connector, SocketConnector, StreamTransport, Transport};
