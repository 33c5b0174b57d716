//! Where a client connects and a server listens.
//!
//! | input                 | resolves to                              |
//! |-----------------------|------------------------------------------|
//! | `tcp://host:port`     | TCP                                      |
//! | `unix:///run/x.sock`  | Unix socket at the URL path              |
//! | `/run/x.sock`, `./x`  | Unix socket at that path                 |
//! | `display`             | `<runtime_dir>/display-jsonrpc.socket`   |

use crate::config::DEFAULT_RUNTIME_DIR;
use crate::error::RpcError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Target {
    pub fn parse(s: &str, runtime_dir: &Path) -> Result<Self, RpcError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RpcError::InvalidTarget("empty target".into()));
        }

        if s.starts_with("tcp://") {
            let url = Url::parse(s).map_err(|e| RpcError::InvalidTarget(format!("{s}: {e}")))?;
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| RpcError::InvalidTarget(format!("{s}: missing host")))?;
            let port = url
                .port()
                .ok_or_else(|| RpcError::InvalidTarget(format!("{s}: missing port")))?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            return Ok(Target::Tcp {
                host: host.to_string(),
                port,
            });
        }

        if s.starts_with("unix://") {
            let url = Url::parse(s).map_err(|e| RpcError::InvalidTarget(format!("{s}: {e}")))?;
            if url.path().is_empty() || url.path() == "/" {
                return Err(RpcError::InvalidTarget(format!("{s}: missing socket path")));
            }
            return Ok(Target::Unix(PathBuf::from(url.path())));
        }

        if s.contains('/') {
            return Ok(Target::Unix(PathBuf::from(s)));
        }

        Ok(Target::Unix(runtime_dir.join(format!("{s}-jsonrpc.socket"))))
    }

    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Target::Unix(path) => Some(path),
            Target::Tcp { .. } => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Target::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Target::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

impl FromStr for Target {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Target::parse(s, Path::new(DEFAULT_RUNTIME_DIR))
    }
}
