use crate::target::Target;
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;
use tracing::trace;

pub mod channel;

const READ_CHUNK: usize = 8 * 1024;

/// A duplex byte pipe. Framing happens above it, so `receive` may return
/// any slice of the stream.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, data: &[u8]) -> anyhow::Result<()>;

    /// Next chunk of bytes, or `None` once the peer has closed.
    async fn receive(&self) -> anyhow::Result<Option<Vec<u8>>>;

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Any tokio byte stream (TCP, Unix socket, duplex pipe) as a [`Transport`].
pub struct StreamTransport<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await.context("write failed")?;
        writer.flush().await.context("flush failed")?;
        Ok(())
    }

    async fn receive(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; READ_CHUNK];
        let n = reader.read(&mut buf).await.context("read failed")?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    async fn close(&self) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.context("shutdown failed")?;
        Ok(())
    }
}

/// Opens transports to targets; the seam clients and pools reconnect
/// through.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, target: &Target) -> anyhow::Result<Arc<dyn Transport>>;
}

/// Dials TCP and Unix-domain sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketConnector;

#[async_trait]
impl Connector for SocketConnector {
    async fn connect(&self, target: &Target) -> anyhow::Result<Arc<dyn Transport>> {
        trace!(%target, "dialing");
        let transport: Arc<dyn Transport> = match target {
            Target::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .with_context(|| format!("tcp connect to {target}"))?;
                stream.set_nodelay(true)?;
                Arc::new(StreamTransport::new(stream))
            }
            Target::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .with_context(|| format!("unix connect to {target}"))?;
                Arc::new(StreamTransport::new(stream))
            }
        };
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_transport_over_duplex() -> anyhow::Result<()> {
        let (a, b) = tokio::io::duplex(64);
        let a = StreamTransport::new(a);
        let b = StreamTransport::new(b);

        a.send(b"5\r\nhello\r\n").await?;
        assert_eq!(b.receive().await?, Some(b"5\r\nhello\r\n".to_vec()));

        a.close().await?;
        assert_eq!(b.receive().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn unix_connect_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = Target::Unix(dir.path().join("absent.socket"));
        assert!(SocketConnector.connect(&target).await.is_err());
    }
}
