use crate::transport::Transport;
use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{Mutex, mpsc};

/// In-memory transport; one half of [`channel_transport_pair`].
pub struct ChannelTransport {
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    rx: Mutex<Receiver<Vec<u8>>>,
}

impl ChannelTransport {
    pub fn new(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, data: &[u8]) -> anyhow::Result<()> {
        let tx = self.tx.lock().await.clone();
        match tx {
            Some(tx) => tx
                .send(data.to_vec())
                .await
                .map_err(|e| anyhow!("send failed: {e}")),
            None => Err(anyhow!("channel closed")),
        }
    }

    async fn receive(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    /// Drops the sending side; the peer then reads `None`.
    async fn close(&self) -> anyhow::Result<()> {
        self.tx.lock().await.take();
        Ok(())
    }
}

pub fn channel_transport_pair(capacity: usize) -> (ChannelTransport, ChannelTransport) {
    let (tx1, rx1) = mpsc::channel::<Vec<u8>>(capacity);
    let (tx2, rx2) = mpsc::channel::<Vec<u8>>(capacity);

    let a = ChannelTransport::new(tx1, rx2); // side A
    let b = ChannelTransport::new(tx2, rx1); // side B

    (a, b)
}
