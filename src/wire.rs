use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace};

/// Abstraction over a UDP socket, introduced to facilitate mocking the I/O
///  part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WireSocket: Send + Sync + 'static {
    /// Best-effort send: failures are logged and the packet is dropped.
    async fn send_packet(&self, to: SocketAddr, buf: &[u8]);

    async fn recv_packet(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl WireSocket for UdpSocket {
    async fn send_packet(&self, to: SocketAddr, buf: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);

        if let Err(e) = self.send_to(buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    async fn recv_packet(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        Ok(self.recv_from(buf).await?)
    }
}

/// Handle for enqueueing outgoing packets from synchronous contexts (the
///  overlay's wire-send callback fires under the node lock). Packets are
///  copied to the heap and shipped by a worker task; when the worker is gone,
///  sends drop silently.
#[derive(Clone)]
pub struct WireSender {
    tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
}

impl WireSender {
    pub fn send(&self, to: SocketAddr, payload: Vec<u8>) {
        if self.tx.send((to, payload)).is_err() {
            trace!("send worker gone, dropping packet to {:?}", to);
        }
    }
}

/// Spawns the send worker owning the socket's outgoing half.
pub fn spawn_send_worker(socket: Arc<dyn WireSocket>) -> (WireSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(SocketAddr, Vec<u8>)>();

    let handle = tokio::spawn(async move {
        while let Some((to, buf)) = rx.recv().await {
            socket.send_packet(to, &buf).await;
        }
    });

    (WireSender { tx }, handle)
}
