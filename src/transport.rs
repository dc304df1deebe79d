use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::error::Result;
use crate::protocol::Message;

/// Outbound datagram seam. The agent and the controller only ever send
/// through this trait so they can be driven without real sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, message: &Message, target: SocketAddr) -> Result<()>;
}

/// JSON-over-UDP transport backed by a tokio socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    /// Ephemeral-port socket with broadcast enabled.
    pub async fn bind_ephemeral() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        Ok(Self::new(Arc::new(socket)))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, message: &Message, target: SocketAddr) -> Result<()> {
        let bytes = message.encode()?;
        self.socket.send_to(&bytes, target).await?;
        trace!(kind = message.kind(), %target, "Datagram sent");
        Ok(())
    }
}

/// Bind a broadcast-capable UDP listener on all interfaces.
pub fn bind_listener(port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = std::net::UdpSocket::bind(addr)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket)?)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::FleetError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Records every datagram instead of sending it.
    #[derive(Default)]
    pub struct RecordingTransport {
        sent: Mutex<Vec<(Message, SocketAddr)>>,
        fail: AtomicBool,
    }

    impl RecordingTransport {
        pub fn failing() -> Self {
            let transport = Self::default();
            transport.fail.store(true, Ordering::SeqCst);
            transport
        }

        pub fn sent(&self) -> Vec<(Message, SocketAddr)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn sent_kinds(&self) -> Vec<&'static str> {
            self.sent().iter().map(|(m, _)| m.kind()).collect()
        }

        pub fn clear(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_to(&self, message: &Message, target: SocketAddr) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(FleetError::Network("network unreachable".into()));
            }
            self.sent.lock().unwrap().push((message.clone(), target));
            Ok(())
        }
    }
}
