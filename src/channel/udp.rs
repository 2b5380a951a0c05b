use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::channel::{Channel, InboundCallback};
use crate::endpoint::{ChannelEndpoint, Transport};
use crate::error::FabricError;

/// Control traffic only: the channel layer does not fragment payloads past
/// path-MTU — callers must keep UDP control messages under this size.
pub const MAX_UDP_PAYLOAD: usize = 1400;

/// A shared datagram socket. One `UdpChannel` serves every peer a router
/// talks to over UDP; `transmit` targets whatever destination address it
/// was constructed with, while `serve` fans inbound datagrams out to
/// `on_receive` keyed by their source address.
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    peer: ChannelEndpoint,
}

impl UdpChannel {
    pub async fn bind(local_addr: SocketAddr) -> Result<Arc<UdpSocket>, FabricError> {
        Ok(Arc::new(UdpSocket::bind(local_addr).await?))
    }

    pub fn to_peer(socket: Arc<UdpSocket>, peer: SocketAddr) -> Arc<UdpChannel> {
        Arc::new(UdpChannel {
            socket,
            peer: ChannelEndpoint::new(Transport::Udp, peer.ip(), peer.port()),
        })
    }

    /// Drives the receive loop for the life of the socket. UDP send never
    /// reports loss back to the core — upper layers detect it via session
    /// retries and receipts (§4.3).
    pub async fn serve(socket: Arc<UdpSocket>, on_receive: InboundCallback) -> Result<(), FabricError> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, src) = socket.recv_from(&mut buf).await?;
            let peer = ChannelEndpoint::new(Transport::Udp, src.ip(), src.port());
            on_receive(peer, buf[..n].to_vec());
        }
    }
}

#[async_trait]
impl Channel for UdpChannel {
    fn endpoint(&self) -> ChannelEndpoint {
        self.peer
    }

    async fn transmit(&self, payload: &[u8]) -> Result<(), FabricError> {
        if payload.len() > MAX_UDP_PAYLOAD {
            tracing::warn!(
                len = payload.len(),
                max = MAX_UDP_PAYLOAD,
                "udp payload exceeds path-mtu budget, sending anyway"
            );
        }
        let addr = SocketAddr::new(self.peer.addr, self.peer.port);
        // Best-effort: a send failure here is not surfaced to callers, per
        // the channel layer's contract — only TCP connect failures are.
        let _ = self.socket.send_to(payload, addr).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn round_trips_a_datagram() {
        let a = UdpChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        let cb: InboundCallback = Arc::new(move |_ep, bytes| {
            received2.lock().unwrap().push(bytes);
        });
        tokio::spawn(UdpChannel::serve(b.clone(), cb));

        let out = UdpChannel::to_peer(a, b_addr);
        out.transmit(b"hello").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(received.lock().unwrap().as_slice(), [b"hello".to_vec()]);
    }
}
