use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::channel::{Channel, InboundCallback};
use crate::endpoint::{ChannelEndpoint, Transport};
use crate::error::FabricError;

/// Outbound-only fan-out channel: either a joined multicast group or a
/// subnet UDP-broadcast address, depending on `DiscoveryMode`. Loopback
/// receive is enabled so same-host integration tests can see their own
/// sends without a second machine on the LAN.
pub struct MulticastChannel {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    channel_ep: ChannelEndpoint,
}

impl MulticastChannel {
    /// Joins `group:port` on `iface` (or `0.0.0.0` for "any"), enabling
    /// loopback so a sender on the same host observes its own datagrams —
    /// used by multi-router integration tests run in a single process.
    pub fn join(group: Ipv4Addr, port: u16, iface: Ipv4Addr) -> Result<Arc<MulticastChannel>, FabricError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.set_multicast_loop_v4(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        socket.join_multicast_v4(&group, &iface)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        Ok(Arc::new(MulticastChannel {
            socket,
            target: SocketAddr::V4(SocketAddrV4::new(group, port)),
            channel_ep: ChannelEndpoint::new(Transport::Multicast, IpAddr::V4(group), port),
        }))
    }

    /// Plain UDP-broadcast fan-out to `broadcast_addr:port` — used when
    /// `DiscoveryMode::UdpBroadcast` relays through a well-known server
    /// rather than a joined multicast group. Binds to the same well-known
    /// `port` it broadcasts to (like `join`'s group port), not an ephemeral
    /// one — every router on the LAN both sends and listens on `port`, so
    /// a peer's advertise only arrives here if this socket owns that port.
    pub fn broadcast(broadcast_addr: Ipv4Addr, port: u16) -> Result<Arc<MulticastChannel>, FabricError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        Ok(Arc::new(MulticastChannel {
            socket,
            target: SocketAddr::V4(SocketAddrV4::new(broadcast_addr, port)),
            channel_ep: ChannelEndpoint::new(Transport::Udp, IpAddr::V4(broadcast_addr), port),
        }))
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Drives the receive loop. Advertise frames from self arrive too when
    /// loopback is enabled; `discovery` is expected to ignore frames whose
    /// `router-ep` is the local one.
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
impl Channel for MulticastChannel {
    fn endpoint(&self) -> ChannelEndpoint {
        self.channel_ep
    }

    /// Fan-out send: always reports success to the caller, matching the
    /// channel layer's UDP send contract.
    async fn transmit(&self, payload: &[u8]) -> Result<(), FabricError> {
        let _ = self.socket.send_to(payload, self.target).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn loopback_broadcast_is_self_observable() {
        let port = 45900u16;
        let chan = MulticastChannel::broadcast(Ipv4Addr::new(127, 0, 0, 1), port).unwrap();
        // `broadcast` binds its own socket to `port`, so the channel
        // observes its own send the same way a second router bound to
        // the same well-known discovery port would.
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        let cb: InboundCallback = Arc::new(move |_ep, bytes| received2.lock().unwrap().push(bytes));
        tokio::spawn(MulticastChannel::serve(chan.socket(), cb));

        chan.transmit(b"advertise").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(received.lock().unwrap().as_slice(), [b"advertise".to_vec()]);
    }

}
