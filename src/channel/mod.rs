//! TCP (framed, back-pressured), UDP (datagram), and multicast/UDP-broadcast
//! channels sharing one outbound interface and one inbound callback.

pub mod multicast;
pub mod registry;
pub mod tcp;
pub mod udp;

pub use registry::ChannelRegistry;

use async_trait::async_trait;
use std::sync::Arc;

use crate::endpoint::ChannelEndpoint;
use crate::error::FabricError;

/// Invoked for every inbound frame a channel decodes, regardless of
/// transport. `channel_ep` identifies the sender as seen at the transport
/// layer (source address for UDP/multicast, peer address for TCP).
pub type InboundCallback = Arc<dyn Fn(ChannelEndpoint, Vec<u8>) + Send + Sync>;

#[async_trait]
pub trait Channel: Send + Sync {
    fn endpoint(&self) -> ChannelEndpoint;

    /// Sends one already-encoded envelope. TCP surfaces a connect/write
    /// failure; UDP and multicast report success once handed to the
    /// socket — upper layers detect loss via session retries and receipts.
    async fn transmit(&self, payload: &[u8]) -> Result<(), FabricError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Transport;
    use std::net::IpAddr;

    struct NullChannel(ChannelEndpoint);

    #[async_trait]
    impl Channel for NullChannel {
        fn endpoint(&self) -> ChannelEndpoint {
            self.0
        }
        async fn transmit(&self, _payload: &[u8]) -> Result<(), FabricError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn trait_object_is_usable_behind_arc() {
        let ep = ChannelEndpoint::new(Transport::Tcp, IpAddr::from([127, 0, 0, 1]), 9000);
        let ch: Arc<dyn Channel> = Arc::new(NullChannel(ep));
        ch.transmit(b"hi").await.unwrap();
        assert_eq!(ch.endpoint(), ep);
    }
}
