//! End-to-end dead-router eviction: a hub forwards a receipt-requested
//! envelope across a real TCP channel toward a peer that never acks, and
//! the hub's own background timer evicts it once `receipt_delay` elapses.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use router_fabric::channel::Channel;
use router_fabric::config::{Config, DiscoveryMode};
use router_fabric::endpoint::{ChannelEndpoint, Endpoint, PhysicalEndpoint, Transport};
use router_fabric::message::{Envelope, MessageFlags, TypeTag};
use router_fabric::{FabricError, Router, RouterRole};

const DISCOVERY_PORT: u16 = 47890;
const HUB_TCP_PORT: u16 = 47901;
const LEAF0_TCP_PORT: u16 = 47902;
const LEAF2_TCP_PORT: u16 = 47904;

fn fast_config(router_ep: &str, tcp_port: u16, parent_ep: Option<&str>) -> Config {
    let mut c = Config::default();
    c.router_ep = router_ep.to_string();
    c.tcp_ep = Some(format!("tcp://127.0.0.1:{tcp_port}"));
    c.udp_ep = Some(format!("udp://127.0.0.1:{DISCOVERY_PORT}"));
    c.discovery_mode = DiscoveryMode::UdpBroadcast;
    c.parent_ep = parent_ep.map(|s| s.to_string());
    c.bk_interval = Duration::from_millis(30);
    c.advertise_time = Duration::from_millis(40);
    c.receipt_delay = Duration::from_millis(150);
    c
}

/// Stands in for an unresponsive peer: transmits are accepted and
/// silently dropped, so no `Receipt` ever comes back.
struct Blackhole(ChannelEndpoint);

#[async_trait]
impl Channel for Blackhole {
    fn endpoint(&self) -> ChannelEndpoint {
        self.0
    }
    async fn transmit(&self, _payload: &[u8]) -> Result<(), FabricError> {
        Ok(())
    }
}

#[tokio::test]
async fn hub_evicts_peer_whose_receipt_never_arrives() {
    let hub_ep = "physical://root1/hubh";
    let leaf0_ep = "physical://root1/hubh/leaf0";
    let leaf1_ep = PhysicalEndpoint::new("root1", -1, vec!["hubh".into(), "leaf1".into()]);
    let leaf2_ep = "physical://root1/hubh/leaf2";
    let parent = format!("physical://root1/hubh?c=tcp://127.0.0.1:{HUB_TCP_PORT}");

    let hub = Router::new(fast_config(hub_ep, HUB_TCP_PORT, None), RouterRole::Hub).unwrap();
    hub.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let leaf0 = Router::new(fast_config(leaf0_ep, LEAF0_TCP_PORT, Some(&parent)), RouterRole::Leaf).unwrap();
    leaf0.start().await.unwrap();
    let leaf2 = Router::new(fast_config(leaf2_ep, LEAF2_TCP_PORT, Some(&parent)), RouterRole::Leaf).unwrap();
    leaf2.start().await.unwrap();

    // Let advertises converge: hub dials both leaves, both leaves dial the hub.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(hub.physical_routes.count(), 2, "hub should know both live leaves before the blackhole is added");

    // leaf1 never actually runs; stand in a channel that swallows every
    // transmit so the hub's receipt for it never arrives.
    let blackhole_chan_ep = ChannelEndpoint::new(Transport::Tcp, IpAddr::from([127, 0, 0, 1]), 47903);
    hub.physical_routes.upsert(leaf1_ep.clone(), Arc::new(Blackhole(blackhole_chan_ep)), uuid::Uuid::new_v4());
    assert_eq!(hub.physical_routes.count(), 3);

    // leaf0 has no direct knowledge of leaf1 at all; sending to it falls
    // through to leaf0's uplink, landing on the hub's real physical route.
    let probe = Envelope::new(
        TypeTag::new(*b"PROB"),
        Endpoint::Physical(leaf0.self_ep.clone()),
        Endpoint::Physical(leaf1_ep.clone()),
        Vec::new(),
    )
    .with_flags(MessageFlags::RECEIPT_REQUEST);
    leaf0.send_to(Endpoint::Physical(leaf1_ep.clone()), probe).await.unwrap();

    // Past receipt_delay, the hub's background timer should have swept
    // the expired receipt and evicted leaf1.
    tokio::time::sleep(Duration::from_millis(150 + 300)).await;

    assert!(!hub.physical_routes.contains(&leaf1_ep), "hub should have evicted the unresponsive peer");
    assert_eq!(hub.physical_routes.count(), 2, "only the two live leaves should remain");
}
