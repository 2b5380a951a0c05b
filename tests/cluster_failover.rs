//! End-to-end cluster failover: five members on real routers behind a
//! relaying hub elect a master, then converge on a new one once the
//! original master's router stops.

use std::time::Duration;

use router_fabric::cluster::{ClusterMember, MemberState};
use router_fabric::config::{Config, DiscoveryMode};
use router_fabric::endpoint::PhysicalEndpoint;
use router_fabric::{Router, RouterRole};

const DISCOVERY_PORT: u16 = 47891;
const HUB_TCP_PORT: u16 = 47910;

fn fast_config(router_ep: &str, tcp_port: u16, parent_ep: Option<&str>) -> Config {
    let mut c = Config::default();
    c.router_ep = router_ep.to_string();
    c.tcp_ep = Some(format!("tcp://127.0.0.1:{tcp_port}"));
    c.udp_ep = Some(format!("udp://127.0.0.1:{DISCOVERY_PORT}"));
    c.discovery_mode = DiscoveryMode::UdpBroadcast;
    c.parent_ep = parent_ep.map(|s| s.to_string());
    c.bk_interval = Duration::from_millis(20);
    c.advertise_time = Duration::from_millis(40);
    c.master_broadcast_interval = Duration::from_millis(60);
    c.slave_update_interval = Duration::from_millis(60);
    c.missing_master_count = 3;
    c.missing_slave_count = 3;
    c.election_interval = Duration::from_millis(60);
    c
}

async fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}

fn leaf_ep(n: u16) -> PhysicalEndpoint {
    PhysicalEndpoint::new("root1", -1, vec!["hubc".into(), format!("leaf{n}")])
}

#[tokio::test]
async fn cluster_elects_new_master_after_original_master_stops() {
    let hub_ep = "physical://root1/hubc";
    let parent = format!("physical://root1/hubc?c=tcp://127.0.0.1:{HUB_TCP_PORT}");

    let hub = Router::new(fast_config(hub_ep, HUB_TCP_PORT, None), RouterRole::Hub).unwrap();
    hub.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut routers = Vec::new();
    let mut members = Vec::new();
    for i in 0..5u16 {
        let ep = format!("physical://root1/hubc/leaf{i}");
        let config = fast_config(&ep, HUB_TCP_PORT + 1 + i, Some(&parent));
        let router = Router::new(config, RouterRole::Leaf).unwrap();
        router.start().await.unwrap();
        let member = ClusterMember::new(router.clone(), &router.config).unwrap();
        routers.push(router);
        members.push(member);
    }

    // Let advertises converge across the hub and all five leaves.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let leaf4_ep = leaf_ep(4);
    let leaf3_ep = leaf_ep(3);

    let settled = wait_until(Duration::from_secs(4), || {
        members.iter().all(|m| m.master_ep().as_ref() == Some(&leaf4_ep))
    })
    .await;
    assert!(settled, "all five members should converge on leaf4, the lexically greatest candidate");
    assert_eq!(members[4].state(), MemberState::Master);
    for m in &members[0..4] {
        assert_eq!(m.state(), MemberState::Slave);
    }

    // Simulate master failure: stop leaf4's router so it never broadcasts
    // cluster status again; the hub also evicts it on the RouterStop notice.
    routers[4].stop(Duration::from_millis(100)).await.unwrap();

    let failed_over = wait_until(Duration::from_secs(4), || {
        members[0..4].iter().all(|m| m.master_ep().as_ref() == Some(&leaf3_ep))
    })
    .await;
    assert!(failed_over, "the remaining four members should fail over to leaf3, the next lexically greatest");
    assert_eq!(members[3].state(), MemberState::Master);
    for m in &members[0..3] {
        assert_eq!(m.state(), MemberState::Slave);
    }
}
