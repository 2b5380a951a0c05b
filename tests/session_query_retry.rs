//! End-to-end session retry/timeout: a query against a handler that never
//! replies should be retried exactly `QueryOptions::retries` extra times
//! (one original attempt plus `retries` retries) before the session fails,
//! each attempt actually crossing a real TCP link between two routers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use router_fabric::config::{Config, DiscoveryMode};
use router_fabric::dispatch::Delivery;
use router_fabric::endpoint::{Endpoint, LogicalEndpoint};
use router_fabric::message::types::{MessageType, TypeTag};
use router_fabric::session::{QueryOptions, SessionManager};
use router_fabric::{FabricError, Router, RouterRole};
use serde::{Deserialize, Serialize};

const DISCOVERY_PORT: u16 = 47892;

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    nonce: u32,
}
impl MessageType for Ping {
    const TYPE_TAG: TypeTag = TypeTag::new(*b"QPNG");
    const TYPE_NAME: &'static str = "Ping";
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    nonce: u32,
}
impl MessageType for Pong {
    const TYPE_TAG: TypeTag = TypeTag::new(*b"QPON");
    const TYPE_NAME: &'static str = "Pong";
}

fn fast_config(router_ep: &str, tcp_port: u16) -> Config {
    let mut c = Config::default();
    c.router_ep = router_ep.to_string();
    c.tcp_ep = Some(format!("tcp://127.0.0.1:{tcp_port}"));
    c.udp_ep = Some(format!("udp://127.0.0.1:{DISCOVERY_PORT}"));
    c.discovery_mode = DiscoveryMode::UdpBroadcast;
    c.enable_p2p = true;
    c.bk_interval = Duration::from_millis(20);
    c.advertise_time = Duration::from_millis(40);
    c
}

#[tokio::test]
async fn query_against_silent_handler_retries_exactly_once_per_attempt_then_times_out() {
    let a = Router::new(fast_config("physical://root1/a", 47920), RouterRole::Leaf).unwrap();
    let b = Router::new(fast_config("physical://root1/b", 47921), RouterRole::Leaf).unwrap();
    a.start().await.unwrap();
    b.start().await.unwrap();

    let pattern = LogicalEndpoint::new(vec!["svc".into(), "echo".into()]);
    b.add_local_logical_ep(pattern.clone());

    let deliveries = Arc::new(AtomicUsize::new(0));
    let counted = deliveries.clone();
    b.dispatcher
        .add_logical::<Ping, _, _>(pattern.clone(), None, false, false, move |_msg, _delivery: Delivery| {
            counted.fetch_add(1, Ordering::SeqCst);
            async {}
        })
        .unwrap();

    // session manager only on the initiator; B is left with a bare
    // dispatcher handler so every retried attempt reaches it directly
    // instead of being deduplicated by a responder-side session cache.
    let session = SessionManager::new(a.clone(), Duration::from_secs(30));

    // Sibling leaves with EnableP2P dial each other directly on advertise;
    // give that — and the logical route it carries — time to converge.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let opts = QueryOptions {
        ttl: 8,
        timeout: Duration::from_millis(120),
        retries: 2,
        idempotent: false,
        broadcast: false,
    };
    let result: Result<Pong, FabricError> = session
        .query(Endpoint::Logical(pattern), &Ping { nonce: 42 }, opts)
        .await;

    assert!(matches!(&result, Err(FabricError::Timeout(_))), "query should exhaust retries and time out, got {result:?}");
    assert_eq!(
        deliveries.load(Ordering::SeqCst),
        3,
        "handler should see one delivery per attempt: the original send plus 2 retries"
    );
}
