//! Multicast or UDP-broadcast discovery: each router periodically
//! announces its physical location and the logical patterns it serves;
//! `RouterStop` fires once on graceful shutdown (§4.5).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::endpoint::{LogicalEndpoint, PhysicalEndpoint};
use crate::message::types::{MessageType, TypeTag, TAG_DEAD_ROUTER, TAG_ROUTER_ADVERTISE, TAG_ROUTER_STOP};

/// Body of a `RouterAdvertise` control message. Field names mirror the
/// documented property-map keys of §6.3 (`router-ep`, `channels`,
/// `set-id`, `logical-eps[]`) one-for-one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterAdvertise {
    pub router_ep: PhysicalEndpoint,
    pub channels: Vec<String>,
    pub set_id: Uuid,
    /// Truncated by `MaxLogicalAdvertiseEPs` before it ever leaves this
    /// router (§4.5) — receivers never need to re-truncate.
    pub logical_eps: Vec<LogicalEndpoint>,
    pub role: RouterRoleWire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouterRoleWire {
    Leaf,
    Hub,
    Root,
}

impl MessageType for RouterAdvertise {
    const TYPE_TAG: TypeTag = TAG_ROUTER_ADVERTISE;
    const TYPE_NAME: &'static str = "RouterAdvertise";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStop {
    pub router_ep: PhysicalEndpoint,
}

impl MessageType for RouterStop {
    const TYPE_TAG: TypeTag = TAG_ROUTER_STOP;
    const TYPE_NAME: &'static str = "RouterStop";
}

/// A dead-router notice, broadcast so every peer can evict the same
/// unreachable router (§4.5 "Receipts and dead-router detection").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadRouterNotice {
    pub dead_ep: PhysicalEndpoint,
    pub dead_set_id: Uuid,
}

impl MessageType for DeadRouterNotice {
    const TYPE_TAG: TypeTag = TAG_DEAD_ROUTER;
    const TYPE_NAME: &'static str = "DeadRouterNotice";
}

/// Truncates a logical-endpoint-set advertisement to at most
/// `max_eps` entries, per `MaxLogicalAdvertiseEPs`. Deterministic:
/// patterns are sorted first so a truncated advertise is stable across
/// repeated calls rather than depending on registration order.
pub fn truncate_advertised_eps(mut eps: Vec<LogicalEndpoint>, max_eps: usize) -> Vec<LogicalEndpoint> {
    eps.sort();
    eps.truncate(max_eps);
    eps
}
