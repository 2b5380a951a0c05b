//! Cluster wire types and the small vocabulary borrowed from the
//! teacher's SWIM-based membership module (`Member`, `MemberState`,
//! metadata maps), repurposed here for the broadcast/election protocol
//! spec.md §4.7 actually specifies — no gossip, no suspicion, no
//! incarnation counters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::endpoint::PhysicalEndpoint;
use crate::message::types::{MessageType, TypeTag, TAG_CLUSTER_STATUS, TAG_ELECTION_CALL, TAG_SLAVE_STATUS};

/// A policy bias applied during master election (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterMode {
    Normal,
    Observer,
    Monitor,
    PreferMaster,
    PreferSlave,
}

/// One instance's position in the membership state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Stopped,
    Warmup,
    Election,
    Master,
    Slave,
}

/// Per-member status carried in a cluster-status broadcast and in a
/// slave's periodic reply. Property keys are case-insensitive (§3.5) —
/// callers are expected to normalize keys before inserting; this type
/// does not normalize on their behalf so it stays a plain data carrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberStatus {
    pub instance_ep: PhysicalEndpoint,
    pub mode: ClusterMode,
    pub state: MemberState,
    pub properties: BTreeMap<String, String>,
    /// Milliseconds since the Unix epoch when this member came online.
    pub online_time: i64,
}

/// Broadcast by the master every `MasterBroadcastInterval` (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub master_ep: PhysicalEndpoint,
    pub members: BTreeMap<PhysicalEndpoint, MemberStatus>,
    pub global_properties: BTreeMap<String, String>,
}

impl MessageType for ClusterStatus {
    const TYPE_TAG: TypeTag = TAG_CLUSTER_STATUS;
    const TYPE_NAME: &'static str = "ClusterStatus";
}

/// A slave's per-member status reply, sent every `SlaveUpdateInterval`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveStatus {
    pub status: MemberStatus,
}

impl MessageType for SlaveStatus {
    const TYPE_TAG: TypeTag = TAG_SLAVE_STATUS;
    const TYPE_NAME: &'static str = "SlaveStatus";
}

/// Broadcast by an instance entering `Election`, proposing itself as
/// master candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionCall {
    pub candidate_ep: PhysicalEndpoint,
    pub mode: ClusterMode,
}

impl MessageType for ElectionCall {
    const TYPE_TAG: TypeTag = TAG_ELECTION_CALL;
    const TYPE_NAME: &'static str = "ElectionCall";
}
