use serde::{Deserialize, Serialize};

/// A stable 4-byte type tag. Control messages reserve the low range; user
/// message types are registered at any other value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeTag(pub [u8; 4]);

impl TypeTag {
    pub const fn new(b: [u8; 4]) -> Self {
        TypeTag(b)
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

pub const TAG_ROUTER_ADVERTISE: TypeTag = TypeTag::new(*b"RADV");
pub const TAG_ROUTER_STOP: TypeTag = TypeTag::new(*b"RSTP");
pub const TAG_DEAD_ROUTER: TypeTag = TypeTag::new(*b"DEAD");
pub const TAG_SESSION_KEEP_ALIVE: TypeTag = TypeTag::new(*b"SKAL");
pub const TAG_RECEIPT: TypeTag = TypeTag::new(*b"RCPT");
pub const TAG_SESSION_REPLY: TypeTag = TypeTag::new(*b"SRPL");
pub const TAG_SESSION_CANCEL: TypeTag = TypeTag::new(*b"SCAN");
pub const TAG_CLUSTER_STATUS: TypeTag = TypeTag::new(*b"CLST");
pub const TAG_SLAVE_STATUS: TypeTag = TypeTag::new(*b"SLST");
pub const TAG_ELECTION_CALL: TypeTag = TypeTag::new(*b"ELEC");
pub const TAG_QUEUE_ENQUEUE: TypeTag = TypeTag::new(*b"QENQ");

/// A type is registered with a stable tag and a human-readable name used in
/// traces and advertise bodies.
pub trait MessageType: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static {
    const TYPE_TAG: TypeTag;
    const TYPE_NAME: &'static str;
}

/// Reserved control-message bodies are plain property maps (§6.3),
/// key -> string, so the wire format stays legible for tracing without a
/// dedicated struct per control message.
pub type PropertyMap = std::collections::BTreeMap<String, String>;
