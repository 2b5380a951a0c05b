use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::message::flags::MessageFlags;
use crate::message::types::TypeTag;

/// A message envelope. Control messages (route advertise, keep-alive,
/// dead-router notice, session keep-alive, receipts, cluster status) are
/// ordinary envelopes with reserved type tags — there is no separate
/// control-plane wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub type_tag: TypeTag,
    pub flags: MessageFlags,
    pub from_ep: Endpoint,
    pub to_ep: Endpoint,
    pub session_id: Uuid,
    pub hop_count: u8,
    pub ttl: u8,
    /// Milliseconds since the Unix epoch; `None` means no expiry.
    pub expire_time: Option<i64>,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(type_tag: TypeTag, from_ep: Endpoint, to_ep: Endpoint, body: Vec<u8>) -> Self {
        Self {
            type_tag,
            flags: MessageFlags::NONE,
            from_ep,
            to_ep,
            session_id: Uuid::nil(),
            hop_count: 0,
            ttl: 16,
            expire_time: None,
            body,
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn expired(&self, now: SystemTime) -> bool {
        match self.expire_time {
            Some(ms) => {
                let now_ms = now
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                now_ms > ms
            }
            None => false,
        }
    }

    /// Decrements TTL by one hop, saturating at zero.
    pub fn decrement_ttl(&mut self) -> bool {
        self.hop_count = self.hop_count.saturating_add(1);
        if self.ttl == 0 {
            false
        } else {
            self.ttl -= 1;
            true
        }
    }
}
