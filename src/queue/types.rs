//! Wire and in-memory shapes for the message-queue engine (§3.6).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::types::{MessageType, TypeTag, TAG_QUEUE_ENQUEUE};

/// Delivery priority. Declaration order doubles as rank: `VeryLow` is the
/// lowest, `VeryHigh` the highest — `Priority::VeryHigh as u8` sorts above
/// `Priority::Normal as u8` so the heap key formula in §3.6 falls out of
/// a plain derive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    VeryLow = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    VeryHigh = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// A message sitting in a queue, durable or in-flight within a
/// transaction. `enqueue_order` is a per-queue monotonic counter assigned
/// at enqueue time; it is the tie-break within a priority band, never
/// recomputed, so FIFO order survives a rollback re-insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMsg {
    pub id: Uuid,
    pub queue_ep: String,
    pub body: Vec<u8>,
    pub priority: Priority,
    pub enqueue_time: i64,
    pub enqueue_order: u64,
    pub expire_time: Option<i64>,
    pub delivery_attempts: u32,
    pub session_txn_id: Option<Uuid>,
}

/// Per-queue operational snapshot (depth per priority band, oldest pending
/// enqueue time), surfaced for monitoring rather than carried on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_ep: String,
    pub depth: usize,
    pub depth_by_priority: [usize; 5],
    pub oldest_enqueue_time: Option<i64>,
}

/// Wire body for `EnqueueTo` against a queue served by a remote router;
/// rides the fabric as an ordinary envelope tagged `TAG_QUEUE_ENQUEUE`
/// (§6.3). The receiving engine assigns `id`/`enqueue_time`/`enqueue_order`
/// itself on arrival — those are local, not carried over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEnqueueWire {
    pub queue_ep: String,
    pub body: Vec<u8>,
    pub priority: Priority,
    pub expire_time: Option<i64>,
}

impl MessageType for QueueEnqueueWire {
    const TYPE_TAG: TypeTag = TAG_QUEUE_ENQUEUE;
    const TYPE_NAME: &'static str = "QueueEnqueueWire";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rank_orders_very_high_above_normal() {
        assert!(Priority::VeryHigh > Priority::Normal);
        assert!(Priority::Normal > Priority::VeryLow);
    }
}
