//! Durable/volatile message queues layered on the fabric: priorities,
//! TTL, dead-letter, and nested transactions with read-committed,
//! optimistic-visibility isolation (§4.8).
//!
//! `engine` owns one [`state::QueueState`] per configured logical
//! pattern plus a dead-letter queue and the flush tick; `client` is the
//! user-facing handle a caller opens against one queue; `store` holds the
//! two durability backends; `types` is the wire/in-memory message shape.

pub mod client;
pub mod engine;
pub mod state;
pub mod store;
pub mod types;

pub use client::MsgQueueClient;
pub use engine::{MsgQueueEngine, QueueBackend};
pub use types::{Priority, QueuedMsg};
