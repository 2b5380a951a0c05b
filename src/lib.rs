//! router-fabric — a hierarchical, self-organizing messaging fabric.
//!
//! Processes ("routers") discover each other on a LAN, advertise named
//! service endpoints, and exchange typed messages with delivery, session,
//! query/response, broadcast, and transactional-queue semantics. See
//! `SPEC_FULL.md` for the full component breakdown; this crate implements
//! the five core subsystems in dependency order: [`endpoint`] naming,
//! [`message`] envelopes and codec, [`channel`] transport, [`dispatch`],
//! [`router`] topology, [`session`] queries, [`cluster`] membership, and
//! [`queue`] transactional message queues.

pub mod channel;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod queue;
pub mod router;
pub mod session;

pub use config::Config;
pub use error::{FabricError, Result};
pub use router::{Router, RouterHandle, RouterRole};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
