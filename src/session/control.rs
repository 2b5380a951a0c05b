use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::types::{MessageType, TypeTag, TAG_SESSION_CANCEL, TAG_SESSION_KEEP_ALIVE, TAG_SESSION_REPLY};

/// Emitted by an async responder every half of `SessionTimeout`, up to
/// `MaxAsyncKeepAlive` times, to keep the initiator's session alive
/// while the real reply is still pending (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionKeepAlive {
    pub session_id: Uuid,
}

impl MessageType for SessionKeepAlive {
    const TYPE_TAG: TypeTag = TAG_SESSION_KEEP_ALIVE;
    const TYPE_NAME: &'static str = "SessionKeepAlive";
}

/// The wire body for a completed query reply. `exception` distinguishes
/// a `SessionFault` from a successful `body`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReply {
    pub session_id: Uuid,
    pub body: Vec<u8>,
    pub exception: Option<String>,
}

impl MessageType for SessionReply {
    const TYPE_TAG: TypeTag = TAG_SESSION_REPLY;
    const TYPE_NAME: &'static str = "SessionReply";
}

/// Sent by the initiator to cooperatively cancel an outstanding session;
/// the responder stops emitting keep-alives (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCancel {
    pub session_id: Uuid,
}

impl MessageType for SessionCancel {
    const TYPE_TAG: TypeTag = TAG_SESSION_CANCEL;
    const TYPE_NAME: &'static str = "SessionCancel";
}
