use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::types::{MessageType, TypeTag, TAG_RECEIPT};

/// A small ack for a `ReceiptRequest`-flagged envelope. Carries
/// `NotReceipt` itself so receipts never recursively request receipts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub for_session: Uuid,
}

impl MessageType for Receipt {
    const TYPE_TAG: TypeTag = TAG_RECEIPT;
    const TYPE_NAME: &'static str = "Receipt";
}
