use std::sync::Arc;

use crate::message::envelope::Envelope;

/// A handler's means of answering a query-carrying delivery. The session
/// layer's `RequestContext` implements this; non-session deliveries get a
/// sink that silently swallows replies.
pub trait ReplySink: Send + Sync {
    fn reply(&self, body: Vec<u8>);
    fn fault(&self, message: String);
}

struct NullSink;
impl ReplySink for NullSink {
    fn reply(&self, _body: Vec<u8>) {}
    fn fault(&self, _message: String) {}
}

/// One inbound message handed to a handler: the decoded envelope header
/// plus a reply sink. Handlers reply out-of-band through the sink rather
/// than via a return value, mirroring the source's `RequestContext.Reply`
/// idiom (§4.6) instead of an exception-driven call/return.
pub struct Delivery {
    pub envelope: Envelope,
    reply_sink: Arc<dyn ReplySink>,
}

impl Delivery {
    pub fn new(envelope: Envelope, reply_sink: Arc<dyn ReplySink>) -> Self {
        Self { envelope, reply_sink }
    }

    pub fn fire_and_forget(envelope: Envelope) -> Self {
        Self {
            envelope,
            reply_sink: Arc::new(NullSink),
        }
    }

    pub fn reply(&self, body: Vec<u8>) {
        self.reply_sink.reply(body)
    }

    pub fn fault(&self, message: String) {
        self.reply_sink.fault(message)
    }

    /// Hands out the underlying sink so a handler can build a
    /// [`crate::session::RequestContext`] and answer asynchronously
    /// instead of from within the dispatcher call.
    pub fn reply_sink(&self) -> Arc<dyn ReplySink> {
        self.reply_sink.clone()
    }
}
