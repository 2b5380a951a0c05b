//! `RequestContext`: the handle a handler holds to answer a query
//! asynchronously, possibly long after the dispatcher call returns
//! (§4.6 "Reply/Cancel/Abort").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dispatch::ReplySink;

/// Wraps a [`ReplySink`] with once-only semantics and a `Drop` guard: a
/// handler that returns without calling `reply`/`cancel`/`abort` aborts
/// the session rather than leaving the initiator waiting the full
/// timeout.
pub struct RequestContext {
    sink: Arc<dyn ReplySink>,
    settled: AtomicBool,
}

impl RequestContext {
    pub fn new(sink: Arc<dyn ReplySink>) -> Arc<RequestContext> {
        Arc::new(RequestContext {
            sink,
            settled: AtomicBool::new(false),
        })
    }

    /// Sends `body` as the final reply. A second call is a no-op.
    pub fn reply(&self, body: Vec<u8>) {
        if !self.settled.swap(true, Ordering::AcqRel) {
            self.sink.reply(body);
        }
    }

    /// Faults the session with `message`, surfaced to the initiator as a
    /// `SessionFault`.
    pub fn abort(&self, message: String) {
        if !self.settled.swap(true, Ordering::AcqRel) {
            self.sink.fault(message);
        }
    }

    /// Marks the session settled without sending anything further — used
    /// when a handler decides a `SessionCancel` it received should end
    /// the exchange quietly instead of faulting it.
    pub fn cancel(&self) {
        self.settled.store(true, Ordering::Release);
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if !self.settled.swap(true, Ordering::AcqRel) {
            self.sink.fault("handler dropped without a reply".into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        replies: Mutex<Vec<Vec<u8>>>,
        faults: Mutex<Vec<String>>,
    }

    impl ReplySink for RecordingSink {
        fn reply(&self, body: Vec<u8>) {
            self.replies.lock().unwrap().push(body);
        }
        fn fault(&self, message: String) {
            self.faults.lock().unwrap().push(message);
        }
    }

    #[test]
    fn drop_without_reply_faults_once() {
        let sink = Arc::new(RecordingSink {
            replies: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
        });
        {
            let _ctx = RequestContext::new(sink.clone());
        }
        assert_eq!(sink.faults.lock().unwrap().len(), 1);
        assert!(sink.replies.lock().unwrap().is_empty());
    }

    #[test]
    fn reply_then_drop_does_not_double_settle() {
        let sink = Arc::new(RecordingSink {
            replies: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
        });
        {
            let ctx = RequestContext::new(sink.clone());
            ctx.reply(b"ok".to_vec());
        }
        assert_eq!(sink.replies.lock().unwrap().len(), 1);
        assert!(sink.faults.lock().unwrap().is_empty());
    }
}
