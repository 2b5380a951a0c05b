//! `MsgQueueClient`: the user-facing handle for Enqueue/Peek/Dequeue and
//! nested transactions against one queue (§4.8).

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::endpoint::{Endpoint, LogicalEndpoint};
use crate::error::FabricError;
use crate::message::types::MessageType;

use super::engine::MsgQueueEngine;
use super::state::QueueState;
use super::types::{Priority, QueueEnqueueWire, QueuedMsg};

/// A client's open transaction stack. Every `Begin` pushes a frame id;
/// `Commit`/`Rollback` must name the current innermost frame — nesting is
/// strictly LIFO, matching §4.8's "every Begin pushes a new frame".
pub struct MsgQueueClient {
    engine: Arc<MsgQueueEngine>,
    pub queue_ep: LogicalEndpoint,
    state: Arc<QueueState>,
    txn_stack: Mutex<Vec<Uuid>>,
}

impl MsgQueueClient {
    pub(crate) fn new(engine: Arc<MsgQueueEngine>, queue_ep: LogicalEndpoint, state: Arc<QueueState>) -> Arc<MsgQueueClient> {
        Arc::new(MsgQueueClient {
            engine,
            queue_ep,
            state,
            txn_stack: Mutex::new(Vec::new()),
        })
    }

    fn current_txn(&self) -> Option<Uuid> {
        self.txn_stack.lock().last().copied()
    }

    /// Enqueues onto this client's own queue.
    pub async fn enqueue(&self, body: Vec<u8>, priority: Priority) -> Result<(), FabricError> {
        let msg = self.state.new_message(body, priority, None);
        self.state.enqueue(msg, self.current_txn()).await
    }

    /// Enqueues with an explicit expiry (absolute ms since epoch).
    pub async fn enqueue_with_expiry(&self, body: Vec<u8>, priority: Priority, expire_time: i64) -> Result<(), FabricError> {
        let msg = self.state.new_message(body, priority, Some(expire_time));
        self.state.enqueue(msg, self.current_txn()).await
    }

    /// Enqueues onto a different queue, local or remote. A target naming
    /// a queue this engine hosts is written straight into that queue's
    /// state; otherwise it travels the fabric as a `QueueEnqueueWire`
    /// envelope (§6.3 `TAG_QUEUE_ENQUEUE`) and is applied on arrival.
    ///
    /// `EnqueueTo` always commits immediately regardless of the caller's
    /// open transaction — nested transactions are scoped to one queue
    /// (see DESIGN.md for this Open Question's resolution).
    pub async fn enqueue_to(&self, target: Endpoint, body: Vec<u8>, priority: Priority) -> Result<(), FabricError> {
        let logical = match &target {
            Endpoint::Logical(l) => l.clone(),
            Endpoint::Physical(_) => {
                return self.engine.enqueue_remote(target, body, priority).await;
            }
        };
        if let Some(state) = self.engine.local_queue(&logical) {
            let msg = state.new_message(body, priority, None);
            state.enqueue(msg, None).await
        } else {
            self.engine.enqueue_remote(target, body, priority).await
        }
    }

    /// Non-blocking peek that waits up to `deadline` (`None` = forever,
    /// `Some(Duration::ZERO)` = try now) for something to appear.
    /// Returns `None` rather than a timeout error (§4.8).
    pub async fn peek(&self, deadline: Option<Duration>) -> Option<QueuedMsg> {
        if let Some(msg) = self.state.peek() {
            return Some(msg);
        }
        let Some(deadline) = deadline else {
            loop {
                // Wait forever: re-check on every enqueue notification.
                let notified = self.notified();
                if let Some(msg) = self.state.peek() {
                    return Some(msg);
                }
                notified.await;
            }
        };
        if deadline.is_zero() {
            return None;
        }
        let start = tokio::time::Instant::now();
        loop {
            let notified = self.notified();
            if let Some(msg) = self.state.peek() {
                return Some(msg);
            }
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.state.notified()
    }

    /// Blocking dequeue within the client's current transaction, if any.
    pub async fn dequeue(&self, deadline: Option<Duration>) -> Result<QueuedMsg, FabricError> {
        self.state.dequeue(self.current_txn(), deadline).await
    }

    pub fn begin_transaction(&self) -> Uuid {
        let tid = self.state.begin();
        self.txn_stack.lock().push(tid);
        tid
    }

    /// Commits `tid`, which must be the innermost open frame.
    pub async fn commit(&self, tid: Uuid) -> Result<(), FabricError> {
        let parent = {
            let mut stack = self.txn_stack.lock();
            match stack.last() {
                Some(top) if *top == tid => {
                    stack.pop();
                    stack.last().copied()
                }
                _ => return Err(FabricError::TransactionConflict(format!("{tid} is not the innermost open transaction"))),
            }
        };
        self.state.commit(tid, parent).await
    }

    /// Rolls `tid` back, which must be the innermost open frame.
    pub fn rollback(&self, tid: Uuid) -> Result<(), FabricError> {
        {
            let mut stack = self.txn_stack.lock();
            match stack.last() {
                Some(top) if *top == tid => {
                    stack.pop();
                }
                _ => return Err(FabricError::TransactionConflict(format!("{tid} is not the innermost open transaction"))),
            }
        }
        self.state.rollback(tid);
        Ok(())
    }

    /// Unwinds the whole transaction stack, innermost first.
    pub fn rollback_all(&self) {
        let frames: Vec<Uuid> = std::mem::take(&mut *self.txn_stack.lock());
        for tid in frames.into_iter().rev() {
            self.state.rollback(tid);
        }
    }

    /// Rolls back every open frame and deregisters the client.
    pub fn close(self: &Arc<Self>) {
        self.rollback_all();
        self.engine.forget_client(self);
    }
}

impl MsgQueueEngine {
    pub(crate) async fn enqueue_remote(&self, target: Endpoint, body: Vec<u8>, priority: Priority) -> Result<(), FabricError> {
        let wire = QueueEnqueueWire {
            queue_ep: target.to_string(),
            body,
            priority,
            expire_time: None,
        };
        let payload = self.router().codec.encode_body(&wire)?;
        let env = crate::message::envelope::Envelope::new(
            QueueEnqueueWire::TYPE_TAG,
            Endpoint::Physical(self.router().self_ep.clone()),
            target.clone(),
            payload,
        );
        self.router().send_to(target, env).await
    }
}
