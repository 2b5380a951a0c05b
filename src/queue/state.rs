//! Per-queue in-memory state: the priority heap, transaction reservations,
//! and directed wake-ups (§3.6, §4.8).
//!
//! A message is visible (sitting in `heap`) to at most one reader. A
//! Dequeue inside a transaction moves its entry into that transaction's
//! frame instead of removing it outright, so Rollback can push it straight
//! back. Commit either merges a frame into its parent (nested) or, at the
//! outermost level, finalises pending enqueues into the heap and pending
//! dequeues out of `messages` and appends one durable record.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::FabricError;

use super::store::{CommitRecord, TransactionLog};
use super::types::{Priority, QueuedMsg};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct HeapEntry {
    priority_rank: u8,
    enqueue_order: u64,
    msg_id: Uuid,
}

/// Heap key is `(-priority, enqueueOrder)` per §3.6: highest priority
/// pops first, and within a priority band the oldest `enqueue_order`
/// pops first. `BinaryHeap` is a max-heap, so the order component is
/// reversed to make an older (smaller) order compare greater.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority_rank
            .cmp(&other.priority_rank)
            .then_with(|| other.enqueue_order.cmp(&self.enqueue_order))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct TxnFrame {
    reserved: Vec<HeapEntry>,
    pending_enqueues: Vec<HeapEntry>,
}

struct Inner {
    heap: BinaryHeap<HeapEntry>,
    messages: HashMap<Uuid, QueuedMsg>,
    frames: HashMap<Uuid, TxnFrame>,
}

pub struct QueueState {
    pub queue_ep: String,
    inner: Mutex<Inner>,
    notify: Notify,
    log: Arc<dyn TransactionLog>,
    order_counter: AtomicU64,
}

fn entry_for(msg: &QueuedMsg) -> HeapEntry {
    HeapEntry {
        priority_rank: msg.priority as u8,
        enqueue_order: msg.enqueue_order,
        msg_id: msg.id,
    }
}

impl QueueState {
    pub async fn new(queue_ep: impl Into<String>, log: Arc<dyn TransactionLog>) -> Result<Arc<QueueState>, FabricError> {
        let state = Arc::new(QueueState {
            queue_ep: queue_ep.into(),
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                messages: HashMap::new(),
                frames: HashMap::new(),
            }),
            notify: Notify::new(),
            log,
            order_counter: AtomicU64::new(0),
        });
        state.recover().await?;
        Ok(state)
    }

    /// Replays the durable log to reconstruct queue contents on startup
    /// (§4.8, §6.5 "crash recovery replays the log").
    async fn recover(&self) -> Result<(), FabricError> {
        let records = self.log.replay().await?;
        let mut inner = self.inner.lock();
        let mut max_order = 0u64;
        for record in records {
            for msg in record.enqueued {
                max_order = max_order.max(msg.enqueue_order);
                inner.heap.push(entry_for(&msg));
                inner.messages.insert(msg.id, msg);
            }
            for id in record.dequeued {
                inner.messages.remove(&id);
            }
        }
        // Entries that were removed by a later dequeued-id were never
        // pushed back onto the heap in the first place in a well-formed
        // log, but guard anyway: drop heap entries with no backing message.
        let messages = &inner.messages;
        inner.heap = inner.heap.drain().filter(|e| messages.contains_key(&e.msg_id)).collect();
        self.order_counter.store(max_order + 1, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn next_order(&self) -> u64 {
        self.order_counter.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Builds a message with a freshly assigned id and enqueue order, the
    /// fixed point that rollback/commit preserve FIFO order around.
    pub fn new_message(&self, body: Vec<u8>, priority: Priority, expire_time: Option<i64>) -> QueuedMsg {
        QueuedMsg {
            id: Uuid::new_v4(),
            queue_ep: self.queue_ep.clone(),
            body,
            priority,
            enqueue_time: now_ms(),
            enqueue_order: self.next_order(),
            expire_time,
            delivery_attempts: 0,
            session_txn_id: None,
        }
    }

    /// Enqueues `msg`. Outside a transaction this is immediately durable
    /// and visible; inside one (`txn = Some`) it stays invisible to every
    /// other reader until that transaction's outermost Commit.
    pub async fn enqueue(&self, msg: QueuedMsg, txn: Option<Uuid>) -> Result<(), FabricError> {
        let entry = entry_for(&msg);
        {
            let mut inner = self.inner.lock();
            inner.messages.insert(msg.id, msg.clone());
            match txn {
                Some(tid) => inner.frames.entry(tid).or_default().pending_enqueues.push(entry),
                None => inner.heap.push(entry),
            }
        }
        if txn.is_none() {
            self.log
                .append(&CommitRecord {
                    enqueued: vec![msg],
                    dequeued: vec![],
                })
                .await?;
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Non-blocking look at the highest-priority, oldest visible message
    /// without removing it.
    pub fn peek(&self) -> Option<QueuedMsg> {
        let inner = self.inner.lock();
        inner.heap.peek().and_then(|e| inner.messages.get(&e.msg_id).cloned())
    }

    /// Attempts one non-blocking dequeue. Outside a transaction the
    /// removal is immediately durable; inside one it is reserved in the
    /// caller's frame, invisible everywhere else until Commit or Rollback.
    pub async fn try_dequeue(&self, txn: Option<Uuid>) -> Result<Option<QueuedMsg>, FabricError> {
        let (entry, msg) = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.heap.pop() else {
                return Ok(None);
            };
            let mut msg = inner
                .messages
                .get(&entry.msg_id)
                .cloned()
                .expect("heap entry always has a backing message");
            msg.delivery_attempts += 1;
            inner.messages.insert(msg.id, msg.clone());
            match txn {
                Some(tid) => {
                    inner.frames.entry(tid).or_default().reserved.push(entry);
                }
                None => {
                    inner.messages.remove(&entry.msg_id);
                }
            }
            (entry, msg)
        };
        if txn.is_none() {
            self.log
                .append(&CommitRecord {
                    enqueued: vec![],
                    dequeued: vec![entry.msg_id],
                })
                .await?;
        }
        Ok(Some(msg))
    }

    /// Registers a new transaction frame, returning its id.
    pub fn begin(&self) -> Uuid {
        let tid = Uuid::new_v4();
        self.inner.lock().frames.insert(tid, TxnFrame::default());
        tid
    }

    /// Commits `tid`. With `parent` set, the frame's effects are merged
    /// into the parent frame rather than finalised — nested commits only
    /// become durable when the outermost frame commits (§4.8 "Nested").
    pub async fn commit(&self, tid: Uuid, parent: Option<Uuid>) -> Result<(), FabricError> {
        let frame = {
            let mut inner = self.inner.lock();
            inner.frames.remove(&tid).unwrap_or_default()
        };

        match parent {
            Some(pid) => {
                let mut inner = self.inner.lock();
                let parent_frame = inner.frames.entry(pid).or_default();
                parent_frame.reserved.extend(frame.reserved);
                parent_frame.pending_enqueues.extend(frame.pending_enqueues);
            }
            None => {
                let (enqueued, dequeued) = {
                    let mut inner = self.inner.lock();
                    let mut enqueued = Vec::with_capacity(frame.pending_enqueues.len());
                    for entry in &frame.pending_enqueues {
                        inner.heap.push(*entry);
                        if let Some(msg) = inner.messages.get(&entry.msg_id) {
                            enqueued.push(msg.clone());
                        }
                    }
                    let mut dequeued = Vec::with_capacity(frame.reserved.len());
                    for entry in &frame.reserved {
                        inner.messages.remove(&entry.msg_id);
                        dequeued.push(entry.msg_id);
                    }
                    (enqueued, dequeued)
                };
                let record = CommitRecord { enqueued, dequeued };
                if !record.is_empty() {
                    self.log.append(&record).await?;
                }
                for _ in &frame.pending_enqueues {
                    self.notify.notify_one();
                }
            }
        }
        Ok(())
    }

    /// Rolls `tid` back: reserved dequeues return to the heap in their
    /// original priority/order slot, pending enqueues are discarded
    /// entirely (§4.8 "Isolation").
    pub fn rollback(&self, tid: Uuid) {
        let frame = {
            let mut inner = self.inner.lock();
            inner.frames.remove(&tid).unwrap_or_default()
        };
        let restored = frame.reserved.len();
        let mut inner = self.inner.lock();
        for entry in frame.reserved {
            inner.heap.push(entry);
        }
        for entry in frame.pending_enqueues {
            inner.messages.remove(&entry.msg_id);
        }
        drop(inner);
        for _ in 0..restored {
            self.notify.notify_one();
        }
    }

    /// Blocks until a message is visible or `deadline` elapses.
    /// `deadline = None` waits forever; `Some(Duration::ZERO)` is a single
    /// non-blocking attempt.
    pub async fn dequeue(&self, txn: Option<Uuid>, deadline: Option<std::time::Duration>) -> Result<QueuedMsg, FabricError> {
        let start = tokio::time::Instant::now();
        loop {
            let notified = self.notify.notified();
            if let Some(msg) = self.try_dequeue(txn).await? {
                return Ok(msg);
            }
            let remaining = match deadline {
                None => None,
                Some(d) => {
                    let elapsed = start.elapsed();
                    if elapsed >= d {
                        return Err(FabricError::Timeout(format!("dequeue on {} timed out", self.queue_ep)));
                    }
                    Some(d - elapsed)
                }
            };
            match remaining {
                None => notified.await,
                Some(remaining) => {
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        return Err(FabricError::Timeout(format!("dequeue on {} timed out", self.queue_ep)));
                    }
                }
            }
        }
    }

    /// Scans every currently visible message and removes those past
    /// `expire_time` or at/over `max_attempts` deliveries, for the
    /// engine's flush tick to move into the dead-letter queue (§4.8).
    /// Messages held inside an open transaction are untouched — they are
    /// not visible here in the first place.
    pub async fn drain_for_flush(&self, now: i64, max_attempts: u32) -> Result<Vec<QueuedMsg>, FabricError> {
        let drained = {
            let mut inner = self.inner.lock();
            let all: Vec<HeapEntry> = inner.heap.drain().collect();
            let mut kept = Vec::with_capacity(all.len());
            let mut drained = Vec::new();
            for entry in all {
                let msg = inner.messages.get(&entry.msg_id).cloned();
                match msg {
                    Some(msg)
                        if msg.expire_time.map(|t| t <= now).unwrap_or(false)
                            || (max_attempts > 0 && msg.delivery_attempts >= max_attempts) =>
                    {
                        inner.messages.remove(&entry.msg_id);
                        drained.push(msg);
                    }
                    Some(_) => kept.push(entry),
                    None => {}
                }
            }
            inner.heap = kept.into_iter().collect();
            drained
        };
        if !drained.is_empty() {
            self.log
                .append(&CommitRecord {
                    enqueued: vec![],
                    dequeued: drained.iter().map(|m| m.id).collect(),
                })
                .await?;
        }
        Ok(drained)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Snapshot of visible (non-reserved) depth per priority band and the
    /// oldest still-pending enqueue time, for operational visibility
    /// (SPEC_FULL.md §4.8 queue `Stats`).
    pub fn stats(&self) -> super::types::QueueStats {
        let inner = self.inner.lock();
        let mut depth_by_priority = [0usize; 5];
        let mut oldest = None;
        for entry in inner.heap.iter() {
            depth_by_priority[entry.priority_rank as usize] += 1;
            if let Some(msg) = inner.messages.get(&entry.msg_id) {
                oldest = Some(oldest.map_or(msg.enqueue_time, |o: i64| o.min(msg.enqueue_time)));
            }
        }
        super::types::QueueStats {
            queue_ep: self.queue_ep.clone(),
            depth: inner.heap.len(),
            depth_by_priority,
            oldest_enqueue_time: oldest,
        }
    }

    /// Exposes the queue's wake-up signal so callers (the client's `Peek`
    /// loop) can wait alongside `dequeue` without duplicating its
    /// notify-before-check ordering.
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::MemoryLog;

    async fn state() -> Arc<QueueState> {
        QueueState::new("logical://queues/orders", MemoryLog::new()).await.unwrap()
    }

    #[tokio::test]
    async fn dequeue_returns_highest_priority_oldest_first() {
        let s = state().await;
        let low = s.new_message(b"low".to_vec(), Priority::Low, None);
        let high = s.new_message(b"high".to_vec(), Priority::High, None);
        s.enqueue(low, None).await.unwrap();
        s.enqueue(high.clone(), None).await.unwrap();

        let first = s.try_dequeue(None).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
    }

    #[tokio::test]
    async fn fifo_within_same_priority() {
        let s = state().await;
        let a = s.new_message(b"a".to_vec(), Priority::Normal, None);
        let b = s.new_message(b"b".to_vec(), Priority::Normal, None);
        s.enqueue(a.clone(), None).await.unwrap();
        s.enqueue(b.clone(), None).await.unwrap();

        assert_eq!(s.try_dequeue(None).await.unwrap().unwrap().id, a.id);
        assert_eq!(s.try_dequeue(None).await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn transactional_enqueue_invisible_until_commit() {
        let s = state().await;
        let tid = s.begin();
        let msg = s.new_message(b"hidden".to_vec(), Priority::Normal, None);
        s.enqueue(msg, Some(tid)).await.unwrap();

        assert!(s.peek().is_none());
        s.commit(tid, None).await.unwrap();
        assert!(s.peek().is_some());
    }

    #[tokio::test]
    async fn nested_rollback_then_outer_commit_preserves_order() {
        let s = state().await;
        let ten = s.new_message(10i32.to_le_bytes().to_vec(), Priority::High, None);
        let twenty = s.new_message(20i32.to_le_bytes().to_vec(), Priority::Low, None);
        s.enqueue(ten.clone(), None).await.unwrap();
        s.enqueue(twenty.clone(), None).await.unwrap();

        let outer = s.begin();
        let inner = s.begin();
        let first = s.try_dequeue(Some(inner)).await.unwrap().unwrap();
        let second = s.try_dequeue(Some(inner)).await.unwrap().unwrap();
        assert_eq!(first.id, ten.id);
        assert_eq!(second.id, twenty.id);

        s.rollback(inner);
        s.commit(outer, None).await.unwrap();

        assert_eq!(s.try_dequeue(None).await.unwrap().unwrap().id, ten.id);
        assert_eq!(s.try_dequeue(None).await.unwrap().unwrap().id, twenty.id);
    }

    #[tokio::test]
    async fn zero_deadline_times_out_immediately_on_empty_queue() {
        let s = state().await;
        let err = s.dequeue(None, Some(std::time::Duration::ZERO)).await.unwrap_err();
        assert!(matches!(err, FabricError::Timeout(_)));
    }

    #[tokio::test]
    async fn recover_replays_committed_enqueue() {
        let log = MemoryLog::new();
        {
            let s = QueueState::new("logical://queues/orders", log.clone()).await.unwrap();
            let msg = s.new_message(b"persisted".to_vec(), Priority::Normal, None);
            s.enqueue(msg, None).await.unwrap();
        }
        let recovered = QueueState::new("logical://queues/orders", log).await.unwrap();
        assert_eq!(recovered.len(), 1);
    }
}
