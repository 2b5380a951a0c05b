//! `MsgQueueEngine`: durable/volatile queues layered on a router, with
//! priorities, TTL, dead-letter, and nested transactions (§4.8).
//!
//! Sits on top of a [`RouterHandle`] the same way [`ClusterMember`] does:
//! it claims a set of logical patterns (`QueueMap`), rides the router's
//! shared background timer for expiry/dead-letter scanning instead of
//! spawning its own ticker, and registers a dispatcher target so
//! `EnqueueTo` against a remote queue arrives as an ordinary envelope.
//!
//! [`ClusterMember`]: crate::cluster::ClusterMember

use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::dispatch::{Dispatcher, DispatchTarget, Scope};
use crate::endpoint::{Endpoint, LogicalEndpoint};
use crate::error::FabricError;
use crate::router::RouterHandle;

use super::client::MsgQueueClient;
use super::state::{now_ms, QueueState};
use super::store::{FileLog, MemoryLog, TransactionLog};
use super::types::{Priority, QueueEnqueueWire};

const DEAD_LETTER_SEGMENT: &str = "__deadletter__";

/// Where a queue's transaction log lives. File-backed queues survive a
/// process restart; memory-backed queues are for tests and ephemeral
/// traffic (§4.8 "Durability").
#[derive(Clone)]
pub enum QueueBackend {
    Memory,
    File(PathBuf),
}

struct QueueEntry {
    ep: LogicalEndpoint,
    state: Arc<QueueState>,
}

pub struct MsgQueueEngine {
    router: RouterHandle,
    queues: DashMap<String, QueueEntry>,
    dead_letter: Arc<QueueState>,
    dead_letter_ep: LogicalEndpoint,
    dead_letter_ttl: Duration,
    flush_interval: Duration,
    max_delivery_attempts: u32,
    since_flush: Mutex<Duration>,
}

fn canonical_key(ep: &LogicalEndpoint) -> String {
    ep.clone().with_broadcast(false).to_string()
}

async fn open_log(backend: &QueueBackend, dir_name: &str) -> Result<Arc<dyn TransactionLog>, FabricError> {
    match backend {
        QueueBackend::Memory => Ok(MemoryLog::new()),
        QueueBackend::File(base) => {
            let dir = base.join(encode_dir_name(dir_name));
            Ok(FileLog::open(&dir)?)
        }
    }
}

/// Encodes a queue endpoint string into a filesystem-safe directory name
/// (§6.5 "one directory per queue endpoint, name-encoded").
fn encode_dir_name(ep: &str) -> String {
    ep.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl MsgQueueEngine {
    pub async fn new(router: RouterHandle, config: &Config, backend: QueueBackend) -> Result<Arc<MsgQueueEngine>, FabricError> {
        let queues = DashMap::new();
        for raw in &config.queue_map {
            let logical = match Endpoint::parse(raw)? {
                Endpoint::Logical(l) => l,
                Endpoint::Physical(_) => {
                    return Err(FabricError::Configuration(format!("QueueMap entry {raw:?} must be a logical endpoint")))
                }
            };
            let key = canonical_key(&logical);
            let log = open_log(&backend, &key).await?;
            let state = QueueState::new(key.clone(), log).await?;
            router.add_local_logical_ep(logical.clone());
            queues.insert(key, QueueEntry { ep: logical, state });
        }

        let dead_letter_ep = LogicalEndpoint::new(vec![DEAD_LETTER_SEGMENT.into()]);
        let dead_letter_log = open_log(&backend, &canonical_key(&dead_letter_ep)).await?;
        let dead_letter = QueueState::new(canonical_key(&dead_letter_ep), dead_letter_log).await?;
        router.add_local_logical_ep(dead_letter_ep.clone());

        let engine = Arc::new(MsgQueueEngine {
            router: router.clone(),
            queues,
            dead_letter,
            dead_letter_ep,
            dead_letter_ttl: config.dead_letter_ttl,
            flush_interval: config.flush_interval,
            max_delivery_attempts: config.max_delivery_attempts,
            since_flush: Mutex::new(Duration::ZERO),
        });

        engine.router.dispatcher.add_target(engine.clone(), None)?;

        let hook_engine = engine.clone();
        let bk_interval = engine.router.config.bk_interval;
        let hook: crate::router::TickHook = Arc::new(move || {
            let hook_engine = hook_engine.clone();
            Box::pin(async move { hook_engine.on_tick(bk_interval).await })
        });
        engine.router.register_tick_hook(hook);

        Ok(engine)
    }

    pub(crate) fn router(&self) -> &RouterHandle {
        &self.router
    }

    pub(crate) fn local_queue(&self, logical: &LogicalEndpoint) -> Option<Arc<QueueState>> {
        self.queues.get(&canonical_key(logical)).map(|e| e.state.clone())
    }

    /// One `Stats` snapshot per configured queue plus the dead-letter
    /// queue, keyed by canonical queue endpoint string.
    pub fn stats(&self) -> std::collections::HashMap<String, super::types::QueueStats> {
        let mut out: std::collections::HashMap<String, super::types::QueueStats> =
            self.queues.iter().map(|e| (e.key().clone(), e.value().state.stats())).collect();
        out.insert(canonical_key(&self.dead_letter_ep), self.dead_letter.stats());
        out
    }

    /// Opens a client against one of this engine's configured queues.
    pub fn open_client(self: &Arc<Self>, queue_ep: &str) -> Result<Arc<MsgQueueClient>, FabricError> {
        let logical = match Endpoint::parse(queue_ep)? {
            Endpoint::Logical(l) => l,
            Endpoint::Physical(_) => return Err(FabricError::Configuration(format!("{queue_ep:?} must be a logical endpoint"))),
        };
        let state = self
            .local_queue(&logical)
            .ok_or_else(|| FabricError::NotFound(format!("queue {queue_ep:?} is not in QueueMap")))?;
        Ok(MsgQueueClient::new(self.clone(), logical, state))
    }

    pub(crate) fn forget_client(&self, _client: &Arc<MsgQueueClient>) {
        // Transactions are already rolled back by `close`'s caller; there
        // is no further per-client state held by the engine itself.
    }

    /// Runs one flush pass driven by the router's shared background timer
    /// (§5 "one background timer task"): moves expired or over-attempted
    /// messages to the dead-letter queue, then ages the dead-letter queue
    /// itself out by its own TTL.
    async fn on_tick(self: Arc<Self>, bk_interval: Duration) {
        let due = {
            let mut t = self.since_flush.lock();
            *t += bk_interval;
            if *t >= self.flush_interval {
                *t = Duration::ZERO;
                true
            } else {
                false
            }
        };
        if !due {
            return;
        }

        let now = now_ms();
        for entry in self.queues.iter() {
            match entry.state.drain_for_flush(now, self.max_delivery_attempts).await {
                Ok(expired) => {
                    for mut msg in expired {
                        msg.expire_time = Some(now + self.dead_letter_ttl.as_millis() as i64);
                        msg.queue_ep = canonical_key(&self.dead_letter_ep);
                        if let Err(e) = self.dead_letter.enqueue(msg, None).await {
                            tracing::warn!(error = %e, queue = %entry.ep, "failed to move expired message to dead-letter queue");
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, queue = %entry.ep, "queue flush scan failed"),
            }
        }

        if let Err(e) = self.dead_letter.drain_for_flush(now, 0).await {
            tracing::warn!(error = %e, "dead-letter queue flush failed");
        }
    }
}

impl DispatchTarget for MsgQueueEngine {
    fn register(self: Arc<Self>, dispatcher: &Dispatcher, scope: Option<Scope>) -> Result<(), FabricError> {
        for entry in self.queues.iter() {
            let engine = self.clone();
            dispatcher.add_logical::<QueueEnqueueWire, _, _>(entry.ep.clone(), scope.clone(), false, true, move |msg, _delivery| {
                let engine = engine.clone();
                async move { engine.handle_remote_enqueue(msg).await }
            })?;
        }
        Ok(())
    }
}

impl MsgQueueEngine {
    async fn handle_remote_enqueue(self: Arc<Self>, wire: QueueEnqueueWire) {
        let Some(entry) = self.queues.get(&wire.queue_ep) else {
            tracing::debug!(queue = %wire.queue_ep, "EnqueueTo arrived for a queue this engine does not host");
            return;
        };
        let msg = entry.state.new_message(wire.body, wire.priority, wire.expire_time);
        if let Err(e) = entry.state.enqueue(msg, None).await {
            tracing::warn!(error = %e, queue = %wire.queue_ep, "failed to persist remotely enqueued message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{Router, RouterRole};

    fn test_config(queue_map: Vec<String>) -> Config {
        let mut c = Config::default();
        c.router_ep = "physical://root1/hubA/leaf1".to_string();
        c.tcp_ep = None;
        c.udp_ep = Some("udp://127.0.0.1:0".to_string());
        c.queue_map = queue_map;
        c.flush_interval = Duration::from_millis(10);
        c.dead_letter_ttl = Duration::from_secs(60);
        c.max_delivery_attempts = 5;
        c
    }

    #[tokio::test]
    async fn open_client_round_trips_enqueue_dequeue() {
        let config = test_config(vec!["logical://queues/orders".to_string()]);
        let router = Router::new(config.clone(), RouterRole::Leaf).unwrap();
        let engine = MsgQueueEngine::new(router, &config, QueueBackend::Memory).await.unwrap();
        let client = engine.open_client("logical://queues/orders").unwrap();

        client.enqueue(b"hello".to_vec(), Priority::Normal).await.unwrap();
        let msg = client.dequeue(Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(msg.body, b"hello");
    }

    #[tokio::test]
    async fn open_client_rejects_unconfigured_queue() {
        let config = test_config(vec!["logical://queues/orders".to_string()]);
        let router = Router::new(config.clone(), RouterRole::Leaf).unwrap();
        let engine = MsgQueueEngine::new(router, &config, QueueBackend::Memory).await.unwrap();
        assert!(engine.open_client("logical://queues/unknown").is_err());
    }

    #[tokio::test]
    async fn stats_reports_depth_by_priority() {
        let config = test_config(vec!["logical://queues/orders".to_string()]);
        let router = Router::new(config.clone(), RouterRole::Leaf).unwrap();
        let engine = MsgQueueEngine::new(router, &config, QueueBackend::Memory).await.unwrap();
        let client = engine.open_client("logical://queues/orders").unwrap();

        client.enqueue(b"a".to_vec(), Priority::High).await.unwrap();
        client.enqueue(b"b".to_vec(), Priority::High).await.unwrap();
        client.enqueue(b"c".to_vec(), Priority::Low).await.unwrap();

        let stats = engine.stats();
        let orders = stats.get("logical://queues/orders").unwrap();
        assert_eq!(orders.depth, 3);
        assert_eq!(orders.depth_by_priority[Priority::High as usize], 2);
        assert_eq!(orders.depth_by_priority[Priority::Low as usize], 1);
        assert!(orders.oldest_enqueue_time.is_some());
    }

    #[tokio::test]
    async fn expired_message_moves_to_dead_letter_queue() {
        let config = test_config(vec!["logical://queues/orders".to_string()]);
        let router = Router::new(config.clone(), RouterRole::Leaf).unwrap();
        let engine = MsgQueueEngine::new(router, &config, QueueBackend::Memory).await.unwrap();
        let client = engine.open_client("logical://queues/orders").unwrap();

        client.enqueue_with_expiry(b"stale".to_vec(), Priority::Normal, now_ms() - 1000).await.unwrap();
        engine.clone().on_tick(Duration::from_millis(10)).await;

        assert!(client.peek(Some(Duration::ZERO)).await.is_none());
        assert_eq!(engine.dead_letter.len(), 1);
    }
}
