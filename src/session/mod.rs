//! Request/reply sessions: retries, idempotent reply caching, async
//! keep-alive, cancellation, and broadcast queries (§4.6).

pub mod context;
pub mod control;

use dashmap::{DashMap, DashSet};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::dispatch::{Delivery, Dispatcher, ReplySink};
use crate::endpoint::Endpoint;
use crate::error::FabricError;
use crate::message::envelope::Envelope;
use crate::message::flags::MessageFlags;
use crate::message::types::MessageType;
use crate::router::{RouterHandle, SessionIntercept};

use control::{SessionCancel, SessionKeepAlive, SessionReply};

pub use context::RequestContext;

#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub ttl: u8,
    pub timeout: Duration,
    pub retries: u32,
    /// Declared by the caller: a session against a handler known to be
    /// idempotent suppresses retries entirely (one send, one timeout, one
    /// failure). The fabric has no remote way to introspect a handler's
    /// idempotency attribute across processes, so this is caller-supplied
    /// rather than looked up (see DESIGN.md).
    pub idempotent: bool,
    pub broadcast: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            ttl: 16,
            timeout: Duration::from_secs(30),
            retries: 3,
            idempotent: false,
            broadcast: false,
        }
    }
}

/// What a query resolves to, surfaced to the caller as a session-level
/// failure distinct from a plain timeout (§4.6 "Exception propagation").
enum QueryOutcome {
    Reply(Vec<u8>),
    Fault(String),
}

struct PendingQuery {
    tx: Option<oneshot::Sender<QueryOutcome>>,
    cancelled: Arc<AtomicBool>,
    /// Extended by an inbound `SessionKeepAlive` so a slow async
    /// responder can hold the initiator open past the attempt's nominal
    /// timeout without consuming a retry (§4.6).
    deadline: Arc<Mutex<Instant>>,
    keep_alive_extension: Duration,
}

struct CachedReply {
    body: Vec<u8>,
    exception: Option<String>,
    expires_at: Instant,
}

struct ResponderSession {
    opened_at: Instant,
}

/// Owns both initiator-side pending queries and responder-side opened
/// sessions plus their reply cache. One instance per router; installed
/// as the router's [`SessionIntercept`] so session-tagged envelopes never
/// reach the dispatcher directly.
pub struct SessionManager {
    router: RouterHandle,
    dispatcher: Arc<Dispatcher>,
    session_cache_time: Duration,
    pending: DashMap<Uuid, PendingQuery>,
    responder_sessions: DashMap<Uuid, ResponderSession>,
    reply_cache: DashMap<Uuid, CachedReply>,
    aborted: DashSet<Uuid>,
    self_weak: OnceCell<Weak<SessionManager>>,
}

impl SessionManager {
    pub fn new(router: RouterHandle, session_cache_time: Duration) -> Arc<SessionManager> {
        let dispatcher = router.dispatcher.clone();
        let mgr = Arc::new(SessionManager {
            router,
            dispatcher,
            session_cache_time,
            pending: DashMap::new(),
            responder_sessions: DashMap::new(),
            reply_cache: DashMap::new(),
            aborted: DashSet::new(),
            self_weak: OnceCell::new(),
        });
        let _ = mgr.self_weak.set(Arc::downgrade(&mgr));
        mgr.router.set_session_intercept(mgr.clone());
        mgr
    }

    fn self_arc(&self) -> Arc<SessionManager> {
        self.self_weak
            .get()
            .and_then(Weak::upgrade)
            .expect("SessionManager is always constructed via ::new")
    }

    /// Sends `req` to `to` and awaits a reply of type `Resp`, retrying
    /// per `opts` unless the caller has declared the target idempotent.
    pub async fn query<Req, Resp>(&self, to: Endpoint, req: &Req, opts: QueryOptions) -> Result<Resp, FabricError>
    where
        Req: MessageType,
        Resp: MessageType,
    {
        let session_id = Uuid::new_v4();
        let body = self.router.codec.encode_body(req)?;
        let attempts = if opts.idempotent { 1 } else { opts.retries + 1 };
        let cancelled = Arc::new(AtomicBool::new(false));

        for attempt in 0..attempts {
            if self.aborted.remove(&session_id).is_some() {
                return Err(FabricError::Cancelled);
            }

            let (tx, mut rx) = oneshot::channel();
            let deadline = Arc::new(Mutex::new(Instant::now() + opts.timeout));
            self.pending.insert(
                session_id,
                PendingQuery {
                    tx: Some(tx),
                    cancelled: cancelled.clone(),
                    deadline: deadline.clone(),
                    keep_alive_extension: opts.timeout,
                },
            );

            let mut flags = MessageFlags::OPEN_SESSION;
            if opts.broadcast {
                flags |= MessageFlags::BROADCAST;
            }
            let env = Envelope::new(
                Req::TYPE_TAG,
                Endpoint::Physical(self.router.self_ep.clone()),
                to.clone(),
                body.clone(),
            )
            .with_session(session_id)
            .with_flags(flags)
            .with_ttl(opts.ttl);

            self.router.send_to(to.clone(), env).await?;

            // Re-poll against `deadline` rather than a single fixed
            // timeout: a `SessionKeepAlive` from an async responder
            // pushes `deadline` out, and this attempt only truly expires
            // once no extension arrived before it elapsed.
            let outcome = loop {
                let remaining = {
                    let d = *deadline.lock();
                    d.saturating_duration_since(Instant::now())
                };
                if remaining.is_zero() {
                    break Err(());
                }
                match tokio::time::timeout(remaining, &mut rx).await {
                    Ok(res) => break Ok(res),
                    Err(_) => {
                        if Instant::now() >= *deadline.lock() {
                            break Err(());
                        }
                        // deadline was extended mid-wait; loop and wait out the rest.
                        continue;
                    }
                }
            };
            self.pending.remove(&session_id);

            if cancelled.load(Ordering::Acquire) {
                return Err(FabricError::Cancelled);
            }

            match outcome {
                Ok(Ok(QueryOutcome::Reply(bytes))) => {
                    return self.router.codec.decode_body::<Resp>(&bytes);
                }
                Ok(Ok(QueryOutcome::Fault(msg))) => return Err(FabricError::SessionFault(msg)),
                Ok(Err(_)) => return Err(FabricError::Aborted),
                Err(()) => {
                    tracing::debug!(%session_id, attempt, "query timed out, retrying");
                    continue;
                }
            }
        }
        Err(FabricError::Timeout(format!("session {session_id} exhausted retries")))
    }

    /// Cooperatively cancels an outstanding query; surfaced at this
    /// initiator the next time it wakes (§5).
    pub fn cancel(&self, session_id: Uuid) {
        if let Some(mut pending) = self.pending.get_mut(&session_id) {
            pending.cancelled.store(true, Ordering::Release);
            if let Some(tx) = pending.tx.take() {
                let _ = tx.send(QueryOutcome::Fault("cancelled".into()));
            }
        }
    }

    fn handle_reply(&self, env: Envelope) {
        let Ok(reply) = self.router.codec.decode_body::<SessionReply>(&env.body) else {
            return;
        };
        // First reply wins for a broadcast query; later arrivals find no
        // pending entry and are dropped here (§4.6).
        if let Some((_, mut pending)) = self.pending.remove(&reply.session_id) {
            if let Some(tx) = pending.tx.take() {
                let outcome = match reply.exception {
                    Some(msg) => QueryOutcome::Fault(msg),
                    None => QueryOutcome::Reply(reply.body),
                };
                let _ = tx.send(outcome);
            }
        }
    }

    fn handle_cancel(&self, env: Envelope) {
        let Ok(cancel) = self.router.codec.decode_body::<SessionCancel>(&env.body) else {
            return;
        };
        self.aborted.insert(cancel.session_id);
        self.responder_sessions.remove(&cancel.session_id);
    }

    fn handle_keep_alive(&self, env: Envelope) {
        let Ok(keep_alive) = self.router.codec.decode_body::<SessionKeepAlive>(&env.body) else {
            return;
        };
        if let Some(pending) = self.pending.get(&keep_alive.session_id) {
            let extended = Instant::now() + pending.keep_alive_extension;
            let mut d = pending.deadline.lock();
            if extended > *d {
                *d = extended;
            }
        }
    }

    fn handle_query_arrival(self: &Arc<Self>, env: Envelope, reply: Arc<dyn ReplySink>) {
        let session_id = env.session_id;

        if let Some(cached) = self.reply_cache.get(&session_id) {
            if cached.expires_at > Instant::now() {
                match &cached.exception {
                    Some(msg) => reply.fault(msg.clone()),
                    None => reply.reply(cached.body.clone()),
                }
                return;
            }
        }

        if self.responder_sessions.contains_key(&session_id) {
            tracing::trace!(%session_id, "dropping duplicate query while handler is in flight");
            return;
        }
        self.responder_sessions.insert(
            session_id,
            ResponderSession {
                opened_at: Instant::now(),
            },
        );

        let caching_sink: Arc<dyn ReplySink> = Arc::new(CachingReplySink {
            manager: self.clone(),
            session_id,
            inner: reply,
        });
        self.dispatcher.dispatch(Delivery::new(env, caching_sink));
    }

    /// Keeps `session_id` alive from the responder side while `ctx`'s
    /// handler is still working: emits `SessionKeepAlive` to `initiator`
    /// every half of `interval` until `ctx` settles (`Reply`/`Cancel`/
    /// `Abort`/drop) or `max_count` keep-alives have gone out, whichever
    /// comes first. Called by an async handler that has stashed the
    /// `RequestContext` and returned immediately (§4.6).
    pub fn keep_session_alive(
        self: &Arc<Self>,
        initiator: Endpoint,
        session_id: Uuid,
        ctx: Arc<RequestContext>,
        interval: Duration,
        max_count: Option<u32>,
    ) {
        let mgr = self.clone();
        let self_ep = Endpoint::Physical(mgr.router.self_ep.clone());
        let period = interval / 2;
        tokio::spawn(async move {
            let mut sent = 0u32;
            loop {
                if ctx.is_settled() {
                    return;
                }
                if let Some(max) = max_count {
                    if sent >= max {
                        return;
                    }
                }
                tokio::time::sleep(period).await;
                if ctx.is_settled() {
                    return;
                }
                let Ok(body) = mgr.router.codec.encode_body(&SessionKeepAlive { session_id }) else {
                    return;
                };
                let env = Envelope::new(SessionKeepAlive::TYPE_TAG, self_ep.clone(), initiator.clone(), body)
                    .with_session(session_id);
                if mgr.router.send_to(initiator.clone(), env).await.is_err() {
                    return;
                }
                sent += 1;
            }
        });
    }

    fn store_reply(&self, session_id: Uuid, body: Vec<u8>, exception: Option<String>) {
        self.reply_cache.insert(
            session_id,
            CachedReply {
                body,
                exception,
                expires_at: Instant::now() + self.session_cache_time,
            },
        );
        self.responder_sessions.remove(&session_id);
    }

    /// Evicts reply-cache entries and stale responder sessions past
    /// `SessionCacheTime` — driven from the router's shared background
    /// timer task in a full deployment; exposed here so it can also be
    /// invoked directly in tests.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.reply_cache.retain(|_, v| v.expires_at > now);
        self.responder_sessions
            .retain(|_, v| now.duration_since(v.opened_at) < self.session_cache_time * 4);
    }
}

impl SessionIntercept for SessionManager {
    fn try_handle(&self, env: Envelope, reply: Arc<dyn ReplySink>) -> bool {
        match env.type_tag {
            t if t == SessionReply::TYPE_TAG => {
                self.handle_reply(env);
                true
            }
            t if t == SessionCancel::TYPE_TAG => {
                self.handle_cancel(env);
                true
            }
            t if t == SessionKeepAlive::TYPE_TAG => {
                self.handle_keep_alive(env);
                true
            }
            _ if env.flags.contains(MessageFlags::OPEN_SESSION) => {
                self.self_arc().handle_query_arrival(env, reply);
                true
            }
            _ => false,
        }
    }
}

struct CachingReplySink {
    manager: Arc<SessionManager>,
    session_id: Uuid,
    inner: Arc<dyn ReplySink>,
}

impl ReplySink for CachingReplySink {
    fn reply(&self, body: Vec<u8>) {
        self.manager.store_reply(self.session_id, body.clone(), None);
        self.inner.reply(body);
    }

    fn fault(&self, message: String) {
        self.manager.store_reply(self.session_id, Vec::new(), Some(message.clone()));
        self.inner.fault(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::router::{Router, RouterRole};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        nonce: u32,
    }
    impl MessageType for Ping {
        const TYPE_TAG: crate::message::types::TypeTag = crate::message::types::TypeTag::new(*b"PING");
        const TYPE_NAME: &'static str = "Ping";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Pong {
        nonce: u32,
    }
    impl MessageType for Pong {
        const TYPE_TAG: crate::message::types::TypeTag = crate::message::types::TypeTag::new(*b"PONG");
        const TYPE_NAME: &'static str = "Pong";
    }

    fn test_router() -> RouterHandle {
        let mut c = Config::default();
        c.router_ep = "physical://root1/hubA/leaf1".to_string();
        c.tcp_ep = None;
        c.udp_ep = Some("udp://127.0.0.1:0".to_string());
        Router::new(c, RouterRole::Leaf).unwrap()
    }

    #[tokio::test]
    async fn query_with_no_route_fails_fast_without_retrying() {
        let router = test_router();
        let mgr = SessionManager::new(router, Duration::from_secs(30));
        let opts = QueryOptions {
            timeout: Duration::from_millis(30),
            retries: 3,
            ..Default::default()
        };
        // No physical route and no parent uplink configured: send_to
        // fails immediately on the first attempt rather than waiting out
        // a session timeout that could never be satisfied.
        let err = mgr
            .query::<Ping, Pong>(
                Endpoint::parse("physical://root1/hubA/leaf2").unwrap(),
                &Ping { nonce: 1 },
                opts,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::NoRoute(_)));
    }

    #[test]
    fn cancel_before_send_short_circuits_next_attempt() {
        let router = test_router();
        let mgr = SessionManager::new(router, Duration::from_secs(30));
        let session_id = Uuid::new_v4();
        mgr.aborted.insert(session_id);
        assert!(mgr.aborted.contains(&session_id));
    }

    #[tokio::test]
    async fn inbound_keep_alive_extends_pending_deadline() {
        let router = test_router();
        let mgr = SessionManager::new(router.clone(), Duration::from_secs(30));

        let session_id = Uuid::new_v4();
        let deadline = Arc::new(Mutex::new(Instant::now()));
        mgr.pending.insert(
            session_id,
            PendingQuery {
                tx: None,
                cancelled: Arc::new(AtomicBool::new(false)),
                deadline: deadline.clone(),
                keep_alive_extension: Duration::from_secs(5),
            },
        );
        let before = *deadline.lock();

        let self_ep = Endpoint::Physical(router.self_ep.clone());
        let body = router.codec.encode_body(&SessionKeepAlive { session_id }).unwrap();
        let env = Envelope::new(SessionKeepAlive::TYPE_TAG, self_ep.clone(), self_ep.clone(), body).with_session(session_id);
        router.send_to(self_ep, env).await.unwrap();

        assert!(*deadline.lock() > before);
    }

    #[tokio::test]
    async fn query_survives_past_nominal_timeout_when_kept_alive() {
        let router = test_router();
        let mgr = SessionManager::new(router.clone(), Duration::from_secs(30));
        let self_ep = Endpoint::Physical(router.self_ep.clone());

        let opts = QueryOptions {
            timeout: Duration::from_millis(100),
            retries: 0,
            idempotent: true,
            ..Default::default()
        };

        let query_mgr = mgr.clone();
        let query_to = self_ep.clone();
        let query_task = tokio::spawn(async move { query_mgr.query::<Ping, Pong>(query_to, &Ping { nonce: 7 }, opts).await });

        // Let the query land in `pending`, then keep it alive and reply
        // past the 100ms nominal timeout but within the extension (which
        // pushes the deadline out by another full `opts.timeout`).
        tokio::time::sleep(Duration::from_millis(30)).await;
        let session_id = *mgr.pending.iter().next().unwrap().key();

        let body = router.codec.encode_body(&SessionKeepAlive { session_id }).unwrap();
        let env = Envelope::new(SessionKeepAlive::TYPE_TAG, self_ep.clone(), self_ep.clone(), body).with_session(session_id);
        router.send_to(self_ep.clone(), env).await.unwrap();

        tokio::time::sleep(Duration::from_millis(90)).await;
        let reply = SessionReply {
            session_id,
            body: router.codec.encode_body(&Pong { nonce: 7 }).unwrap(),
            exception: None,
        };
        let body = router.codec.encode_body(&reply).unwrap();
        let env = Envelope::new(SessionReply::TYPE_TAG, self_ep.clone(), self_ep.clone(), body).with_session(session_id);
        router.send_to(self_ep, env).await.unwrap();

        let pong = query_task.await.unwrap().unwrap();
        assert_eq!(pong.nonce, 7);
    }
}
