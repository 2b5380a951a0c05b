//! Routes an inbound message to registered handlers keyed by
//! `(message type, logical endpoint, dynamic scope)`.
//!
//! Handler discovery is reflection-free by construction (see DESIGN.md):
//! a [`DispatchTarget`] records its own handlers into the dispatcher at
//! construction time, the compile-time analogue of the source's
//! annotated-method introspection (§9 design notes).

mod context;
mod key;

pub use context::{Delivery, ReplySink};
pub use key::{HandlerKey, Scope};

use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::FabricError;
use crate::message::codec::MessageCodec;
use crate::message::types::{MessageType, TypeTag};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type RawHandler = Arc<dyn Fn(Delivery) -> BoxFuture + Send + Sync>;

struct HandlerEntry {
    handler: RawHandler,
    is_idempotent: bool,
}

/// Concurrent message router. Dispatch is intentionally ordering-free
/// across messages (§5): each delivery is handed to a bounded worker
/// pool, so two inbound messages on different channels — or even the
/// same TCP channel — may complete out of order once handed off here.
pub struct Dispatcher {
    codec: Arc<MessageCodec>,
    handlers: DashMap<HandlerKey, HandlerEntry>,
    defaults: DashMap<TypeTag, HandlerEntry>,
    pool: Arc<Semaphore>,
    inflight: Arc<AtomicUsize>,
}

/// Implemented by a value that owns one or more handlers; `register`
/// wires them into a dispatcher in one call, standing in for the
/// source's reflective `AddTarget`.
pub trait DispatchTarget {
    fn register(self: Arc<Self>, dispatcher: &Dispatcher, scope: Option<Scope>) -> Result<(), FabricError>;
}

impl Dispatcher {
    pub fn new(codec: Arc<MessageCodec>, worker_count: usize) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            codec,
            handlers: DashMap::new(),
            defaults: DashMap::new(),
            pool: Arc::new(Semaphore::new(worker_count.max(1))),
            inflight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn add_target<D: DispatchTarget + 'static>(
        &self,
        target: Arc<D>,
        scope: Option<Scope>,
    ) -> Result<(), FabricError> {
        target.register(self, scope)
    }

    /// Registers a handler keyed only by message type — used for physical
    /// (point-to-point) deliveries that do not route through a logical
    /// pattern, e.g. control messages addressed directly to this router.
    pub fn add_physical<T, F, Fut>(
        &self,
        scope: Option<Scope>,
        idempotent: bool,
        handler: F,
    ) -> Result<(), FabricError>
    where
        T: MessageType,
        F: Fn(T, Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = HandlerKey {
            type_tag: T::TYPE_TAG,
            logical_ep: None,
            scope,
        };
        self.insert(key, idempotent, self.wrap::<T, F, Fut>(handler))
    }

    /// Registers a handler keyed by `(type, logical endpoint, scope)`.
    /// `default` additionally installs it as the type's fallback when no
    /// other registration matches; at most one default per type, per §4.4.
    pub fn add_logical<T, F, Fut>(
        &self,
        logical_ep: crate::endpoint::LogicalEndpoint,
        scope: Option<Scope>,
        default: bool,
        idempotent: bool,
        handler: F,
    ) -> Result<(), FabricError>
    where
        T: MessageType,
        F: Fn(T, Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped = self.wrap::<T, F, Fut>(handler);
        if default {
            if self.defaults.contains_key(&T::TYPE_TAG) {
                return Err(FabricError::DuplicateHandler(format!(
                    "a default handler for {} is already registered",
                    T::TYPE_NAME
                )));
            }
            self.defaults.insert(
                T::TYPE_TAG,
                HandlerEntry {
                    handler: wrapped.clone(),
                    is_idempotent: idempotent,
                },
            );
        }
        let key = HandlerKey {
            type_tag: T::TYPE_TAG,
            logical_ep: Some(logical_ep),
            scope,
        };
        self.insert(key, idempotent, wrapped)
    }

    fn wrap<T, F, Fut>(&self, handler: F) -> RawHandler
    where
        T: MessageType,
        F: Fn(T, Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let codec = self.codec.clone();
        Arc::new(move |delivery: Delivery| -> BoxFuture {
            let handler = &handler;
            match codec.decode_body::<T>(&delivery.envelope.body) {
                Ok(msg) => Box::pin(handler(msg, delivery)),
                Err(e) => {
                    tracing::warn!(error = %e, type_name = T::TYPE_NAME, "dropping message: decode failed");
                    delivery.fault(format!("decode error: {e}"));
                    Box::pin(async {})
                }
            }
        })
    }

    fn insert(&self, key: HandlerKey, idempotent: bool, handler: RawHandler) -> Result<(), FabricError> {
        if self.handlers.contains_key(&key) {
            return Err(FabricError::DuplicateHandler(format!("{key:?}")));
        }
        self.handlers.insert(
            key,
            HandlerEntry {
                handler,
                is_idempotent: idempotent,
            },
        );
        Ok(())
    }

    pub fn is_idempotent(&self, type_tag: TypeTag, logical_ep: Option<&crate::endpoint::LogicalEndpoint>) -> bool {
        self.lookup(type_tag, logical_ep)
            .map(|e| e.is_idempotent)
            .unwrap_or(false)
    }

    fn lookup(&self, type_tag: TypeTag, logical_ep: Option<&crate::endpoint::LogicalEndpoint>) -> Option<dashmap::mapref::one::Ref<'_, HandlerKey, HandlerEntry>> {
        if let Some(ep) = logical_ep {
            for entry in self.handlers.iter() {
                if entry.key().type_tag == type_tag {
                    if let Some(pattern) = &entry.key().logical_ep {
                        if pattern.logical_match(ep) {
                            return self.handlers.get(entry.key());
                        }
                    }
                }
            }
        }
        let physical_key = HandlerKey {
            type_tag,
            logical_ep: None,
            scope: None,
        };
        if let Some(e) = self.handlers.get(&physical_key) {
            return Some(e);
        }
        None
    }

    /// Hands `delivery` to the worker pool. Errors inside a handler never
    /// propagate into the caller's I/O loop (§7) — they are traced and
    /// the worker moves on.
    pub fn dispatch(self: &Arc<Self>, delivery: Delivery) {
        let this = self.clone();
        let inflight = self.inflight.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                return;
            };
            inflight.fetch_add(1, Ordering::Relaxed);
            let type_tag = delivery.envelope.type_tag;
            let logical_ep = delivery.envelope.to_ep.as_logical().cloned();
            let found = this.lookup(type_tag, logical_ep.as_ref()).map(|e| e.handler.clone());
            match found.or_else(|| this.defaults.get(&type_tag).map(|e| e.handler.clone())) {
                Some(handler) => handler(delivery).await,
                None => {
                    tracing::debug!(%type_tag, to = %delivery.envelope.to_ep, "no handler registered, dropping");
                }
            }
            inflight.fetch_sub(1, Ordering::Relaxed);
        });
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::message::codec::CodecConfig;
    use crate::message::envelope::Envelope;
    use crate::message::types::TypeTag;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        nonce: u32,
    }

    impl MessageType for Ping {
        const TYPE_TAG: TypeTag = TypeTag::new(*b"PING");
        const TYPE_NAME: &'static str = "Ping";
    }

    struct NullSink;
    impl ReplySink for NullSink {
        fn reply(&self, _body: Vec<u8>) {}
        fn fault(&self, _message: String) {}
    }

    fn envelope_for(msg: &Ping, codec: &MessageCodec, to: &str) -> Envelope {
        Envelope::new(
            Ping::TYPE_TAG,
            Endpoint::parse("physical://root1/hubA/leaf1").unwrap(),
            Endpoint::parse(to).unwrap(),
            codec.encode_body(msg).unwrap(),
        )
    }

    #[tokio::test]
    async fn routes_to_matching_logical_handler() {
        let codec = Arc::new(MessageCodec::new(CodecConfig::default()));
        let dispatcher = Dispatcher::new(codec.clone(), 4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        dispatcher
            .add_logical::<Ping, _, _>(
                crate::endpoint::LogicalEndpoint::new(vec!["svc".into(), "*".into()]),
                None,
                false,
                false,
                move |msg: Ping, _d| {
                    let seen = seen2.clone();
                    async move {
                        seen.lock().unwrap().push(msg.nonce);
                    }
                },
            )
            .unwrap();

        let env = envelope_for(&Ping { nonce: 7 }, &codec, "logical://svc/billing");
        dispatcher.dispatch(Delivery::new(env, Arc::new(NullSink)));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().as_slice(), [7]);
    }

    #[test]
    fn duplicate_default_handler_is_rejected_synchronously() {
        let codec = Arc::new(MessageCodec::new(CodecConfig::default()));
        let dispatcher = Dispatcher::new(codec, 4);
        let ep = crate::endpoint::LogicalEndpoint::new(vec!["svc".into()]);
        dispatcher
            .add_logical::<Ping, _, _>(ep.clone(), None, true, false, |_m: Ping, _d| async {})
            .unwrap();
        let err = dispatcher
            .add_logical::<Ping, _, _>(ep, None, true, false, |_m: Ping, _d| async {})
            .unwrap_err();
        assert!(matches!(err, FabricError::DuplicateHandler(_)));
    }
}
