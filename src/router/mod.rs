//! The router state machine: owns the route tables, drives discovery,
//! advertise/keep-alive, dead-router detection, and forwarding (§4.5).
//!
//! Three roles form a tree — `Leaf ≺ Hub ≺ Root` — distinguished only by
//! how many segments their physical endpoint carries and which uplink
//! they forward to; the state machine itself is shared code.

pub mod discovery;
pub mod receipt;
pub mod routes;

pub use routes::{LogicalRouteEntry, LogicalRoutes, PhysicalRouteEntry, PhysicalRoutes};

use parking_lot::RwLock;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::Deref;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::channel::multicast::MulticastChannel;
use crate::channel::registry::ChannelRegistry;
use crate::channel::tcp::TcpChannel;
use crate::channel::{Channel, InboundCallback};
use crate::config::{Config, DiscoveryMode};
use crate::dispatch::{Delivery, Dispatcher, ReplySink};
use crate::endpoint::{ChannelEndpoint, Endpoint, LogicalEndpoint, PhysicalEndpoint, Transport};
use crate::error::FabricError;
use crate::message::codec::{CodecConfig, MessageCodec};
use crate::message::envelope::Envelope;
use crate::message::flags::MessageFlags;
use crate::message::types::MessageType;

use discovery::{DeadRouterNotice, RouterAdvertise, RouterRoleWire, RouterStop};
use receipt::Receipt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterRole {
    Leaf,
    Hub,
    Root,
}

impl RouterRole {
    fn wire(self) -> RouterRoleWire {
        match self {
            RouterRole::Leaf => RouterRoleWire::Leaf,
            RouterRole::Hub => RouterRoleWire::Hub,
            RouterRole::Root => RouterRoleWire::Root,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RouterState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl From<u8> for RouterState {
    fn from(v: u8) -> Self {
        match v {
            1 => RouterState::Starting,
            2 => RouterState::Running,
            3 => RouterState::Stopping,
            _ => RouterState::Stopped,
        }
    }
}

/// Callback invoked once a peer is evicted for missing a receipt,
/// surfacing `(deadEP, logicalEndpointSetID)` to user code (§4.5).
pub type DeadRouterHook = Arc<dyn Fn(PhysicalEndpoint, Uuid) + Send + Sync>;

/// A unit of work run from the router's single background timer task
/// alongside advertising, idle-reaping, and receipt sweeping — the
/// cluster and queue layers register one each instead of spawning a
/// second ticker, per §5's "one background timer task" design.
pub type TickHook = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A handler the session layer (or any other layer stacked on the
/// router) installs to claim envelopes addressed to this router before
/// they fall through to the dispatcher. Returns `true` if the envelope
/// was consumed.
pub trait SessionIntercept: Send + Sync {
    fn try_handle(&self, envelope: Envelope, reply: Arc<dyn ReplySink>) -> bool;
}

struct PendingReceipt {
    peer: PhysicalEndpoint,
    set_id: Uuid,
    deadline: tokio::time::Instant,
}

pub struct Router {
    pub config: Arc<Config>,
    pub role: RouterRole,
    pub self_ep: PhysicalEndpoint,
    state: AtomicU8,
    pub physical_routes: PhysicalRoutes,
    pub logical_routes: LogicalRoutes,
    channels: Arc<ChannelRegistry>,
    pub codec: Arc<MessageCodec>,
    pub dispatcher: Arc<Dispatcher>,
    local_logical_eps: RwLock<Vec<LogicalEndpoint>>,
    logical_set_id: RwLock<Uuid>,
    uplink_eps: Vec<LogicalEndpoint>,
    downlink_eps: Vec<LogicalEndpoint>,
    parent_channel: RwLock<Option<Arc<dyn Channel>>>,
    parent_ep: RwLock<Option<PhysicalEndpoint>>,
    dead_router_hook: RwLock<Option<DeadRouterHook>>,
    session_intercept: RwLock<Option<Arc<dyn SessionIntercept>>>,
    pending_receipts: dashmap::DashMap<Uuid, PendingReceipt>,
    advertise_socket: AsyncMutex<Option<Arc<tokio::net::UdpSocket>>>,
    advertise_target: RwLock<Option<SocketAddr>>,
    tick_hooks: RwLock<Vec<TickHook>>,
}

/// Cloneable, `Arc`-backed facade user code holds to call `Send`/`Query`/
/// `Broadcast` and to register dispatcher targets — mirrors the teacher's
/// thin `Server` facade over `Arc`-shared subsystem managers.
#[derive(Clone)]
pub struct RouterHandle(pub(crate) Arc<Router>);

impl Deref for RouterHandle {
    type Target = Router;
    fn deref(&self) -> &Router {
        &self.0
    }
}

impl RouterHandle {
    /// Forwards to [`Router::send_to`]; exists because that method takes
    /// `self: &Arc<Router>`, a receiver `Deref` alone can't produce.
    pub async fn send_to(&self, to: Endpoint, env: Envelope) -> Result<(), FabricError> {
        Router::send_to(&self.0, to, env).await
    }

    /// Forwards to [`Router::start`]; see `send_to`'s doc comment for why
    /// this can't just be a `Deref`ed call.
    pub async fn start(&self) -> Result<(), FabricError> {
        Router::start(&self.0).await
    }

    /// Forwards to [`Router::stop`].
    pub async fn stop(&self, drain_deadline: Duration) -> Result<(), FabricError> {
        Router::stop(&self.0, drain_deadline).await
    }
}

impl Router {
    pub fn new(config: Config, role: RouterRole) -> Result<RouterHandle, FabricError> {
        let self_ep = parse_self_ep(&config)?;
        let codec = Arc::new(MessageCodec::new(CodecConfig {
            max_body_size: 16 * 1024 * 1024,
            shared_key: config
                .shared_key
                .as_ref()
                .map(|k| derive_key(k)),
        }));
        codec.register::<RouterAdvertise>();
        codec.register::<RouterStop>();
        codec.register::<DeadRouterNotice>();
        codec.register::<Receipt>();
        codec.register::<crate::session::control::SessionKeepAlive>();
        codec.register::<crate::session::control::SessionReply>();
        codec.register::<crate::session::control::SessionCancel>();

        let dispatcher = Dispatcher::new(codec.clone(), num_cpus::get().max(2));
        let channels = ChannelRegistry::new(config.max_idle);

        let uplink_eps = parse_ep_list(&config.uplink_ep)?;
        let downlink_eps = parse_ep_list(&config.downlink_ep)?;

        let router = Arc::new(Router {
            config: Arc::new(config),
            role,
            self_ep,
            state: AtomicU8::new(RouterState::Stopped as u8),
            physical_routes: PhysicalRoutes::new(),
            logical_routes: LogicalRoutes::new(),
            channels,
            codec,
            dispatcher,
            local_logical_eps: RwLock::new(Vec::new()),
            logical_set_id: RwLock::new(Uuid::new_v4()),
            uplink_eps,
            downlink_eps,
            parent_channel: RwLock::new(None),
            parent_ep: RwLock::new(None),
            dead_router_hook: RwLock::new(None),
            session_intercept: RwLock::new(None),
            pending_receipts: dashmap::DashMap::new(),
            advertise_socket: AsyncMutex::new(None),
            advertise_target: RwLock::new(None),
            tick_hooks: RwLock::new(Vec::new()),
        });

        Ok(RouterHandle(router))
    }

    pub fn state(&self) -> RouterState {
        RouterState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: RouterState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn on_dead_router(&self, hook: DeadRouterHook) {
        *self.dead_router_hook.write() = Some(hook);
    }

    pub fn set_session_intercept(&self, intercept: Arc<dyn SessionIntercept>) {
        *self.session_intercept.write() = Some(intercept);
    }

    /// Registers a closure to be spawned on every `BkInterval` tick of the
    /// shared background timer (§5). Used by the cluster and queue layers
    /// so neither needs a ticker of its own.
    pub fn register_tick_hook(&self, hook: TickHook) {
        self.tick_hooks.write().push(hook);
    }

    /// Adds `pattern` to the set of logical endpoints this router serves
    /// locally and bumps the logical-endpoint-set ID so the next advertise
    /// carries it and peers know to re-sync (§4.5).
    pub fn add_local_logical_ep(&self, pattern: LogicalEndpoint) {
        let mut eps = self.local_logical_eps.write();
        if !eps.contains(&pattern) {
            eps.push(pattern);
            *self.logical_set_id.write() = Uuid::new_v4();
        }
    }

    pub fn local_logical_eps(&self) -> Vec<LogicalEndpoint> {
        self.local_logical_eps.read().clone()
    }

    pub fn logical_set_id(&self) -> Uuid {
        *self.logical_set_id.read()
    }

    /// Starts channel listeners and the single background timer task that
    /// services advertising, dead-router probing, and idle-connection
    /// reaping (§5).
    pub async fn start(self: &Arc<Router>) -> Result<(), FabricError> {
        self.set_state(RouterState::Starting);

        if let Some(tcp_ep) = &self.config.tcp_ep {
            let addr: ChannelEndpoint = tcp_ep.parse()?;
            let listen_addr = SocketAddr::new(addr.addr, addr.port);
            let this = self.clone();
            let on_receive: InboundCallback = Arc::new(move |peer, bytes| {
                let this = this.clone();
                tokio::spawn(async move { this.handle_inbound(peer, bytes).await });
            });
            let registry = self.channels.clone();
            tokio::spawn(async move {
                if let Err(e) = TcpChannel::serve(listen_addr, this_backlog(), on_receive, registry).await {
                    tracing::error!(error = %e, "tcp listener exited");
                }
            });
        }

        self.start_discovery().await?;
        self.dial_parent().await;

        let this = self.clone();
        tokio::spawn(async move { this.background_timer().await });

        self.set_state(RouterState::Running);
        tracing::info!(self_ep = %self.self_ep, role = ?self.role, "router started");
        Ok(())
    }

    /// Leaves dial their hub, hubs dial their root, per `ParentEP` — the
    /// uplink channel used whenever no direct or logical route covers a
    /// destination (§4.5 step 5).
    async fn dial_parent(self: &Arc<Router>) {
        let Some(parent_ep) = self.config.parent_ep.clone() else {
            return;
        };
        let Ok(Endpoint::Physical(parent)) = Endpoint::parse(&parent_ep) else {
            tracing::warn!(%parent_ep, "ParentEP is not a physical endpoint, skipping uplink");
            return;
        };
        let Some(channel_ep) = parent.channel_ep else {
            tracing::warn!(%parent_ep, "ParentEP carries no channel, skipping uplink");
            return;
        };
        match self.dial(channel_ep).await {
            Ok(chan) => {
                *self.parent_channel.write() = Some(chan);
                *self.parent_ep.write() = Some(parent);
            }
            Err(e) => tracing::warn!(error = %e, %parent_ep, "failed to dial parent"),
        }
    }

    async fn start_discovery(self: &Arc<Router>) -> Result<(), FabricError> {
        let port = self.config.advertise_port();
        match self.config.discovery_mode {
            DiscoveryMode::Multicast => {
                let group: Ipv4Addr = "239.27.27.1".parse().unwrap();
                let chan = MulticastChannel::join(group, port, Ipv4Addr::UNSPECIFIED)?;
                let socket = chan.socket();
                *self.advertise_socket.lock().await = Some(socket.clone());
                *self.advertise_target.write() = Some(SocketAddr::new(group.into(), port));
                let this = self.clone();
                let on_receive: InboundCallback = Arc::new(move |peer, bytes| {
                    let this = this.clone();
                    tokio::spawn(async move { this.handle_inbound(peer, bytes).await });
                });
                tokio::spawn(MulticastChannel::serve(socket, on_receive));
            }
            DiscoveryMode::UdpBroadcast => {
                let broadcast_ep: ChannelEndpoint = self
                    .config
                    .udp_ep
                    .as_deref()
                    .unwrap_or("udp://255.255.255.255:45000")
                    .parse()?;
                let chan = MulticastChannel::broadcast(
                    match broadcast_ep.addr {
                        std::net::IpAddr::V4(v4) => v4,
                        _ => Ipv4Addr::new(255, 255, 255, 255),
                    },
                    broadcast_ep.port,
                )?;
                let socket = chan.socket();
                *self.advertise_socket.lock().await = Some(socket.clone());
                *self.advertise_target.write() = Some(SocketAddr::new(broadcast_ep.addr, broadcast_ep.port));
                let this = self.clone();
                let on_receive: InboundCallback = Arc::new(move |peer, bytes| {
                    let this = this.clone();
                    tokio::spawn(async move { this.handle_inbound(peer, bytes).await });
                });
                tokio::spawn(MulticastChannel::serve(socket, on_receive));
            }
        }
        Ok(())
    }

    async fn background_timer(self: Arc<Router>) {
        let mut ticker = tokio::time::interval(self.config.bk_interval);
        let mut since_advertise = Duration::ZERO;
        loop {
            ticker.tick().await;
            if self.state() == RouterState::Stopped || self.state() == RouterState::Stopping {
                return;
            }
            since_advertise += self.config.bk_interval;
            if since_advertise >= self.config.advertise_time {
                since_advertise = Duration::ZERO;
                self.send_advertise().await;
            }
            self.channels_reap();
            self.sweep_receipts().await;

            let hooks: Vec<TickHook> = self.tick_hooks.read().clone();
            for hook in hooks {
                tokio::spawn(hook());
            }
        }
    }

    fn channels_reap(&self) {
        self.channels.reap_idle();
    }

    async fn send_advertise(&self) {
        let mut aggregated = self.local_logical_eps();
        aggregated.extend(self.logical_routes.patterns());
        aggregated.sort();
        aggregated.dedup();
        let eps = discovery::truncate_advertised_eps(aggregated, self.config.max_logical_advertise_eps);
        let advertise = RouterAdvertise {
            router_ep: self.self_ep.clone(),
            channels: self
                .config
                .tcp_ep
                .iter()
                .cloned()
                .chain(self.config.udp_ep.iter().cloned())
                .collect(),
            set_id: self.logical_set_id(),
            logical_eps: eps,
            role: self.role.wire(),
        };
        let Ok(body) = self.codec.encode_body(&advertise) else {
            return;
        };
        let env = Envelope::new(
            RouterAdvertise::TYPE_TAG,
            Endpoint::Physical(self.self_ep.clone()),
            Endpoint::Physical(self.self_ep.clone()).with_segment_appended("*"),
            body,
        );
        let Ok(bytes) = self.codec.encode_envelope(&env) else {
            return;
        };
        let guard = self.advertise_socket.lock().await;
        if let (Some(socket), Some(target)) = (guard.as_ref(), *self.advertise_target.read()) {
            let _ = socket.send_to(&bytes, target).await;
        }
    }

    async fn sweep_receipts(&self) {
        let now = tokio::time::Instant::now();
        let expired: Vec<(Uuid, PhysicalEndpoint, Uuid)> = self
            .pending_receipts
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| (*e.key(), e.value().peer.clone(), e.value().set_id))
            .collect();
        for (session_id, peer, set_id) in expired {
            self.pending_receipts.remove(&session_id);
            self.evict_dead_router(peer, set_id).await;
        }
    }

    /// Removes `peer` from the physical table, broadcasts a `DeadRouter`
    /// notice, and invokes the user hook (§4.5).
    async fn evict_dead_router(&self, peer: PhysicalEndpoint, set_id: Uuid) {
        self.physical_routes.remove(&peer);
        self.logical_routes.remove_peer(&peer);
        tracing::warn!(dead_ep = %peer, "evicting dead router");

        let notice = DeadRouterNotice {
            dead_ep: peer.clone(),
            dead_set_id: set_id,
        };
        if let Ok(body) = self.codec.encode_body(&notice) {
            let env = Envelope::new(
                DeadRouterNotice::TYPE_TAG,
                Endpoint::Physical(self.self_ep.clone()),
                Endpoint::Physical(self.self_ep.clone()).with_segment_appended("*"),
                body,
            );
            if let Ok(bytes) = self.codec.encode_envelope(&env) {
                let guard = self.advertise_socket.lock().await;
                if let (Some(socket), Some(target)) = (guard.as_ref(), *self.advertise_target.read()) {
                    let _ = socket.send_to(&bytes, target).await;
                }
            }
        }

        if let Some(hook) = self.dead_router_hook.read().clone() {
            hook(peer, set_id);
        }
    }

    async fn handle_inbound(self: Arc<Router>, from_channel: ChannelEndpoint, bytes: Vec<u8>) {
        let env = match self.codec.decode_envelope(&bytes) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, from = %from_channel, "dropping undecodable envelope");
                return;
            }
        };

        if env.expired(std::time::SystemTime::now()) {
            tracing::debug!(session = %env.session_id, "dropping expired envelope");
            return;
        }

        match env.type_tag {
            t if t == RouterAdvertise::TYPE_TAG => self.handle_advertise(env).await,
            t if t == DeadRouterNotice::TYPE_TAG => self.handle_dead_router_notice(env).await,
            t if t == RouterStop::TYPE_TAG => self.handle_router_stop(env).await,
            t if t == Receipt::TYPE_TAG => self.handle_receipt(env).await,
            _ => self.route_inbound(env).await,
        }
    }

    async fn handle_advertise(self: &Arc<Router>, env: Envelope) {
        let Ok(adv) = self.codec.decode_body::<RouterAdvertise>(&env.body) else {
            return;
        };
        if adv.router_ep == self.self_ep {
            return;
        }
        let changed = self.physical_routes.set_id_changed(&adv.router_ep, adv.set_id);
        let distance = match self.role {
            RouterRole::Leaf => 1,
            RouterRole::Hub => 1,
            RouterRole::Root => 2,
        };
        let filtered: Vec<LogicalEndpoint> = adv
            .logical_eps
            .into_iter()
            .filter(|ep| self.passes_uplink_downlink_filter(ep))
            .collect();

        // A leaf only dials a sibling leaf's advertised channel directly
        // when P2P is enabled; otherwise sibling traffic stays relayed
        // through the hub and this advert is used for logical-route and
        // liveness bookkeeping only (§4 "P2P mode").
        let sibling_leaf_without_p2p =
            self.role == RouterRole::Leaf && adv.role == RouterRoleWire::Leaf && !self.config.enable_p2p;
        if !sibling_leaf_without_p2p {
            if let Some(channel_ep) = adv.channels.first().and_then(|c| c.parse::<ChannelEndpoint>().ok()) {
                if let Ok(chan) = self.dial(channel_ep).await {
                    self.physical_routes.upsert(adv.router_ep.clone(), chan, adv.set_id);
                }
            }
        }
        if changed {
            self.logical_routes.replace_for_peer(&adv.router_ep, &filtered, distance);
            tracing::debug!(peer = %adv.router_ep, "re-synced logical routes after set-id change");
        }
    }

    fn passes_uplink_downlink_filter(&self, ep: &LogicalEndpoint) -> bool {
        let filters = match self.role {
            RouterRole::Hub => &self.downlink_eps,
            RouterRole::Root => &self.uplink_eps,
            RouterRole::Leaf => return true,
        };
        filters.is_empty() || filters.iter().any(|f| f.logical_match(ep))
    }

    async fn handle_dead_router_notice(&self, env: Envelope) {
        let Ok(notice) = self.codec.decode_body::<DeadRouterNotice>(&env.body) else {
            return;
        };
        self.physical_routes.remove(&notice.dead_ep);
        self.logical_routes.remove_peer(&notice.dead_ep);
        if let Some(hook) = self.dead_router_hook.read().clone() {
            hook(notice.dead_ep, notice.dead_set_id);
        }
    }

    async fn handle_router_stop(&self, env: Envelope) {
        let Ok(stop) = self.codec.decode_body::<RouterStop>(&env.body) else {
            return;
        };
        self.physical_routes.remove(&stop.router_ep);
        self.logical_routes.remove_peer(&stop.router_ep);
    }

    async fn handle_receipt(&self, env: Envelope) {
        let Ok(receipt) = self.codec.decode_body::<Receipt>(&env.body) else {
            return;
        };
        self.pending_receipts.remove(&receipt.for_session);
    }

    /// Dispatches a non-control envelope addressed here, or forwards it
    /// onward, mirroring `SendTo`'s numbered steps with `self` already
    /// substituted for step 1's destination.
    ///
    /// A hop acknowledges a `ReceiptRequest` the moment it receives the
    /// envelope regardless of whether it is the terminal router (receipts
    /// are per-hop, not per-destination), but only the terminal router
    /// intercepts sessions or hands the envelope to the dispatcher — a
    /// Hub or Root that isn't the destination re-enters `send_to` so the
    /// envelope keeps moving toward it (§4.5 steps 2-7; "otherwise all
    /// inter-leaf traffic is relayed through the hub").
    async fn route_inbound(self: Arc<Router>, env: Envelope) {
        if env.flags.contains(MessageFlags::RECEIPT_REQUEST) && !env.flags.contains(MessageFlags::NOT_RECEIPT) {
            self.send_receipt_for(&env).await;
        }

        if !self.is_addressed_to_self(&env.to_ep) {
            let to = env.to_ep.clone();
            if let Err(e) = self.send_to(to, env).await {
                tracing::debug!(error = %e, "failed to forward inbound envelope onward");
            }
            return;
        }

        let reply_sink: Arc<dyn ReplySink> = Arc::new(DirectReply {
            router: self.clone(),
            to: env.from_ep.clone(),
            session_id: env.session_id,
        });

        if let Some(intercept) = self.session_intercept.read().clone() {
            if intercept.try_handle(env.clone(), reply_sink.clone()) {
                return;
            }
        }

        self.dispatcher.dispatch(Delivery::new(env, reply_sink));
    }

    /// Whether `to` names this router: a physical match against
    /// [`Router::self_ep`], or a logical endpoint matching one of the
    /// patterns this router serves locally (§4.5 step 2, step 3's implicit
    /// distance-0 case).
    fn is_addressed_to_self(&self, to: &Endpoint) -> bool {
        match to {
            Endpoint::Physical(p) => p.physical_match(&self.self_ep),
            Endpoint::Logical(l) => self.local_logical_eps.read().iter().any(|pattern| pattern.logical_match(l)),
        }
    }

    /// Acknowledges a `ReceiptRequest`-flagged envelope. The receipt
    /// itself carries `NotReceipt` so it can never loop.
    async fn send_receipt_for(self: &Arc<Router>, env: &Envelope) {
        let receipt = Receipt {
            for_session: env.session_id,
        };
        let Ok(body) = self.codec.encode_body(&receipt) else {
            return;
        };
        let mut reply = Envelope::new(
            Receipt::TYPE_TAG,
            Endpoint::Physical(self.self_ep.clone()),
            env.from_ep.clone(),
            body,
        )
        .with_session(env.session_id);
        reply.flags.set(MessageFlags::NOT_RECEIPT, true);
        if let Err(e) = self.send_to(env.from_ep.clone(), reply).await {
            tracing::debug!(error = %e, to = %env.from_ep, "failed to send receipt");
        }
    }

    /// `SendTo` (§4.5): rewrite abstract endpoints, dispatch locally,
    /// fan out broadcasts, pick the lowest-distance logical route, fall
    /// back to a direct physical route, or forward upward. TTL is
    /// decremented once per hop; split-horizon is honored except for
    /// receipts.
    pub async fn send_to(self: &Arc<Router>, to: Endpoint, mut env: Envelope) -> Result<(), FabricError> {
        env.to_ep = to.clone();
        if !env.decrement_ttl() && env.type_tag != Receipt::TYPE_TAG {
            tracing::trace!(to = %to, "dropping envelope: ttl exhausted");
            return Ok(());
        }

        match &to {
            Endpoint::Physical(p) if p.physical_match(&self.self_ep) => {
                self.route_inbound(env).await;
                return Ok(());
            }
            Endpoint::Logical(l) => {
                let matches = self.logical_routes.matching(l);
                if !matches.is_empty() {
                    if l.broadcast || env.flags.contains(MessageFlags::BROADCAST) {
                        for m in matches {
                            self.send_to_physical_route(&m.physical_ep, env.clone()).await?;
                        }
                        return Ok(());
                    }
                    let best = &matches[0];
                    return self.send_to_physical_route(&best.physical_ep, env).await;
                }
                // No known route for this pattern yet; fall through to the
                // uplink forward below instead of failing outright, so a
                // Hub/Root that hasn't synced a distant leaf's advertise can
                // still relay toward a parent that might know it.
            }
            Endpoint::Physical(p) => {
                if self.physical_routes.contains(p) {
                    return self.send_to_physical_route(p, env).await;
                }
            }
        }

        // No direct route: forward upward if we have a parent (a leaf's
        // hub, or a hub's root).
        if let Some(parent) = self.parent_channel.read().clone() {
            let bytes = self.codec.encode_envelope(&env)?;
            parent.transmit(&bytes).await.inspect_err(|e| {
                tracing::warn!(error = %e, "uplink transmit failed");
            })?;
            return Ok(());
        }

        Err(FabricError::NoRoute(to.to_string()))
    }

    async fn send_to_physical_route(self: &Arc<Router>, peer: &PhysicalEndpoint, env: Envelope) -> Result<(), FabricError> {
        let Some(entry) = self.physical_routes.get(peer) else {
            return Err(FabricError::NoRoute(peer.to_string()));
        };
        if env.flags.contains(MessageFlags::RECEIPT_REQUEST) && !env.flags.contains(MessageFlags::NOT_RECEIPT) {
            self.pending_receipts.insert(
                env.session_id,
                PendingReceipt {
                    peer: peer.clone(),
                    set_id: entry.logical_set_id,
                    deadline: tokio::time::Instant::now() + self.config.receipt_delay,
                },
            );
        }
        let bytes = self.codec.encode_envelope(&env)?;
        entry.channel.transmit(&bytes).await
    }

    async fn dial(self: &Arc<Router>, channel_ep: ChannelEndpoint) -> Result<Arc<dyn Channel>, FabricError> {
        if let Some(existing) = self.channels.get(&channel_ep) {
            return Ok(existing);
        }
        match channel_ep.transport {
            Transport::Tcp => {
                let addr = SocketAddr::new(channel_ep.addr, channel_ep.port);
                let this = self.clone();
                let on_receive: InboundCallback = Arc::new(move |peer, bytes| {
                    let this = this.clone();
                    tokio::spawn(async move { this.handle_inbound(peer, bytes).await });
                });
                let chan = TcpChannel::connect(addr, on_receive).await?;
                self.channels.insert(chan.clone());
                Ok(chan as Arc<dyn Channel>)
            }
            _ => Err(FabricError::NoRoute(format!("no dial strategy for {channel_ep}"))),
        }
    }

    /// Graceful shutdown: emits `RouterStop`, drains dispatcher in-flight
    /// work up to a bounded deadline, then stops (§4.5, §7).
    pub async fn stop(self: &Arc<Router>, drain_deadline: Duration) -> Result<(), FabricError> {
        self.set_state(RouterState::Stopping);
        let stop_msg = RouterStop {
            router_ep: self.self_ep.clone(),
        };
        if let Ok(body) = self.codec.encode_body(&stop_msg) {
            let env = Envelope::new(
                RouterStop::TYPE_TAG,
                Endpoint::Physical(self.self_ep.clone()),
                Endpoint::Physical(self.self_ep.clone()).with_segment_appended("*"),
                body,
            );
            if let Ok(bytes) = self.codec.encode_envelope(&env) {
                let guard = self.advertise_socket.lock().await;
                if let (Some(socket), Some(target)) = (guard.as_ref(), *self.advertise_target.read()) {
                    let _ = socket.send_to(&bytes, target).await;
                }
            }
        }

        let start = tokio::time::Instant::now();
        while self.dispatcher.inflight_count() > 0 && start.elapsed() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.set_state(RouterState::Stopped);
        Ok(())
    }
}

struct DirectReply {
    router: Arc<Router>,
    to: Endpoint,
    session_id: Uuid,
}

impl ReplySink for DirectReply {
    fn reply(&self, body: Vec<u8>) {
        self.send_session_reply(body, None);
    }

    fn fault(&self, message: String) {
        self.send_session_reply(Vec::new(), Some(message));
    }
}

impl DirectReply {
    fn send_session_reply(&self, body: Vec<u8>, exception: Option<String>) {
        let router = self.router.clone();
        let to = self.to.clone();
        let session_id = self.session_id;
        tokio::spawn(async move {
            let reply = crate::session::control::SessionReply {
                session_id,
                body,
                exception,
            };
            let Ok(reply_body) = router.codec.encode_body(&reply) else {
                return;
            };
            let env = Envelope::new(
                crate::message::types::TAG_SESSION_REPLY,
                Endpoint::Physical(router.self_ep.clone()),
                to.clone(),
                reply_body,
            )
            .with_session(session_id);
            let _ = router.send_to(to, env).await;
        });
    }
}

fn parse_self_ep(config: &Config) -> Result<PhysicalEndpoint, FabricError> {
    match Endpoint::parse(&config.router_ep)? {
        Endpoint::Physical(p) => Ok(p),
        Endpoint::Logical(_) => Err(FabricError::Configuration(
            "RouterEP must be a physical endpoint".into(),
        )),
    }
}

fn parse_ep_list(raw: &[String]) -> Result<Vec<LogicalEndpoint>, FabricError> {
    raw.iter()
        .map(|s| match Endpoint::parse(s)? {
            Endpoint::Logical(l) => Ok(l),
            Endpoint::Physical(_) => Err(FabricError::Configuration(format!(
                "uplink/downlink filter {s} must be a logical endpoint"
            ))),
        })
        .collect()
}

fn this_backlog() -> u32 {
    128
}

/// Stretches an operator-supplied shared-key string into the 256-bit key
/// the codec's AES-GCM encryption needs. Not a KDF in the cryptographic
/// sense — the codec treats encryption as a pluggable collaborator
/// (spec §1) and this crate supplies only the wiring, not primitives.
fn derive_key(shared_key: &str) -> [u8; 32] {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(shared_key.as_bytes());
    let digest = hasher.finalize().to_le_bytes();
    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = digest[i % digest.len()];
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(ep: &str) -> Config {
        let mut c = Config::default();
        c.router_ep = ep.to_string();
        c.tcp_ep = None;
        c.udp_ep = Some("udp://127.0.0.1:0".to_string());
        c
    }

    #[test]
    fn new_router_starts_stopped() {
        let handle = Router::new(test_config("physical://root1/hubA/leaf1"), RouterRole::Leaf).unwrap();
        assert_eq!(handle.state(), RouterState::Stopped);
    }

    #[test]
    fn local_logical_registration_bumps_set_id() {
        let handle = Router::new(test_config("physical://root1/hubA/leaf1"), RouterRole::Leaf).unwrap();
        let before = handle.logical_set_id();
        handle.add_local_logical_ep(LogicalEndpoint::new(vec!["svc".into()]));
        assert_ne!(before, handle.logical_set_id());
    }

    /// Records every payload handed to `transmit` so a test can assert a
    /// Hub actually forwarded an envelope onto a child's channel.
    struct RecordingChannel {
        ep: ChannelEndpoint,
        sent: std::sync::Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl Channel for RecordingChannel {
        fn endpoint(&self) -> ChannelEndpoint {
            self.ep
        }

        async fn transmit(&self, payload: &[u8]) -> Result<(), FabricError> {
            self.sent.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    fn recording_channel(port: u16) -> Arc<RecordingChannel> {
        Arc::new(RecordingChannel {
            ep: ChannelEndpoint::new(Transport::Tcp, std::net::IpAddr::from([127, 0, 0, 1]), port),
            sent: std::sync::Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn hub_forwards_envelope_not_addressed_to_itself() {
        let handle = Router::new(test_config("physical://root1/hubA"), RouterRole::Hub).unwrap();
        let leaf2 = PhysicalEndpoint::new("root1", -1, vec!["hubA".into(), "leaf2".into()]);
        let chan = recording_channel(9100);
        handle.physical_routes.upsert(leaf2.clone(), chan.clone(), Uuid::new_v4());

        let leaf1 = Endpoint::Physical(PhysicalEndpoint::new("root1", -1, vec!["hubA".into(), "leaf1".into()]));
        let env = Envelope::new(
            crate::message::types::TypeTag::new(*b"PING"),
            leaf1,
            Endpoint::Physical(leaf2),
            b"hello".to_vec(),
        );

        handle.0.clone().route_inbound(env).await;

        assert_eq!(chan.sent.lock().unwrap().len(), 1, "Hub must forward to Leaf2's channel instead of dispatching locally");
    }

    #[tokio::test]
    async fn hub_dispatches_locally_when_addressed_to_itself() {
        let handle = Router::new(test_config("physical://root1/hubA"), RouterRole::Hub).unwrap();
        let other = Endpoint::Physical(PhysicalEndpoint::new("root1", -1, vec!["hubA".into(), "leaf1".into()]));
        let env = Envelope::new(
            crate::message::types::TypeTag::new(*b"PING"),
            other,
            Endpoint::Physical(handle.self_ep.clone()),
            b"hello".to_vec(),
        );

        // No handler is registered; this only asserts it does NOT attempt
        // a network forward (no parent, no physical route — forwarding
        // would surface as a trace, not a panic, so the behavioral proof
        // is `is_addressed_to_self` returning true for this envelope).
        assert!(handle.is_addressed_to_self(&env.to_ep));
        handle.0.clone().route_inbound(env).await;
    }

    #[test]
    fn send_advertise_aggregates_children_logical_eps() {
        let handle = Router::new(test_config("physical://root1/hubA"), RouterRole::Hub).unwrap();
        handle.add_local_logical_ep(LogicalEndpoint::new(vec!["hub-svc".into()]));
        let leaf2 = PhysicalEndpoint::new("root1", -1, vec!["hubA".into(), "leaf2".into()]);
        handle.logical_routes.replace_for_peer(&leaf2, &[LogicalEndpoint::new(vec!["orders".into()])], 1);

        let mut aggregated = handle.local_logical_eps();
        aggregated.extend(handle.logical_routes.patterns());
        aggregated.sort();
        aggregated.dedup();

        assert!(aggregated.contains(&LogicalEndpoint::new(vec!["hub-svc".into()])));
        assert!(aggregated.contains(&LogicalEndpoint::new(vec!["orders".into()])));
    }
}
