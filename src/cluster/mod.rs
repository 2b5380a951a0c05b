//! Cluster membership: broadcast/election leader state machine, replicated
//! global properties, and lifecycle events (§4.7).
//!
//! The protocol is deliberately not gossip-based — a master broadcasts,
//! slaves reply, and a missing master triggers election by timeout. The
//! `Member`/mode vocabulary is borrowed from the teacher's SWIM module
//! (see `cluster::types` doc comment) purely as a shape to reuse; no
//! suspicion mechanism or incarnation counter is introduced.

pub mod types;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::dispatch::{Dispatcher, DispatchTarget, Scope};
use crate::endpoint::{Endpoint, LogicalEndpoint, PhysicalEndpoint};
use crate::error::FabricError;
use crate::message::types::MessageType;
use crate::router::{RouterHandle, TickHook};

use types::{ClusterStatus, ElectionCall, MemberStatus};
pub use types::{ClusterMode, MemberState};

/// Lifecycle events surfaced to user code (§4.7).
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    StateChange(MemberState, MemberState),
    ClusterStatusUpdate(ClusterStatus),
    /// Fires just before this member serializes its status — callers may
    /// adjust `properties()` in response before the status goes out.
    StatusTransmission,
    MasterTask,
    SlaveTask,
}

pub type ClusterEventHook = Arc<dyn Fn(ClusterEvent) + Send + Sync>;

#[derive(Default)]
struct Timers {
    since_master_broadcast: Duration,
    since_slave_update: Duration,
    since_warmup: Duration,
    since_election: Duration,
}

struct MemberRecord {
    status: MemberStatus,
    last_seen: Instant,
}

/// One instance's membership state machine, stacked on a [`RouterHandle`].
/// Cluster traffic rides the fabric itself as broadcast deliveries to a
/// reserved logical pattern (`ClusterBaseEP`, default `logical://__cluster__`).
pub struct ClusterMember {
    router: RouterHandle,
    base_logical: LogicalEndpoint,
    instance_ep: PhysicalEndpoint,
    mode: ClusterMode,
    state: AtomicU8,
    started_at: SystemTime,
    properties: RwLock<BTreeMap<String, String>>,
    known_master: RwLock<Option<PhysicalEndpoint>>,
    last_master_seen: Mutex<Instant>,
    members: DashMap<PhysicalEndpoint, MemberRecord>,
    global_properties: RwLock<BTreeMap<String, String>>,
    election_responses: DashMap<PhysicalEndpoint, ClusterMode>,
    timers: Mutex<Timers>,
    event_hook: RwLock<Option<ClusterEventHook>>,

    master_broadcast_interval: Duration,
    slave_update_interval: Duration,
    missing_master_interval: Duration,
    missing_slave_interval: Duration,
    election_interval: Duration,
}

fn state_from_u8(v: u8) -> MemberState {
    match v {
        1 => MemberState::Warmup,
        2 => MemberState::Election,
        3 => MemberState::Master,
        4 => MemberState::Slave,
        _ => MemberState::Stopped,
    }
}

fn mode_from_str(s: &str) -> ClusterMode {
    match s {
        "Observer" => ClusterMode::Observer,
        "Monitor" => ClusterMode::Monitor,
        "PreferMaster" => ClusterMode::PreferMaster,
        "PreferSlave" => ClusterMode::PreferSlave,
        _ => ClusterMode::Normal,
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl ClusterMember {
    pub fn new(router: RouterHandle, config: &Config) -> Result<Arc<ClusterMember>, FabricError> {
        let base_logical = match config.cluster_base_ep.as_deref() {
            Some(raw) => match Endpoint::parse(raw)? {
                Endpoint::Logical(l) => l,
                Endpoint::Physical(_) => {
                    return Err(FabricError::Configuration("ClusterBaseEP must be a logical endpoint".into()))
                }
            },
            None => LogicalEndpoint::new(vec!["__cluster__".into()]),
        };

        let member = Arc::new(ClusterMember {
            instance_ep: router.self_ep.clone(),
            router,
            base_logical,
            mode: mode_from_str(&config.cluster_mode),
            state: AtomicU8::new(MemberState::Stopped as u8),
            started_at: SystemTime::now(),
            properties: RwLock::new(BTreeMap::new()),
            known_master: RwLock::new(None),
            last_master_seen: Mutex::new(Instant::now()),
            members: DashMap::new(),
            global_properties: RwLock::new(BTreeMap::new()),
            election_responses: DashMap::new(),
            timers: Mutex::new(Timers::default()),
            event_hook: RwLock::new(None),
            master_broadcast_interval: config.master_broadcast_interval,
            slave_update_interval: config.slave_update_interval,
            missing_master_interval: config.missing_master_interval(),
            missing_slave_interval: config.missing_slave_interval(),
            election_interval: config.election_interval,
        });

        member.router.add_local_logical_ep(member.base_logical.clone());
        member.router.dispatcher.add_target(member.clone(), None)?;

        let hook_member = member.clone();
        let tick_interval = member.router.config.bk_interval;
        let hook: TickHook = Arc::new(move || {
            let hook_member = hook_member.clone();
            Box::pin(async move { hook_member.on_tick(tick_interval).await })
        });
        member.router.register_tick_hook(hook);

        member.set_state(MemberState::Warmup);
        Ok(member)
    }

    pub fn on_event(&self, hook: ClusterEventHook) {
        *self.event_hook.write() = Some(hook);
    }

    pub fn state(&self) -> MemberState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, new: MemberState) {
        let orig = self.state();
        self.state.store(new as u8, Ordering::Release);
        if orig != new {
            self.fire(ClusterEvent::StateChange(orig, new));
        }
    }

    fn fire(&self, event: ClusterEvent) {
        if let Some(hook) = self.event_hook.read().clone() {
            hook(event);
        }
    }

    /// Sets a local property (case folded to lowercase per §3.5's
    /// case-insensitive key rule).
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.write().insert(key.into().to_lowercase(), value.into());
    }

    pub fn properties(&self) -> BTreeMap<String, String> {
        self.properties.read().clone()
    }

    pub fn master_ep(&self) -> Option<PhysicalEndpoint> {
        self.known_master.read().clone()
    }

    /// Snapshot of the cluster as last observed (master's own view on a
    /// master, replicated view on a slave).
    pub fn cluster_status(&self) -> ClusterStatus {
        ClusterStatus {
            master_ep: self.known_master.read().clone().unwrap_or_else(|| self.instance_ep.clone()),
            // Monitor members are never electable and never visible in the
            // cluster-wide snapshot (§4.7); Observer members stay visible,
            // just excluded from election (filtered separately where that
            // matters).
            members: self
                .members
                .iter()
                .filter(|e| e.value().status.mode != ClusterMode::Monitor)
                .map(|e| (e.key().clone(), e.value().status.clone()))
                .collect(),
            global_properties: self.global_properties.read().clone(),
        }
    }

    /// Master-only: sets a global property, replicated on the next
    /// broadcast. A slave's call is a no-op — global edits are the
    /// master's authority alone (§4.7).
    pub fn global_set(&self, key: impl Into<String>, value: impl Into<String>) {
        if self.state() == MemberState::Master {
            self.global_properties.write().insert(key.into().to_lowercase(), value.into());
        }
    }

    pub fn global_get(&self, key: &str) -> Option<String> {
        self.global_properties.read().get(&key.to_lowercase()).cloned()
    }

    pub fn global_remove(&self, key: &str) {
        if self.state() == MemberState::Master {
            self.global_properties.write().remove(&key.to_lowercase());
        }
    }

    pub fn global_clear(&self) {
        if self.state() == MemberState::Master {
            self.global_properties.write().clear();
        }
    }

    fn my_status(&self) -> MemberStatus {
        MemberStatus {
            instance_ep: self.instance_ep.clone(),
            mode: self.mode,
            state: self.state(),
            properties: self.properties(),
            online_time: self
                .started_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
        }
    }

    async fn broadcast(&self, env_body: Vec<u8>, type_tag: crate::message::types::TypeTag) {
        let to = Endpoint::Logical(self.base_logical.clone().with_broadcast(true));
        let env = crate::message::envelope::Envelope::new(
            type_tag,
            Endpoint::Physical(self.instance_ep.clone()),
            to.clone(),
            env_body,
        )
        .with_ttl(self.router.config.def_msg_ttl);
        if let Err(e) = self.router.send_to(to, env).await {
            tracing::debug!(error = %e, "cluster broadcast had no peers to reach");
        }
    }

    async fn send_election_call(&self) {
        self.fire(ClusterEvent::StatusTransmission);
        let call = ElectionCall {
            candidate_ep: self.instance_ep.clone(),
            mode: self.mode,
        };
        if let Ok(body) = self.router.codec.encode_body(&call) {
            self.broadcast(body, ElectionCall::TYPE_TAG).await;
        }
    }

    async fn send_cluster_status(&self) {
        self.fire(ClusterEvent::StatusTransmission);
        let status = self.cluster_status();
        if let Ok(body) = self.router.codec.encode_body(&status) {
            self.broadcast(body, ClusterStatus::TYPE_TAG).await;
        }
    }

    async fn send_slave_status(&self) {
        self.fire(ClusterEvent::StatusTransmission);
        let status = types::SlaveStatus {
            status: self.my_status(),
        };
        if let Ok(body) = self.router.codec.encode_body(&status) {
            self.broadcast(body, types::SlaveStatus::TYPE_TAG).await;
        }
    }

    /// Runs the state machine one tick (driven by the router's shared
    /// background timer; see `Router::register_tick_hook`).
    async fn on_tick(self: Arc<Self>, bk_interval: Duration) {
        match self.state() {
            MemberState::Stopped => {}
            MemberState::Warmup => {
                let elapsed = {
                    let mut t = self.timers.lock();
                    t.since_warmup += bk_interval;
                    t.since_warmup
                };
                if elapsed >= self.missing_master_interval {
                    self.enter_election().await;
                }
            }
            MemberState::Election => {
                let elapsed = {
                    let mut t = self.timers.lock();
                    t.since_election += bk_interval;
                    t.since_election
                };
                if elapsed >= self.election_interval {
                    self.resolve_election().await;
                }
            }
            MemberState::Master => {
                let due = {
                    let mut t = self.timers.lock();
                    t.since_master_broadcast += bk_interval;
                    if t.since_master_broadcast >= self.master_broadcast_interval {
                        t.since_master_broadcast = Duration::ZERO;
                        true
                    } else {
                        false
                    }
                };
                if due {
                    self.evict_missing_members();
                    self.send_cluster_status().await;
                    self.fire(ClusterEvent::MasterTask);
                }
            }
            MemberState::Slave => {
                let (slave_due, master_missing) = {
                    let mut t = self.timers.lock();
                    t.since_slave_update += bk_interval;
                    let slave_due = t.since_slave_update >= self.slave_update_interval;
                    if slave_due {
                        t.since_slave_update = Duration::ZERO;
                    }
                    (slave_due, self.last_master_seen.lock().elapsed() >= self.missing_master_interval)
                };
                if master_missing {
                    self.enter_election().await;
                    return;
                }
                if slave_due {
                    self.send_slave_status().await;
                    self.fire(ClusterEvent::SlaveTask);
                }
            }
        }
    }

    async fn enter_election(&self) {
        self.election_responses.clear();
        self.election_responses.insert(self.instance_ep.clone(), self.mode);
        self.timers.lock().since_election = Duration::ZERO;
        self.set_state(MemberState::Election);
        self.send_election_call().await;
    }

    async fn resolve_election(&self) {
        let candidates: Vec<(PhysicalEndpoint, ClusterMode)> = self
            .election_responses
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        self.election_responses.clear();

        let winner = elect_master(&candidates);
        match winner {
            Some(ep) if ep == self.instance_ep => {
                self.members.clear();
                self.members.insert(
                    self.instance_ep.clone(),
                    MemberRecord {
                        status: self.my_status(),
                        last_seen: Instant::now(),
                    },
                );
                *self.known_master.write() = Some(self.instance_ep.clone());
                self.timers.lock().since_master_broadcast = Duration::ZERO;
                self.set_state(MemberState::Master);
                self.send_cluster_status().await;
            }
            Some(ep) => {
                *self.known_master.write() = Some(ep);
                *self.last_master_seen.lock() = Instant::now();
                self.timers.lock().since_slave_update = Duration::ZERO;
                self.set_state(MemberState::Slave);
            }
            None => {
                // Nobody eligible responded (e.g. only Observers/Monitors
                // are alive): stay in warmup and try again.
                self.timers.lock().since_warmup = Duration::ZERO;
                self.set_state(MemberState::Warmup);
            }
        }
    }

    fn evict_missing_members(&self) {
        let now = Instant::now();
        let stale: Vec<PhysicalEndpoint> = self
            .members
            .iter()
            .filter(|e| e.key() != &self.instance_ep && now.duration_since(e.value().last_seen) >= self.missing_slave_interval)
            .map(|e| e.key().clone())
            .collect();
        for ep in stale {
            self.members.remove(&ep);
        }
    }

    async fn handle_election_call(self: Arc<Self>, call: ElectionCall) {
        if call.candidate_ep == self.instance_ep {
            return;
        }
        match self.state() {
            MemberState::Master => {
                // A second master announcing itself: re-run election
                // rather than silently keep broadcasting (§4.7 "Master ->
                // Election" on observing another live master).
                self.enter_election().await;
            }
            MemberState::Warmup | MemberState::Slave => {
                self.election_responses.insert(call.candidate_ep, call.mode);
                self.enter_election().await;
            }
            MemberState::Election => {
                self.election_responses.insert(call.candidate_ep, call.mode);
            }
            MemberState::Stopped => {}
        }
    }

    async fn handle_cluster_status(self: Arc<Self>, status: ClusterStatus) {
        if status.master_ep == self.instance_ep {
            return;
        }
        *self.known_master.write() = Some(status.master_ep.clone());
        *self.last_master_seen.lock() = Instant::now();

        if self.state() == MemberState::Master && status.master_ep != self.instance_ep {
            // Partition heal: another master is alive. Re-elect.
            self.enter_election().await;
            return;
        }
        if matches!(self.state(), MemberState::Warmup | MemberState::Election) {
            self.timers.lock().since_slave_update = Duration::ZERO;
            self.set_state(MemberState::Slave);
        }

        *self.global_properties.write() = status.global_properties.clone();
        self.fire(ClusterEvent::ClusterStatusUpdate(status));
    }

    async fn handle_slave_status(self: Arc<Self>, msg: types::SlaveStatus) {
        if self.state() != MemberState::Master {
            return;
        }
        self.members.insert(
            msg.status.instance_ep.clone(),
            MemberRecord {
                status: msg.status,
                last_seen: Instant::now(),
            },
        );
    }
}

/// §4.7 election resolution: ineligible modes are dropped first, then a
/// `PreferMaster` candidate wins over everyone, a `Normal` candidate wins
/// over a lone `PreferSlave`, and ties within a tier break on the
/// lexically greatest instance endpoint.
fn elect_master(candidates: &[(PhysicalEndpoint, ClusterMode)]) -> Option<PhysicalEndpoint> {
    let eligible: Vec<&(PhysicalEndpoint, ClusterMode)> = candidates
        .iter()
        .filter(|(_, m)| !matches!(m, ClusterMode::Observer | ClusterMode::Monitor))
        .collect();

    let prefer_master: Vec<&PhysicalEndpoint> = eligible
        .iter()
        .filter(|(_, m)| *m == ClusterMode::PreferMaster)
        .map(|(ep, _)| ep)
        .collect();
    if !prefer_master.is_empty() {
        return prefer_master.into_iter().max().cloned();
    }

    let normal: Vec<&PhysicalEndpoint> = eligible
        .iter()
        .filter(|(_, m)| *m == ClusterMode::Normal)
        .map(|(ep, _)| ep)
        .collect();
    if !normal.is_empty() {
        return normal.into_iter().max().cloned();
    }

    eligible.into_iter().map(|(ep, _)| ep).max().cloned()
}

impl DispatchTarget for ClusterMember {
    fn register(self: Arc<Self>, dispatcher: &Dispatcher, scope: Option<Scope>) -> Result<(), FabricError> {
        let base = self.base_logical.clone();

        let status_target = self.clone();
        dispatcher.add_logical::<ClusterStatus, _, _>(base.clone(), scope.clone(), false, true, move |msg, _d| {
            let status_target = status_target.clone();
            async move { status_target.handle_cluster_status(msg).await }
        })?;

        let slave_target = self.clone();
        dispatcher.add_logical::<types::SlaveStatus, _, _>(base.clone(), scope.clone(), false, true, move |msg, _d| {
            let slave_target = slave_target.clone();
            async move { slave_target.handle_slave_status(msg).await }
        })?;

        let election_target = self;
        dispatcher.add_logical::<ElectionCall, _, _>(base, scope, false, true, move |msg, _d| {
            let election_target = election_target.clone();
            async move { election_target.handle_election_call(msg).await }
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(name: &str) -> PhysicalEndpoint {
        PhysicalEndpoint::new(name, -1, vec![])
    }

    #[test]
    fn prefer_master_wins_over_normal() {
        let candidates = vec![
            (ep("a"), ClusterMode::Normal),
            (ep("z"), ClusterMode::PreferMaster),
        ];
        assert_eq!(elect_master(&candidates), Some(ep("z")));
    }

    #[test]
    fn normal_beats_lone_prefer_slave() {
        let candidates = vec![(ep("m"), ClusterMode::Normal), (ep("z"), ClusterMode::PreferSlave)];
        assert_eq!(elect_master(&candidates), Some(ep("m")));
    }

    #[test]
    fn observer_and_monitor_are_never_elected() {
        let candidates = vec![
            (ep("z"), ClusterMode::Observer),
            (ep("y"), ClusterMode::Monitor),
            (ep("a"), ClusterMode::Normal),
        ];
        assert_eq!(elect_master(&candidates), Some(ep("a")));
    }

    #[test]
    fn ties_within_a_tier_break_lexically() {
        let candidates = vec![(ep("alpha"), ClusterMode::Normal), (ep("beta"), ClusterMode::Normal)];
        assert_eq!(elect_master(&candidates), Some(ep("beta")));
    }

    #[test]
    fn all_ineligible_yields_no_winner() {
        let candidates = vec![(ep("a"), ClusterMode::Monitor)];
        assert_eq!(elect_master(&candidates), None);
    }

    fn test_router() -> crate::router::RouterHandle {
        let mut c = Config::default();
        c.router_ep = "physical://root1/hubA/leaf1".to_string();
        c.tcp_ep = None;
        c.udp_ep = Some("udp://127.0.0.1:0".to_string());
        c.cluster_base_ep = Some("logical://__cluster__".to_string());
        crate::router::Router::new(c, crate::router::RouterRole::Leaf).unwrap()
    }

    #[tokio::test]
    async fn monitor_members_are_invisible_in_cluster_status() {
        let router = test_router();
        let config = Config {
            cluster_base_ep: Some("logical://__cluster__".to_string()),
            ..Config::default()
        };
        let member = ClusterMember::new(router, &config).unwrap();

        member.members.insert(
            ep("observer1"),
            MemberRecord {
                status: MemberStatus {
                    instance_ep: ep("observer1"),
                    mode: ClusterMode::Observer,
                    state: MemberState::Slave,
                    properties: BTreeMap::new(),
                    online_time: 0,
                },
                last_seen: Instant::now(),
            },
        );
        member.members.insert(
            ep("monitor1"),
            MemberRecord {
                status: MemberStatus {
                    instance_ep: ep("monitor1"),
                    mode: ClusterMode::Monitor,
                    state: MemberState::Slave,
                    properties: BTreeMap::new(),
                    online_time: 0,
                },
                last_seen: Instant::now(),
            },
        );

        let status = member.cluster_status();
        assert!(status.members.contains_key(&ep("observer1")));
        assert!(!status.members.contains_key(&ep("monitor1")));
    }
}
