use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::tcp::TcpChannel;
use crate::channel::Channel;
use crate::endpoint::ChannelEndpoint;

/// Owns every live channel handle a router currently holds, keyed by the
/// peer's transport-level [`ChannelEndpoint`]. Modeled on the teacher's
/// `Server` pattern of an `Arc`-shared subsystem plus an `AtomicUsize`
/// connection counter, generalized from one fixed listener to N channel
/// kinds (TCP connections are individually reaped on idle; UDP/multicast
/// channels are long-lived for the process).
pub struct ChannelRegistry {
    tcp: DashMap<ChannelEndpoint, Arc<TcpChannel>>,
    others: DashMap<ChannelEndpoint, Arc<dyn Channel>>,
    active_tcp: Arc<AtomicUsize>,
    max_idle: Duration,
}

impl ChannelRegistry {
    pub fn new(max_idle: Duration) -> Arc<ChannelRegistry> {
        Arc::new(ChannelRegistry {
            tcp: DashMap::new(),
            others: DashMap::new(),
            active_tcp: Arc::new(AtomicUsize::new(0)),
            max_idle,
        })
    }

    pub fn insert(&self, channel: Arc<TcpChannel>) {
        self.active_tcp.fetch_add(1, Ordering::Relaxed);
        self.tcp.insert(channel.endpoint(), channel);
    }

    pub fn insert_other(&self, channel: Arc<dyn Channel>) {
        self.others.insert(channel.endpoint(), channel);
    }

    pub fn get_tcp(&self, ep: &ChannelEndpoint) -> Option<Arc<TcpChannel>> {
        self.tcp.get(ep).map(|e| e.value().clone())
    }

    pub fn get(&self, ep: &ChannelEndpoint) -> Option<Arc<dyn Channel>> {
        if let Some(c) = self.tcp.get(ep) {
            return Some(c.value().clone() as Arc<dyn Channel>);
        }
        self.others.get(ep).map(|e| e.value().clone())
    }

    pub fn active_tcp_count(&self) -> usize {
        self.active_tcp.load(Ordering::Relaxed)
    }

    /// Closes every TCP connection idle past `max_idle`. Intended to be
    /// driven off the router's shared `BkInterval` timer task.
    pub fn reap_idle(&self) {
        let stale: Vec<ChannelEndpoint> = self
            .tcp
            .iter()
            .filter(|e| e.value().idle_for() > self.max_idle)
            .map(|e| *e.key())
            .collect();
        for ep in stale {
            if self.tcp.remove(&ep).is_some() {
                self.active_tcp.fetch_sub(1, Ordering::Relaxed);
                tracing::debug!(%ep, "reaped idle tcp channel");
            }
        }
    }

    pub fn remove(&self, ep: &ChannelEndpoint) {
        if self.tcp.remove(ep).is_some() {
            self.active_tcp.fetch_sub(1, Ordering::Relaxed);
        }
        self.others.remove(ep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Transport;
    use std::net::IpAddr;

    #[test]
    fn empty_registry_reports_zero_active() {
        let reg = ChannelRegistry::new(Duration::from_secs(60));
        assert_eq!(reg.active_tcp_count(), 0);
        let ep = ChannelEndpoint::new(Transport::Tcp, IpAddr::from([127, 0, 0, 1]), 9000);
        assert!(reg.get(&ep).is_none());
    }
}
