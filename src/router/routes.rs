//! Physical and logical route tables (§3.3).
//!
//! Physical routes name a reachable peer with a current channel; logical
//! routes map a logical pattern to the set of physical endpoints that
//! serve it, each tagged with a distance (0 = local, 1 = same hub,
//! 2 = uplink). Every logical entry is kept consistent with the physical
//! table: evicting a physical route evicts every logical entry that named
//! it (invariant (b), §3.3).

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::channel::Channel;
use crate::endpoint::{LogicalEndpoint, PhysicalEndpoint};

#[derive(Clone)]
pub struct PhysicalRouteEntry {
    pub channel: Arc<dyn Channel>,
    pub last_seen: Instant,
    pub logical_set_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalRouteEntry {
    pub physical_ep: PhysicalEndpoint,
    pub distance: u8,
}

/// Physical routes keyed by peer endpoint.
#[derive(Default)]
pub struct PhysicalRoutes {
    table: DashMap<PhysicalEndpoint, PhysicalRouteEntry>,
}

impl PhysicalRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, ep: PhysicalEndpoint, channel: Arc<dyn Channel>, logical_set_id: Uuid) {
        self.table.insert(
            ep,
            PhysicalRouteEntry {
                channel,
                last_seen: Instant::now(),
                logical_set_id,
            },
        );
    }

    pub fn touch(&self, ep: &PhysicalEndpoint) {
        if let Some(mut e) = self.table.get_mut(ep) {
            e.last_seen = Instant::now();
        }
    }

    pub fn get(&self, ep: &PhysicalEndpoint) -> Option<PhysicalRouteEntry> {
        self.table.get(ep).map(|e| e.value().clone())
    }

    pub fn set_id_changed(&self, ep: &PhysicalEndpoint, new_set_id: Uuid) -> bool {
        self.table
            .get(ep)
            .map(|e| e.logical_set_id != new_set_id)
            .unwrap_or(true)
    }

    pub fn remove(&self, ep: &PhysicalEndpoint) -> Option<PhysicalRouteEntry> {
        self.table.remove(ep).map(|(_, v)| v)
    }

    pub fn count(&self) -> usize {
        self.table.len()
    }

    pub fn contains(&self, ep: &PhysicalEndpoint) -> bool {
        self.table.contains_key(ep)
    }

    pub fn iter_stale(&self, ttl: std::time::Duration) -> Vec<PhysicalEndpoint> {
        self.table
            .iter()
            .filter(|e| e.value().last_seen.elapsed() > ttl)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn all(&self) -> Vec<PhysicalEndpoint> {
        self.table.iter().map(|e| e.key().clone()).collect()
    }
}

/// Logical routes keyed by the exact pattern a peer advertised. Lookup
/// scans every pattern and tests `logical_match` against the requested
/// endpoint, since a pattern may use a trailing `*`.
#[derive(Default)]
pub struct LogicalRoutes {
    table: DashMap<LogicalEndpoint, Vec<LogicalRouteEntry>>,
}

impl LogicalRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the entire set of patterns a peer serves (invoked on
    /// receipt of a fresh advertise whose `logical-eps[]` differs from
    /// what is on file for that peer's set ID).
    pub fn replace_for_peer(&self, peer: &PhysicalEndpoint, patterns: &[LogicalEndpoint], distance: u8) {
        self.remove_peer(peer);
        for pattern in patterns {
            self.table
                .entry(pattern.clone())
                .or_default()
                .push(LogicalRouteEntry {
                    physical_ep: peer.clone(),
                    distance,
                });
        }
    }

    pub fn remove_peer(&self, peer: &PhysicalEndpoint) {
        for mut entry in self.table.iter_mut() {
            entry.value_mut().retain(|e| &e.physical_ep != peer);
        }
        self.table.retain(|_, v| !v.is_empty());
    }

    /// All physical endpoints whose advertised pattern matches `target`,
    /// deduplicated, sorted so equal-distance ties resolve by lexical
    /// endpoint order (§4.5 step 3).
    pub fn matching(&self, target: &LogicalEndpoint) -> Vec<LogicalRouteEntry> {
        let mut out = Vec::new();
        for entry in self.table.iter() {
            if entry.key().logical_match(target) {
                out.extend(entry.value().iter().cloned());
            }
        }
        out.sort_by(|a, b| {
            a.distance
                .cmp(&b.distance)
                .then_with(|| a.physical_ep.cmp(&b.physical_ep))
        });
        out.dedup_by(|a, b| a.physical_ep == b.physical_ep);
        out
    }

    /// The single lowest-distance match, tie-broken lexically.
    pub fn best_match(&self, target: &LogicalEndpoint) -> Option<LogicalRouteEntry> {
        self.matching(target).into_iter().next()
    }

    /// Every distinct pattern currently known from any peer, regardless of
    /// distance. Used to fold children's (and other peers') logical
    /// endpoints into what this router re-advertises upward/sideways, so a
    /// Hub republishes its leaves' services toward the Root and siblings
    /// instead of advertising only what it serves itself (§4.5).
    pub fn patterns(&self) -> Vec<LogicalEndpoint> {
        self.table.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PhysicalEndpoint {
        PhysicalEndpoint::new("root1", -1, vec!["hubA".into(), name.into()])
    }

    #[test]
    fn matching_picks_lowest_distance_then_lexical_order() {
        let routes = LogicalRoutes::new();
        let target = LogicalEndpoint::new(vec!["svc".into(), "*".into()]);
        routes.replace_for_peer(&peer("leafB"), &[LogicalEndpoint::new(vec!["svc".into(), "*".into()])], 1);
        routes.replace_for_peer(&peer("leafA"), &[LogicalEndpoint::new(vec!["svc".into(), "*".into()])], 0);
        let best = routes.best_match(&target).unwrap();
        assert_eq!(best.physical_ep, peer("leafA"));
        assert_eq!(best.distance, 0);
    }

    #[test]
    fn removing_peer_drops_its_logical_entries() {
        let routes = LogicalRoutes::new();
        let pattern = LogicalEndpoint::new(vec!["svc".into()]);
        routes.replace_for_peer(&peer("leafA"), &[pattern.clone()], 0);
        routes.remove_peer(&peer("leafA"));
        assert!(routes.matching(&pattern).is_empty());
    }

    #[test]
    fn physical_route_set_id_change_is_detected() {
        let table = PhysicalRoutes::new();
        let ep = peer("leafA");
        let id1 = Uuid::new_v4();
        struct Dummy(crate::endpoint::ChannelEndpoint);
        #[async_trait::async_trait]
        impl Channel for Dummy {
            fn endpoint(&self) -> crate::endpoint::ChannelEndpoint {
                self.0
            }
            async fn transmit(&self, _p: &[u8]) -> Result<(), crate::error::FabricError> {
                Ok(())
            }
        }
        let chan = Arc::new(Dummy(crate::endpoint::ChannelEndpoint::new(
            crate::endpoint::Transport::Tcp,
            std::net::IpAddr::from([127, 0, 0, 1]),
            9000,
        )));
        table.upsert(ep.clone(), chan, id1);
        assert!(!table.set_id_changed(&ep, id1));
        assert!(table.set_id_changed(&ep, Uuid::new_v4()));
    }
}
