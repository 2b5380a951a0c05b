//! Process-wide configuration snapshot (§6.4).
//!
//! `Config` is loaded once at startup and handed to a router as an
//! immutable `Arc`. Reconfiguration is an explicit reload, never a
//! live-patch — mirrors the teacher crate's struct-of-fields `Default`
//! config idiom.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMode {
    Multicast,
    UdpBroadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub router_ep: String,
    pub parent_ep: Option<String>,
    pub cloud_ep: Option<String>,
    pub discovery_mode: DiscoveryMode,
    pub udp_ep: Option<String>,
    pub tcp_ep: Option<String>,
    pub tcp_backlog: u32,
    #[serde(with = "duration_secs")]
    pub bk_interval: Duration,
    #[serde(with = "duration_secs")]
    pub max_idle: Duration,
    pub enable_p2p: bool,
    #[serde(with = "duration_secs")]
    pub advertise_time: Duration,
    #[serde(with = "duration_secs")]
    pub keep_alive_time: Duration,
    pub def_msg_ttl: u8,
    pub shared_key: Option<String>,
    #[serde(with = "duration_secs")]
    pub session_cache_time: Duration,
    pub session_retries: u32,
    #[serde(with = "duration_secs")]
    pub session_timeout: Duration,
    pub max_logical_advertise_eps: usize,
    #[serde(with = "duration_secs")]
    pub dead_router_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub receipt_delay: Duration,
    pub uplink_ep: Vec<String>,
    pub downlink_ep: Vec<String>,
    pub abstract_map: HashMap<String, String>,

    // Cluster
    pub cluster_base_ep: Option<String>,
    pub cluster_mode: String,
    #[serde(with = "duration_secs")]
    pub master_broadcast_interval: Duration,
    #[serde(with = "duration_secs")]
    pub slave_update_interval: Duration,
    pub missing_master_count: u32,
    pub missing_slave_count: u32,
    #[serde(with = "duration_secs")]
    pub election_interval: Duration,

    // Queue
    pub queue_map: Vec<String>,
    #[serde(with = "duration_secs")]
    pub flush_interval: Duration,
    #[serde(with = "duration_secs")]
    pub dead_letter_ttl: Duration,
    pub max_delivery_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            router_ep: "physical://localhost/leaf1".to_string(),
            parent_ep: None,
            cloud_ep: None,
            discovery_mode: DiscoveryMode::Multicast,
            udp_ep: Some("udp://0.0.0.0:45000".to_string()),
            tcp_ep: Some("tcp://0.0.0.0:45001".to_string()),
            tcp_backlog: 128,
            bk_interval: Duration::from_secs(1),
            max_idle: Duration::from_secs(300),
            enable_p2p: false,
            advertise_time: Duration::from_secs(15),
            keep_alive_time: Duration::from_secs(15),
            def_msg_ttl: 16,
            shared_key: None,
            session_cache_time: Duration::from_secs(120),
            session_retries: 3,
            session_timeout: Duration::from_secs(30),
            max_logical_advertise_eps: 256,
            dead_router_ttl: Duration::from_secs(45),
            receipt_delay: Duration::from_secs(10),
            uplink_ep: Vec::new(),
            downlink_ep: Vec::new(),
            abstract_map: HashMap::new(),

            cluster_base_ep: None,
            cluster_mode: "Normal".to_string(),
            master_broadcast_interval: Duration::from_secs(5),
            slave_update_interval: Duration::from_secs(5),
            missing_master_count: 3,
            missing_slave_count: 3,
            election_interval: Duration::from_secs(5),

            queue_map: Vec::new(),
            flush_interval: Duration::from_secs(5),
            dead_letter_ttl: Duration::from_secs(3600),
            max_delivery_attempts: 5,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, crate::error::FabricError> {
        toml_lite::parse(s)
    }

    /// Overrides any §6.4 key from a `ROUTER_FABRIC_<KEY>` environment
    /// variable (e.g. `ROUTER_FABRIC_ROUTER_EP`), applied after the TOML
    /// file/defaults so the environment always wins.
    pub fn apply_env_overrides(&mut self) {
        const PREFIX: &str = "ROUTER_FABRIC_";
        for (name, value) in std::env::vars() {
            let Some(key) = name.strip_prefix(PREFIX) else {
                continue;
            };
            toml_lite::apply_key(self, &key.to_lowercase(), &value);
        }
    }

    /// Renders the current snapshot back out as a flat `key = value`
    /// table in the same shape `from_toml_str` reads, so a first run
    /// with no config file on disk can seed one from the compiled-in
    /// defaults.
    pub fn to_toml_string(&self) -> String {
        let mut out = String::new();
        macro_rules! line {
            ($k:expr, $v:expr) => {
                out.push_str(&format!("{} = \"{}\"\n", $k, $v))
            };
        }
        line!("router_ep", self.router_ep);
        if let Some(v) = &self.parent_ep {
            line!("parent_ep", v);
        }
        if let Some(v) = &self.cloud_ep {
            line!("cloud_ep", v);
        }
        line!(
            "discovery_mode",
            match self.discovery_mode {
                DiscoveryMode::Multicast => "MULTICAST",
                DiscoveryMode::UdpBroadcast => "UDPBROADCAST",
            }
        );
        if let Some(v) = &self.udp_ep {
            line!("udp_ep", v);
        }
        if let Some(v) = &self.tcp_ep {
            line!("tcp_ep", v);
        }
        line!("tcp_backlog", self.tcp_backlog);
        line!("bk_interval", self.bk_interval.as_secs());
        line!("max_idle", self.max_idle.as_secs());
        line!("enable_p2p", self.enable_p2p);
        line!("advertise_time", self.advertise_time.as_secs());
        line!("keep_alive_time", self.keep_alive_time.as_secs());
        line!("def_msg_ttl", self.def_msg_ttl);
        line!("session_cache_time", self.session_cache_time.as_secs());
        line!("session_retries", self.session_retries);
        line!("session_timeout", self.session_timeout.as_secs());
        line!("max_logical_advertise_eps", self.max_logical_advertise_eps);
        line!("dead_router_ttl", self.dead_router_ttl.as_secs());
        for ep in &self.uplink_ep {
            line!("uplink_ep", ep);
        }
        for ep in &self.downlink_ep {
            line!("downlink_ep", ep);
        }
        out
    }

    pub fn missing_master_interval(&self) -> Duration {
        self.master_broadcast_interval * self.missing_master_count
    }

    pub fn missing_slave_interval(&self) -> Duration {
        self.slave_update_interval * self.missing_slave_count
    }

    /// Port discovery advertise frames are sent/received on. Derived from
    /// `udp_ep` when set; falls back to the well-known default so a
    /// router with no explicit UDP endpoint can still discover peers.
    pub fn advertise_port(&self) -> u16 {
        self.udp_ep
            .as_deref()
            .and_then(|s| s.rsplit_once(':'))
            .and_then(|(_, p)| p.parse().ok())
            .unwrap_or(45000)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// A deliberately minimal TOML reader: this crate treats configuration
/// *file parsing* (sections, nested tables, full TOML grammar) as an
/// out-of-scope collaborator (spec §1) and accepts a flat `key = value`
/// table, one assignment per line. Every recognised key from §6.4 is
/// still honoured — scope excludes the grammar, not the key list.
/// Repeating a list key (`uplink_ep`, `downlink_ep`, `queue_map`) appends
/// to that field; `abstract_map[pattern] = target` populates the map.
mod toml_lite {
    use super::{Config, DiscoveryMode};
    use crate::error::FabricError;
    use std::time::Duration;

    pub fn parse(s: &str) -> Result<Config, FabricError> {
        let mut config = Config::default();
        for line in s.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            apply_key(&mut config, key, value);
        }
        Ok(config)
    }

    pub(crate) fn apply_key(config: &mut Config, key: &str, value: &str) {
        if let Some(pattern) = key.strip_prefix("abstract_map[").and_then(|k| k.strip_suffix(']')) {
            config.abstract_map.insert(pattern.to_string(), value.to_string());
            return;
        }
        match key {
            "router_ep" => config.router_ep = value.to_string(),
            "parent_ep" => config.parent_ep = Some(value.to_string()),
            "cloud_ep" => config.cloud_ep = Some(value.to_string()),
            "discovery_mode" => {
                config.discovery_mode = match value.to_uppercase().as_str() {
                    "UDPBROADCAST" => DiscoveryMode::UdpBroadcast,
                    _ => DiscoveryMode::Multicast,
                }
            }
            "udp_ep" => config.udp_ep = Some(value.to_string()),
            "tcp_ep" => config.tcp_ep = Some(value.to_string()),
            "tcp_backlog" => config.tcp_backlog = value.parse().unwrap_or(config.tcp_backlog),
            "bk_interval" => set_secs(&mut config.bk_interval, value),
            "max_idle" => set_secs(&mut config.max_idle, value),
            "enable_p2p" => config.enable_p2p = value == "true",
            "advertise_time" => set_secs(&mut config.advertise_time, value),
            "keep_alive_time" => set_secs(&mut config.keep_alive_time, value),
            "def_msg_ttl" => config.def_msg_ttl = value.parse().unwrap_or(config.def_msg_ttl),
            "shared_key" => config.shared_key = Some(value.to_string()),
            "session_cache_time" => set_secs(&mut config.session_cache_time, value),
            "session_retries" => config.session_retries = value.parse().unwrap_or(config.session_retries),
            "session_timeout" => set_secs(&mut config.session_timeout, value),
            "max_logical_advertise_eps" => {
                config.max_logical_advertise_eps = value.parse().unwrap_or(config.max_logical_advertise_eps)
            }
            "dead_router_ttl" => set_secs(&mut config.dead_router_ttl, value),
            "receipt_delay" => set_secs(&mut config.receipt_delay, value),
            "uplink_ep" => config.uplink_ep.push(value.to_string()),
            "downlink_ep" => config.downlink_ep.push(value.to_string()),
            "cluster_base_ep" => config.cluster_base_ep = Some(value.to_string()),
            "cluster_mode" => config.cluster_mode = value.to_string(),
            "master_broadcast_interval" => set_secs(&mut config.master_broadcast_interval, value),
            "slave_update_interval" => set_secs(&mut config.slave_update_interval, value),
            "missing_master_count" => config.missing_master_count = value.parse().unwrap_or(config.missing_master_count),
            "missing_slave_count" => config.missing_slave_count = value.parse().unwrap_or(config.missing_slave_count),
            "election_interval" => set_secs(&mut config.election_interval, value),
            "queue_map" => config.queue_map.push(value.to_string()),
            "flush_interval" => set_secs(&mut config.flush_interval, value),
            "dead_letter_ttl" => set_secs(&mut config.dead_letter_ttl, value),
            "max_delivery_attempts" => {
                config.max_delivery_attempts = value.parse().unwrap_or(config.max_delivery_attempts)
            }
            _ => tracing::warn!(key, "unrecognised config key, ignoring"),
        }
    }

    fn set_secs(field: &mut Duration, value: &str) {
        if let Ok(secs) = value.parse::<u64>() {
            *field = Duration::from_secs(secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_intervals() {
        let c = Config::default();
        assert_eq!(c.missing_master_interval(), c.master_broadcast_interval * c.missing_master_count);
    }

    #[test]
    fn minimal_toml_overrides_router_ep() {
        let c = Config::from_toml_str("router_ep = \"physical://root1/hubA/leaf2\"\n").unwrap();
        assert_eq!(c.router_ep, "physical://root1/hubA/leaf2");
    }

    #[test]
    fn toml_lite_wires_every_recognised_key() {
        let raw = "\
            discovery_mode = \"UDPBROADCAST\"\n\
            enable_p2p = \"true\"\n\
            session_retries = \"7\"\n\
            uplink_ep = \"physical://root1\"\n\
            downlink_ep = \"physical://root1/hubA/leaf1\"\n\
            downlink_ep = \"physical://root1/hubA/leaf2\"\n\
            abstract_map[svc.*] = \"physical://root1/hubA/leaf1\"\n\
        ";
        let c = Config::from_toml_str(raw).unwrap();
        assert_eq!(c.discovery_mode, DiscoveryMode::UdpBroadcast);
        assert!(c.enable_p2p);
        assert_eq!(c.session_retries, 7);
        assert_eq!(c.uplink_ep, vec!["physical://root1".to_string()]);
        assert_eq!(c.downlink_ep.len(), 2);
        assert_eq!(c.abstract_map.get("svc.*").map(String::as_str), Some("physical://root1/hubA/leaf1"));
    }

    #[test]
    fn to_toml_string_round_trips_through_from_toml_str() {
        let original = Config::default();
        let rendered = original.to_toml_string();
        let reparsed = Config::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed.router_ep, original.router_ep);
        assert_eq!(reparsed.session_retries, original.session_retries);
        assert_eq!(reparsed.discovery_mode, original.discovery_mode);
    }

    #[test]
    fn env_override_wins_over_toml_and_defaults() {
        let mut c = Config::from_toml_str("router_ep = \"physical://root1/hubA/leaf2\"\n").unwrap();
        std::env::set_var("ROUTER_FABRIC_ROUTER_EP", "physical://root1/hubA/leaf9");
        c.apply_env_overrides();
        std::env::remove_var("ROUTER_FABRIC_ROUTER_EP");
        assert_eq!(c.router_ep, "physical://root1/hubA/leaf9");
    }
}
