use serde::{Deserialize, Serialize};
use std::fmt;

use crate::endpoint::channel_ep::ChannelEndpoint;
use crate::endpoint::escape::{escape, unescape};
use crate::error::FabricError;

/// `physical://ROOT[:PORT][/seg1/seg2…][?c=channelEP][&o=objectID][&broadcast]`
///
/// A physical endpoint with no host and no segments but with a channel is a
/// "channel physical" — it names a transport address rather than a router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysicalEndpoint {
    pub root_host: String,
    pub root_port: i32,
    pub segments: Vec<String>,
    pub channel_ep: Option<ChannelEndpoint>,
    pub object_id: Option<String>,
    pub broadcast: bool,
}

impl PhysicalEndpoint {
    pub fn new(root_host: impl Into<String>, root_port: i32, segments: Vec<String>) -> Self {
        Self {
            root_host: root_host.into().to_lowercase(),
            root_port,
            segments: segments.into_iter().map(|s| s.to_lowercase()).collect(),
            channel_ep: None,
            object_id: None,
            broadcast: false,
        }
    }

    pub fn is_channel_physical(&self) -> bool {
        self.root_host.is_empty() && self.segments.is_empty() && self.channel_ep.is_some()
    }

    pub fn with_segment_appended(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into().to_lowercase());
        Self {
            segments,
            ..self.clone()
        }
    }

    pub fn with_channel(mut self, ch: ChannelEndpoint) -> Self {
        self.channel_ep = Some(ch);
        self
    }

    pub fn with_object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Strict equality: roots and segments equal; channel and objectID ignored.
    pub fn physical_match(&self, other: &PhysicalEndpoint) -> bool {
        self.root_host == other.root_host
            && self.root_port == other.root_port
            && self.segments == other.segments
    }

    /// `self` is a strict prefix of `other` under the same root.
    pub fn is_descendant_of(&self, other: &PhysicalEndpoint) -> bool {
        self.root_host == other.root_host
            && self.root_port == other.root_port
            && other.segments.len() > self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// Same root and same parent segments; differ only in the last segment.
    pub fn is_peer_of(&self, other: &PhysicalEndpoint) -> bool {
        if self.root_host != other.root_host || self.root_port != other.root_port {
            return false;
        }
        if self.segments.len() != other.segments.len() || self.segments.is_empty() {
            return false;
        }
        let last = self.segments.len() - 1;
        self.segments[..last] == other.segments[..last] && self.segments[last] != other.segments[last]
    }

    /// Loose equality: ignores `broadcast`.
    pub fn equals(&self, other: &PhysicalEndpoint) -> bool {
        self.root_host == other.root_host
            && self.root_port == other.root_port
            && self.segments == other.segments
            && self.channel_ep == other.channel_ep
            && self.object_id == other.object_id
    }

    fn canonical_string(&self, include_broadcast: bool) -> String {
        let mut s = String::from("physical://");
        s.push_str(&self.root_host);
        if self.root_port >= 0 {
            s.push(':');
            s.push_str(&self.root_port.to_string());
        }
        for seg in &self.segments {
            s.push('/');
            s.push_str(&escape(seg));
        }
        let mut query: Vec<String> = Vec::new();
        if let Some(ch) = &self.channel_ep {
            query.push(format!("c={}", escape(&ch.to_string())));
        }
        if let Some(obj) = &self.object_id {
            query.push(format!("o={}", escape(obj)));
        }
        if include_broadcast && self.broadcast {
            query.push("broadcast".to_string());
        }
        if !query.is_empty() {
            s.push('?');
            s.push_str(&query.join("&"));
        }
        s
    }
}

impl fmt::Display for PhysicalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_string(true))
    }
}

/// Total, strict ordering: lexicographic over the canonical string,
/// `broadcast` included.
impl PartialOrd for PhysicalEndpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PhysicalEndpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical_string(true).cmp(&other.canonical_string(true))
    }
}

pub fn parse(body: &str) -> Result<PhysicalEndpoint, FabricError> {
    let (path, query) = match body.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (body, None),
    };
    let path = path.strip_suffix('/').unwrap_or(path);

    let (authority, seg_part) = match path.split_once('/') {
        Some((a, s)) => (a, Some(s)),
        None => (path, None),
    };

    let (root_host, root_port) = if let Some((h, p)) = authority.rsplit_once(':') {
        let port: i32 = p
            .parse()
            .map_err(|_| FabricError::malformed(format!("non-numeric port {p:?}")))?;
        (h.to_lowercase(), port)
    } else {
        (authority.to_lowercase(), -1)
    };

    let mut segments = Vec::new();
    if let Some(seg_part) = seg_part {
        if !seg_part.is_empty() {
            for raw in seg_part.split('/') {
                if raw.is_empty() {
                    return Err(FabricError::malformed("empty segment in physical endpoint"));
                }
                segments.push(
                    unescape(raw)
                        .map_err(FabricError::malformed)?
                        .to_lowercase(),
                );
            }
        }
    }

    let mut ep = PhysicalEndpoint {
        root_host,
        root_port,
        segments,
        channel_ep: None,
        object_id: None,
        broadcast: false,
    };

    if let Some(query) = query {
        if !query.is_empty() {
            for kv in query.split('&') {
                if kv == "broadcast" {
                    ep.broadcast = true;
                    continue;
                }
                let (key, val) = kv
                    .split_once('=')
                    .ok_or_else(|| FabricError::malformed(format!("malformed query item {kv:?}")))?;
                let val = unescape(val).map_err(FabricError::malformed)?;
                match key {
                    "c" => ep.channel_ep = Some(val.parse()?),
                    "o" => ep.object_id = Some(val),
                    other => {
                        return Err(FabricError::malformed(format!("unknown query key {other:?}")))
                    }
                }
            }
        }
    }

    Ok(ep)
}
