use serde::{Deserialize, Serialize};
use std::fmt;

use crate::endpoint::escape::{escape, unescape};
use crate::error::FabricError;

pub const WILDCARD: &str = "*";
pub const NULL_SINK_SEGMENT: &str = "null";

/// `logical://seg1/seg2…[?broadcast]`
///
/// `logical://null[/…]` denotes the null sink — messages sent there are
/// silently discarded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalEndpoint {
    pub segments: Vec<String>,
    pub broadcast: bool,
}

impl LogicalEndpoint {
    pub fn new(segments: Vec<String>) -> Self {
        Self {
            segments: segments.into_iter().map(|s| s.to_lowercase()).collect(),
            broadcast: false,
        }
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn is_null_sink(&self) -> bool {
        matches!(self.segments.first(), Some(s) if s == NULL_SINK_SEGMENT)
    }

    /// Logical match: symmetric by construction — see module tests.
    pub fn logical_match(&self, other: &LogicalEndpoint) -> bool {
        logical_match_segments(&self.segments, &other.segments)
    }

    /// Loose equality: ignores `broadcast`.
    pub fn equals(&self, other: &LogicalEndpoint) -> bool {
        self.segments == other.segments
    }

    fn canonical_string(&self, include_broadcast: bool) -> String {
        let mut s = String::from("logical://");
        s.push_str(
            &self
                .segments
                .iter()
                .map(|seg| escape(seg))
                .collect::<Vec<_>>()
                .join("/"),
        );
        if include_broadcast && self.broadcast {
            s.push_str("?broadcast");
        }
        s
    }
}

/// Scans segments left-to-right. Matches when segments are equal
/// case-insensitively, one side holds a `*` (consuming the remainder of the
/// other side, including zero further segments), or both sides are
/// simultaneously exhausted.
pub fn logical_match_segments(a: &[String], b: &[String]) -> bool {
    let mut i = 0;
    loop {
        match (a.get(i), b.get(i)) {
            (Some(sa), Some(sb)) => {
                if sa == WILDCARD || sb == WILDCARD {
                    return true;
                }
                if sa != sb {
                    return false;
                }
                i += 1;
            }
            (None, None) => return true,
            (Some(sa), None) => return sa == WILDCARD,
            (None, Some(sb)) => return sb == WILDCARD,
        }
    }
}

impl fmt::Display for LogicalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_string(true))
    }
}

impl PartialOrd for LogicalEndpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogicalEndpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical_string(true).cmp(&other.canonical_string(true))
    }
}

pub fn parse(body: &str) -> Result<LogicalEndpoint, FabricError> {
    let (seg_part, query) = match body.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (body, None),
    };

    let mut segments = Vec::new();
    if !seg_part.is_empty() {
        for raw in seg_part.split('/') {
            if raw.is_empty() {
                return Err(FabricError::malformed("empty segment in logical endpoint"));
            }
            segments.push(unescape(raw).map_err(FabricError::malformed)?.to_lowercase());
        }
    }

    let mut broadcast = false;
    if let Some(query) = query {
        if query.is_empty() {
            return Err(FabricError::malformed("empty query on logical endpoint"));
        }
        for kv in query.split('&') {
            if kv == "broadcast" {
                broadcast = true;
            } else {
                return Err(FabricError::malformed(format!(
                    "unexpected query parameter on logical endpoint: {kv:?}"
                )));
            }
        }
    }

    Ok(LogicalEndpoint { segments, broadcast })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_trailing_segment() {
        let a = LogicalEndpoint::new(vec!["foo".into(), "*".into()]);
        let b = LogicalEndpoint::new(vec!["foo".into(), "bar".into()]);
        assert!(a.logical_match(&b));
        assert!(b.logical_match(&a));
    }

    #[test]
    fn distinct_literal_segments_do_not_match() {
        let a = LogicalEndpoint::new(vec!["foo".into()]);
        let b = LogicalEndpoint::new(vec!["bar".into()]);
        assert!(!a.logical_match(&b));
    }

    #[test]
    fn compare_is_strict_but_equals_is_loose() {
        let a = LogicalEndpoint::new(vec!["seg0".into(), "seg1".into()]).with_broadcast(true);
        let b = LogicalEndpoint::new(vec!["seg0".into(), "seg1".into()]);
        assert!(a.equals(&b));
        assert_ne!(a.cmp(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn stray_query_key_is_rejected() {
        assert!(parse("foo?x=1").is_err());
    }
}
