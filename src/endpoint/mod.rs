//! The URI-like naming scheme used for every route and address.
//!
//! An [`Endpoint`] is always physical or logical once it has entered the
//! fabric — abstract endpoints are rewritten through the process-wide
//! [`AbstractMap`] before they are ever stored in a route table or envelope.

pub mod abstract_map;
pub mod channel_ep;
mod escape;
pub mod logical;
pub mod physical;

pub use abstract_map::{AbstractEndpoint, AbstractMap};
pub use channel_ep::{ChannelEndpoint, Transport};
pub use logical::LogicalEndpoint;
pub use physical::PhysicalEndpoint;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FabricError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Physical(PhysicalEndpoint),
    Logical(LogicalEndpoint),
}

/// The three schemes a raw endpoint string may name, before abstract
/// rewriting collapses to [`Endpoint`].
enum ParsedScheme {
    Physical(PhysicalEndpoint),
    Logical(LogicalEndpoint),
    Abstract(AbstractEndpoint),
}

fn parse_scheme(s: &str) -> Result<ParsedScheme, FabricError> {
    if let Some(body) = s.strip_prefix("physical://") {
        Ok(ParsedScheme::Physical(physical::parse(body)?))
    } else if let Some(body) = s.strip_prefix("logical://") {
        Ok(ParsedScheme::Logical(logical::parse(body)?))
    } else if let Some(body) = s.strip_prefix("abstract://") {
        Ok(ParsedScheme::Abstract(abstract_map::parse(body)?))
    } else {
        Err(FabricError::malformed(format!("unknown endpoint scheme in {s:?}")))
    }
}

impl Endpoint {
    /// Parses `s`, rewriting an abstract endpoint through the process-wide
    /// `AbstractMap` before returning. This is the entry point user code and
    /// the wire codec should use.
    pub fn parse(s: &str) -> Result<Endpoint, FabricError> {
        match parse_scheme(s)? {
            ParsedScheme::Physical(p) => Ok(Endpoint::Physical(p)),
            ParsedScheme::Logical(l) => Ok(Endpoint::Logical(l)),
            ParsedScheme::Abstract(a) => AbstractMap::global().resolve(&a),
        }
    }

    /// Like [`Endpoint::parse`], but never consults the `AbstractMap`.
    /// Used internally by abstract-map resolution targets, which must
    /// terminate in one rewrite rather than recurse indefinitely.
    pub(crate) fn parse_no_abstract(s: &str) -> Result<Endpoint, FabricError> {
        match parse_scheme(s)? {
            ParsedScheme::Physical(p) => Ok(Endpoint::Physical(p)),
            ParsedScheme::Logical(l) => Ok(Endpoint::Logical(l)),
            ParsedScheme::Abstract(_) => Err(FabricError::malformed(
                "abstract-map target must not itself be abstract",
            )),
        }
    }

    pub fn is_physical(&self) -> bool {
        matches!(self, Endpoint::Physical(_))
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, Endpoint::Logical(_))
    }

    pub fn as_physical(&self) -> Option<&PhysicalEndpoint> {
        match self {
            Endpoint::Physical(p) => Some(p),
            Endpoint::Logical(_) => None,
        }
    }

    pub fn as_logical(&self) -> Option<&LogicalEndpoint> {
        match self {
            Endpoint::Logical(l) => Some(l),
            Endpoint::Physical(_) => None,
        }
    }

    pub fn broadcast(&self) -> bool {
        match self {
            Endpoint::Physical(p) => p.broadcast,
            Endpoint::Logical(l) => l.broadcast,
        }
    }

    /// Loose equality: ignores `broadcast`. Fails across variants.
    pub fn equals(&self, other: &Endpoint) -> bool {
        match (self, other) {
            (Endpoint::Physical(a), Endpoint::Physical(b)) => a.equals(b),
            (Endpoint::Logical(a), Endpoint::Logical(b)) => a.equals(b),
            _ => false,
        }
    }

    pub fn with_segment_appended(&self, segment: impl Into<String>) -> Endpoint {
        match self {
            Endpoint::Physical(p) => Endpoint::Physical(p.with_segment_appended(segment)),
            Endpoint::Logical(l) => {
                let mut segments = l.segments.clone();
                segments.push(segment.into().to_lowercase());
                Endpoint::Logical(LogicalEndpoint {
                    segments,
                    broadcast: l.broadcast,
                })
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Physical(p) => write!(f, "{p}"),
            Endpoint::Logical(l) => write!(f, "{l}"),
        }
    }
}

/// Strict ordering: lexicographic over the canonical string; `broadcast`
/// participates, so `Compare` is strict while `Equals` is loose.
impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_then_display_round_trips_loosely() {
        for s in [
            "physical://root1:9000/hubA/leaf1",
            "logical://svc/billing",
            "logical://svc/*?broadcast",
        ] {
            let ep = Endpoint::parse(s).unwrap();
            let reparsed = Endpoint::parse(&ep.to_string()).unwrap();
            assert!(ep.equals(&reparsed), "{s} did not round-trip");
        }
    }

    #[test]
    fn unknown_scheme_is_malformed() {
        assert!(Endpoint::parse("ftp://nope").is_err());
    }

    #[test]
    fn abstract_resolves_via_global_map() {
        AbstractMap::global().reload(vec![(
            "billing".to_string(),
            "logical://svc/billing".to_string(),
        )]);
        let ep = Endpoint::parse("abstract://billing").unwrap();
        assert_eq!(ep.to_string(), "logical://svc/billing");
    }
}
