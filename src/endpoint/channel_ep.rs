use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::FabricError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Tcp,
    Udp,
    Multicast,
}

impl Transport {
    fn scheme(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::Multicast => "mcast",
        }
    }
}

/// A transport-level channel address: `scheme://host:port`.
///
/// Multicast addresses canonicalise their host to `*` — the group is
/// identified by port alone within this fabric's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelEndpoint {
    pub transport: Transport,
    pub addr: IpAddr,
    pub port: u16,
}

impl ChannelEndpoint {
    pub fn new(transport: Transport, addr: IpAddr, port: u16) -> Self {
        Self { transport, addr, port }
    }
}

impl fmt::Display for ChannelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.transport == Transport::Multicast {
            write!(f, "mcast://*:{}", self.port)
        } else {
            write!(f, "{}://{}:{}", self.transport.scheme(), self.addr, self.port)
        }
    }
}

impl FromStr for ChannelEndpoint {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| FabricError::malformed(format!("channel endpoint {s:?} missing scheme")))?;
        let transport = match scheme {
            "tcp" => Transport::Tcp,
            "udp" => Transport::Udp,
            "mcast" | "multicast" => Transport::Multicast,
            other => return Err(FabricError::malformed(format!("unknown channel scheme {other:?}"))),
        };
        let (host, port_str) = rest
            .rsplit_once(':')
            .ok_or_else(|| FabricError::malformed(format!("channel endpoint {s:?} missing port")))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| FabricError::malformed(format!("non-numeric port {port_str:?}")))?;
        let addr = if transport == Transport::Multicast || host == "*" {
            IpAddr::from([0, 0, 0, 0])
        } else {
            host.parse()
                .map_err(|_| FabricError::malformed(format!("invalid channel address {host:?}")))?
        };
        Ok(ChannelEndpoint { transport, addr, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multicast_canonicalises_to_wildcard_host() {
        let ep = ChannelEndpoint::new(Transport::Multicast, "239.1.1.1".parse().unwrap(), 7000);
        assert_eq!(ep.to_string(), "mcast://*:7000");
    }

    #[test]
    fn round_trips_tcp() {
        let s = "tcp://10.0.0.1:5000";
        let ep: ChannelEndpoint = s.parse().unwrap();
        assert_eq!(ep.to_string(), s);
    }
}
