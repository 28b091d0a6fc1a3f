//! Network addressing helpers for the embedded node.
//!
//! This library provides:
//! - The network family strings accepted by dial and listen calls
//!   (`tcp`, `tcp4`, `tcp6`, `udp`, `udp4`, `udp6`)
//! - `host:port` splitting and port lookup (numeric or well-known service name)
//! - Listen address validation (host must be empty or an IP literal of the
//!   requested family)
//! - The node's own address pair as published by the control plane

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// Network string is not one of the supported families.
    #[error("unsupported network type {0:?}")]
    UnsupportedNetwork(String),

    /// Address is not of the form `host:port`.
    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: &'static str },

    /// Port is neither numeric nor a known service.
    #[error("unknown port {port:?} for network {network}")]
    UnknownPort { network: Network, port: String },

    /// Listen host is present but not an IP literal.
    #[error("invalid listen addr {0:?}; host part must be empty or an IP literal")]
    HostNotLiteral(String),

    /// Host literal does not belong to the family named by the network.
    #[error("invalid non-{family} addr {addr} for network {network}")]
    FamilyMismatch {
        family: &'static str,
        addr: IpAddr,
        network: Network,
    },
}

// ============================================================================
// Network families
// ============================================================================

/// Transport protocol without an address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// A network family string as accepted by dial and listen calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
}

impl Network {
    /// The protocol with the family suffix stripped.
    pub fn protocol(self) -> Protocol {
        match self {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => Protocol::Tcp,
            Network::Udp | Network::Udp4 | Network::Udp6 => Protocol::Udp,
        }
    }

    /// The family-agnostic network for a protocol.
    pub fn generic(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => Network::Tcp,
            Protocol::Udp => Network::Udp,
        }
    }

    /// The family-specific network for a protocol and IP version.
    pub fn for_family(protocol: Protocol, ipv6: bool) -> Self {
        match (protocol, ipv6) {
            (Protocol::Tcp, false) => Network::Tcp4,
            (Protocol::Tcp, true) => Network::Tcp6,
            (Protocol::Udp, false) => Network::Udp4,
            (Protocol::Udp, true) => Network::Udp6,
        }
    }

    pub fn is_v4_only(self) -> bool {
        matches!(self, Network::Tcp4 | Network::Udp4)
    }

    pub fn is_v6_only(self) -> bool {
        matches!(self, Network::Tcp6 | Network::Udp6)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        }
    }

    /// Whether `ip` may be used with this network.
    pub fn admits(self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(_) => !self.is_v6_only(),
            IpAddr::V6(_) => !self.is_v4_only(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = NetworkError;

    /// Parse a network string. The empty string means `tcp`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            other => Err(NetworkError::UnsupportedNetwork(other.to_string())),
        }
    }
}

// ============================================================================
// Address parsing
// ============================================================================

/// Split `host:port`, removing brackets around an IPv6 host.
///
/// The host may be empty (`":80"`).
pub fn split_host_port(addr: &str) -> Result<(&str, &str), NetworkError> {
    let invalid = |reason| NetworkError::InvalidAddress {
        addr: addr.to_string(),
        reason,
    };

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("missing ']'"))?;
        let port = tail.strip_prefix(':').ok_or_else(|| invalid("missing port"))?;
        return Ok((host, port));
    }

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    if host.contains(':') {
        return Err(invalid("too many colons"));
    }
    Ok((host, port))
}

/// Resolve a port string: decimal, or a well-known service name for the
/// network's protocol.
pub fn lookup_port(network: Network, port: &str) -> Result<u16, NetworkError> {
    if let Ok(n) = port.parse::<u16>() {
        return Ok(n);
    }

    let known = match network.protocol() {
        Protocol::Tcp => TCP_SERVICES,
        Protocol::Udp => UDP_SERVICES,
    };
    let wanted = port.to_ascii_lowercase();
    known
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, n)| *n)
        .ok_or_else(|| NetworkError::UnknownPort {
            network,
            port: port.to_string(),
        })
}

const TCP_SERVICES: &[(&str, u16)] = &[
    ("domain", 53),
    ("dns", 53),
    ("ftp", 21),
    ("ftps", 990),
    ("gopher", 70),
    ("http", 80),
    ("https", 443),
    ("imap2", 143),
    ("imap3", 220),
    ("imaps", 993),
    ("pop3", 110),
    ("pop3s", 995),
    ("smtp", 25),
    ("submissions", 465),
    ("ssh", 22),
    ("telnet", 23),
];

const UDP_SERVICES: &[(&str, u16)] = &[("domain", 53), ("dns", 53)];

/// Parse and validate a listen address for `network`.
///
/// Returns the bind host (`None` for "any local node address") and the port.
pub fn parse_listen_addr(
    network: Network,
    addr: &str,
) -> Result<(Option<IpAddr>, u16), NetworkError> {
    let (host, port) = split_host_port(addr)?;
    let port = lookup_port(network, port)?;

    if host.is_empty() {
        return Ok((None, port));
    }

    let ip: IpAddr = host
        .parse()
        .map_err(|_| NetworkError::HostNotLiteral(addr.to_string()))?;

    if network.is_v4_only() && !ip.is_ipv4() {
        return Err(NetworkError::FamilyMismatch {
            family: "IPv4",
            addr: ip,
            network,
        });
    }
    if network.is_v6_only() && !ip.is_ipv6() {
        return Err(NetworkError::FamilyMismatch {
            family: "IPv6",
            addr: ip,
            network,
        });
    }

    Ok((Some(ip), port))
}

// ============================================================================
// Node addresses
// ============================================================================

/// The node's own overlay addresses, one per family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddrs {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

impl NodeAddrs {
    pub fn new(v4: Option<Ipv4Addr>, v6: Option<Ipv6Addr>) -> Self {
        Self { v4, v6 }
    }

    /// Whether `ip` is one of the node's own addresses.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.v4 == Some(v4),
            IpAddr::V6(v6) => self.v6 == Some(v6),
        }
    }

    /// The node address of the same family as `peer`.
    pub fn same_family_as(&self, peer: IpAddr) -> Option<IpAddr> {
        match peer {
            IpAddr::V4(_) => self.v4.map(IpAddr::V4),
            IpAddr::V6(_) => self.v6.map(IpAddr::V6),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }

    /// All known addresses, IPv4 first.
    pub fn to_vec(&self) -> Vec<IpAddr> {
        self.v4
            .map(IpAddr::V4)
            .into_iter()
            .chain(self.v6.map(IpAddr::V6))
            .collect()
    }
}
