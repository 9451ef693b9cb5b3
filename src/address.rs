//! Peer addresses and the textual address grammar.
//!
//! A [`PeerAddr`] is the identity of a remote endpoint: IPv4 or IPv6
//! octets plus port (and scope id for v6). It hashes its fields in a
//! fixed little-endian order so the value is stable across processes
//! when paired with a deterministic hasher.
//!
//! The grammar accepts three shapes: a bare `port` (bind-to-any), a
//! `host:port` pair, and a bracketed `[v6]:port`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use crate::error::AddrParseError;

/// A peer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    /// IPv4 endpoint.
    V4 {
        /// Address octets in network order.
        octets: [u8; 4],
        /// TCP port.
        port: u16,
    },
    /// IPv6 endpoint.
    V6 {
        /// Address octets in network order.
        octets: [u8; 16],
        /// Interface scope id, zero when unset.
        scope_id: u32,
        /// TCP port.
        port: u16,
    },
}

impl PeerAddr {
    /// The endpoint's port.
    pub fn port(&self) -> u16 {
        match self {
            PeerAddr::V4 { port, .. } | PeerAddr::V6 { port, .. } => *port,
        }
    }

    /// Convert into a [`SocketAddr`] for the dialer.
    pub fn socket_addr(&self) -> SocketAddr {
        match *self {
            PeerAddr::V4 { octets, port } => {
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port))
            }
            PeerAddr::V6 {
                octets,
                scope_id,
                port,
            } => SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, scope_id)),
        }
    }
}

// Fields feed the hasher in a fixed order (octets, scope id for v6, then
// port, little-endian) so the hash is stable given a stable hasher.
impl Hash for PeerAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            PeerAddr::V4 { octets, port } => {
                state.write(octets);
                state.write(&port.to_le_bytes());
            }
            PeerAddr::V6 {
                octets,
                scope_id,
                port,
            } => {
                state.write(octets);
                state.write(&scope_id.to_le_bytes());
                state.write(&port.to_le_bytes());
            }
        }
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => PeerAddr::V4 {
                octets: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => PeerAddr::V6 {
                octets: v6.ip().octets(),
                scope_id: v6.scope_id(),
                port: v6.port(),
            },
        }
    }
}

impl From<PeerAddr> for SocketAddr {
    fn from(addr: PeerAddr) -> Self {
        addr.socket_addr()
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PeerAddr::V4 { octets, port } => {
                write!(f, "{}:{}", Ipv4Addr::from(octets), port)
            }
            PeerAddr::V6 {
                octets,
                scope_id: 0,
                port,
            } => write!(f, "[{}]:{}", Ipv6Addr::from(octets), port),
            PeerAddr::V6 {
                octets,
                scope_id,
                port,
            } => write!(f, "[{}%{}]:{}", Ipv6Addr::from(octets), scope_id, port),
        }
    }
}

impl FromStr for PeerAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, AddrParseError> {
        if let Some(rest) = s.strip_prefix('[') {
            let end = rest.find(']').ok_or(AddrParseError::MissingEndBracket)?;
            let host = &rest[..end];
            if host.contains('[') {
                return Err(AddrParseError::UnexpectedLeftBracket);
            }
            let after = &rest[end + 1..];
            if after.contains(']') {
                return Err(AddrParseError::UnexpectedRightBracket);
            }
            let port = match after.strip_prefix(':') {
                Some(port) if !port.is_empty() => parse_port(port)?,
                _ => return Err(AddrParseError::MissingPort),
            };
            let (octets, scope_id) = parse_v6_host(host)?;
            return Ok(PeerAddr::V6 {
                octets,
                scope_id,
                port,
            });
        }
        if s.contains('[') {
            return Err(AddrParseError::UnexpectedLeftBracket);
        }
        if s.contains(']') {
            return Err(AddrParseError::UnexpectedRightBracket);
        }

        let Some(idx) = s.rfind(':') else {
            // A bare token is a bind-to-any port.
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(AddrParseError::UnknownAddressProtocol);
            }
            let port = parse_port(s)?;
            return Ok(PeerAddr::V4 {
                octets: [0; 4],
                port,
            });
        };

        let host = &s[..idx];
        let port = parse_port(&s[idx + 1..])?;
        if host.contains('.') {
            let ip = Ipv4Addr::from_str(host).map_err(|_| AddrParseError::InvalidHost)?;
            Ok(PeerAddr::V4 {
                octets: ip.octets(),
                port,
            })
        } else if host.contains(':') {
            // Unbracketed v6 with a trailing port is accepted only when
            // what precedes the last colon is itself a valid address.
            let (octets, scope_id) =
                parse_v6_host(host).map_err(|_| AddrParseError::TooManyColons)?;
            Ok(PeerAddr::V6 {
                octets,
                scope_id,
                port,
            })
        } else {
            Err(AddrParseError::UnknownAddressProtocol)
        }
    }
}

fn parse_port(s: &str) -> Result<u16, AddrParseError> {
    s.parse::<u16>().map_err(|_| AddrParseError::InvalidPort)
}

fn parse_v6_host(host: &str) -> Result<([u8; 16], u32), AddrParseError> {
    let (ip_part, scope_id) = match host.split_once('%') {
        Some((ip, scope)) => (
            ip,
            scope.parse::<u32>().map_err(|_| AddrParseError::InvalidHost)?,
        ),
        None => (host, 0),
    };
    let ip = Ipv6Addr::from_str(ip_part).map_err(|_| AddrParseError::InvalidHost)?;
    Ok((ip.octets(), scope_id))
}

/// Accept either form of an address argument.
impl TryFrom<&str> for PeerAddr {
    type Error = AddrParseError;

    fn try_from(s: &str) -> Result<Self, AddrParseError> {
        s.parse()
    }
}

impl From<IpAddr> for PeerAddr {
    fn from(ip: IpAddr) -> Self {
        PeerAddr::from(SocketAddr::new(ip, 0))
    }
}
