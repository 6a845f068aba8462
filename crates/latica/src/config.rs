//! Engine configuration and persisted state.
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::SiblingResolver;
use crate::encryption::KeyPair;
use crate::error::LaticaError;
use crate::nat::NatType;
use crate::types::{Id32, PeerId};

/// Default heartbeat / maintenance interval.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);
/// Upper bound on sockets opened for one traversal attempt.
pub const MAX_PORT_POOL: usize = 1024;

/// Always-unrestricted rendezvous peers used to seed the first reflection.
const BOOTSTRAP: &[(&str, u16, &str)] = &[
    ("44.213.42.133", 10885, "4825fe0475c44bc0222e76c5fa7cf4759cd5ef8c66258c039653f06d329a9af5"),
    ("107.20.123.15", 31503, "2de8ac51f820a5b9dc8a3d2c0f27ccc6e12a418c9674272a10daaa609eab0b41"),
    ("54.227.171.107", 43883, "7aa3d21ceb527533489af3888ea6d73d26771f30419578e85fba197b15b3d18d"),
    ("54.157.134.116", 34420, "1d2315f6f16e5f560b75fbfaf274cad28c12eb54bb921f32cf93087d926f05a9"),
    ("184.169.205.9", 52489, "db00d46e23d99befe42beb32da65ac3343a1579da32c3f6f89f707d5f71bb052"),
    ("35.158.123.13", 31501, "4ba1d23266a2d2833a3275c1d6e6f7ce4b8657e2f1b8be11f6caf53d0955db88"),
    ("35.160.18.99", 11205, "2bad1ff23dd5e0e32d3d85e1d9bb6324fef54fec0224c4f132066ad3d0096a35"),
    ("3.68.89.3", 22787, "448b083bd8a495ce684d5837359ce69d0ff8a5a844efe18583ab000c99d3a0ff"),
    ("3.76.100.161", 25761, "07bffa90d89bf74e06ff7f83938b90acb1a1c5ce718d1f07854c48c6c12cee49"),
];

/// A statically known peer `{address, port, peerId, natType}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub address: Ipv4Addr,
    pub port: u16,
    pub peer_id: PeerId,
    pub nat_type: NatType,
}

impl BootstrapPeer {
    pub fn new(address: Ipv4Addr, port: u16, peer_id: PeerId) -> Self {
        Self {
            address,
            port,
            peer_id,
            nat_type: NatType::UNRESTRICTED,
        }
    }
}

impl std::str::FromStr for BootstrapPeer {
    type Err = LaticaError;

    /// Parses `address:port:peerId`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || LaticaError::Config(format!("expected address:port:peerId, got '{s}'"));
        let mut parts = s.splitn(3, ':');
        let address = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let port = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let peer_id = parts.next().ok_or_else(bad)?.parse()?;
        Ok(Self::new(address, port, peer_id))
    }
}

/// The embedded rendezvous list.
pub fn default_bootstrap_peers() -> Vec<BootstrapPeer> {
    BOOTSTRAP
        .iter()
        .filter_map(|(addr, port, id)| {
            Some(BootstrapPeer::new(addr.parse().ok()?, *port, id.parse().ok()?))
        })
        .collect()
}

/// Configuration for an [`Engine`](crate::runtime::Engine).
///
/// ```rust
/// use latica::{EngineConfig, PeerId};
///
/// let config = EngineConfig::new(PeerId::random())
///     .cluster_id([7; 32])
///     .keepalive(std::time::Duration::from_secs(10));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct EngineConfig {
    pub(crate) peer_id: PeerId,
    pub(crate) cluster_id: Option<Id32>,
    pub(crate) bind_address: Ipv4Addr,
    pub(crate) port: u16,
    pub(crate) probe_port: u16,
    pub(crate) address: Option<Ipv4Addr>,
    pub(crate) keepalive: Duration,
    pub(crate) nat_type: Option<NatType>,
    pub(crate) indexed: bool,
    pub(crate) bootstrap: Vec<BootstrapPeer>,
    pub(crate) signing_key: Option<KeyPair>,
    pub(crate) sibling_resolver: Option<SiblingResolver>,
    pub(crate) port_pool_size: usize,
    pub(crate) restore: Option<EngineSnapshot>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("peer_id", &self.peer_id)
            .field("cluster_id", &self.cluster_id.map(hex::encode))
            .field("port", &self.port)
            .field("probe_port", &self.probe_port)
            .field("keepalive", &self.keepalive)
            .field("nat_type", &self.nat_type)
            .field("indexed", &self.indexed)
            .field("bootstrap", &self.bootstrap.len())
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    /// Defaults: ephemeral ports (or `LATICA_PORT` for the main socket),
    /// 30 s keepalive, the embedded bootstrap list and a random signing key.
    pub fn new(peer_id: PeerId) -> Self {
        let port = std::env::var("LATICA_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Self {
            peer_id,
            cluster_id: None,
            bind_address: Ipv4Addr::UNSPECIFIED,
            port,
            probe_port: 0,
            address: None,
            keepalive: DEFAULT_KEEPALIVE,
            nat_type: None,
            indexed: false,
            bootstrap: default_bootstrap_peers(),
            signing_key: None,
            sibling_resolver: None,
            port_pool_size: MAX_PORT_POOL,
            restore: None,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn cluster_id(mut self, cluster_id: Id32) -> Self {
        self.cluster_id = Some(cluster_id);
        self
    }

    /// Local interface to bind both sockets on (default `0.0.0.0`).
    pub fn bind_address(mut self, address: Ipv4Addr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn probe_port(mut self, port: u16) -> Self {
        self.probe_port = port;
        self
    }

    /// Known external address. Otherwise learned from the first PONG.
    pub fn address(mut self, address: Ipv4Addr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Skip reflection and assume this NAT type.
    pub fn nat_type(mut self, nat_type: NatType) -> Self {
        self.nat_type = Some(nat_type);
        self
    }

    /// Run as an indexed rendezvous peer (no cluster required).
    pub fn indexed(mut self, indexed: bool) -> Self {
        self.indexed = indexed;
        self
    }

    /// Replace the bootstrap list.
    pub fn bootstrap(mut self, peers: Vec<BootstrapPeer>) -> Self {
        self.bootstrap = peers;
        self
    }

    pub fn add_bootstrap(mut self, peer: BootstrapPeer) -> Self {
        self.bootstrap.push(peer);
        self
    }

    pub fn signing_key(mut self, pair: KeyPair) -> Self {
        self.signing_key = Some(pair);
        self
    }

    pub fn sibling_resolver(mut self, resolver: SiblingResolver) -> Self {
        self.sibling_resolver = Some(resolver);
        self
    }

    pub fn port_pool_size(mut self, size: usize) -> Self {
        self.port_pool_size = size;
        self
    }

    /// Reload state captured by [`EngineHandle::snapshot`](crate::runtime::EngineHandle::snapshot).
    pub fn restore(mut self, snapshot: EngineSnapshot) -> Self {
        self.restore = Some(snapshot);
        self
    }

    pub fn validate(&self) -> Result<(), LaticaError> {
        if self.cluster_id.is_none() && !self.indexed {
            return Err(LaticaError::Config(
                "cluster_id is required unless the peer is indexed".into(),
            ));
        }
        if self.keepalive.is_zero() {
            return Err(LaticaError::Config("keepalive must be non-zero".into()));
        }
        if self.port_pool_size == 0 || self.port_pool_size > MAX_PORT_POOL {
            return Err(LaticaError::Config(format!(
                "port_pool_size must be within 1..={MAX_PORT_POOL}"
            )));
        }
        if let Some(nat) = self.nat_type {
            if !nat.is_valid() {
                return Err(LaticaError::Config(format!("invalid nat type {nat:?}")));
            }
        }
        if let Some(snapshot) = &self.restore {
            if snapshot.peer_id != self.peer_id {
                return Err(LaticaError::Config("snapshot belongs to another peer".into()));
            }
        }
        Ok(())
    }
}

/// A cached frame with its local insert time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFrame {
    pub frame: Vec<u8>,
    pub timestamp: u64,
}

/// Persistable engine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub peer_id: PeerId,
    pub clock: u32,
    pub packets: Vec<CachedFrame>,
    /// Hex ids of cached packets not yet handed to any peer.
    pub unpublished: Vec<String>,
}

impl EngineSnapshot {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, LaticaError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, LaticaError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}
