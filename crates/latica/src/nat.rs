//! NAT and firewall classification.
//!
//! A NAT type is a 5-bit value:
//!
//! ```text
//! 0b00001  endpoint dependence is defined
//! 0b00010  mapping is endpoint independent (1) or dependent (0)
//! 0b00100  firewall behaviour is defined
//! 0b01000  firewall admits any IP (1) or only known IPs (0)
//! 0b10000  firewall admits any port (1) or only known ports (0)
//! ```
//!
//! [`connection_strategy`] maps a (local, remote) pair onto one of five
//! ways of establishing a path between two peers.
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NatType(u8);

/// Every remote sees the same IP:PORT mapping for this peer.
pub const MAPPING_ENDPOINT_INDEPENDENT: u8 = 0b00011;
/// Every remote sees a different IP:PORT mapping for this peer.
pub const MAPPING_ENDPOINT_DEPENDENT: u8 = 0b00001;

pub const FIREWALL_ALLOW_ANY: u8 = 0b11100;
pub const FIREWALL_ALLOW_KNOWN_IP: u8 = 0b01100;
pub const FIREWALL_ALLOW_KNOWN_IP_AND_PORT: u8 = 0b00100;

impl NatType {
    pub const UNKNOWN: NatType = NatType(0);
    /// Full cone: anyone may send to the mapping.
    pub const UNRESTRICTED: NatType = NatType(FIREWALL_ALLOW_ANY | MAPPING_ENDPOINT_INDEPENDENT);
    /// Any port of a previously contacted IP may send.
    pub const ADDR_RESTRICTED: NatType =
        NatType(FIREWALL_ALLOW_KNOWN_IP | MAPPING_ENDPOINT_INDEPENDENT);
    /// Only a previously contacted IP:PORT may send.
    pub const PORT_RESTRICTED: NatType =
        NatType(FIREWALL_ALLOW_KNOWN_IP_AND_PORT | MAPPING_ENDPOINT_INDEPENDENT);
    /// Symmetric: only replies to our own traffic get through.
    pub const ENDPOINT_RESTRICTED: NatType =
        NatType(FIREWALL_ALLOW_KNOWN_IP_AND_PORT | MAPPING_ENDPOINT_DEPENDENT);

    pub const fn from_bits(bits: u8) -> Self {
        NatType(bits & 0b11111)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Combine a mapping flag with a firewall flag.
    pub const fn compose(mapping: u8, firewall: u8) -> Self {
        NatType((mapping | firewall) & 0b11111)
    }

    pub const fn is_endpoint_dependence_defined(self) -> bool {
        self.0 & 0b00001 == 0b00001
    }

    pub const fn is_firewall_defined(self) -> bool {
        self.0 & 0b00100 == 0b00100
    }

    /// Both the mapping and the firewall behaviour are known.
    pub const fn is_valid(self) -> bool {
        self.is_endpoint_dependence_defined() && self.is_firewall_defined()
    }

    /// Schema assertion for a JSON-decoded `natType` field.
    pub fn is_valid_value(n: u64) -> bool {
        n <= 0b11111 && NatType(n as u8).is_valid()
    }

    pub fn name(self) -> &'static str {
        match self {
            NatType::UNRESTRICTED => "UNRESTRICTED",
            NatType::ADDR_RESTRICTED => "ADDR_RESTRICTED",
            NatType::PORT_RESTRICTED => "PORT_RESTRICTED",
            NatType::ENDPOINT_RESTRICTED => "ENDPOINT_RESTRICTED",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Debug for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#07b})", self.name(), self.0)
    }
}

/// How to establish a path from the local peer to a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Do nothing and let the other side initiate.
    Defer,
    /// Simply send.
    DirectConnect,
    /// Open many local sockets, spray the remote, and listen for replies.
    TraversalOpen,
    /// Spray random remote ports without listening.
    TraversalConnect,
    /// Route through a third party.
    Proxy,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::Defer => "STRATEGY_DEFER",
            Strategy::DirectConnect => "STRATEGY_DIRECT_CONNECT",
            Strategy::TraversalOpen => "STRATEGY_TRAVERSAL_OPEN",
            Strategy::TraversalConnect => "STRATEGY_TRAVERSAL_CONNECT",
            Strategy::Proxy => "STRATEGY_PROXY",
        };
        f.write_str(s)
    }
}

/// The strategy to use when connecting from `local` to `remote`.
///
/// Not symmetric: the side with the easier NAT often defers.
pub fn connection_strategy(local: NatType, remote: NatType) -> Strategy {
    use NatType as N;

    match (remote, local) {
        (N::UNRESTRICTED, _) => Strategy::DirectConnect,

        (N::ADDR_RESTRICTED, N::UNRESTRICTED) => Strategy::Defer,
        (N::ADDR_RESTRICTED, N::ADDR_RESTRICTED) => Strategy::DirectConnect,
        (N::ADDR_RESTRICTED, N::PORT_RESTRICTED) => Strategy::DirectConnect,
        (N::ADDR_RESTRICTED, N::ENDPOINT_RESTRICTED) => Strategy::DirectConnect,

        (N::PORT_RESTRICTED, N::UNRESTRICTED) => Strategy::Defer,
        (N::PORT_RESTRICTED, N::ADDR_RESTRICTED) => Strategy::DirectConnect,
        (N::PORT_RESTRICTED, N::PORT_RESTRICTED) => Strategy::DirectConnect,
        (N::PORT_RESTRICTED, N::ENDPOINT_RESTRICTED) => Strategy::TraversalConnect,

        (N::ENDPOINT_RESTRICTED, N::UNRESTRICTED) => Strategy::Defer,
        (N::ENDPOINT_RESTRICTED, N::ADDR_RESTRICTED) => Strategy::DirectConnect,
        (N::ENDPOINT_RESTRICTED, N::PORT_RESTRICTED) => Strategy::TraversalOpen,
        (N::ENDPOINT_RESTRICTED, N::ENDPOINT_RESTRICTED) => Strategy::Proxy,

        _ => Strategy::Proxy,
    }
}
