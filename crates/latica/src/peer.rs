//! Remote peer records and the capped peer table owned by the engine.
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};

use rand::seq::SliceRandom;

use crate::nat::NatType;
use crate::types::{Id32, PeerId};

/// Maximum number of peers kept in the table.
pub const MAX_PEERS: usize = 4096;

/// A discovered, introduced or connected remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePeer {
    pub peer_id: PeerId,
    pub address: Ipv4Addr,
    pub port: u16,
    pub nat_type: NatType,
    /// cluster id -> subcluster ids the peer announced.
    pub clusters: HashMap<Id32, HashSet<Id32>>,
    pub clock: u32,
    pub last_update: u64,
    pub last_request: u64,
    /// Peer through which STREAM traffic for this peer is relayed.
    pub proxy: Option<PeerId>,
    /// Bootstrap and statically configured peers are never pruned.
    pub indexed: bool,
    /// Last ping id this peer answered.
    pub ping_id: Option<String>,
    /// Whether this peer has already answered one of our probe pings.
    pub probed: bool,
    pub uptime: u64,
}

impl RemotePeer {
    pub fn new(peer_id: PeerId, address: Ipv4Addr, port: u16) -> Self {
        Self {
            peer_id,
            address,
            port,
            nat_type: NatType::UNKNOWN,
            clusters: HashMap::new(),
            clock: 0,
            last_update: 0,
            last_request: 0,
            proxy: None,
            indexed: false,
            ping_id: None,
            probed: false,
            uptime: 0,
        }
    }

    pub fn addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.address, self.port)
    }

    pub fn in_cluster(&self, cluster_id: &Id32) -> bool {
        self.clusters.contains_key(cluster_id)
    }

    pub fn in_subcluster(&self, cluster_id: &Id32, subcluster_id: &Id32) -> bool {
        self.clusters
            .get(cluster_id)
            .is_some_and(|subs| subs.contains(subcluster_id))
    }

    pub fn is_unrestricted(&self) -> bool {
        self.nat_type == NatType::UNRESTRICTED
    }
}

/// What a received packet tells us about its sender.
#[derive(Debug, Clone)]
pub struct PeerUpdate {
    pub peer_id: PeerId,
    pub addr: SocketAddrV4,
    pub nat_type: Option<NatType>,
    pub clock: u32,
    pub membership: Option<(Id32, Id32)>,
}

/// Owning table of remote peers.
pub struct PeerTable {
    peers: HashMap<PeerId, RemotePeer>,
    cap: usize,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    pub fn new() -> Self {
        Self::with_cap(MAX_PEERS)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            peers: HashMap::new(),
            cap: cap.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&RemotePeer> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut RemotePeer> {
        self.peers.get_mut(peer_id)
    }

    pub fn find_by_addr(&self, addr: SocketAddrV4) -> Option<&RemotePeer> {
        self.peers.values().find(|p| p.addr() == addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RemotePeer> {
        self.peers.values_mut()
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<RemotePeer> {
        self.peers.remove(peer_id)
    }

    /// Insert a fully formed record, replacing any previous one.
    pub fn insert(&mut self, peer: RemotePeer) {
        if !self.peers.contains_key(&peer.peer_id) {
            self.make_room();
        }
        self.peers.insert(peer.peer_id, peer);
    }

    /// Create or refresh a peer from packet contents.
    ///
    /// An update carrying an older clock than the stored record only
    /// refreshes liveness and the observed address, and returns `None`.
    pub fn upsert(&mut self, update: PeerUpdate, now: u64) -> Option<&mut RemotePeer> {
        if let Some(existing) = self.peers.get_mut(&update.peer_id) {
            if existing.clock > update.clock {
                existing.address = *update.addr.ip();
                existing.port = update.addr.port();
                existing.last_update = now;
                return None;
            }
        } else {
            self.make_room();
            let peer = RemotePeer::new(update.peer_id, *update.addr.ip(), update.addr.port());
            self.peers.insert(update.peer_id, peer);
        }

        let peer = self.peers.get_mut(&update.peer_id)?;
        peer.address = *update.addr.ip();
        peer.port = update.addr.port();
        peer.clock = update.clock;
        peer.last_update = now;
        if let Some(nat) = update.nat_type.filter(|n| n.is_valid()) {
            peer.nat_type = nat;
        }
        if let Some((cluster, subcluster)) = update.membership {
            peer.clusters.entry(cluster).or_default().insert(subcluster);
        }
        Some(peer)
    }

    fn make_room(&mut self) {
        if self.peers.len() < self.cap {
            return;
        }
        let oldest = self
            .peers
            .values()
            .filter(|p| !p.indexed)
            .min_by_key(|p| p.last_update)
            .map(|p| p.peer_id);
        if let Some(id) = oldest {
            self.peers.remove(&id);
        }
    }

    /// Drop non-indexed peers not heard from within `max_age` ms.
    pub fn prune(&mut self, now: u64, max_age: u64) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| !p.indexed && now.saturating_sub(p.last_update) > max_age)
            .map(|p| p.peer_id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    /// Up to `n` random peers for multicast, skipping `ignore`.
    ///
    /// When a member of `cluster`/`subcluster` exists it is always among
    /// the picks.
    pub fn select(
        &self,
        n: usize,
        cluster: Option<(&Id32, &Id32)>,
        ignore: &[SocketAddrV4],
    ) -> Vec<RemotePeer> {
        let mut candidates: Vec<&RemotePeer> = self
            .peers
            .values()
            .filter(|p| !ignore.contains(&p.addr()))
            .collect();
        candidates.shuffle(&mut rand::rng());

        let member = cluster.and_then(|(c, s)| {
            candidates
                .iter()
                .position(|p| p.in_subcluster(c, s))
                .or_else(|| candidates.iter().position(|p| p.in_cluster(c)))
        });
        if let Some(i) = member {
            candidates.swap(0, i);
        }

        candidates.into_iter().take(n).cloned().collect()
    }

    /// Peers that announced membership of `subcluster`.
    pub fn members(&self, cluster: &Id32, subcluster: &Id32) -> Vec<&RemotePeer> {
        self.peers
            .values()
            .filter(|p| p.in_subcluster(cluster, subcluster))
            .collect()
    }
}
