//! Pure engine state: every protocol decision, no I/O.
//!
//! Handlers take the current time in ms and return the effects to execute.
//! The loop owns exactly one `EngineState`; nothing else touches the cache,
//! the peer table or the ledgers.
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::num::NonZeroUsize;
use std::sync::Arc;

use latica_metrics::EngineMetrics;
use lru::LruCache;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::cache::{self, Cache, InsertOutcome};
use crate::config::{BootstrapPeer, CachedFrame, EngineConfig, EngineSnapshot};
use crate::encryption::{verify, KeyPair, Keyring};
use crate::error::LaticaError;
use crate::ledger::{Gate, RateClass, Rates, ReturnRoutes, JOIN_TICKS, QUERY_TICKS};
use crate::nat::{connection_strategy, NatType, Strategy};
use crate::packet::{
    self, fragment, IntroMessage, JoinMessage, Packet, PacketBody, PacketType, PingMessage,
    PongMessage, QueryMessage, MAX_HOPS, VERSION,
};
use crate::peer::{PeerTable, PeerUpdate, RemotePeer};
use crate::types::{random_token, sha256, Id32, PeerId, EMPTY_ID};

use super::effect::{EngineEffect, Socket};
use super::reflection::Reflection;
use super::{DeliveredPacket, EngineCommand, EngineEvent, EngineInfo, PublishOptions};

/// Peers picked per multicast.
pub(super) const FANOUT: usize = 3;
/// Delays after the first send at which a ping "with retry" is re-sent.
pub(super) const PING_RETRY_MS: [u64; 2] = [500, 1_500];
/// Lifetime of a rendezvous stamped into a JOIN.
pub(super) const RENDEZVOUS_TTL_MS: u64 = 60_000;
/// How long a port pool or port spray keeps trying.
pub(super) const TRAVERSAL_LIFETIME_MS: u64 = 10_000;
/// Ports sprayed per timer poll.
pub(super) const SPRAY_BATCH: usize = 64;
/// Queries older than this are dropped.
pub(super) const QUERY_VALIDITY_MS: u64 = 60_000;
/// Fragments buffered for STREAM reassembly.
const STREAM_BUFFER: usize = 1024;

/// A ping frame scheduled for re-sending.
#[derive(Debug, Clone)]
pub(super) struct PendingPing {
    pub due: u64,
    pub ping_id: String,
    pub socket: Socket,
    pub to: SocketAddrV4,
    pub data: Vec<u8>,
}

/// A TRAVERSAL_CONNECT attempt spraying random ports of one address.
#[derive(Debug, Clone)]
pub(super) struct Spray {
    pub ping_id: String,
    pub address: Ipv4Addr,
    pub ports: Vec<u16>,
    pub data: Vec<u8>,
    pub deadline: u64,
}

/// Cluster and subcluster a packet is addressed to, when both are set.
fn membership(packet: &Packet) -> Option<(Id32, Id32)> {
    (packet.cluster_id != EMPTY_ID && packet.subcluster_id != EMPTY_ID)
        .then_some((packet.cluster_id, packet.subcluster_id))
}

fn peer_id_from(bytes: &[u8]) -> Option<PeerId> {
    <[u8; 32]>::try_from(bytes).ok().map(PeerId::from_bytes)
}

pub(super) struct EngineState {
    pub peer_id: PeerId,
    pub cluster_id: Option<Id32>,
    pub indexed: bool,
    pub keepalive_ms: u64,
    pub port_pool_size: usize,
    /// External address, configured or learned.
    pub address: Option<Ipv4Addr>,
    /// External port of the main socket, learned from PONGs.
    pub external_port: Option<u16>,
    pub local_port: u16,
    pub probe_port: u16,
    pub nat_type: NatType,
    pub static_nat: bool,
    pub ready: bool,
    pub clock: u32,
    pub started: u64,

    pub cache: Cache,
    pub peers: PeerTable,
    pub keys: Keyring,
    pub subclusters: HashSet<Id32>,
    pub gate: Gate,
    pub rates: Rates,
    pub routes: ReturnRoutes,
    pub own_queries: Gate,
    /// Cache keys not yet handed to any peer.
    pub unpublished: HashSet<String>,
    pub streams: LruCache<String, Packet>,

    pub reflection: Reflection,
    pub pending_pings: Vec<PendingPing>,
    pub sprays: Vec<Spray>,
    /// Open port pools: ping id -> close deadline.
    pub pools: HashMap<String, u64>,

    bootstrap: Vec<BootstrapPeer>,
    restore: Option<EngineSnapshot>,
    pub metrics: Arc<EngineMetrics>,
}

impl EngineState {
    pub fn new(
        config: EngineConfig,
        local_port: u16,
        probe_port: u16,
        metrics: Arc<EngineMetrics>,
        now: u64,
    ) -> Self {
        let mut cache = Cache::new();
        if let Some(resolver) = config.sibling_resolver {
            cache.set_sibling_resolver(resolver);
        }
        let own = config.signing_key.unwrap_or_else(KeyPair::generate);

        Self {
            peer_id: config.peer_id,
            cluster_id: config.cluster_id,
            indexed: config.indexed,
            keepalive_ms: config.keepalive.as_millis() as u64,
            port_pool_size: config.port_pool_size,
            address: config.address,
            external_port: None,
            local_port,
            probe_port,
            nat_type: config.nat_type.unwrap_or(NatType::UNKNOWN),
            static_nat: config.nat_type.is_some(),
            ready: false,
            clock: 0,
            started: now,
            cache,
            peers: PeerTable::new(),
            keys: Keyring::new(own),
            subclusters: HashSet::new(),
            gate: Gate::new(),
            rates: Rates::new(),
            routes: ReturnRoutes::new(),
            own_queries: Gate::new(),
            unpublished: HashSet::new(),
            streams: LruCache::new(NonZeroUsize::new(STREAM_BUFFER).unwrap_or(NonZeroUsize::MIN)),
            reflection: Reflection::new(),
            pending_pings: Vec::new(),
            sprays: Vec::new(),
            pools: HashMap::new(),
            bootstrap: config.bootstrap,
            restore: config.restore,
            metrics,
        }
    }

    /// Restore persisted state, ping the bootstrap peers and either
    /// announce a static NAT type or start reflection.
    pub fn start(&mut self, now: u64) -> Vec<EngineEffect> {
        let mut effects = Vec::new();
        if let Some(snapshot) = self.restore.take() {
            self.restore_snapshot(snapshot);
        }
        for peer in std::mem::take(&mut self.bootstrap) {
            effects.extend(self.add_peer(peer, now));
        }
        if self.static_nat {
            effects.extend(self.set_nat_type(self.nat_type, now));
        } else {
            effects.extend(self.request_reflection(now));
        }
        effects
    }

    fn restore_snapshot(&mut self, snapshot: EngineSnapshot) {
        self.clock = self.clock.max(snapshot.clock);
        let mut restored = 0;
        for CachedFrame { frame, timestamp } in snapshot.packets {
            let Some(packet) = packet::decode(&frame) else {
                continue;
            };
            if self.cache.insert_at(packet.id_hex(), packet, timestamp).inserted() {
                restored += 1;
            }
        }
        self.unpublished.extend(snapshot.unpublished);
        info!(packets = restored, clock = self.clock, "restored engine snapshot");
    }

    // ── Helpers ───────────────────────────────────────────────────────

    pub fn cluster(&self) -> Id32 {
        self.cluster_id.unwrap_or(EMPTY_ID)
    }

    /// Advertised port of the main socket.
    pub fn port(&self) -> u16 {
        self.external_port.unwrap_or(self.local_port)
    }

    pub fn uptime(&self, now: u64) -> u64 {
        now.saturating_sub(self.started)
    }

    pub fn in_cluster(&self, packet: &Packet) -> bool {
        self.cluster_id.map_or(true, |c| packet.cluster_id == c)
    }

    pub fn summary_hash(&self) -> String {
        self.cache.summarize("", |p| self.in_cluster(p)).hash_hex()
    }

    pub fn encode(&self, packet: &Packet) -> Option<Vec<u8>> {
        match packet::encode(packet) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(error = %e, kind = ?packet.packet_type, "failed to encode packet");
                None
            }
        }
    }

    /// Send `packet` to up to [`FANOUT`] peers, preferring members of its
    /// subcluster.
    pub fn mcast(&self, packet: &Packet, ignore: &[SocketAddrV4]) -> Vec<EngineEffect> {
        let Some(data) = self.encode(packet) else {
            return Vec::new();
        };
        let cluster = membership(packet);
        self.peers
            .select(FANOUT, cluster.as_ref().map(|(c, s)| (c, s)), ignore)
            .into_iter()
            .map(|peer| EngineEffect::send(peer.addr(), data.clone()))
            .collect()
    }

    /// Re-flood a packet one hop further if its budget allows.
    fn forward(&self, packet: &Packet, ignore: &[SocketAddrV4]) -> Vec<EngineEffect> {
        if packet.hops >= MAX_HOPS {
            return Vec::new();
        }
        let mut next = packet.clone();
        next.hops += 1;
        self.mcast(&next, ignore)
    }

    /// Where STREAM traffic for `peer_id` goes: the peer, or its proxy.
    fn route_to(&self, peer_id: &PeerId) -> Option<SocketAddrV4> {
        let peer = self.peers.get(peer_id)?;
        match peer.proxy {
            Some(proxy) => self.peers.get(&proxy).map(RemotePeer::addr),
            None => Some(peer.addr()),
        }
    }

    /// Cache a PUBLISH packet. `None` if it was already present.
    fn store(&mut self, packet: Packet, now: u64) -> Option<Vec<EngineEffect>> {
        match self.cache.insert_at(packet.id_hex(), packet, now) {
            InsertOutcome::Skipped => None,
            InsertOutcome::Inserted { evicted } => {
                self.metrics.cache_inserts.inc();
                let effects = match evicted {
                    Some(old) => {
                        self.metrics.cache_evictions.inc();
                        self.unpublished.remove(&old.id_hex());
                        self.forward(&old, &[])
                    }
                    None => Vec::new(),
                };
                Some(effects)
            }
        }
    }

    pub fn ping_message(&self, now: u64) -> PingMessage {
        let mut msg = PingMessage::new(self.peer_id);
        msg.nat_type = self.nat_type.is_valid().then_some(self.nat_type);
        msg.uptime = Some(self.uptime(now));
        msg.cache_size = Some(self.cache.len() as u64);
        msg.cache_summary_hash = Some(self.summary_hash());
        msg
    }

    fn ping_frame(&self, msg: &PingMessage, cluster: Option<(Id32, Id32)>) -> Option<Vec<u8>> {
        let mut packet = match Packet::ping(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to build ping");
                return None;
            }
        };
        packet.clock = self.clock;
        match cluster {
            Some((c, s)) => {
                packet.cluster_id = c;
                packet.subcluster_id = s;
            }
            None => packet.cluster_id = self.cluster(),
        }
        self.encode(&packet)
    }

    /// Send a PING. With `retry` it gets a ping id and is re-sent at
    /// [`PING_RETRY_MS`] unless a PONG with that id arrives first.
    pub fn ping(
        &mut self,
        socket: Socket,
        to: SocketAddrV4,
        mut msg: PingMessage,
        retry: bool,
        cluster: Option<(Id32, Id32)>,
        now: u64,
    ) -> Vec<EngineEffect> {
        if retry && msg.ping_id.is_none() {
            msg.ping_id = Some(random_token());
        }
        let Some(data) = self.ping_frame(&msg, cluster) else {
            return Vec::new();
        };
        if let (true, Some(ping_id)) = (retry, &msg.ping_id) {
            for delay in PING_RETRY_MS {
                self.pending_pings.push(PendingPing {
                    due: now + delay,
                    ping_id: ping_id.clone(),
                    socket,
                    to,
                    data: data.clone(),
                });
            }
        }
        vec![EngineEffect::Send { socket, to, data }]
    }

    fn pong_to(&self, socket: Socket, to: SocketAddrV4, msg: &PongMessage) -> Option<EngineEffect> {
        let mut packet = Packet::pong(msg).ok()?;
        packet.clock = self.clock;
        packet.cluster_id = self.cluster();
        Some(EngineEffect::Send {
            socket,
            to,
            data: self.encode(&packet)?,
        })
    }

    /// Record a NAT classification. Emits `Ready` the first time and
    /// re-announces every subscription when the type changes.
    pub fn set_nat_type(&mut self, nat_type: NatType, now: u64) -> Vec<EngineEffect> {
        let old = self.nat_type;
        let first = !self.ready;
        self.nat_type = nat_type;
        self.ready = true;
        let mut effects = Vec::new();

        if old != nat_type {
            info!(old = %old, new = %nat_type, "nat type changed");
            effects.push(EngineEffect::Emit(EngineEvent::NatChanged { old, new: nat_type }));
        }
        if first {
            effects.push(EngineEffect::Emit(EngineEvent::Ready {
                nat_type,
                address: self.address,
                port: self.port(),
            }));
        }
        if first || old != nat_type {
            effects.extend(self.announce_all(now));
        }
        effects
    }

    /// Flood a JOIN for `subcluster_id`. Postponed until both the external
    /// address and the NAT type are known.
    pub fn announce(&mut self, subcluster_id: Id32, now: u64) -> Vec<EngineEffect> {
        let (Some(address), Some(cluster_id)) = (self.address, self.cluster_id) else {
            debug!("postponing join: address or cluster unknown");
            return Vec::new();
        };
        if !self.nat_type.is_valid() {
            debug!("postponing join: nat type unknown");
            return Vec::new();
        }

        let msg = JoinMessage::new(self.peer_id, self.nat_type, address, self.port());
        let mut packet = match Packet::join(&msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to build join");
                return Vec::new();
            }
        };
        packet.cluster_id = cluster_id;
        packet.subcluster_id = subcluster_id;
        packet.clock = self.clock;
        // every announcement is a distinct flood
        packet.packet_id = sha256(&[packet.message.as_slice(), &now.to_be_bytes()].concat());
        self.gate.admit(&format!("join:{}", packet.id_hex()), JOIN_TICKS);
        self.mcast(&packet, &[])
    }

    pub fn announce_all(&mut self, now: u64) -> Vec<EngineEffect> {
        let subclusters: Vec<Id32> = self.subclusters.iter().copied().collect();
        subclusters
            .into_iter()
            .flat_map(|s| self.announce(s, now))
            .collect()
    }

    /// Register a static peer and ping it with retry.
    pub fn add_peer(&mut self, seed: BootstrapPeer, now: u64) -> Vec<EngineEffect> {
        if seed.peer_id == self.peer_id {
            return Vec::new();
        }
        let mut peer = RemotePeer::new(seed.peer_id, seed.address, seed.port);
        peer.nat_type = seed.nat_type;
        peer.indexed = true;
        peer.last_update = now;
        if let Some(existing) = self.peers.get(&seed.peer_id) {
            peer.clusters = existing.clusters.clone();
            peer.clock = existing.clock;
        }
        let to = peer.addr();
        self.peers.insert(peer);
        debug!(peer = %seed.peer_id, %to, "added static peer");

        let msg = self.ping_message(now);
        self.ping(Socket::Main, to, msg, true, None, now)
    }

    // ── Inbound datagrams ─────────────────────────────────────────────

    /// Decode, rate-limit, validate and dispatch one datagram.
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        from: SocketAddrV4,
        via: Socket,
        now: u64,
    ) -> Vec<EngineEffect> {
        self.metrics.datagrams_in.inc();

        let Some(packet) = packet::decode(data) else {
            self.metrics.dropped_decode.inc();
            debug!(%from, len = data.len(), "dropping datagram: not a packet");
            return Vec::new();
        };
        if packet.version < VERSION {
            self.metrics.dropped_decode.inc();
            debug!(%from, version = packet.version, "dropping packet: old version");
            return Vec::new();
        }

        let class = if packet.packet_type.is_replicatable() {
            RateClass::Replicatable
        } else {
            RateClass::Direct
        };
        if !self.rates.admit(class, from, now) {
            self.metrics.dropped_rate_limited.inc();
            debug!(%from, ?class, "dropping packet: rate limited");
            return Vec::new();
        }

        let body = match packet.body() {
            Ok(body) => body,
            Err(e) => {
                self.metrics.dropped_schema.inc();
                debug!(
                    %from,
                    kind = ?packet.packet_type,
                    error = %e,
                    "dropping packet: invalid message"
                );
                return Vec::new();
            }
        };

        match body {
            PacketBody::Ping(msg) => self.on_ping(&packet, msg, from, via, now),
            PacketBody::Pong(msg) => self.on_pong(&packet, msg, from, via, now),
            PacketBody::Intro(msg) => self.on_intro(&packet, msg, from, now),
            PacketBody::Join(msg) => self.on_join(packet, msg, from, now),
            PacketBody::Publish => self.on_publish(packet, from, now),
            PacketBody::Stream => self.on_stream(packet, from),
            PacketBody::Sync => self.on_sync(&packet, from),
            PacketBody::Query(msg) => self.on_query(packet, msg, from, now),
        }
    }

    fn on_ping(
        &mut self,
        packet: &Packet,
        msg: PingMessage,
        from: SocketAddrV4,
        via: Socket,
        now: u64,
    ) -> Vec<EngineEffect> {
        if msg.requester_peer_id == self.peer_id {
            return Vec::new();
        }

        // probe-socket pings carry the probe port, not the peer's main one
        if !msg.is_probe && via == Socket::Main {
            let update = PeerUpdate {
                peer_id: msg.requester_peer_id,
                addr: from,
                nat_type: msg.nat_type,
                clock: packet.clock,
                membership: membership(packet),
            };
            if let Some(peer) = self.peers.upsert(update, now) {
                if let Some(uptime) = msg.uptime {
                    peer.uptime = uptime;
                }
            }
        }

        let summary_hash = self.summary_hash();
        let mut pong = PongMessage::new(msg.requester_peer_id, self.peer_id);
        pong.address = Some(*from.ip());
        pong.port = Some(from.port());
        pong.ping_id = msg.ping_id.clone();
        pong.reflection_id = msg.reflection_id.clone();
        pong.is_reflection = msg.is_reflection;
        pong.is_connection = msg.is_connection;
        pong.is_probe = msg.is_probe;
        pong.is_debug = msg.is_debug;
        pong.nat_type = self.nat_type.is_valid().then_some(self.nat_type);
        pong.uptime = Some(self.uptime(now));
        pong.cache_size = Some(self.cache.len() as u64);
        pong.cache_summary_hash = Some(summary_hash.clone());

        let mut effects: Vec<EngineEffect> =
            self.pong_to(Socket::Main, from, &pong).into_iter().collect();

        // second reflection stage: echo from our probe socket to theirs
        if msg.is_reflection && !msg.is_probe {
            if let Some(port) = msg.probe_external_port {
                let mut echo = pong;
                echo.is_probe = true;
                let to = SocketAddrV4::new(*from.ip(), port);
                effects.extend(self.pong_to(Socket::Probe, to, &echo));
            }
            return effects;
        }

        if msg.is_connection {
            info!(peer = %msg.requester_peer_id, %from, "connection established");
            effects.push(EngineEffect::Emit(EngineEvent::Connection {
                peer_id: msg.requester_peer_id,
                address: from,
                nat_type: msg.nat_type.unwrap_or_default(),
            }));
        }

        let same_cluster = self.cluster_id.is_some_and(|c| packet.cluster_id == c);
        if let (false, true, Some(theirs)) = (msg.is_probe, same_cluster, &msg.cache_summary_hash) {
            if *theirs != summary_hash {
                debug!(%from, "cache summary differs, starting sync");
                effects.extend(self.sync_request(from, ""));
            }
        }
        effects
    }

    fn on_pong(
        &mut self,
        packet: &Packet,
        msg: PongMessage,
        from: SocketAddrV4,
        via: Socket,
        now: u64,
    ) -> Vec<EngineEffect> {
        if msg.requester_peer_id != self.peer_id {
            debug!(%from, "dropping pong addressed to another peer");
            return Vec::new();
        }

        if via == Socket::Main && !msg.is_probe {
            let update = PeerUpdate {
                peer_id: msg.responder_peer_id,
                addr: from,
                nat_type: msg.nat_type,
                clock: packet.clock,
                membership: membership(packet),
            };
            if let Some(peer) = self.peers.upsert(update, now) {
                if msg.ping_id.is_some() {
                    peer.ping_id = msg.ping_id.clone();
                }
                if let Some(uptime) = msg.uptime {
                    peer.uptime = uptime;
                }
            }
        }

        if msg.reflection_id.is_some() && (msg.is_reflection || msg.is_probe) {
            return self.on_reflection_pong(&msg, via, now);
        }
        if via == Socket::Probe {
            return Vec::new();
        }

        let mut effects = Vec::new();
        if self.address.is_none() {
            if let Some(address) = msg.address {
                info!(%address, port = ?msg.port, "learned external address");
                self.address = Some(address);
                self.external_port = msg.port;
                effects.extend(self.announce_all(now));
            }
        }

        if let Some(ping_id) = &msg.ping_id {
            self.pending_pings.retain(|p| &p.ping_id != ping_id);
            self.sprays.retain(|s| &s.ping_id != ping_id);
            if self.pools.remove(ping_id).is_some() {
                effects.push(EngineEffect::ClosePortPool {
                    ping_id: ping_id.clone(),
                });
            }
        }

        if msg.is_connection {
            info!(peer = %msg.responder_peer_id, %from, "connection established");
            effects.push(EngineEffect::Emit(EngineEvent::Connection {
                peer_id: msg.responder_peer_id,
                address: from,
                nat_type: msg.nat_type.unwrap_or_default(),
            }));
        }
        effects
    }

    fn on_intro(
        &mut self,
        packet: &Packet,
        msg: IntroMessage,
        from: SocketAddrV4,
        now: u64,
    ) -> Vec<EngineEffect> {
        if msg.requester_peer_id != self.peer_id || msg.responder_peer_id == self.peer_id {
            return Vec::new();
        }

        let target = SocketAddrV4::new(msg.address, msg.port);
        let introducer = self.peers.find_by_addr(from).map(|p| p.peer_id);
        let cluster = membership(packet);
        // the packet clock is the introducer's; keep whatever the responder told us
        let clock = self
            .peers
            .get(&msg.responder_peer_id)
            .map_or(0, |p| p.clock);
        self.peers.upsert(
            PeerUpdate {
                peer_id: msg.responder_peer_id,
                addr: target,
                nat_type: Some(msg.nat_type),
                clock,
                membership: cluster,
            },
            now,
        );

        let strategy = connection_strategy(self.nat_type, msg.nat_type);
        debug!(
            peer = %msg.responder_peer_id,
            %target,
            %strategy,
            rendezvous = msg.is_rendezvous,
            "intro"
        );

        let mut ping = self.ping_message(now);
        ping.is_connection = true;
        let ping_id = random_token();
        ping.ping_id = Some(ping_id.clone());

        match strategy {
            Strategy::Defer => Vec::new(),
            Strategy::DirectConnect => self.ping(Socket::Main, target, ping, true, cluster, now),
            Strategy::TraversalOpen => {
                let Some(data) = self.ping_frame(&ping, cluster) else {
                    return Vec::new();
                };
                self.pools.insert(ping_id.clone(), now + TRAVERSAL_LIFETIME_MS);
                vec![EngineEffect::OpenPortPool {
                    ping_id,
                    to: target,
                    data,
                    size: self.port_pool_size,
                }]
            }
            Strategy::TraversalConnect => {
                let Some(data) = self.ping_frame(&ping, cluster) else {
                    return Vec::new();
                };
                let mut rng = rand::rng();
                let mut ports: Vec<u16> = rand::seq::index::sample(
                    &mut rng,
                    usize::from(u16::MAX) - 1024,
                    self.port_pool_size,
                )
                .into_iter()
                .map(|i| (i + 1024) as u16)
                .filter(|p| *p != msg.port)
                .collect();
                ports.insert(0, msg.port);
                self.sprays.push(Spray {
                    ping_id,
                    address: msg.address,
                    ports,
                    data,
                    deadline: now + TRAVERSAL_LIFETIME_MS,
                });
                self.poll_sprays(now)
            }
            Strategy::Proxy => {
                if let Some(peer) = self.peers.get_mut(&msg.responder_peer_id) {
                    peer.proxy = introducer;
                }
                Vec::new()
            }
        }
    }

    /// INTRO `a` and `b` to each other.
    ///
    /// The packets keep clock 0: the clock belongs to the peer described,
    /// not to us.
    fn introduce(
        &self,
        a: PeerId,
        b: PeerId,
        cluster: (Id32, Id32),
        rendezvous: bool,
    ) -> Vec<EngineEffect> {
        let (Some(pa), Some(pb)) = (self.peers.get(&a), self.peers.get(&b)) else {
            return Vec::new();
        };
        if !pa.nat_type.is_valid() || !pb.nat_type.is_valid() {
            debug!(%a, %b, "skipping intro: nat type unknown");
            return Vec::new();
        }

        [(pa, pb), (pb, pa)]
            .into_iter()
            .filter_map(|(to, about)| {
                let msg = IntroMessage {
                    requester_peer_id: to.peer_id,
                    responder_peer_id: about.peer_id,
                    nat_type: about.nat_type,
                    address: about.address,
                    port: about.port,
                    is_rendezvous: rendezvous,
                    timestamp: None,
                };
                let mut packet = Packet::intro(&msg).ok()?;
                packet.cluster_id = cluster.0;
                packet.subcluster_id = cluster.1;
                Some(EngineEffect::send(to.addr(), self.encode(&packet)?))
            })
            .collect()
    }

    fn on_join(
        &mut self,
        mut packet: Packet,
        mut msg: JoinMessage,
        from: SocketAddrV4,
        now: u64,
    ) -> Vec<EngineEffect> {
        let requester = msg.requester_peer_id;
        let gate_key = format!("join:{}", packet.id_hex());
        if requester == self.peer_id || !self.gate.admit(&gate_key, JOIN_TICKS) {
            return Vec::new();
        }

        let direct = packet.hops == 0;
        let addr = if direct {
            from
        } else {
            SocketAddrV4::new(msg.address, msg.port)
        };
        let cluster = (packet.cluster_id, packet.subcluster_id);
        let known = self
            .peers
            .get(&requester)
            .is_some_and(|p| p.ping_id.is_some());
        self.peers.upsert(
            PeerUpdate {
                peer_id: requester,
                addr,
                nat_type: Some(msg.nat_type),
                clock: packet.clock,
                membership: Some(cluster),
            },
            now,
        );

        // a member asking us, the rendezvous, to broker an intro
        if let (Some(wanted), Some(rendezvous)) =
            (msg.rendezvous_requester_peer_id, msg.rendezvous_peer_id)
        {
            if rendezvous == self.peer_id {
                debug!(%requester, %wanted, "brokering rendezvous intro");
                return self.introduce(requester, wanted, cluster, true);
            }
        }

        let mut effects = Vec::new();
        let subscribed =
            self.cluster_id == Some(cluster.0) && self.subclusters.contains(&cluster.1);
        if subscribed {
            effects.push(EngineEffect::Emit(EngineEvent::Join {
                peer_id: requester,
                cluster_id: cluster.0,
                subcluster_id: cluster.1,
            }));
        }

        if direct {
            let mut members: Vec<PeerId> = self
                .peers
                .members(&cluster.0, &cluster.1)
                .into_iter()
                .map(|p| p.peer_id)
                .filter(|id| *id != requester)
                .collect();
            members.shuffle(&mut rand::rng());
            for member in members.into_iter().take(FANOUT) {
                effects.extend(self.introduce(requester, member, cluster, false));
            }
        }

        let live_rendezvous = msg
            .rendezvous_deadline
            .is_some_and(|deadline| deadline > now);
        if msg.rendezvous_peer_id.is_none()
            && self.nat_type == NatType::UNRESTRICTED
            && msg.nat_type != NatType::UNRESTRICTED
        {
            if let Some(address) = self.address {
                msg.rendezvous_address = Some(address);
                msg.rendezvous_port = Some(self.port());
                msg.rendezvous_type = Some(self.nat_type);
                msg.rendezvous_peer_id = Some(self.peer_id);
                msg.rendezvous_deadline = Some(now + RENDEZVOUS_TTL_MS);
                match serde_json::to_vec(&msg) {
                    Ok(message) => packet.message = message,
                    Err(e) => warn!(error = %e, "failed to stamp rendezvous"),
                }
            }
        } else if subscribed
            && live_rendezvous
            && !known
            && msg.rendezvous_peer_id != Some(self.peer_id)
        {
            effects.extend(self.request_rendezvous(&msg, cluster));
        }

        effects.extend(self.forward(&packet, &[from, addr]));
        effects
    }

    /// Ask the rendezvous named in `seen` to introduce us to its requester.
    fn request_rendezvous(&self, seen: &JoinMessage, cluster: (Id32, Id32)) -> Vec<EngineEffect> {
        let (Some(r_address), Some(r_port), Some(r_peer), Some(address)) = (
            seen.rendezvous_address,
            seen.rendezvous_port,
            seen.rendezvous_peer_id,
            self.address,
        ) else {
            return Vec::new();
        };
        if !self.nat_type.is_valid() {
            return Vec::new();
        }

        let mut msg = JoinMessage::new(self.peer_id, self.nat_type, address, self.port());
        msg.rendezvous_peer_id = Some(r_peer);
        msg.rendezvous_requester_peer_id = Some(seen.requester_peer_id);
        let Ok(mut packet) = Packet::join(&msg) else {
            return Vec::new();
        };
        packet.cluster_id = cluster.0;
        packet.subcluster_id = cluster.1;
        packet.clock = self.clock;

        debug!(rendezvous = %r_peer, requester = %seen.requester_peer_id, "requesting rendezvous");
        self.encode(&packet)
            .map(|data| vec![EngineEffect::send(SocketAddrV4::new(r_address, r_port), data)])
            .unwrap_or_default()
    }

    fn on_publish(&mut self, packet: Packet, from: SocketAddrV4, now: u64) -> Vec<EngineEffect> {
        let Some(mut effects) = self.store(packet.clone(), now) else {
            return Vec::new();
        };

        if self.subclusters.contains(&packet.subcluster_id) {
            let complete = if packet.index == -1 {
                Some(packet.clone())
            } else {
                self.cache.compose(&packet)
            };
            if let Some(complete) = complete {
                effects.extend(self.deliver(&complete, from, false));
            }
        }

        effects.extend(self.forward(&packet, &[from]));
        effects
    }

    /// Open a complete PUBLISH or STREAM packet and emit it.
    fn deliver(&self, packet: &Packet, from: SocketAddrV4, stream: bool) -> Vec<EngineEffect> {
        let message = match self.keys.open(&packet.message, &packet.subcluster_id) {
            Ok(message) => message,
            Err(e) => {
                debug!(id = %packet.id_hex(), error = %e, "failed to open packet");
                return vec![EngineEffect::Emit(EngineEvent::Warning {
                    description: format!("failed to open packet {}: {e}", packet.id_hex()),
                })];
            }
        };

        let verified = !packet.sig.is_empty() && verify(&packet.usr2, &message, &packet.sig);
        let origin = peer_id_from(if stream { &packet.usr4 } else { &packet.usr1 });
        let delivered = DeliveredPacket {
            packet_id: packet.id(),
            subcluster_id: packet.subcluster_id,
            previous_id: packet.previous_id,
            origin,
            message,
            verified,
            clock: packet.clock,
            hops: packet.hops,
            from,
        };
        let event = if stream {
            EngineEvent::Stream(delivered)
        } else {
            EngineEvent::Packet(delivered)
        };
        vec![EngineEffect::Emit(event)]
    }

    fn on_stream(&mut self, packet: Packet, from: SocketAddrV4) -> Vec<EngineEffect> {
        let Some(destination) = peer_id_from(&packet.usr3) else {
            debug!(%from, "dropping stream without destination");
            return Vec::new();
        };
        if !self.gate.admit(&format!("stream:{}", packet.id_hex()), QUERY_TICKS) {
            return Vec::new();
        }

        if destination != self.peer_id {
            if packet.hops >= MAX_HOPS {
                return Vec::new();
            }
            let Some(to) = self.route_to(&destination).filter(|to| *to != from) else {
                debug!(%destination, "no route for stream relay");
                return Vec::new();
            };
            let mut next = packet;
            next.hops += 1;
            return self
                .encode(&next)
                .map(|data| vec![EngineEffect::send(to, data)])
                .unwrap_or_default();
        }

        if !self.subclusters.contains(&packet.subcluster_id) {
            return Vec::new();
        }

        let complete = if packet.index == -1 {
            Some(packet)
        } else {
            self.streams.put(packet.id_hex(), packet.clone());
            let composed = cache::compose(&packet, self.streams.iter().map(|(_, p)| p));
            if composed.is_some() {
                let head = if packet.index == 0 {
                    packet.packet_id
                } else {
                    packet.previous_id
                };
                let done: Vec<String> = self
                    .streams
                    .iter()
                    .filter(|(_, p)| p.packet_id == head || p.previous_id == head)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in done {
                    self.streams.pop(&key);
                }
            }
            composed
        };

        complete
            .map(|p| self.deliver(&p, from, true))
            .unwrap_or_default()
    }

    fn on_query(
        &mut self,
        packet: Packet,
        msg: QueryMessage,
        from: SocketAddrV4,
        now: u64,
    ) -> Vec<EngineEffect> {
        if !self.gate.admit(&format!("query:{}", packet.id_hex()), QUERY_TICKS) {
            return Vec::new();
        }
        if now.saturating_sub(msg.timestamp) > QUERY_VALIDITY_MS {
            debug!(query = %msg.query_id, "dropping stale query");
            return Vec::new();
        }

        if msg.is_answer {
            if self.own_queries.contains(&msg.query_id) {
                return vec![EngineEffect::Emit(EngineEvent::Answer {
                    query_id: msg.query_id,
                    data: msg.data,
                })];
            }
            let Some(back) = self.routes.get(&msg.query_id) else {
                return Vec::new();
            };
            if packet.hops >= MAX_HOPS {
                return Vec::new();
            }
            let mut next = packet;
            next.hops += 1;
            return self
                .encode(&next)
                .map(|data| vec![EngineEffect::send(back, data)])
                .unwrap_or_default();
        }

        if self.own_queries.contains(&msg.query_id) {
            return Vec::new();
        }
        self.routes.insert(&msg.query_id, from, QUERY_TICKS);
        let mut effects = vec![EngineEffect::Emit(EngineEvent::Query {
            query_id: msg.query_id,
            data: msg.data,
            from,
        })];
        effects.extend(self.forward(&packet, &[from]));
        effects
    }

    // ── Commands ──────────────────────────────────────────────────────

    /// Apply an application command. Replies are sent inline.
    pub fn handle_command(&mut self, cmd: EngineCommand, now: u64) -> Vec<EngineEffect> {
        match cmd {
            EngineCommand::Join { shared_key, reply } => {
                let subcluster_id = self.keys.add_shared(&shared_key);
                self.subclusters.insert(subcluster_id);
                info!(subcluster = %hex::encode(subcluster_id), "joined subcluster");
                let _ = reply.send(subcluster_id);
                self.announce(subcluster_id, now)
            }
            EngineCommand::Leave { subcluster_id, reply } => {
                let left = self.subclusters.remove(&subcluster_id);
                self.keys.remove(&subcluster_id);
                let _ = reply.send(left);
                Vec::new()
            }
            EngineCommand::Publish {
                subcluster_id,
                message,
                options,
                reply,
            } => match self.publish(subcluster_id, &message, options, now) {
                Ok((id, effects)) => {
                    let _ = reply.send(Ok(id));
                    effects
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Vec::new()
                }
            },
            EngineCommand::Stream {
                peer_id,
                subcluster_id,
                message,
                reply,
            } => match self.stream(peer_id, subcluster_id, &message) {
                Ok((id, effects)) => {
                    let _ = reply.send(Ok(id));
                    effects
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Vec::new()
                }
            },
            EngineCommand::Query { data, reply } => match self.query(data, now) {
                Ok((id, effects)) => {
                    let _ = reply.send(Ok(id));
                    effects
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Vec::new()
                }
            },
            EngineCommand::Answer {
                query_id,
                data,
                reply,
            } => match self.answer(&query_id, data, now) {
                Ok(effects) => {
                    let _ = reply.send(Ok(()));
                    effects
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Vec::new()
                }
            },
            EngineCommand::AddPeer { peer } => self.add_peer(peer, now),
            EngineCommand::Peers { reply } => {
                let _ = reply.send(self.peers.iter().cloned().collect());
                Vec::new()
            }
            EngineCommand::Info { reply } => {
                let _ = reply.send(self.info(now));
                Vec::new()
            }
            EngineCommand::CacheSummary { prefix, reply } => {
                let _ = reply.send(self.cache.summarize(&prefix, |p| self.in_cluster(p)));
                Vec::new()
            }
            EngineCommand::Metrics { reply } => {
                let _ = reply.send(self.metrics.snapshot());
                Vec::new()
            }
            EngineCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
                Vec::new()
            }
            EngineCommand::Reconnect => self.reconnect(now),
            // handled by the loop
            EngineCommand::Close => Vec::new(),
        }
    }

    /// Seal, sign, fragment, cache and flood a message. Returns the id of
    /// the first packet.
    pub fn publish(
        &mut self,
        subcluster_id: Id32,
        message: &[u8],
        options: PublishOptions,
        now: u64,
    ) -> Result<(Id32, Vec<EngineEffect>), LaticaError> {
        let sealed = self.keys.seal(message, &subcluster_id)?;
        self.clock = self.clock.wrapping_add(1);

        let mut template = Packet::new(PacketType::Publish);
        template.cluster_id = self.cluster();
        template.subcluster_id = subcluster_id;
        template.clock = self.clock;
        template.timestamp = now;
        if let Some(ttl) = options.ttl {
            template.ttl = ttl;
        }
        if let Some(previous_id) = options.previous_id {
            template.previous_id = previous_id;
            if let Some(sibling) = self.cache.latest_sibling(&previous_id) {
                template.clock = template.clock.max(sibling.clock.wrapping_add(1));
                self.clock = template.clock;
            }
        }
        template.usr1 = self.peer_id.as_bytes().to_vec();
        template.usr2 = self.keys.own().public_key().to_vec();
        template.sig = self.keys.own().sign(message).to_vec();

        let packets = fragment(&template, &sealed, options.meta)?;
        let head = packets.first().map(Packet::id).ok_or(LaticaError::Malformed)?;

        let mut effects = Vec::new();
        for packet in packets {
            let key = packet.id_hex();
            let sends = self.mcast(&packet, &[]);
            if let Some(evictions) = self.store(packet, now) {
                effects.extend(evictions);
            }
            if sends.is_empty() {
                self.unpublished.insert(key);
            }
            effects.extend(sends);
        }
        debug!(id = %hex::encode(head), subcluster = %hex::encode(subcluster_id), "published");
        Ok((head, effects))
    }

    /// Seal and send a message straight to one peer (or its proxy).
    pub fn stream(
        &mut self,
        peer_id: PeerId,
        subcluster_id: Id32,
        message: &[u8],
    ) -> Result<(Id32, Vec<EngineEffect>), LaticaError> {
        let to = self
            .route_to(&peer_id)
            .ok_or(LaticaError::UnknownPeer(peer_id))?;
        let sealed = self.keys.seal(message, &subcluster_id)?;
        self.clock = self.clock.wrapping_add(1);

        let mut template = Packet::new(PacketType::Stream);
        template.cluster_id = self.cluster();
        template.subcluster_id = subcluster_id;
        template.clock = self.clock;
        template.usr1 = self.peer_id.as_bytes().to_vec();
        template.usr2 = self.keys.own().public_key().to_vec();
        template.usr3 = peer_id.as_bytes().to_vec();
        template.usr4 = self.peer_id.as_bytes().to_vec();
        template.sig = self.keys.own().sign(message).to_vec();

        let packets = fragment(&template, &sealed, serde_json::Value::Null)?;
        let head = packets.first().map(Packet::id).ok_or(LaticaError::Malformed)?;
        let effects = packets
            .iter()
            .map(|p| packet::encode(p).map(|data| EngineEffect::send(to, data)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((head, effects))
    }

    pub fn query(
        &mut self,
        data: String,
        now: u64,
    ) -> Result<(String, Vec<EngineEffect>), LaticaError> {
        let query_id = random_token();
        let msg = QueryMessage {
            query_id: query_id.clone(),
            timestamp: now,
            is_answer: false,
            data: Some(data),
        };
        let mut packet = Packet::query(&msg)?;
        packet.cluster_id = self.cluster();
        packet.clock = self.clock;

        self.own_queries.admit(&query_id, QUERY_TICKS);
        self.gate.admit(&format!("query:{}", packet.id_hex()), QUERY_TICKS);
        Ok((query_id, self.mcast(&packet, &[])))
    }

    pub fn answer(
        &mut self,
        query_id: &str,
        data: String,
        now: u64,
    ) -> Result<Vec<EngineEffect>, LaticaError> {
        let to = self
            .routes
            .get(query_id)
            .ok_or_else(|| LaticaError::NoRoute(query_id.to_string()))?;
        let msg = QueryMessage {
            query_id: query_id.to_string(),
            timestamp: now,
            is_answer: true,
            data: Some(data),
        };
        let mut packet = Packet::query(&msg)?;
        packet.cluster_id = self.cluster();
        packet.clock = self.clock;
        Ok(vec![EngineEffect::send(to, packet::encode(&packet)?)])
    }

    pub fn info(&self, now: u64) -> EngineInfo {
        let mut subclusters: Vec<Id32> = self.subclusters.iter().copied().collect();
        subclusters.sort_unstable();
        EngineInfo {
            peer_id: self.peer_id,
            cluster_id: self.cluster_id,
            address: self.address,
            port: self.port(),
            local_port: self.local_port,
            probe_port: self.probe_port,
            nat_type: self.nat_type,
            clock: self.clock,
            uptime: self.uptime(now),
            peers: self.peers.len(),
            cache_size: self.cache.len(),
            subclusters,
            unpublished: self.unpublished.len(),
        }
    }

    pub fn snapshot(&self) -> Result<EngineSnapshot, LaticaError> {
        let packets = self
            .cache
            .values()
            .map(|p| {
                Ok(CachedFrame {
                    frame: packet::encode(p)?,
                    timestamp: p.timestamp,
                })
            })
            .collect::<Result<Vec<_>, LaticaError>>()?;
        Ok(EngineSnapshot {
            peer_id: self.peer_id,
            clock: self.clock,
            packets,
            unpublished: self.unpublished.iter().cloned().collect(),
        })
    }

    /// Restart reflection, ping every peer and re-announce.
    pub fn reconnect(&mut self, now: u64) -> Vec<EngineEffect> {
        info!("reconnecting");
        let mut effects = Vec::new();
        if !self.static_nat {
            self.reflection.reset();
            effects.extend(self.request_reflection(now));
        }
        effects.extend(self.heartbeat(now));
        effects.extend(self.announce_all(now));
        effects
    }

    // ── Timers ────────────────────────────────────────────────────────

    fn heartbeat(&mut self, now: u64) -> Vec<EngineEffect> {
        let msg = self.ping_message(now);
        let Some(data) = self.ping_frame(&msg, None) else {
            return Vec::new();
        };
        self.peers
            .iter_mut()
            .map(|peer| {
                peer.last_request = now;
                EngineEffect::send(peer.addr(), data.clone())
            })
            .collect()
    }

    fn flush_unpublished(&mut self) -> Vec<EngineEffect> {
        let mut effects = Vec::new();
        for key in self.unpublished.clone() {
            let Some(packet) = self.cache.get(&key) else {
                self.unpublished.remove(&key);
                continue;
            };
            let sends = self.mcast(packet, &[]);
            if !sends.is_empty() {
                self.unpublished.remove(&key);
            }
            effects.extend(sends);
        }
        effects
    }

    /// Keepalive tick: expire, decay, prune, heartbeat and re-announce.
    pub fn tick_maintenance(&mut self, now: u64) -> Vec<EngineEffect> {
        let mut effects = Vec::new();

        for packet in self.cache.expire(now) {
            self.metrics.cache_evictions.inc();
            self.unpublished.remove(&packet.id_hex());
            effects.push(EngineEffect::Emit(EngineEvent::Delete {
                packet_id: packet.id(),
            }));
            effects.extend(self.forward(&packet, &[]));
        }

        self.gate.tick();
        self.own_queries.tick();
        self.routes.tick();
        self.rates.prune(now, 2);
        for peer_id in self.peers.prune(now, 2 * self.keepalive_ms) {
            debug!(peer = %peer_id, "pruned stale peer");
        }

        effects.extend(self.heartbeat(now));
        effects.extend(self.announce_all(now));
        effects.extend(self.flush_unpublished());
        if !self.static_nat && !self.nat_type.is_valid() {
            effects.extend(self.request_reflection(now));
        }
        effects
    }

    pub fn poll_sprays(&mut self, now: u64) -> Vec<EngineEffect> {
        let mut effects = Vec::new();
        self.sprays.retain_mut(|spray| {
            if spray.deadline <= now || spray.ports.is_empty() {
                return false;
            }
            let n = spray.ports.len().min(SPRAY_BATCH);
            for port in spray.ports.drain(..n) {
                effects.push(EngineEffect::send(
                    SocketAddrV4::new(spray.address, port),
                    spray.data.clone(),
                ));
            }
            true
        });
        effects
    }

    /// Short timer: ping retries, sprays, pool lifetimes, reflection.
    pub fn poll_timers(&mut self, now: u64) -> Vec<EngineEffect> {
        let (due, pending): (Vec<PendingPing>, Vec<PendingPing>) =
            std::mem::take(&mut self.pending_pings)
                .into_iter()
                .partition(|p| p.due <= now);
        self.pending_pings = pending;

        let mut effects: Vec<EngineEffect> = due
            .into_iter()
            .map(|p| EngineEffect::Send {
                socket: p.socket,
                to: p.to,
                data: p.data,
            })
            .collect();

        effects.extend(self.poll_sprays(now));

        let expired: Vec<String> = self
            .pools
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for ping_id in expired {
            self.pools.remove(&ping_id);
            effects.push(EngineEffect::ClosePortPool { ping_id });
        }

        effects.extend(self.poll_reflection(now));
        effects
    }
}

#[cfg(test)]
pub(super) mod tests {
    use super::*;
    use crate::cache::EMPTY_SUMMARY_HEX;
    use crate::packet::decode;
    use tokio::sync::oneshot;

    pub const CLUSTER: Id32 = [7; 32];

    pub fn addr(n: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, n), 9000 + n as u16)
    }

    /// A state with a static nat type and known address, no bootstrap.
    pub fn state_with(n: u8, nat: NatType) -> EngineState {
        let config = EngineConfig::new(PeerId::from_bytes([n; 32]))
            .cluster_id(CLUSTER)
            .address(*addr(n).ip())
            .nat_type(nat)
            .bootstrap(Vec::new());
        let mut state = EngineState::new(config, addr(n).port(), 0, Arc::default(), 0);
        state.start(0);
        state
    }

    pub fn state(n: u8) -> EngineState {
        state_with(n, NatType::UNRESTRICTED)
    }

    pub fn know(state: &mut EngineState, n: u8, nat: NatType) {
        let id = PeerId::from_bytes([n; 32]);
        let mut seed = BootstrapPeer::new(*addr(n).ip(), addr(n).port(), id);
        seed.nat_type = nat;
        state.add_peer(seed, 0);
        state.pending_pings.clear();
    }

    pub fn sends(effects: &[EngineEffect]) -> Vec<(SocketAddrV4, Packet)> {
        effects
            .iter()
            .filter_map(|e| match e {
                EngineEffect::Send { to, data, .. } => Some((*to, decode(data)?)),
                _ => None,
            })
            .collect()
    }

    pub fn frames(effects: &[EngineEffect]) -> Vec<(SocketAddrV4, Vec<u8>)> {
        effects
            .iter()
            .filter_map(|e| match e {
                EngineEffect::Send { to, data, .. } => Some((*to, data.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn events(effects: Vec<EngineEffect>) -> Vec<EngineEvent> {
        effects
            .into_iter()
            .filter_map(|e| match e {
                EngineEffect::Emit(ev) => Some(ev),
                _ => None,
            })
            .collect()
    }

    pub fn join(state: &mut EngineState, secret: &str) -> Id32 {
        let (tx, mut rx) = oneshot::channel();
        state.handle_command(
            EngineCommand::Join {
                shared_key: secret.as_bytes().to_vec(),
                reply: tx,
            },
            0,
        );
        rx.try_recv().unwrap()
    }

    #[test]
    fn static_nat_emits_ready_on_start() {
        let config = EngineConfig::new(PeerId::from_bytes([1; 32]))
            .cluster_id(CLUSTER)
            .nat_type(NatType::PORT_RESTRICTED)
            .bootstrap(Vec::new());
        let mut state = EngineState::new(config, 1, 2, Arc::default(), 0);
        let evs = events(state.start(0));
        assert!(evs.iter().any(|e| matches!(
            e,
            EngineEvent::Ready { nat_type, .. } if *nat_type == NatType::PORT_RESTRICTED
        )));
    }

    #[test]
    fn bootstrap_peers_are_indexed_and_pinged_with_retry() {
        let seed = BootstrapPeer::new(*addr(2).ip(), addr(2).port(), PeerId::from_bytes([2; 32]));
        let config = EngineConfig::new(PeerId::from_bytes([1; 32]))
            .cluster_id(CLUSTER)
            .nat_type(NatType::UNRESTRICTED)
            .bootstrap(vec![seed]);
        let mut state = EngineState::new(config, 1, 2, Arc::default(), 0);
        let effects = state.start(0);

        assert!(state.peers.get(&PeerId::from_bytes([2; 32])).unwrap().indexed);
        assert!(sends(&effects)
            .iter()
            .any(|(to, p)| *to == addr(2) && p.packet_type == PacketType::Ping));
        assert_eq!(state.pending_pings.len(), 2);

        assert!(state.poll_timers(400).is_empty());
        assert_eq!(sends(&state.poll_timers(500)).len(), 1);
        assert_eq!(sends(&state.poll_timers(1_500)).len(), 1);
        assert!(state.pending_pings.is_empty());
    }

    #[test]
    fn ping_gets_pong_and_registers_peer() {
        let mut a = state(1);
        let mut b = state(2);
        know(&mut a, 2, NatType::UNRESTRICTED);

        let ping = a.ping(Socket::Main, addr(2), a.ping_message(0), true, None, 0);
        let (_, data) = frames(&ping).remove(0);
        let reply = b.handle_datagram(&data, addr(1), Socket::Main, 10);

        assert!(b.peers.get(&a.peer_id).is_some());
        let pongs = sends(&reply);
        let (to, pong) = &pongs[0];
        assert_eq!(*to, addr(1));
        let PacketBody::Pong(msg) = pong.body().unwrap() else {
            panic!("expected pong");
        };
        assert_eq!(msg.requester_peer_id, a.peer_id);
        assert_eq!(msg.port, Some(addr(1).port()));

        // the pong cancels the retries
        let (_, data) = frames(&reply).remove(0);
        a.handle_datagram(&data, addr(2), Socket::Main, 20);
        assert!(a.pending_pings.is_empty());
    }

    #[test]
    fn garbage_and_invalid_messages_are_counted_and_dropped() {
        let mut a = state(1);
        assert!(a.handle_datagram(b"hello", addr(2), Socket::Main, 0).is_empty());
        assert_eq!(a.metrics.dropped_decode.get(), 1);

        let mut packet = Packet::new(PacketType::Ping);
        packet.message = br#"{"requesterPeerId":"nope"}"#.to_vec();
        let data = packet::encode(&packet).unwrap();
        assert!(a.handle_datagram(&data, addr(2), Socket::Main, 0).is_empty());
        assert_eq!(a.metrics.dropped_schema.get(), 1);
    }

    #[test]
    fn rate_limiter_drops_floods() {
        let mut a = state(1);
        let ping = Packet::ping(&PingMessage::new(PeerId::from_bytes([2; 32]))).unwrap();
        let data = packet::encode(&ping).unwrap();
        for _ in 0..crate::ledger::INITIAL_QUOTA {
            a.handle_datagram(&data, addr(2), Socket::Main, 0);
        }
        assert!(a.handle_datagram(&data, addr(2), Socket::Main, 0).is_empty());
        assert_eq!(a.metrics.dropped_rate_limited.get(), 1);
    }

    #[test]
    fn publish_without_peers_is_kept_unpublished_then_flushed() {
        let mut a = state(1);
        let s = join(&mut a, "room");
        let (id, effects) = a.publish(s, b"hi", PublishOptions::default(), 0).unwrap();
        assert!(effects.is_empty());
        assert!(a.cache.has(&hex::encode(id)));
        assert_eq!(a.unpublished.len(), 1);

        know(&mut a, 2, NatType::UNRESTRICTED);
        let effects = a.tick_maintenance(1_000);
        assert!(sends(&effects).iter().any(|(_, p)| p.packet_type == PacketType::Publish));
        assert!(a.unpublished.is_empty());
    }

    #[test]
    fn publish_without_keys_fails() {
        let mut a = state(1);
        assert!(matches!(
            a.publish([9; 32], b"x", PublishOptions::default(), 0),
            Err(LaticaError::NoKeys(_))
        ));
    }

    fn deliver_all(
        to: &mut EngineState,
        effects: &[EngineEffect],
        src: SocketAddrV4,
    ) -> Vec<EngineEvent> {
        frames(effects)
            .into_iter()
            .flat_map(|(_, data)| events(to.handle_datagram(&data, src, Socket::Main, 10)))
            .collect()
    }

    #[test]
    fn subscriber_opens_and_verifies_publish() {
        let mut a = state(1);
        let mut b = state(2);
        know(&mut a, 2, NatType::UNRESTRICTED);
        let s = join(&mut a, "room");
        assert_eq!(join(&mut b, "room"), s);

        let (_, effects) = a.publish(s, b"hello", PublishOptions::default(), 0).unwrap();
        let evs = deliver_all(&mut b, &effects, addr(1));
        let delivered = evs
            .iter()
            .find_map(|e| match e {
                EngineEvent::Packet(p) => Some(p),
                _ => None,
            })
            .expect("packet event");
        assert_eq!(delivered.message, b"hello");
        assert!(delivered.verified);
        assert_eq!(delivered.origin, Some(a.peer_id));
    }

    #[test]
    fn fragmented_publish_is_delivered_once_complete() {
        let mut a = state(1);
        let mut b = state(2);
        know(&mut a, 2, NatType::UNRESTRICTED);
        let s = join(&mut a, "room");
        join(&mut b, "room");

        let message: Vec<u8> = (0..5_000u32).map(|i| i as u8).collect();
        let (_, effects) = a.publish(s, &message, PublishOptions::default(), 0).unwrap();
        let mut all = frames(&effects);
        assert!(all.len() > 2);

        // withhold one fragment
        let withheld = all.remove(2);
        for (_, data) in &all {
            let evs = events(b.handle_datagram(data, addr(1), Socket::Main, 10));
            assert!(!evs.iter().any(|e| matches!(e, EngineEvent::Packet(_))));
        }
        let evs = events(b.handle_datagram(&withheld.1, addr(1), Socket::Main, 10));
        let delivered = evs
            .iter()
            .find_map(|e| match e {
                EngineEvent::Packet(p) => Some(p),
                _ => None,
            })
            .expect("composed packet");
        assert_eq!(delivered.message, message);
        assert!(delivered.verified);

        // a duplicate is ignored
        assert!(events(b.handle_datagram(&withheld.1, addr(1), Socket::Main, 11)).is_empty());
    }

    #[test]
    fn non_subscriber_caches_and_forwards_without_delivering() {
        let mut a = state(1);
        let mut b = state(2);
        know(&mut a, 2, NatType::UNRESTRICTED);
        know(&mut b, 3, NatType::UNRESTRICTED);
        let s = join(&mut a, "room");

        let (id, effects) = a.publish(s, b"hello", PublishOptions::default(), 0).unwrap();
        let (_, data) = frames(&effects).remove(0);
        let out = b.handle_datagram(&data, addr(1), Socket::Main, 10);
        assert!(b.cache.has(&hex::encode(id)));
        let forwarded = sends(&out);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0, addr(3));
        assert_eq!(forwarded[0].1.hops, 1);
        assert!(events(out).is_empty());
    }

    fn intro_from_3(to: &EngineState, nat_type: NatType) -> Vec<u8> {
        let intro = IntroMessage {
            requester_peer_id: to.peer_id,
            responder_peer_id: PeerId::from_bytes([3; 32]),
            nat_type,
            address: *addr(3).ip(),
            port: addr(3).port(),
            is_rendezvous: false,
            timestamp: None,
        };
        packet::encode(&Packet::intro(&intro).unwrap()).unwrap()
    }

    #[test]
    fn intro_strategies() {
        // local PORT_RESTRICTED, remote ENDPOINT_RESTRICTED: open a pool
        let mut a = state_with(1, NatType::PORT_RESTRICTED);
        let data = intro_from_3(&a, NatType::ENDPOINT_RESTRICTED);
        let effects = a.handle_datagram(&data, addr(2), Socket::Main, 0);
        assert!(matches!(
            effects.as_slice(),
            [EngineEffect::OpenPortPool { to, size, .. }]
                if *to == addr(3) && *size == crate::config::MAX_PORT_POOL
        ));
        assert_eq!(a.pools.len(), 1);
        let closed = a.poll_timers(TRAVERSAL_LIFETIME_MS);
        assert!(closed.iter().any(|e| matches!(e, EngineEffect::ClosePortPool { .. })));

        // remote UNRESTRICTED: direct connection ping
        let mut b = state_with(1, NatType::PORT_RESTRICTED);
        let data = intro_from_3(&b, NatType::UNRESTRICTED);
        let out = sends(&b.handle_datagram(&data, addr(2), Socket::Main, 0));
        let PacketBody::Ping(ping) = out[0].1.body().unwrap() else {
            panic!("expected ping");
        };
        assert!(ping.is_connection);
        assert_eq!(out[0].0, addr(3));

        // both ENDPOINT_RESTRICTED: proxy through the introducer
        let mut c = state_with(1, NatType::ENDPOINT_RESTRICTED);
        know(&mut c, 2, NatType::UNRESTRICTED);
        let data = intro_from_3(&c, NatType::ENDPOINT_RESTRICTED);
        assert!(c.handle_datagram(&data, addr(2), Socket::Main, 0).is_empty());
        let target = c.peers.get(&PeerId::from_bytes([3; 32])).unwrap();
        assert_eq!(target.proxy, Some(PeerId::from_bytes([2; 32])));
    }

    #[test]
    fn introduced_peer_stays_live_after_its_own_ping() {
        let mut a = state_with(1, NatType::PORT_RESTRICTED);
        let id3 = PeerId::from_bytes([3; 32]);

        // an introducer far ahead in clock tells us about node 3
        let mut intro = decode(&intro_from_3(&a, NatType::UNRESTRICTED)).unwrap();
        intro.clock = 10;
        a.handle_datagram(&packet::encode(&intro).unwrap(), addr(2), Socket::Main, 0);
        assert_eq!(a.peers.get(&id3).unwrap().clock, 0);

        // node 3 pings with its own, lower clock much later
        let ping = Packet::ping(&PingMessage::new(id3)).unwrap();
        a.handle_datagram(&packet::encode(&ping).unwrap(), addr(3), Socket::Main, 50_000);
        assert_eq!(a.peers.get(&id3).unwrap().last_update, 50_000);

        a.tick_maintenance(70_000);
        assert!(a.peers.get(&id3).is_some(), "live peer was pruned");
    }

    #[test]
    fn introductions_do_not_carry_our_clock() {
        let mut a = state(1);
        know(&mut a, 2, NatType::UNRESTRICTED);
        know(&mut a, 3, NatType::PORT_RESTRICTED);
        a.clock = 42;

        let out = sends(&a.introduce(
            PeerId::from_bytes([2; 32]),
            PeerId::from_bytes([3; 32]),
            (CLUSTER, [1; 32]),
            false,
        ));
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .all(|(_, p)| p.packet_type == PacketType::Intro && p.clock == 0));
    }

    #[test]
    fn engine_state_can_cross_await_points() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EngineState>();
        assert_send_sync::<Cache>();
    }

    #[test]
    fn traversal_connect_sprays_in_batches() {
        // local ENDPOINT_RESTRICTED, remote PORT_RESTRICTED
        let mut a = state_with(1, NatType::ENDPOINT_RESTRICTED);
        let data = intro_from_3(&a, NatType::PORT_RESTRICTED);
        let first = sends(&a.handle_datagram(&data, addr(2), Socket::Main, 0));
        assert_eq!(first.len(), SPRAY_BATCH);
        assert_eq!(first[0].0, addr(3));
        assert_eq!(sends(&a.poll_timers(50)).len(), SPRAY_BATCH);
    }

    #[test]
    fn join_is_flooded_once_and_reported_to_subscribers() {
        let mut a = state(1);
        let mut b = state(2);
        know(&mut a, 2, NatType::UNRESTRICTED);
        know(&mut b, 3, NatType::UNRESTRICTED);
        join(&mut b, "room");

        let (tx, _rx) = oneshot::channel();
        let effects = a.handle_command(
            EngineCommand::Join {
                shared_key: b"room".to_vec(),
                reply: tx,
            },
            0,
        );
        let (_, data) = frames(&effects).remove(0);

        let out = b.handle_datagram(&data, addr(1), Socket::Main, 10);
        assert!(sends(&out)
            .iter()
            .any(|(to, p)| *to == addr(3) && p.packet_type == PacketType::Join));
        assert!(events(out).iter().any(|e| matches!(
            e,
            EngineEvent::Join { peer_id, .. } if *peer_id == a.peer_id
        )));
        assert!(b.handle_datagram(&data, addr(1), Socket::Main, 11).is_empty());
    }

    #[test]
    fn unrestricted_relay_stamps_rendezvous() {
        let mut a = state_with(1, NatType::PORT_RESTRICTED);
        let mut b = state(2);
        know(&mut a, 2, NatType::UNRESTRICTED);
        know(&mut b, 3, NatType::UNRESTRICTED);

        let (tx, _rx) = oneshot::channel();
        let effects = a.handle_command(
            EngineCommand::Join {
                shared_key: b"room".to_vec(),
                reply: tx,
            },
            0,
        );
        let (_, data) = frames(&effects).remove(0);
        let out = sends(&b.handle_datagram(&data, addr(1), Socket::Main, 10));
        let PacketBody::Join(msg) = out[0].1.body().unwrap() else {
            panic!("expected join");
        };
        assert_eq!(msg.rendezvous_peer_id, Some(b.peer_id));
        assert_eq!(msg.rendezvous_deadline, Some(10 + RENDEZVOUS_TTL_MS));
    }

    #[test]
    fn query_is_routed_back_to_the_asker() {
        let mut a = state(1);
        let mut b = state(2);
        know(&mut a, 2, NatType::UNRESTRICTED);

        let (query_id, effects) = a.query("who?".into(), 0).unwrap();
        let (_, data) = frames(&effects).remove(0);
        let evs = events(b.handle_datagram(&data, addr(1), Socket::Main, 10));
        assert!(evs.iter().any(|e| matches!(
            e,
            EngineEvent::Query { query_id: q, .. } if *q == query_id
        )));

        let answer = b.answer(&query_id, "me".into(), 20).unwrap();
        let (to, data) = frames(&answer).remove(0);
        assert_eq!(to, addr(1));
        let evs = events(a.handle_datagram(&data, addr(2), Socket::Main, 30));
        assert!(evs.iter().any(|e| matches!(
            e,
            EngineEvent::Answer { data: Some(d), .. } if d == "me"
        )));

        assert!(matches!(
            b.answer("0".repeat(32).as_str(), "x".into(), 0),
            Err(LaticaError::NoRoute(_))
        ));
    }

    #[test]
    fn stale_query_is_dropped() {
        let mut a = state(1);
        let mut b = state(2);
        know(&mut a, 2, NatType::UNRESTRICTED);
        let (_, effects) = a.query("old".into(), 0).unwrap();
        let (_, data) = frames(&effects).remove(0);
        assert!(b.handle_datagram(&data, addr(1), Socket::Main, QUERY_VALIDITY_MS + 1).is_empty());
    }

    #[test]
    fn stream_is_relayed_by_non_destination() {
        let mut a = state(1);
        let mut relay = state(2);
        let mut c = state(3);
        know(&mut a, 3, NatType::UNRESTRICTED);
        a.peers.get_mut(&c.peer_id).unwrap().proxy = Some(relay.peer_id);
        know(&mut a, 2, NatType::UNRESTRICTED);
        know(&mut relay, 3, NatType::UNRESTRICTED);
        let s = join(&mut a, "room");
        join(&mut c, "room");

        let (_, effects) = a.stream(c.peer_id, s, b"psst").unwrap();
        let (to, data) = frames(&effects).remove(0);
        assert_eq!(to, addr(2));

        let relayed = frames(&relay.handle_datagram(&data, addr(1), Socket::Main, 0));
        assert_eq!(relayed[0].0, addr(3));

        let evs = events(c.handle_datagram(&relayed[0].1, addr(2), Socket::Main, 0));
        let delivered = evs
            .iter()
            .find_map(|e| match e {
                EngineEvent::Stream(p) => Some(p),
                _ => None,
            })
            .expect("stream event");
        assert_eq!(delivered.message, b"psst");
        assert_eq!(delivered.origin, Some(a.peer_id));
        assert!(delivered.verified);
        assert!(c.cache.is_empty());
    }

    #[test]
    fn stream_to_unknown_peer_fails() {
        let mut a = state(1);
        let s = join(&mut a, "room");
        assert!(matches!(
            a.stream(PeerId::from_bytes([9; 32]), s, b"x"),
            Err(LaticaError::UnknownPeer(_))
        ));
    }

    #[test]
    fn maintenance_expires_packets_and_prunes_peers() {
        let mut a = state(1);
        let s = join(&mut a, "room");
        let options = PublishOptions {
            ttl: Some(1_000),
            ..Default::default()
        };
        let (id, _) = a.publish(s, b"short lived", options, 0).unwrap();
        a.peers.upsert(
            PeerUpdate {
                peer_id: PeerId::from_bytes([5; 32]),
                addr: addr(5),
                nat_type: None,
                clock: 0,
                membership: None,
            },
            0,
        );

        let later = 2 * a.keepalive_ms + 1;
        let evs = events(a.tick_maintenance(later));
        assert!(evs
            .iter()
            .any(|e| matches!(e, EngineEvent::Delete { packet_id } if *packet_id == id)));
        assert!(a.cache.is_empty());
        assert!(a.peers.is_empty());
        assert_eq!(a.summary_hash(), EMPTY_SUMMARY_HEX);
    }

    #[test]
    fn snapshot_restores_cache_and_clock() {
        let mut a = state(1);
        let s = join(&mut a, "room");
        a.publish(s, b"keep me", PublishOptions::default(), 0).unwrap();
        let snapshot = a.snapshot().unwrap();

        let config = EngineConfig::new(a.peer_id)
            .cluster_id(CLUSTER)
            .nat_type(NatType::UNRESTRICTED)
            .bootstrap(Vec::new())
            .restore(snapshot);
        let mut b = EngineState::new(config, 1, 2, Arc::default(), 0);
        b.start(0);
        assert_eq!(b.cache.len(), 1);
        assert_eq!(b.clock, a.clock);
        assert_eq!(b.unpublished.len(), 1);
    }

    #[test]
    fn chained_publish_follows_latest_sibling() {
        let mut a = state(1);
        let s = join(&mut a, "room");
        let (first, _) = a.publish(s, b"one", PublishOptions::default(), 0).unwrap();
        let options = PublishOptions {
            previous_id: Some(first),
            ..Default::default()
        };
        let (second, _) = a.publish(s, b"two", options.clone(), 0).unwrap();
        a.clock = 0;
        let (third, _) = a.publish(s, b"three", options, 0).unwrap();

        let clock = |id: Id32| a.cache.get(&hex::encode(id)).unwrap().clock;
        assert!(clock(third) > clock(second));
    }
}
