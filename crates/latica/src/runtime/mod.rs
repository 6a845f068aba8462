//! Peer engine runtime.
//!
//! One tokio task owns every piece of mutable protocol state (cache, peer
//! table, gate, rate buckets, return routes, key ring) inside a pure
//! [`EngineState`](state::EngineState). The application talks to it only
//! through an [`EngineHandle`]: each call is a command carrying a oneshot
//! reply, and everything the engine wants to report arrives as an
//! [`EngineEvent`] on the channel returned by [`Engine::bind`].
mod effect;
mod executor;
mod r#loop;
mod reflection;
mod state;
mod sync;
mod transport;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use latica_metrics::{EngineMetrics, MetricsSnapshot};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use crate::cache::Summary;
use crate::config::{BootstrapPeer, EngineConfig, EngineSnapshot};
use crate::error::LaticaError;
use crate::nat::NatType;
use crate::peer::RemotePeer;
use crate::types::{now_ms, Id32, PeerId};

pub use effect::Socket;
pub use transport::DatagramSink;

/// Capacity of the command and event channels.
const CHANNEL_CAPACITY: usize = 64;

// ── Commands (app → engine) ───────────────────────────────────────────

/// Options for [`EngineHandle::publish`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Carried in the chain head of fragmented messages.
    pub meta: serde_json::Value,
    /// Chain this publish after an existing packet.
    pub previous_id: Option<Id32>,
    /// Cache lifetime in ms. Defaults to six hours.
    pub ttl: Option<u32>,
}

/// Requests the application sends to the engine loop.
pub enum EngineCommand {
    /// Derive a subcluster from a shared secret, subscribe and announce it.
    Join {
        shared_key: Vec<u8>,
        reply: oneshot::Sender<Id32>,
    },
    Leave {
        subcluster_id: Id32,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        subcluster_id: Id32,
        message: Vec<u8>,
        options: PublishOptions,
        reply: oneshot::Sender<Result<Id32, LaticaError>>,
    },
    Stream {
        peer_id: PeerId,
        subcluster_id: Id32,
        message: Vec<u8>,
        reply: oneshot::Sender<Result<Id32, LaticaError>>,
    },
    Query {
        data: String,
        reply: oneshot::Sender<Result<String, LaticaError>>,
    },
    Answer {
        query_id: String,
        data: String,
        reply: oneshot::Sender<Result<(), LaticaError>>,
    },
    AddPeer {
        peer: BootstrapPeer,
    },
    Peers {
        reply: oneshot::Sender<Vec<RemotePeer>>,
    },
    Info {
        reply: oneshot::Sender<EngineInfo>,
    },
    CacheSummary {
        prefix: String,
        reply: oneshot::Sender<Summary>,
    },
    Metrics {
        reply: oneshot::Sender<MetricsSnapshot>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<EngineSnapshot, LaticaError>>,
    },
    /// Re-run reflection and re-announce every subscription.
    Reconnect,
    /// Stop the loop and drop both sockets.
    Close,
}

// ── Events (engine → app) ─────────────────────────────────────────────

/// A PUBLISH or STREAM payload opened with a subscribed key.
#[derive(Debug, Clone)]
pub struct DeliveredPacket {
    pub packet_id: Id32,
    pub subcluster_id: Id32,
    pub previous_id: Id32,
    /// Publisher (PUBLISH) or origin (STREAM) peer, when carried.
    pub origin: Option<PeerId>,
    pub message: Vec<u8>,
    /// The author signature in the packet matched its signer key.
    pub verified: bool,
    pub clock: u32,
    pub hops: u32,
    pub from: SocketAddrV4,
}

/// Notifications emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// NAT type is known; the engine is reachable.
    Ready {
        nat_type: NatType,
        address: Option<Ipv4Addr>,
        port: u16,
    },
    NatChanged {
        old: NatType,
        new: NatType,
    },
    /// A connection handshake completed with a peer.
    Connection {
        peer_id: PeerId,
        address: SocketAddrV4,
        nat_type: NatType,
    },
    /// A peer announced itself in one of our subclusters.
    Join {
        peer_id: PeerId,
        cluster_id: Id32,
        subcluster_id: Id32,
    },
    Packet(DeliveredPacket),
    Stream(DeliveredPacket),
    /// A query reached this peer. Reply with [`EngineHandle::answer`].
    Query {
        query_id: String,
        data: Option<String>,
        from: SocketAddrV4,
    },
    /// An answer to one of our queries.
    Answer {
        query_id: String,
        data: Option<String>,
    },
    /// A cached packet expired.
    Delete {
        packet_id: Id32,
    },
    Warning {
        description: String,
    },
    Error {
        description: String,
    },
}

/// Point-in-time engine status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInfo {
    pub peer_id: PeerId,
    pub cluster_id: Option<Id32>,
    pub address: Option<Ipv4Addr>,
    /// Advertised port: the externally observed one when known.
    pub port: u16,
    pub local_port: u16,
    pub probe_port: u16,
    pub nat_type: NatType,
    pub clock: u32,
    pub uptime: u64,
    pub peers: usize,
    pub cache_size: usize,
    pub subclusters: Vec<Id32>,
    pub unpublished: usize,
}

// ── EngineHandle (app-facing API) ─────────────────────────────────────

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCommand>,
    peer_id: PeerId,
}

impl EngineHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> EngineCommand,
    ) -> Result<R, LaticaError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| LaticaError::Shutdown)?;
        rx.await.map_err(|_| LaticaError::Shutdown)
    }

    /// Subscribe to the subcluster derived from `shared_key`. Returns its id.
    pub async fn join(&self, shared_key: impl AsRef<[u8]>) -> Result<Id32, LaticaError> {
        let shared_key = shared_key.as_ref().to_vec();
        self.request(|reply| EngineCommand::Join { shared_key, reply })
            .await
    }

    pub async fn leave(&self, subcluster_id: Id32) -> Result<bool, LaticaError> {
        self.request(|reply| EngineCommand::Leave {
            subcluster_id,
            reply,
        })
        .await
    }

    /// Seal `message` for `subcluster_id`, cache it and flood it.
    /// Returns the id of the (head) packet.
    pub async fn publish(
        &self,
        subcluster_id: Id32,
        message: Vec<u8>,
        options: PublishOptions,
    ) -> Result<Id32, LaticaError> {
        self.request(|reply| EngineCommand::Publish {
            subcluster_id,
            message,
            options,
            reply,
        })
        .await?
    }

    /// Send a sealed message directly to one peer, relayed if needed.
    pub async fn stream(
        &self,
        peer_id: PeerId,
        subcluster_id: Id32,
        message: Vec<u8>,
    ) -> Result<Id32, LaticaError> {
        self.request(|reply| EngineCommand::Stream {
            peer_id,
            subcluster_id,
            message,
            reply,
        })
        .await?
    }

    /// Flood a query. Returns its id; answers arrive as [`EngineEvent::Answer`].
    pub async fn query(&self, data: impl Into<String>) -> Result<String, LaticaError> {
        let data = data.into();
        self.request(|reply| EngineCommand::Query { data, reply })
            .await?
    }

    pub async fn answer(
        &self,
        query_id: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), LaticaError> {
        let (query_id, data) = (query_id.into(), data.into());
        self.request(|reply| EngineCommand::Answer {
            query_id,
            data,
            reply,
        })
        .await?
    }

    /// Register a static peer and ping it.
    pub async fn add_peer(&self, peer: BootstrapPeer) -> Result<(), LaticaError> {
        self.cmd_tx
            .send(EngineCommand::AddPeer { peer })
            .await
            .map_err(|_| LaticaError::Shutdown)
    }

    pub async fn peers(&self) -> Result<Vec<RemotePeer>, LaticaError> {
        self.request(|reply| EngineCommand::Peers { reply }).await
    }

    pub async fn info(&self) -> Result<EngineInfo, LaticaError> {
        self.request(|reply| EngineCommand::Info { reply }).await
    }

    pub async fn cache_summary(&self, prefix: impl Into<String>) -> Result<Summary, LaticaError> {
        let prefix = prefix.into();
        self.request(|reply| EngineCommand::CacheSummary { prefix, reply })
            .await
    }

    pub async fn metrics(&self) -> Result<MetricsSnapshot, LaticaError> {
        self.request(|reply| EngineCommand::Metrics { reply }).await
    }

    /// Capture clock, cached frames and unpublished ids for a later restart.
    pub async fn snapshot(&self) -> Result<EngineSnapshot, LaticaError> {
        self.request(|reply| EngineCommand::Snapshot { reply })
            .await?
    }

    pub async fn reconnect(&self) -> Result<(), LaticaError> {
        self.cmd_tx
            .send(EngineCommand::Reconnect)
            .await
            .map_err(|_| LaticaError::Shutdown)
    }

    /// Stop the engine. Idempotent.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(EngineCommand::Close).await;
    }
}

// ── Engine ────────────────────────────────────────────────────────────

/// Channels returned to the application when the engine starts.
pub struct EngineChannels {
    pub handle: EngineHandle,
    pub events: mpsc::Receiver<EngineEvent>,
}

/// The peer engine. Bind it and communicate through [`EngineChannels`].
pub struct Engine;

impl Engine {
    /// Validate `config`, bind the main and probe sockets and spawn the loop.
    ///
    /// A failed bind is the only fatal error and is returned here.
    pub async fn bind(config: EngineConfig) -> Result<EngineChannels, LaticaError> {
        config.validate()?;

        let main = bind_socket(config.bind_address, config.port, Socket::Main).await?;
        let probe = bind_socket(config.bind_address, config.probe_port, Socket::Probe).await?;
        let local_port = main.local_addr()?.port();
        let probe_port = probe.local_addr()?.port();
        tracing::info!(
            peer = %config.peer_id,
            local_port,
            probe_port,
            "latica engine bound"
        );

        let peer_id = config.peer_id;
        let bind_address = config.bind_address;
        let metrics = Arc::new(EngineMetrics::default());
        let state =
            state::EngineState::new(config, local_port, probe_port, metrics.clone(), now_ms());

        let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<EngineEvent>(CHANNEL_CAPACITY);

        tokio::spawn(r#loop::engine_loop(
            state,
            r#loop::Sockets {
                main: Arc::new(main),
                probe: Arc::new(probe),
                bind_address,
            },
            cmd_rx,
            event_tx,
            metrics,
        ));

        Ok(EngineChannels {
            handle: EngineHandle { cmd_tx, peer_id },
            events: event_rx,
        })
    }
}

pub(crate) async fn bind_socket(
    address: Ipv4Addr,
    port: u16,
    socket: Socket,
) -> Result<UdpSocket, LaticaError> {
    UdpSocket::bind(SocketAddrV4::new(address, port))
        .await
        .map_err(|source| LaticaError::Bind {
            socket: socket.name(),
            source,
        })
}
