//! Latica relay protocol.
//!
//! A peer-to-peer relay engine over plain UDP: peers discover their NAT
//! type through reflection, connect through the best traversal strategy
//! for each pair, and flood encrypted, signed packets through subclusters
//! of a cluster. Each peer caches what it relays and reconciles the cache
//! with its neighbours through trie summaries.
//!
//! Wire format: fixed 1411-byte frames with a JSON message region.
//! Crypto: Ed25519 signatures + XChaCha20-Poly1305 sealed boxes.

pub mod cache;
pub mod config;
pub mod encryption;
pub mod error;
pub mod ledger;
pub mod nat;
pub mod packet;
pub mod peer;
pub mod runtime;
pub mod types;

pub use cache::{Cache, InsertOutcome, Summary};
pub use config::{BootstrapPeer, EngineConfig, EngineSnapshot};
pub use encryption::{KeyPair, Keyring};
pub use error::LaticaError;
pub use nat::{connection_strategy, NatType, Strategy};
pub use packet::{Packet, PacketType};
pub use peer::RemotePeer;
pub use runtime::{
    DeliveredPacket, Engine, EngineChannels, EngineEvent, EngineHandle, EngineInfo,
    PublishOptions,
};
pub use types::{now_ms, Id32, PeerId};
