//! Typed JSON messages carried by PING, PONG, INTRO, JOIN and QUERY packets.
//!
//! A received message is validated against its constraint table before it
//! is deserialized, so a schema failure names the offending field.
use std::net::Ipv4Addr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::schema::{
    is_ipv4, is_nat_type, is_peer_id, is_port, is_summary_hash, is_token, validate_message,
    Constraint, FieldKind,
};
use super::{Packet, PacketType};
use crate::error::LaticaError;
use crate::nat::NatType;
use crate::types::PeerId;

const S: FieldKind = FieldKind::String;
const N: FieldKind = FieldKind::Number;
const B: FieldKind = FieldKind::Boolean;

fn is_false(b: &bool) -> bool {
    !*b
}

/// Liveness probe, reflection request or connection attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingMessage {
    pub requester_peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_summary_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_external_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_type: Option<NatType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<u64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_connection: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_reflection: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_probe: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_debug: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl PingMessage {
    pub fn new(requester_peer_id: PeerId) -> Self {
        Self {
            requester_peer_id,
            cache_summary_hash: None,
            probe_external_port: None,
            reflection_id: None,
            ping_id: None,
            nat_type: None,
            uptime: None,
            cache_size: None,
            is_connection: false,
            is_reflection: false,
            is_probe: false,
            is_debug: false,
            timestamp: None,
        }
    }

    pub const SCHEMA: &'static [(&'static str, Constraint)] = &[
        ("requesterPeerId", Constraint::required(S).with(is_peer_id)),
        ("cacheSummaryHash", Constraint::optional(S).with(is_summary_hash)),
        ("probeExternalPort", Constraint::optional(N).with(is_port)),
        ("reflectionId", Constraint::optional(S).with(is_token)),
        ("pingId", Constraint::optional(S).with(is_token)),
        ("natType", Constraint::optional(N).with(is_nat_type)),
        ("uptime", Constraint::optional(N)),
        ("cacheSize", Constraint::optional(N)),
        ("isConnection", Constraint::optional(B)),
        ("isReflection", Constraint::optional(B)),
        ("isProbe", Constraint::optional(B)),
        ("isDebug", Constraint::optional(B)),
        ("timestamp", Constraint::optional(N)),
    ];
}

/// Reply to a [`PingMessage`]. Reports what the responder observed about
/// the requester's address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongMessage {
    pub requester_peer_id: PeerId,
    pub responder_peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_summary_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_type: Option<NatType>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_reflection: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_connection: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_id: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_debug: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_probe: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub rejected: bool,
}

impl PongMessage {
    pub fn new(requester_peer_id: PeerId, responder_peer_id: PeerId) -> Self {
        Self {
            requester_peer_id,
            responder_peer_id,
            cache_summary_hash: None,
            port: None,
            address: None,
            uptime: None,
            cache_size: None,
            nat_type: None,
            is_reflection: false,
            is_connection: false,
            reflection_id: None,
            ping_id: None,
            is_debug: false,
            is_probe: false,
            rejected: false,
        }
    }

    pub const SCHEMA: &'static [(&'static str, Constraint)] = &[
        ("requesterPeerId", Constraint::required(S).with(is_peer_id)),
        ("responderPeerId", Constraint::required(S).with(is_peer_id)),
        ("cacheSummaryHash", Constraint::optional(S).with(is_summary_hash)),
        ("port", Constraint::optional(N).with(is_port)),
        ("address", Constraint::optional(S).with(is_ipv4)),
        ("uptime", Constraint::optional(N)),
        ("cacheSize", Constraint::optional(N)),
        ("natType", Constraint::optional(N).with(is_nat_type)),
        ("isReflection", Constraint::optional(B)),
        ("isConnection", Constraint::optional(B)),
        ("reflectionId", Constraint::optional(S).with(is_token)),
        ("pingId", Constraint::optional(S).with(is_token)),
        ("isDebug", Constraint::optional(B)),
        ("isProbe", Constraint::optional(B)),
        ("rejected", Constraint::optional(B)),
    ];
}

/// Sent by a common contact to tell the receiver to connect to
/// `responder_peer_id` at `address:port`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntroMessage {
    pub requester_peer_id: PeerId,
    pub responder_peer_id: PeerId,
    pub nat_type: NatType,
    pub address: Ipv4Addr,
    pub port: u16,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_rendezvous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl IntroMessage {
    pub const SCHEMA: &'static [(&'static str, Constraint)] = &[
        ("requesterPeerId", Constraint::required(S).with(is_peer_id)),
        ("responderPeerId", Constraint::required(S).with(is_peer_id)),
        ("natType", Constraint::required(N).with(is_nat_type)),
        ("address", Constraint::required(S).with(is_ipv4)),
        ("port", Constraint::required(N).with(is_port)),
        ("isRendezvous", Constraint::optional(B)),
        ("timestamp", Constraint::optional(N)),
    ];
}

/// Flood-replicated announcement that the requester wants into a
/// cluster/subcluster. The rendezvous fields are stamped by an
/// unrestricted peer that agrees to broker introductions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMessage {
    pub requester_peer_id: PeerId,
    pub nat_type: NatType,
    pub address: Ipv4Addr,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendezvous_address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendezvous_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendezvous_type: Option<NatType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendezvous_peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendezvous_deadline: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendezvous_requester_peer_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_connection: bool,
}

impl JoinMessage {
    pub fn new(requester_peer_id: PeerId, nat_type: NatType, address: Ipv4Addr, port: u16) -> Self {
        Self {
            requester_peer_id,
            nat_type,
            address,
            port,
            rendezvous_address: None,
            rendezvous_port: None,
            rendezvous_type: None,
            rendezvous_peer_id: None,
            rendezvous_deadline: None,
            rendezvous_requester_peer_id: None,
            is_connection: false,
        }
    }

    pub const SCHEMA: &'static [(&'static str, Constraint)] = &[
        ("requesterPeerId", Constraint::required(S).with(is_peer_id)),
        ("natType", Constraint::required(N).with(is_nat_type)),
        ("address", Constraint::required(S).with(is_ipv4)),
        ("port", Constraint::required(N).with(is_port)),
        ("rendezvousAddress", Constraint::optional(S).with(is_ipv4)),
        ("rendezvousPort", Constraint::optional(N).with(is_port)),
        ("rendezvousType", Constraint::optional(N).with(is_nat_type)),
        ("rendezvousPeerId", Constraint::optional(S).with(is_peer_id)),
        ("rendezvousDeadline", Constraint::optional(N)),
        ("rendezvousRequesterPeerId", Constraint::optional(S).with(is_peer_id)),
        ("isConnection", Constraint::optional(B)),
    ];
}

/// Opportunistic request (or, with `is_answer`, its reply) routed along
/// the flood topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMessage {
    pub query_id: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_answer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl QueryMessage {
    pub const SCHEMA: &'static [(&'static str, Constraint)] = &[
        ("queryId", Constraint::required(S).with(is_token)),
        ("timestamp", Constraint::required(N)),
        ("isAnswer", Constraint::optional(B)),
        ("data", Constraint::optional(S)),
    ];
}

/// A packet's payload resolved by type. PUBLISH, STREAM and SYNC carry raw
/// bytes and are read from [`Packet::message`] directly.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Ping(PingMessage),
    Pong(PongMessage),
    Intro(IntroMessage),
    Join(JoinMessage),
    Publish,
    Stream,
    Sync,
    Query(QueryMessage),
}

fn parse<T: DeserializeOwned>(
    bytes: &[u8],
    table: &[(&'static str, Constraint)],
) -> Result<T, LaticaError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let map = value.as_object().ok_or(LaticaError::NotAnObject)?;
    validate_message(map, table)?;
    Ok(serde_json::from_value(value)?)
}

impl Packet {
    /// Build a packet whose message is `msg` serialized as JSON.
    pub fn with_message<T: Serialize>(
        packet_type: PacketType,
        msg: &T,
    ) -> Result<Self, LaticaError> {
        let mut packet = Packet::new(packet_type);
        packet.message = serde_json::to_vec(msg)?;
        Ok(packet)
    }

    pub fn ping(msg: &PingMessage) -> Result<Self, LaticaError> {
        Self::with_message(PacketType::Ping, msg)
    }

    pub fn pong(msg: &PongMessage) -> Result<Self, LaticaError> {
        Self::with_message(PacketType::Pong, msg)
    }

    pub fn intro(msg: &IntroMessage) -> Result<Self, LaticaError> {
        Self::with_message(PacketType::Intro, msg)
    }

    pub fn join(msg: &JoinMessage) -> Result<Self, LaticaError> {
        Self::with_message(PacketType::Join, msg)
    }

    pub fn query(msg: &QueryMessage) -> Result<Self, LaticaError> {
        Self::with_message(PacketType::Query, msg)
    }

    /// Resolve the typed body, validating JSON messages against their schema.
    pub fn body(&self) -> Result<PacketBody, LaticaError> {
        Ok(match self.packet_type {
            PacketType::Ping => PacketBody::Ping(parse(&self.message, PingMessage::SCHEMA)?),
            PacketType::Pong => PacketBody::Pong(parse(&self.message, PongMessage::SCHEMA)?),
            PacketType::Intro => PacketBody::Intro(parse(&self.message, IntroMessage::SCHEMA)?),
            PacketType::Join => PacketBody::Join(parse(&self.message, JoinMessage::SCHEMA)?),
            PacketType::Query => PacketBody::Query(parse(&self.message, QueryMessage::SCHEMA)?),
            PacketType::Publish => PacketBody::Publish,
            PacketType::Stream => PacketBody::Stream,
            PacketType::Sync => PacketBody::Sync,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{decode, encode};

    #[test]
    fn ping_roundtrip_through_wire() {
        let mut msg = PingMessage::new(PeerId::from_bytes([3; 32]));
        msg.nat_type = Some(NatType::PORT_RESTRICTED);
        msg.ping_id = Some(crate::types::random_token());
        msg.is_reflection = true;

        let packet = Packet::ping(&msg).unwrap();
        let back = decode(&encode(&packet).unwrap()).unwrap();
        assert_eq!(back.body().unwrap(), PacketBody::Ping(msg));
    }

    #[test]
    fn defaults_are_omitted_on_the_wire() {
        let msg = PingMessage::new(PeerId::from_bytes([3; 32]));
        let json: Value = serde_json::to_value(&msg).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("requesterPeerId"));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut packet = Packet::new(PacketType::Ping);
        packet.message = format!(
            r#"{{"requesterPeerId":"{}","bogus":true}}"#,
            "ab".repeat(32)
        )
        .into_bytes();
        assert!(matches!(packet.body(), Err(LaticaError::UnexpectedKeys(_))));
    }

    #[test]
    fn intro_requires_address() {
        let mut packet = Packet::new(PacketType::Intro);
        packet.message = serde_json::to_vec(&serde_json::json!({
            "requesterPeerId": "ab".repeat(32),
            "responderPeerId": "cd".repeat(32),
            "natType": 31,
            "port": 9000,
        }))
        .unwrap();
        assert!(matches!(
            packet.body(),
            Err(LaticaError::MissingKey("address"))
        ));
    }

    #[test]
    fn invalid_nat_type_fails_assertion() {
        let mut packet = Packet::new(PacketType::Join);
        packet.message = serde_json::to_vec(&serde_json::json!({
            "requesterPeerId": "ab".repeat(32),
            "natType": 2,
            "address": "1.2.3.4",
            "port": 9000,
        }))
        .unwrap();
        assert!(matches!(
            packet.body(),
            Err(LaticaError::AssertionFailed("natType"))
        ));
    }

    #[test]
    fn non_object_message() {
        let mut packet = Packet::new(PacketType::Query);
        packet.message = b"[1,2]".to_vec();
        assert!(matches!(packet.body(), Err(LaticaError::NotAnObject)));

        packet.message = b"not json".to_vec();
        assert!(matches!(packet.body(), Err(LaticaError::Json(_))));
    }

    #[test]
    fn raw_bodies_skip_schema() {
        let mut packet = Packet::new(PacketType::Publish);
        packet.message = vec![0xff; 10];
        assert_eq!(packet.body().unwrap(), PacketBody::Publish);
    }

    #[test]
    fn query_roundtrip() {
        let msg = QueryMessage {
            query_id: crate::types::random_token(),
            timestamp: 42,
            is_answer: true,
            data: Some("who has it".into()),
        };
        let packet = Packet::query(&msg).unwrap();
        assert_eq!(packet.body().unwrap(), PacketBody::Query(msg));
    }
}
