use std::io::Write;

use latica::{DeliveredPacket, EngineEvent};
use serde::Serialize;
use serde_json::{json, Value};

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(line) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{line}");
        let _ = lock.flush();
    }
}

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub peer_id: String,
    pub mode: &'static str,
    pub timestamp: u64,
}

impl EventStarted {
    pub fn new(peer_id: &latica::PeerId, mode: &'static str) -> Self {
        Self {
            event: "started",
            peer_id: peer_id.to_string(),
            mode,
            timestamp: latica::now_ms(),
        }
    }
}

#[derive(Serialize)]
pub struct EventSummary {
    pub event: &'static str,
    pub received: u64,
    pub elapsed_s: f64,
}

// ── Engine events ───────────────────────────────────────────────

fn message_text(message: &[u8]) -> Value {
    match std::str::from_utf8(message) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => json!({ "hex": hex::encode(message) }),
    }
}

fn delivered(kind: &str, p: &DeliveredPacket, elapsed_s: f64) -> Value {
    json!({
        "event": kind,
        "packet_id": hex::encode(p.packet_id),
        "subcluster_id": hex::encode(p.subcluster_id),
        "origin": p.origin.map(|id| id.to_string()),
        "message": message_text(&p.message),
        "verified": p.verified,
        "clock": p.clock,
        "hops": p.hops,
        "from": p.from.to_string(),
        "elapsed_s": elapsed_s,
    })
}

/// JSONL form of an engine event.
pub fn engine_event(event: &EngineEvent, elapsed_s: f64) -> Value {
    match event {
        EngineEvent::Ready {
            nat_type,
            address,
            port,
        } => json!({
            "event": "ready",
            "nat_type": nat_type.to_string(),
            "address": address.map(|a| a.to_string()),
            "port": port,
            "elapsed_s": elapsed_s,
        }),
        EngineEvent::NatChanged { old, new } => json!({
            "event": "nat_changed",
            "old": old.to_string(),
            "new": new.to_string(),
            "elapsed_s": elapsed_s,
        }),
        EngineEvent::Connection {
            peer_id,
            address,
            nat_type,
        } => json!({
            "event": "connection",
            "peer_id": peer_id.to_string(),
            "address": address.to_string(),
            "nat_type": nat_type.to_string(),
            "elapsed_s": elapsed_s,
        }),
        EngineEvent::Join {
            peer_id,
            subcluster_id,
            ..
        } => json!({
            "event": "join",
            "peer_id": peer_id.to_string(),
            "subcluster_id": hex::encode(subcluster_id),
            "elapsed_s": elapsed_s,
        }),
        EngineEvent::Packet(p) => delivered("packet", p, elapsed_s),
        EngineEvent::Stream(p) => delivered("stream", p, elapsed_s),
        EngineEvent::Query {
            query_id,
            data,
            from,
        } => json!({
            "event": "query",
            "query_id": query_id,
            "data": data,
            "from": from.to_string(),
            "elapsed_s": elapsed_s,
        }),
        EngineEvent::Answer { query_id, data } => json!({
            "event": "answer",
            "query_id": query_id,
            "data": data,
            "elapsed_s": elapsed_s,
        }),
        EngineEvent::Delete { packet_id } => json!({
            "event": "delete",
            "packet_id": hex::encode(packet_id),
            "elapsed_s": elapsed_s,
        }),
        EngineEvent::Warning { description } => json!({
            "event": "warning",
            "description": description,
            "elapsed_s": elapsed_s,
        }),
        EngineEvent::Error { description } => json!({
            "event": "error",
            "description": description,
            "elapsed_s": elapsed_s,
        }),
    }
}
