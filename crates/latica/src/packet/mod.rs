//! Fixed-layout binary packet codec.
//!
//! Every datagram is exactly [`PACKET_BYTES`] long: a 4-byte magic prefix,
//! fixed-width numeric fields, five 32-byte identifiers, length-prefixed
//! variable regions and a zero-padded 1024-byte message region.
//!
//! [`encode`] fails loudly on oversized fields. [`decode`] never fails; it
//! returns `None` on any structural problem so the receive path can drop
//! uniformly.
mod chain;
mod message;
mod schema;

pub use chain::{fragment, ChainHead};
pub use message::{
    IntroMessage, JoinMessage, PacketBody, PingMessage, PongMessage, QueryMessage,
};
pub use schema::{validate_message, Constraint, FieldKind};

use crate::error::LaticaError;
use crate::types::{now_ms, sha256, Id32, EMPTY_ID};

/// The 2nd, 3rd, 5th and 7th primes.
pub const MAGIC: [u8; 4] = [0x03, 0x05, 0x0b, 0x11];
/// Current protocol version. Packets from older versions are dropped.
pub const VERSION: u16 = 6;
/// Size of the message region.
pub const MESSAGE_BYTES: usize = 1024;
/// Maximum number of hops a packet may travel.
pub const MAX_HOPS: u32 = 16;
/// Default time to live for cached packets (6 hours, in ms).
pub const CACHE_TTL: u32 = 6 * 60 * 60 * 1000;

const ID_BYTES: usize = 32;
const USR_BYTES: usize = 32;
const SIG_BYTES: usize = 64;

const HEADER_BYTES: usize = 4 + 1 + 2 + 4 + 4 + 4 + 4;
const HOPS_OFFSET: usize = 4 + 1 + 2 + 4;

/// Total size of every encoded packet.
pub const PACKET_BYTES: usize = HEADER_BYTES
    + 5 * ID_BYTES
    + 4 * (2 + USR_BYTES)
    + (2 + MESSAGE_BYTES)
    + (2 + SIG_BYTES);

/// Packet discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Ping = 1,
    Pong = 2,
    Intro = 3,
    Join = 4,
    Publish = 5,
    Stream = 6,
    Sync = 7,
    Query = 8,
}

impl PacketType {
    /// Whether packets of this type are flood-replicated (and share a rate bucket).
    pub fn is_replicatable(self) -> bool {
        matches!(
            self,
            PacketType::Publish | PacketType::Join | PacketType::Sync | PacketType::Query
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = LaticaError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => PacketType::Ping,
            2 => PacketType::Pong,
            3 => PacketType::Intro,
            4 => PacketType::Join,
            5 => PacketType::Publish,
            6 => PacketType::Stream,
            7 => PacketType::Sync,
            8 => PacketType::Query,
            other => return Err(LaticaError::InvalidPacketType(other)),
        })
    }
}

/// A decoded protocol packet.
///
/// `timestamp` and `is_composed` are local bookkeeping and never travel on
/// the wire; equality ignores them.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    pub version: u16,
    pub clock: u32,
    pub hops: u32,
    /// `-1` when not fragmented, `0` for a chain head, `n` for fragment `n`.
    pub index: i32,
    pub ttl: u32,
    pub cluster_id: Id32,
    pub subcluster_id: Id32,
    pub previous_id: Id32,
    pub packet_id: Id32,
    pub next_id: Id32,
    pub usr1: Vec<u8>,
    pub usr2: Vec<u8>,
    pub usr3: Vec<u8>,
    pub usr4: Vec<u8>,
    pub message: Vec<u8>,
    pub sig: Vec<u8>,
    /// Local receive or insert time in Unix ms.
    pub timestamp: u64,
    /// Set on packets reassembled from a fragment chain.
    pub is_composed: bool,
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.packet_type == other.packet_type
            && self.version == other.version
            && self.clock == other.clock
            && self.hops == other.hops
            && self.index == other.index
            && self.ttl == other.ttl
            && self.cluster_id == other.cluster_id
            && self.subcluster_id == other.subcluster_id
            && self.previous_id == other.previous_id
            && self.packet_id == other.packet_id
            && self.next_id == other.next_id
            && self.usr1 == other.usr1
            && self.usr2 == other.usr2
            && self.usr3 == other.usr3
            && self.usr4 == other.usr4
            && self.message == other.message
            && self.sig == other.sig
    }
}

impl Eq for Packet {}

impl Packet {
    /// An empty, unfragmented packet of the given type.
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            version: VERSION,
            clock: 0,
            hops: 0,
            index: -1,
            ttl: CACHE_TTL,
            cluster_id: EMPTY_ID,
            subcluster_id: EMPTY_ID,
            previous_id: EMPTY_ID,
            packet_id: EMPTY_ID,
            next_id: EMPTY_ID,
            usr1: Vec::new(),
            usr2: Vec::new(),
            usr3: Vec::new(),
            usr4: Vec::new(),
            message: Vec::new(),
            sig: Vec::new(),
            timestamp: now_ms(),
            is_composed: false,
        }
    }

    /// The explicit packet id, or the content hash when none was set.
    pub fn id(&self) -> Id32 {
        if self.packet_id != EMPTY_ID {
            return self.packet_id;
        }
        let mut buf = Vec::with_capacity(2 * ID_BYTES + self.message.len());
        buf.extend_from_slice(&self.previous_id);
        buf.extend_from_slice(&self.message);
        buf.extend_from_slice(&self.next_id);
        sha256(&buf)
    }

    /// Fill `packet_id` from the content hash if it is unset.
    pub fn ensure_id(&mut self) -> Id32 {
        self.packet_id = self.id();
        self.packet_id
    }

    /// Hex rendering of [`Packet::id`], the cache key.
    pub fn id_hex(&self) -> String {
        hex::encode(self.id())
    }

    pub fn is_fragment(&self) -> bool {
        self.index > 0
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn put(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// 2-byte length followed by `bytes` zero-padded to `region`.
    fn put_region(
        &mut self,
        field: &'static str,
        bytes: &[u8],
        region: usize,
    ) -> Result<(), LaticaError> {
        if bytes.len() > region {
            return Err(LaticaError::SizeLimit {
                field,
                size: bytes.len(),
                max: region,
            });
        }
        self.put(&(bytes.len() as u16).to_be_bytes());
        self.put(bytes);
        self.buf.resize(self.buf.len() + region - bytes.len(), 0);
        Ok(())
    }
}

/// Encode a packet into a fixed-size frame.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, LaticaError> {
    let mut w = Writer {
        buf: Vec::with_capacity(PACKET_BYTES),
    };

    w.put(&MAGIC);
    w.put(&[packet.packet_type as u8]);
    w.put(&packet.version.to_be_bytes());
    w.put(&packet.clock.to_be_bytes());
    w.put(&packet.hops.to_be_bytes());
    w.put(&packet.index.to_be_bytes());
    w.put(&packet.ttl.to_be_bytes());

    w.put(&packet.cluster_id);
    w.put(&packet.subcluster_id);
    w.put(&packet.previous_id);
    w.put(&packet.id());
    w.put(&packet.next_id);

    w.put_region("usr1", &packet.usr1, USR_BYTES)?;
    w.put_region("usr2", &packet.usr2, USR_BYTES)?;
    w.put_region("usr3", &packet.usr3, USR_BYTES)?;
    w.put_region("usr4", &packet.usr4, USR_BYTES)?;
    w.put_region("message", &packet.message, MESSAGE_BYTES)?;
    w.put_region("sig", &packet.sig, SIG_BYTES)?;

    debug_assert_eq!(w.buf.len(), PACKET_BYTES);
    Ok(w.buf)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    fn region(&mut self, region: usize) -> Option<Vec<u8>> {
        let len = u16::from_be_bytes(self.array()?) as usize;
        let bytes = self.take(region)?;
        if len > region {
            return None;
        }
        Some(bytes[..len].to_vec())
    }
}

/// Decode a frame. Returns `None` on wrong magic, truncation, an unknown
/// type or a length prefix that overflows its region.
pub fn decode(buf: &[u8]) -> Option<Packet> {
    if !is_packet(buf) || buf.len() < PACKET_BYTES {
        return None;
    }

    let mut r = Reader { buf, pos: MAGIC.len() };
    let [ty] = r.array::<1>()?;
    let packet_type = PacketType::try_from(ty).ok()?;

    Some(Packet {
        packet_type,
        version: u16::from_be_bytes(r.array()?),
        clock: u32::from_be_bytes(r.array()?),
        hops: u32::from_be_bytes(r.array()?),
        index: i32::from_be_bytes(r.array()?),
        ttl: u32::from_be_bytes(r.array()?),
        cluster_id: r.array()?,
        subcluster_id: r.array()?,
        previous_id: r.array()?,
        packet_id: r.array()?,
        next_id: r.array()?,
        usr1: r.region(USR_BYTES)?,
        usr2: r.region(USR_BYTES)?,
        usr3: r.region(USR_BYTES)?,
        usr4: r.region(USR_BYTES)?,
        message: r.region(MESSAGE_BYTES)?,
        sig: r.region(SIG_BYTES)?,
        timestamp: now_ms(),
        is_composed: false,
    })
}

/// Cheap check of the magic prefix.
pub fn is_packet(buf: &[u8]) -> bool {
    buf.len() >= MAGIC.len() && buf[..MAGIC.len()] == MAGIC
}

/// Increment the hop counter of an already-encoded frame in place.
///
/// Returns `false` if `buf` is not a packet.
pub fn add_hops(buf: &mut [u8], n: u32) -> bool {
    if !is_packet(buf) || buf.len() < HOPS_OFFSET + 4 {
        return false;
    }
    let mut hops = [0u8; 4];
    hops.copy_from_slice(&buf[HOPS_OFFSET..HOPS_OFFSET + 4]);
    let hops = u32::from_be_bytes(hops).saturating_add(n);
    buf[HOPS_OFFSET..HOPS_OFFSET + 4].copy_from_slice(&hops.to_be_bytes());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        let mut p = Packet::new(PacketType::Publish);
        p.clock = 7;
        p.hops = 2;
        p.index = 0;
        p.cluster_id = [1; 32];
        p.subcluster_id = [2; 32];
        p.usr2 = vec![9; 32];
        p.message = b"hello".to_vec();
        p.sig = vec![4; 64];
        p
    }

    #[test]
    fn frame_size_is_constant() {
        assert_eq!(PACKET_BYTES, 1411);
        let small = encode(&Packet::new(PacketType::Ping)).unwrap();
        let big = encode(&sample()).unwrap();
        assert_eq!(small.len(), PACKET_BYTES);
        assert_eq!(big.len(), PACKET_BYTES);
    }

    #[test]
    fn roundtrip_fills_packet_id() {
        let p = sample();
        let bytes = encode(&p).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back.packet_id, p.id());
        assert_ne!(back.packet_id, EMPTY_ID);

        let mut expected = p.clone();
        expected.ensure_id();
        assert_eq!(back, expected);
    }

    #[test]
    fn explicit_packet_id_is_kept() {
        let mut p = sample();
        p.packet_id = [0xee; 32];
        let back = decode(&encode(&p).unwrap()).unwrap();
        assert_eq!(back.packet_id, [0xee; 32]);
    }

    #[test]
    fn oversized_fields_fail_encode() {
        let mut p = sample();
        p.message = vec![0; MESSAGE_BYTES + 1];
        let err = encode(&p).unwrap_err();
        assert!(matches!(err, LaticaError::SizeLimit { field: "message", .. }));

        let mut p = sample();
        p.usr3 = vec![0; 33];
        assert!(matches!(
            encode(&p),
            Err(LaticaError::SizeLimit { field: "usr3", .. })
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(&[]).is_none());
        assert!(decode(b"not a packet at all").is_none());

        let bytes = encode(&sample()).unwrap();
        assert!(decode(&bytes[..PACKET_BYTES - 1]).is_none());

        let mut bad_magic = bytes.clone();
        bad_magic[0] = 0xff;
        assert!(decode(&bad_magic).is_none());

        let mut bad_type = bytes.clone();
        bad_type[4] = 99;
        assert!(decode(&bad_type).is_none());
    }

    #[test]
    fn decode_rejects_overflowing_length() {
        let mut bytes = encode(&sample()).unwrap();
        // usr1 length prefix sits right after the five ids
        let off = HEADER_BYTES + 5 * ID_BYTES;
        bytes[off..off + 2].copy_from_slice(&100u16.to_be_bytes());
        assert!(decode(&bytes).is_none());
    }

    #[test]
    fn add_hops_in_place() {
        let mut bytes = encode(&sample()).unwrap();
        assert!(add_hops(&mut bytes, 3));
        assert_eq!(decode(&bytes).unwrap().hops, 5);
        assert!(!add_hops(&mut [0u8; 8], 1));
    }

    #[test]
    fn packet_type_conversion() {
        assert_eq!(PacketType::try_from(5).unwrap(), PacketType::Publish);
        assert!(PacketType::try_from(0).is_err());
        assert!(PacketType::Query.is_replicatable());
        assert!(!PacketType::Pong.is_replicatable());
    }
}
