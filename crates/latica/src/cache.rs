//! Bounded store of published packets with trie summaries for diff sync.
//!
//! Keys are the lowercase hex packet ids. Viewing the key set as a 16-ary
//! trie of hex digits, [`Cache::summarize`] returns a checksum for one
//! trie node and its 16 children. Two peers compare roots, then descend
//! one hex digit at a time into the buckets that differ:
//!
//! ```text
//! Level  0   1   2
//! ----------------
//! 2b00
//! aa0e  ━┓  ━┓
//! aa1b   ┃   ┃
//! aae3   ┃   ┃  ━┓
//! aaea   ┃   ┃   ┃
//! aaeb   ┃  ━┛  ━┛
//! ab00   ┃  ━┓
//! abf0  ━┛  ━┛
//! bff9
//! ```
use std::cmp::Ordering;
use std::collections::HashMap;

use sha1::{Digest, Sha1};

use crate::packet::{ChainHead, Packet, PacketType, CACHE_TTL, PACKET_BYTES};
use crate::types::{now_ms, sha256};

/// Size of a summary hash.
pub const HASH_SIZE: usize = 20;

/// Root hash of a summary whose buckets are all empty: SHA-1 of "".
pub const EMPTY_SUMMARY_HEX: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";
pub const EMPTY_SUMMARY_HASH: [u8; HASH_SIZE] = [
    0xda, 0x39, 0xa3, 0xee, 0x5e, 0x6b, 0x4b, 0x0d, 0x32, 0x55, 0xbf, 0xef, 0x95, 0x60, 0x18,
    0x90, 0xaf, 0xd8, 0x07, 0x09,
];

/// Capacity derived from a 16 MB budget of fixed-size frames.
pub const DEFAULT_MAX_SIZE: usize = 16_000_000usize.div_ceil(PACKET_BYTES);

/// Digest used for trie summaries.
pub trait SummaryDigest: Send + Sync {
    fn digest(&self, data: &[u8]) -> [u8; HASH_SIZE];
}

/// SHA-1, the digest every peer on the network agrees on.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1Digest;

impl SummaryDigest for Sha1Digest {
    fn digest(&self, data: &[u8]) -> [u8; HASH_SIZE] {
        Sha1::digest(data).into()
    }
}

/// Orders two sibling packets (same `previous_id`); the greatest is latest.
pub type SiblingResolver = fn(&Packet, &Packet) -> Ordering;

pub fn default_sibling_resolver(a: &Packet, b: &Packet) -> Ordering {
    a.clock.cmp(&b.clock)
}

/// Result of [`Cache::insert`].
#[derive(Debug)]
pub enum InsertOutcome {
    /// Stored. Carries the entry evicted to make room, if any.
    Inserted { evicted: Option<Packet> },
    /// Not stored: wrong packet type or the key already exists.
    Skipped,
}

impl InsertOutcome {
    pub fn inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted { .. })
    }
}

/// One trie node: a root hash and 16 child bucket hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub prefix: String,
    pub hash: [u8; HASH_SIZE],
    pub buckets: [Option<[u8; HASH_SIZE]>; 16],
}

impl Summary {
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Prefixes (one hex digit deeper) of the buckets that differ from `other`.
    pub fn differing_buckets(&self, other: &Summary) -> Vec<(usize, String)> {
        (0..16)
            .filter(|&i| self.buckets[i] != other.buckets[i])
            .map(|i| (i, format!("{}{:x}", self.prefix, i)))
            .collect()
    }
}

pub struct Cache {
    data: HashMap<String, Packet>,
    max_size: usize,
    sibling_resolver: SiblingResolver,
    digest: Box<dyn SummaryDigest>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            data: HashMap::new(),
            max_size: max_size.max(1),
            sibling_resolver: default_sibling_resolver,
            digest: Box::new(Sha1Digest),
        }
    }

    pub fn set_sibling_resolver(&mut self, resolver: SiblingResolver) {
        self.sibling_resolver = resolver;
    }

    pub fn set_digest(&mut self, digest: Box<dyn SummaryDigest>) {
        self.digest = digest;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the cache in encoded bytes.
    pub fn bytes(&self) -> usize {
        self.data.len() * PACKET_BYTES
    }

    /// Insert a PUBLISH packet stamped with the current time.
    pub fn insert(&mut self, key: String, packet: Packet) -> InsertOutcome {
        self.insert_at(key, packet, now_ms())
    }

    /// Insert a PUBLISH packet stamped with `now`.
    ///
    /// At capacity the entry with the oldest timestamp is evicted first and
    /// returned so the caller can re-gossip it.
    pub fn insert_at(&mut self, key: String, mut packet: Packet, now: u64) -> InsertOutcome {
        if packet.packet_type != PacketType::Publish || self.data.contains_key(&key) {
            return InsertOutcome::Skipped;
        }

        let mut evicted = None;
        if self.data.len() >= self.max_size {
            let oldest = self
                .data
                .iter()
                .min_by_key(|(_, p)| p.timestamp)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                evicted = self.data.remove(&k);
            }
        }

        packet.timestamp = now;
        if packet.ttl == 0 {
            packet.ttl = CACHE_TTL;
        }
        self.data.insert(key, packet);
        InsertOutcome::Inserted { evicted }
    }

    pub fn get(&self, key: &str) -> Option<&Packet> {
        self.data.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn delete(&mut self, key: &str) -> Option<Packet> {
        self.data.remove(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &Packet> {
        self.data.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Packet)> {
        self.data.iter()
    }

    /// Remove and return every entry with `now - timestamp > ttl`.
    pub fn expire(&mut self, now: u64) -> Vec<Packet> {
        let expired: Vec<String> = self
            .data
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.timestamp) > p.ttl as u64)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| self.data.remove(&k))
            .collect()
    }

    /// Keys under `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Reassemble a fragmented message from this cache.
    pub fn compose(&self, packet: &Packet) -> Option<Packet> {
        compose(packet, self.data.values())
    }

    /// The latest packet chained after `previous_id`, by the sibling resolver.
    pub fn latest_sibling(&self, previous_id: &[u8; 32]) -> Option<&Packet> {
        let resolver = self.sibling_resolver;
        self.data
            .values()
            .filter(|p| &p.previous_id == previous_id)
            .max_by(|a, b| resolver(a, b))
    }

    /// Summarize the keys under `prefix` that satisfy `predicate`.
    pub fn summarize(&self, prefix: &str, predicate: impl Fn(&Packet) -> bool) -> Summary {
        let mut children: [Vec<&str>; 16] = Default::default();

        for (key, packet) in &self.data {
            if !key.starts_with(prefix) || !predicate(packet) {
                continue;
            }
            let Some(digit) = key[prefix.len()..].chars().next().and_then(|c| c.to_digit(16)) else {
                continue;
            };
            children[digit as usize].push(key.as_str());
        }

        let mut buckets = [None; 16];
        for (i, child) in children.iter_mut().enumerate() {
            if child.is_empty() {
                continue;
            }
            child.sort_unstable();
            buckets[i] = Some(self.digest.digest(child.concat().as_bytes()));
        }

        let hash = if buckets.iter().all(Option::is_none) {
            EMPTY_SUMMARY_HASH
        } else {
            let joined: String = buckets.iter().flatten().map(hex::encode).collect();
            self.digest.digest(joined.as_bytes())
        };

        Summary {
            prefix: prefix.to_string(),
            hash,
            buckets,
        }
    }
}

/// Reassemble the chain `packet` belongs to from the packets in `source`.
///
/// `packet` may be the head or any fragment. Returns `None` if the head is
/// missing, is not a valid chain head, or any fragment is missing.
pub fn compose<'a, I>(packet: &Packet, source: I) -> Option<Packet>
where
    I: IntoIterator<Item = &'a Packet>,
{
    let source: Vec<&Packet> = source.into_iter().collect();

    let head = if packet.index > 0 {
        source
            .iter()
            .copied()
            .find(|p| p.packet_id == packet.previous_id && p.index == 0)?
    } else {
        packet
    };
    if head.index != 0 {
        return None;
    }

    let meta: ChainHead = serde_json::from_slice(&head.message).ok()?;

    let mut fragments: Vec<&Packet> = source
        .into_iter()
        .filter(|p| p.previous_id == head.packet_id && p.index > 0)
        .collect();
    fragments.sort_by_key(|p| p.index);
    fragments.dedup_by_key(|p| p.index);

    if fragments.len() < meta.indexes {
        return None;
    }
    fragments.truncate(meta.indexes);
    if fragments
        .iter()
        .enumerate()
        .any(|(i, p)| p.index != i as i32 + 1)
    {
        return None;
    }

    let mut message: Vec<u8> = fragments.iter().flat_map(|p| p.message.iter().copied()).collect();
    if message.len() < meta.size {
        return None;
    }
    message.truncate(meta.size);

    let mut id_input = Vec::with_capacity(32 + message.len());
    id_input.extend_from_slice(&head.previous_id);
    id_input.extend_from_slice(&message);

    let mut composed = head.clone();
    composed.packet_id = sha256(&id_input);
    composed.message = message;
    composed.index = -1;
    composed.is_composed = true;
    Some(composed)
}

/// Wire form: `[1B prefix len][packed hex prefix][20B root]` followed by
/// `[1B bucket index][20B hash]` for each non-empty bucket.
pub fn encode_summary(summary: &Summary) -> Vec<u8> {
    let plen = summary.prefix.len().min(u8::MAX as usize);
    let padded = if plen % 2 == 1 {
        format!("0{}", &summary.prefix[..plen])
    } else {
        summary.prefix[..plen].to_string()
    };

    let mut out = Vec::with_capacity(1 + padded.len() / 2 + HASH_SIZE * 17);
    out.push(plen as u8);
    let nibbles: Vec<u8> = padded
        .chars()
        .map(|c| c.to_digit(16).unwrap_or(0) as u8)
        .collect();
    for pair in nibbles.chunks(2) {
        out.push((pair[0] << 4) | pair[1]);
    }

    out.extend_from_slice(&summary.hash);
    for (i, bucket) in summary.buckets.iter().enumerate() {
        if let Some(hash) = bucket {
            out.push(i as u8);
            out.extend_from_slice(hash);
        }
    }
    out
}

/// Inverse of [`encode_summary`]. `None` on truncation or a bad bucket index.
pub fn decode_summary(buf: &[u8]) -> Option<Summary> {
    let (&plen, rest) = buf.split_first()?;
    let plen = plen as usize;
    let nbytes = plen.div_ceil(2);
    let prefix_bytes = rest.get(..nbytes)?;
    let prefix_hex = hex::encode(prefix_bytes);
    let prefix = prefix_hex[prefix_hex.len() - plen..].to_string();

    let rest = &rest[nbytes..];
    let hash: [u8; HASH_SIZE] = rest.get(..HASH_SIZE)?.try_into().ok()?;

    let mut buckets = [None; 16];
    let mut rows = &rest[HASH_SIZE..];
    while !rows.is_empty() {
        let (&idx, tail) = rows.split_first()?;
        let slot = buckets.get_mut(idx as usize)?;
        *slot = Some(tail.get(..HASH_SIZE)?.try_into().ok()?);
        rows = &tail[HASH_SIZE..];
    }

    Some(Summary {
        prefix,
        hash,
        buckets,
    })
}
