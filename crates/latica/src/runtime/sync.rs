//! Cache reconciliation by exchanging trie summaries.
use std::net::SocketAddrV4;

use tracing::debug;

use crate::cache::{decode_summary, encode_summary};
use crate::packet::{Packet, PacketType};

use super::effect::EngineEffect;
use super::state::EngineState;

/// Length of a hex cache key; a bucket at this depth is a single entry.
const KEY_HEX_LEN: usize = 64;

impl EngineState {
    /// Send our summary of the keys under `prefix` to `to`.
    pub fn sync_request(&self, to: SocketAddrV4, prefix: &str) -> Vec<EngineEffect> {
        let summary = self.cache.summarize(prefix, |p| self.in_cluster(p));
        let mut packet = Packet::new(PacketType::Sync);
        packet.cluster_id = self.cluster();
        packet.clock = self.clock;
        packet.message = encode_summary(&summary);
        self.encode(&packet)
            .map(|data| vec![EngineEffect::send(to, data)])
            .unwrap_or_default()
    }

    /// Cached frames under `prefix`, sent as-is.
    fn push_prefix(&self, prefix: &str, to: SocketAddrV4) -> Vec<EngineEffect> {
        self.cache
            .keys_with_prefix(prefix)
            .iter()
            .filter_map(|key| self.cache.get(key))
            .filter(|p| self.in_cluster(p))
            .filter_map(|p| self.encode(p))
            .map(|data| EngineEffect::send(to, data))
            .collect()
    }

    /// Compare a remote summary with ours at the same prefix. Entries they
    /// lack are pushed, differing buckets are summarized one level deeper
    /// and buckets only they have get our summary back so they push.
    pub fn on_sync(&mut self, packet: &Packet, from: SocketAddrV4) -> Vec<EngineEffect> {
        self.metrics.sync_rounds.inc();
        if !self.cluster_id.is_some_and(|c| packet.cluster_id == c) {
            return Vec::new();
        }
        let Some(remote) = decode_summary(&packet.message) else {
            self.metrics.dropped_schema.inc();
            debug!(%from, "dropping sync: bad summary");
            return Vec::new();
        };

        let local = self.cache.summarize(&remote.prefix, |p| self.in_cluster(p));
        if local.hash == remote.hash {
            return Vec::new();
        }

        let mut effects = Vec::new();
        let mut missing = false;
        for (i, prefix) in local.differing_buckets(&remote) {
            match (local.buckets[i], remote.buckets[i]) {
                (Some(_), None) => effects.extend(self.push_prefix(&prefix, from)),
                (Some(_), Some(_)) if prefix.len() >= KEY_HEX_LEN => {
                    effects.extend(self.push_prefix(&prefix, from))
                }
                (Some(_), Some(_)) => effects.extend(self.sync_request(from, &prefix)),
                (None, Some(_)) => missing = true,
                (None, None) => {}
            }
        }
        if missing {
            effects.extend(self.sync_request(from, &remote.prefix));
        }

        debug!(%from, prefix = %remote.prefix, sends = effects.len(), "sync round");
        effects
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};

    use super::*;
    use crate::nat::NatType;
    use crate::runtime::effect::Socket;
    use crate::runtime::state::tests::{addr, join, know, sends, state};
    use crate::runtime::PublishOptions;
    use crate::types::Id32;

    fn keys(s: &EngineState) -> HashSet<String> {
        s.cache.iter().map(|(k, _)| k.clone()).collect()
    }

    fn fill(s: &mut EngineState, subcluster: Id32, range: std::ops::Range<u32>) {
        for i in range {
            s.publish(subcluster, &i.to_be_bytes(), PublishOptions::default(), 0)
                .unwrap();
        }
    }

    /// Shuttle datagrams between node 1 (`a`) and node 2 (`b`).
    fn exchange(a: &mut EngineState, b: &mut EngineState, first: Vec<EngineEffect>) -> usize {
        let mut rounds = 0;
        let mut queue: VecDeque<(bool, EngineEffect)> =
            first.into_iter().map(|e| (true, e)).collect();
        while let Some((from_a, effect)) = queue.pop_front() {
            let EngineEffect::Send { to, data, .. } = effect else {
                continue;
            };
            let out = if from_a && to == addr(2) {
                b.handle_datagram(&data, addr(1), Socket::Main, 0)
            } else if !from_a && to == addr(1) {
                a.handle_datagram(&data, addr(2), Socket::Main, 0)
            } else {
                continue;
            };
            rounds += 1;
            queue.extend(out.into_iter().map(|e| (!from_a, e)));
        }
        rounds
    }

    #[test]
    fn empty_peer_pulls_everything() {
        let mut a = state(1);
        let mut b = state(2);
        let s = join(&mut a, "room");
        fill(&mut a, s, 0..40);

        let first = a.sync_request(addr(2), "");
        exchange(&mut a, &mut b, first);
        assert_eq!(keys(&a), keys(&b));
        assert!(b.metrics.sync_rounds.get() >= 1);
    }

    #[test]
    fn partial_overlap_converges_both_ways() {
        let mut a = state(1);
        let mut b = state(2);
        let s = join(&mut a, "room");
        assert_eq!(join(&mut b, "room"), s);
        fill(&mut a, s, 0..30);
        fill(&mut b, s, 100..110);

        // give b a subset of a's packets as well
        let shared: Vec<_> = a.cache.values().take(10).cloned().collect();
        for p in shared {
            b.cache.insert_at(p.id_hex(), p, 0);
        }

        let first = a.sync_request(addr(2), "");
        exchange(&mut a, &mut b, first);
        assert_eq!(keys(&a), keys(&b));
        assert_eq!(a.cache.len(), 40);
        assert_eq!(a.summary_hash(), b.summary_hash());
    }

    #[test]
    fn equal_caches_stay_quiet() {
        let mut a = state(1);
        let mut b = state(2);
        let first = a.sync_request(addr(2), "");
        assert_eq!(exchange(&mut a, &mut b, first), 1);
    }

    #[test]
    fn foreign_cluster_is_ignored() {
        let mut a = state(1);
        let s = join(&mut a, "room");
        fill(&mut a, s, 0..3);
        let mut b = state(2);
        b.cluster_id = Some([8; 32]);

        let first = a.sync_request(addr(2), "");
        let (_, data) = match &first[0] {
            EngineEffect::Send { to, data, .. } => (*to, data.clone()),
            _ => unreachable!(),
        };
        assert!(b.handle_datagram(&data, addr(1), Socket::Main, 0).is_empty());
        assert!(b.cache.is_empty());
    }

    #[test]
    fn differing_ping_summary_starts_sync() {
        let mut a = state(1);
        let mut b = state(2);
        know(&mut b, 1, NatType::UNRESTRICTED);
        let s = join(&mut a, "room");
        fill(&mut a, s, 0..2);

        let ping = b.ping(Socket::Main, addr(1), b.ping_message(0), false, None, 0);
        let (_, data) = match &ping[0] {
            EngineEffect::Send { to, data, .. } => (*to, data.clone()),
            _ => unreachable!(),
        };
        let out = sends(&a.handle_datagram(&data, addr(2), Socket::Main, 0));
        assert!(out.iter().any(|(to, p)| *to == addr(2) && p.packet_type == PacketType::Sync));
    }
}
