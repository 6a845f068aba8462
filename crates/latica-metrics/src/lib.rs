//! Minimal metrics primitives for the latica relay engine.
//!
//! Provides [`Counter`], an atomic monotonic counter, and [`EngineMetrics`],
//! the fixed set of counters the peer engine maintains. Reading the
//! engine counters yields a plain [`MetricsSnapshot`] that serializes
//! with serde.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A monotonically increasing counter backed by [`AtomicU64`].
///
/// All operations use [`Ordering::Relaxed`]; the values are statistics,
/// not synchronization points.
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

/// Counters owned by a running engine.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Datagrams received on any socket.
    pub datagrams_in: Counter,
    /// Datagrams handed to a socket for sending.
    pub datagrams_out: Counter,
    /// Datagrams dropped because they did not decode as a packet.
    pub dropped_decode: Counter,
    /// Packets dropped because their message failed schema validation.
    pub dropped_schema: Counter,
    /// Datagrams dropped by the per-source rate limiter.
    pub dropped_rate_limited: Counter,
    /// Packets inserted into the cache.
    pub cache_inserts: Counter,
    /// Cache entries removed by capacity pressure or TTL expiry.
    pub cache_evictions: Counter,
    /// SYNC packets processed.
    pub sync_rounds: Counter,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every counter at once.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams_in: self.datagrams_in.get(),
            datagrams_out: self.datagrams_out.get(),
            dropped_decode: self.dropped_decode.get(),
            dropped_schema: self.dropped_schema.get(),
            dropped_rate_limited: self.dropped_rate_limited.get(),
            cache_inserts: self.cache_inserts.get(),
            cache_evictions: self.cache_evictions.get(),
            sync_rounds: self.sync_rounds.get(),
        }
    }
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub datagrams_in: u64,
    pub datagrams_out: u64,
    pub dropped_decode: u64,
    pub dropped_schema: u64,
    pub dropped_rate_limited: u64,
    pub cache_inserts: u64,
    pub cache_evictions: u64,
    pub sync_rounds: u64,
}

impl MetricsSnapshot {
    /// Total datagrams dropped before reaching a protocol handler.
    pub fn dropped(&self) -> u64 {
        self.dropped_decode + self.dropped_schema + self.dropped_rate_limited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_operations() {
        let c = Counter::new();
        assert_eq!(c.get(), 0);
        c.inc();
        assert_eq!(c.get(), 1);
        c.inc_by(10);
        assert_eq!(c.get(), 11);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let m = EngineMetrics::new();
        m.datagrams_in.inc_by(5);
        m.dropped_decode.inc();
        m.dropped_rate_limited.inc_by(2);
        m.cache_inserts.inc();

        let snap = m.snapshot();
        assert_eq!(snap.datagrams_in, 5);
        assert_eq!(snap.cache_inserts, 1);
        assert_eq!(snap.dropped(), 3);
    }

    #[test]
    fn snapshot_serde_roundtrip() {
        let m = EngineMetrics::new();
        m.sync_rounds.inc_by(7);
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        let back: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sync_rounds, 7);
        assert_eq!(back, m.snapshot());
    }
}
