//! Short-lived bookkeeping decayed by the maintenance tick: the dedup
//! [`Gate`], the per-source [`Rates`] limiter and query [`ReturnRoutes`].
use std::collections::HashMap;
use std::net::SocketAddrV4;

/// Ticks a query id stays in the gate.
pub const QUERY_TICKS: u32 = 6;
/// Ticks a join id stays in the gate.
pub const JOIN_TICKS: u32 = 2;

/// Dedup ledger: key -> remaining ticks.
#[derive(Debug, Default)]
pub struct Gate {
    entries: HashMap<String, u32>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key` for `ticks` ticks. Returns `false` if it was already present.
    pub fn admit(&mut self, key: &str, ticks: u32) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.entries.insert(key.to_string(), ticks.max(1));
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decrement every counter, dropping those that reach zero.
    pub fn tick(&mut self) {
        self.entries.retain(|_, n| {
            *n -= 1;
            *n > 0
        });
    }
}

pub const INITIAL_QUOTA: u32 = 1024;
pub const MIN_QUOTA: u32 = 64;
pub const MAX_QUOTA: u32 = 4096;
const MINUTE_MS: u64 = 60_000;

/// Rate class: flood-replicated traffic and direct traffic are limited separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateClass {
    Replicatable,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bucket {
    minute: u64,
    count: u32,
    quota: u32,
}

/// Per `(class, source)` quota buckets recomputed every wall-clock minute.
#[derive(Debug, Default)]
pub struct Rates {
    buckets: HashMap<(RateClass, SocketAddrV4), Bucket>,
}

impl Rates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one datagram and report whether it is within quota.
    ///
    /// On a minute rollover the quota shrinks by one (floor
    /// [`MIN_QUOTA`]) if the previous minute exceeded it, otherwise it
    /// grows by one (cap [`MAX_QUOTA`]).
    pub fn admit(&mut self, class: RateClass, source: SocketAddrV4, now: u64) -> bool {
        let minute = now / MINUTE_MS;
        let bucket = self.buckets.entry((class, source)).or_insert(Bucket {
            minute,
            count: 0,
            quota: INITIAL_QUOTA,
        });

        if bucket.minute != minute {
            bucket.quota = if bucket.count > bucket.quota {
                bucket.quota.saturating_sub(1).max(MIN_QUOTA)
            } else {
                (bucket.quota + 1).min(MAX_QUOTA)
            };
            bucket.count = 0;
            bucket.minute = minute;
        }

        bucket.count = bucket.count.saturating_add(1);
        bucket.count <= bucket.quota
    }

    /// Current quota for a source, if it has a bucket.
    pub fn quota(&self, class: RateClass, source: SocketAddrV4) -> Option<u32> {
        self.buckets.get(&(class, source)).map(|b| b.quota)
    }

    /// Forget buckets idle for more than `minutes` full minutes.
    pub fn prune(&mut self, now: u64, minutes: u64) {
        let minute = now / MINUTE_MS;
        self.buckets
            .retain(|_, b| minute.saturating_sub(b.minute) <= minutes);
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Pending query id -> where to send the answer.
#[derive(Debug, Default)]
pub struct ReturnRoutes {
    routes: HashMap<String, (SocketAddrV4, u32)>,
}

impl ReturnRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `responder` for `query_id`. Existing routes are kept.
    pub fn insert(&mut self, query_id: &str, responder: SocketAddrV4, ticks: u32) {
        self.routes
            .entry(query_id.to_string())
            .or_insert((responder, ticks.max(1)));
    }

    pub fn get(&self, query_id: &str) -> Option<SocketAddrV4> {
        self.routes.get(query_id).map(|(addr, _)| *addr)
    }

    pub fn remove(&mut self, query_id: &str) -> Option<SocketAddrV4> {
        self.routes.remove(query_id).map(|(addr, _)| addr)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn tick(&mut self) {
        self.routes.retain(|_, (_, n)| {
            *n -= 1;
            *n > 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn gate_dedups_and_decays() {
        let mut gate = Gate::new();
        assert!(gate.admit("a", JOIN_TICKS));
        assert!(!gate.admit("a", JOIN_TICKS));
        gate.tick();
        assert!(gate.contains("a"));
        gate.tick();
        assert!(!gate.contains("a"));
        assert!(gate.admit("a", JOIN_TICKS));
    }

    #[test]
    fn rates_admit_up_to_quota() {
        let mut rates = Rates::new();
        let src = addr(1);
        for _ in 0..INITIAL_QUOTA {
            assert!(rates.admit(RateClass::Direct, src, 0));
        }
        assert!(!rates.admit(RateClass::Direct, src, 0));
        // the other class has its own bucket
        assert!(rates.admit(RateClass::Replicatable, src, 0));
    }

    #[test]
    fn quota_shrinks_after_exceeding_minute() {
        let mut rates = Rates::new();
        let src = addr(2);
        for _ in 0..=INITIAL_QUOTA {
            rates.admit(RateClass::Direct, src, 0);
        }
        rates.admit(RateClass::Direct, src, 60_000);
        assert_eq!(rates.quota(RateClass::Direct, src), Some(INITIAL_QUOTA - 1));
    }

    #[test]
    fn quota_grows_after_quiet_minute_and_caps() {
        let mut rates = Rates::new();
        let src = addr(3);
        rates.admit(RateClass::Direct, src, 0);
        rates.admit(RateClass::Direct, src, 60_000);
        assert_eq!(rates.quota(RateClass::Direct, src), Some(INITIAL_QUOTA + 1));

        for m in 2..5000u64 {
            rates.admit(RateClass::Direct, src, m * 60_000);
        }
        assert_eq!(rates.quota(RateClass::Direct, src), Some(MAX_QUOTA));
    }

    #[test]
    fn rates_prune_idle_buckets() {
        let mut rates = Rates::new();
        rates.admit(RateClass::Direct, addr(4), 0);
        rates.prune(5 * 60_000, 2);
        assert!(rates.is_empty());
    }

    #[test]
    fn return_routes_expire() {
        let mut routes = ReturnRoutes::new();
        routes.insert("q", addr(5), 2);
        routes.insert("q", addr(6), 2);
        assert_eq!(routes.get("q"), Some(addr(5)));
        routes.tick();
        routes.tick();
        assert!(routes.get("q").is_none());
    }
}
