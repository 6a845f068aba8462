//! NAT self-discovery over the probe socket.
//!
//! Stage 1 pings one UNRESTRICTED peer from the probe socket to learn the
//! probe socket's external port. Stage 2 pings that peer and a never-probed
//! UNRESTRICTED peer from the main socket, passing the probe port so both
//! can echo back to it. The two observed main ports give the mapping
//! behaviour; which echoes make it through gives the firewall behaviour.
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};

use rand::seq::IteratorRandom;
use tracing::{debug, info, warn};

use crate::nat::{
    NatType, FIREWALL_ALLOW_ANY, FIREWALL_ALLOW_KNOWN_IP, FIREWALL_ALLOW_KNOWN_IP_AND_PORT,
    MAPPING_ENDPOINT_DEPENDENT, MAPPING_ENDPOINT_INDEPENDENT,
};
use crate::packet::PongMessage;
use crate::types::{random_token, PeerId};

use super::effect::{EngineEffect, Socket};
use super::state::EngineState;

/// How long stage 2 waits for probe echoes once both ports are known.
pub(super) const PROBE_WAIT_MS: u64 = 1_500;
/// A stage that has not completed by then is abandoned.
pub(super) const STAGE_TIMEOUT_MS: u64 = 5_000;
pub(super) const INITIAL_BACKOFF_MS: u64 = 2_000;
pub(super) const MAX_BACKOFF_MS: u64 = 60_000;

#[derive(Debug)]
enum Stage {
    Idle,
    Probe {
        reflection_id: String,
        probed: PeerId,
        deadline: u64,
    },
    Reflect {
        reflection_id: String,
        probed: PeerId,
        fresh: PeerId,
        deadline: u64,
        /// Main-socket mapping observed by each peer.
        ports: HashMap<PeerId, (Ipv4Addr, u16)>,
        /// Peers whose echo reached the probe socket.
        echoes: HashSet<PeerId>,
        settle_at: Option<u64>,
    },
}

/// One reflection attempt at a time, plus the retry schedule.
#[derive(Debug)]
pub(super) struct Reflection {
    stage: Stage,
    backoff: u64,
    retry_at: Option<u64>,
}

impl Reflection {
    pub fn new() -> Self {
        Self {
            stage: Stage::Idle,
            backoff: INITIAL_BACKOFF_MS,
            retry_at: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.stage, Stage::Idle)
    }

    /// Abandon the current attempt and schedule the next one.
    fn fail(&mut self, now: u64) {
        self.stage = Stage::Idle;
        self.retry_at = Some(now + self.backoff);
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF_MS);
    }
}

/// Combine what two peers observed into a NAT type.
///
/// `probed` and `fresh` are the main-socket mappings reported by the
/// stage-2 peers; the echo flags say whose probe-socket echo arrived.
pub(super) fn classify(
    probed: (Ipv4Addr, u16),
    fresh: (Ipv4Addr, u16),
    echo_probed: bool,
    echo_fresh: bool,
) -> NatType {
    let mapping = if probed == fresh {
        MAPPING_ENDPOINT_INDEPENDENT
    } else {
        MAPPING_ENDPOINT_DEPENDENT
    };
    let firewall = if echo_fresh {
        FIREWALL_ALLOW_ANY
    } else if echo_probed {
        FIREWALL_ALLOW_KNOWN_IP
    } else {
        FIREWALL_ALLOW_KNOWN_IP_AND_PORT
    };
    NatType::compose(mapping, firewall)
}

impl EngineState {
    /// Start stage 1 unless an attempt is running or backing off.
    pub fn request_reflection(&mut self, now: u64) -> Vec<EngineEffect> {
        if self.static_nat || self.reflection.is_running() {
            return Vec::new();
        }
        if self.reflection.retry_at.is_some_and(|at| now < at) {
            return Vec::new();
        }
        self.reflection.retry_at = None;

        // reuse an already probed peer so fresh ones stay available for stage 2
        let mut rng = rand::rng();
        let unrestricted = || self.peers.iter().filter(|p| p.is_unrestricted());
        let Some(peer) = unrestricted()
            .filter(|p| p.probed)
            .choose(&mut rng)
            .or_else(|| unrestricted().choose(&mut rng))
            .map(|p| (p.peer_id, p.addr()))
        else {
            debug!("reflection: no unrestricted peer, retrying later");
            self.reflection.fail(now);
            return Vec::new();
        };

        let reflection_id = random_token();
        let mut msg = self.ping_message(now);
        msg.is_reflection = true;
        msg.is_probe = true;
        msg.reflection_id = Some(reflection_id.clone());

        debug!(peer = %peer.0, "reflection: stage 1");
        self.reflection.stage = Stage::Probe {
            reflection_id,
            probed: peer.0,
            deadline: now + STAGE_TIMEOUT_MS,
        };
        self.ping(Socket::Probe, peer.1, msg, false, None, now)
    }

    /// Feed a PONG carrying a reflection id into the running attempt.
    pub fn on_reflection_pong(
        &mut self,
        msg: &PongMessage,
        via: Socket,
        now: u64,
    ) -> Vec<EngineEffect> {
        let responder = msg.responder_peer_id;
        match &mut self.reflection.stage {
            Stage::Idle => Vec::new(),

            Stage::Probe {
                reflection_id,
                probed,
                ..
            } => {
                if msg.reflection_id.as_deref() != Some(reflection_id.as_str())
                    || via != Socket::Probe
                    || responder != *probed
                {
                    return Vec::new();
                }
                let Some(probe_port) = msg.port else {
                    return Vec::new();
                };
                let probed = *probed;
                self.start_stage_two(probed, probe_port, now)
            }

            Stage::Reflect {
                reflection_id,
                probed,
                fresh,
                ports,
                echoes,
                settle_at,
                ..
            } => {
                if msg.reflection_id.as_deref() != Some(reflection_id.as_str())
                    || (responder != *probed && responder != *fresh)
                {
                    return Vec::new();
                }
                match via {
                    Socket::Probe if msg.is_probe => {
                        echoes.insert(responder);
                    }
                    Socket::Main => {
                        if let (Some(address), Some(port)) = (msg.address, msg.port) {
                            ports.insert(responder, (address, port));
                        }
                    }
                    Socket::Probe => {}
                }
                if ports.len() == 2 && settle_at.is_none() {
                    *settle_at = Some(now + PROBE_WAIT_MS);
                }
                // nothing left to learn once the fresh peer's echo is in
                if ports.len() == 2 && echoes.contains(fresh) {
                    return self.finish_reflection(now);
                }
                Vec::new()
            }
        }
    }

    fn start_stage_two(&mut self, probed: PeerId, probe_port: u16, now: u64) -> Vec<EngineEffect> {
        if let Some(peer) = self.peers.get_mut(&probed) {
            peer.probed = true;
        }

        let fresh = self
            .peers
            .iter()
            .filter(|p| p.is_unrestricted() && !p.probed && p.peer_id != probed)
            .choose(&mut rand::rng())
            .map(|p| (p.peer_id, p.addr()));
        let probed_addr = self.peers.get(&probed).map(|p| p.addr());
        let (Some(fresh), Some(probed_addr)) = (fresh, probed_addr) else {
            debug!("reflection: no second unrestricted peer, retrying later");
            self.reflection.fail(now);
            return Vec::new();
        };

        let reflection_id = random_token();
        let mut msg = self.ping_message(now);
        msg.is_reflection = true;
        msg.reflection_id = Some(reflection_id.clone());
        msg.probe_external_port = Some(probe_port);

        debug!(%probed, fresh = %fresh.0, probe_port, "reflection: stage 2");
        self.reflection.stage = Stage::Reflect {
            reflection_id,
            probed,
            fresh: fresh.0,
            deadline: now + STAGE_TIMEOUT_MS,
            ports: HashMap::new(),
            echoes: HashSet::new(),
            settle_at: None,
        };

        let mut effects = self.ping(Socket::Main, probed_addr, msg.clone(), false, None, now);
        effects.extend(self.ping(Socket::Main, fresh.1, msg, false, None, now));
        effects
    }

    fn finish_reflection(&mut self, now: u64) -> Vec<EngineEffect> {
        let stage = std::mem::replace(&mut self.reflection.stage, Stage::Idle);
        let Stage::Reflect {
            probed,
            fresh,
            ports,
            echoes,
            ..
        } = stage
        else {
            return Vec::new();
        };
        let (Some(&seen_probed), Some(&seen_fresh)) = (ports.get(&probed), ports.get(&fresh)) else {
            self.reflection.fail(now);
            return Vec::new();
        };

        let nat_type = classify(
            seen_probed,
            seen_fresh,
            echoes.contains(&probed),
            echoes.contains(&fresh),
        );
        info!(
            nat = %nat_type,
            address = %seen_probed.0,
            port = seen_probed.1,
            "reflection complete"
        );

        self.address = Some(seen_probed.0);
        self.external_port = Some(seen_probed.1);
        self.reflection.reset();
        self.set_nat_type(nat_type, now)
    }

    /// Timer side of reflection: stage timeouts, the echo window and
    /// scheduled retries.
    pub fn poll_reflection(&mut self, now: u64) -> Vec<EngineEffect> {
        match &self.reflection.stage {
            Stage::Idle => {
                if self.reflection.retry_at.is_some_and(|at| now >= at) {
                    return self.request_reflection(now);
                }
                Vec::new()
            }
            Stage::Probe { deadline, .. } => {
                if now >= *deadline {
                    warn!("reflection: stage 1 timed out");
                    self.reflection.fail(now);
                }
                Vec::new()
            }
            Stage::Reflect {
                deadline, settle_at, ..
            } => {
                if settle_at.is_some_and(|at| now >= at) {
                    return self.finish_reflection(now);
                }
                if now >= *deadline {
                    warn!("reflection: stage 2 timed out");
                    self.reflection.fail(now);
                }
                Vec::new()
            }
        }
    }
}
