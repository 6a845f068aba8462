/// The engine event loop.
///
/// A single async task that owns the `EngineState` and multiplexes over
/// both UDP sockets, port-pool traffic, application commands and timers.
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use latica_metrics::EngineMetrics;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::types::now_ms;

use super::effect::{EngineEffect, Socket};
use super::executor::{Executor, PoolDatagram};
use super::state::EngineState;
use super::transport::is_recoverable;
use super::{bind_socket, EngineCommand, EngineEvent, CHANNEL_CAPACITY};

/// Resolution of ping retries, sprays, pool lifetimes and reflection.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const RECV_BUFFER: usize = 2048;

pub(super) struct Sockets {
    pub main: Arc<UdpSocket>,
    pub probe: Arc<UdpSocket>,
    pub bind_address: Ipv4Addr,
}

impl Sockets {
    /// Bind `socket` again on the same local port.
    async fn rebind(
        &mut self,
        socket: Socket,
        state: &EngineState,
        executor: &mut Executor<Arc<UdpSocket>>,
    ) {
        let port = match socket {
            Socket::Main => state.local_port,
            Socket::Probe => state.probe_port,
        };
        match bind_socket(self.bind_address, port, socket).await {
            Ok(fresh) => {
                let fresh = Arc::new(fresh);
                match socket {
                    Socket::Main => self.main = fresh.clone(),
                    Socket::Probe => self.probe = fresh.clone(),
                }
                executor.replace(socket, fresh);
                info!(socket = socket.name(), port, "socket rebound");
            }
            Err(e) => {
                warn!(socket = socket.name(), error = %e, "rebind failed");
                executor.emit(EngineEvent::Error {
                    description: e.to_string(),
                });
            }
        }
    }
}

/// Main event loop, owns all protocol state.
pub(super) async fn engine_loop(
    mut state: EngineState,
    mut sockets: Sockets,
    mut cmd_rx: mpsc::Receiver<EngineCommand>,
    event_tx: mpsc::Sender<EngineEvent>,
    metrics: Arc<EngineMetrics>,
) {
    let (pool_tx, mut pool_rx) = mpsc::channel::<PoolDatagram>(CHANNEL_CAPACITY);
    let mut executor = Executor::new(
        sockets.main.clone(),
        sockets.probe.clone(),
        event_tx,
        pool_tx,
        metrics,
    );

    // ── Timers ──────────────────────────────────────────────────────
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    let mut keepalive = tokio::time::interval(Duration::from_millis(state.keepalive_ms.max(1)));
    poll.tick().await;
    keepalive.tick().await;

    let effects = state.start(now_ms());
    dispatch(&mut executor, &mut sockets, &state, effects).await;

    let mut main_buf = vec![0u8; RECV_BUFFER];
    let mut probe_buf = vec![0u8; RECV_BUFFER];

    loop {
        let mut broken = None;
        let effects: Vec<EngineEffect> = tokio::select! {
            // ── 1. Datagrams ────────────────────────────────────────
            result = sockets.main.recv_from(&mut main_buf) => match result {
                Ok((n, SocketAddr::V4(from))) => {
                    state.handle_datagram(&main_buf[..n], from, Socket::Main, now_ms())
                }
                Ok(_) => Vec::new(),
                Err(e) => {
                    debug!(error = %e, "main socket recv failed");
                    if is_recoverable(&e) {
                        broken = Some(Socket::Main);
                    }
                    Vec::new()
                }
            },
            result = sockets.probe.recv_from(&mut probe_buf) => match result {
                Ok((n, SocketAddr::V4(from))) => {
                    state.handle_datagram(&probe_buf[..n], from, Socket::Probe, now_ms())
                }
                Ok(_) => Vec::new(),
                Err(e) => {
                    debug!(error = %e, "probe socket recv failed");
                    if is_recoverable(&e) {
                        broken = Some(Socket::Probe);
                    }
                    Vec::new()
                }
            },
            Some((data, from)) = pool_rx.recv() => {
                state.handle_datagram(&data, from, Socket::Main, now_ms())
            }

            // ── 2. Commands from the application ────────────────────
            cmd = cmd_rx.recv() => match cmd {
                Some(EngineCommand::Close) | None => {
                    info!(peer = %state.peer_id, "engine closing");
                    break;
                }
                Some(cmd) => state.handle_command(cmd, now_ms()),
            },

            // ── 3. Timers ───────────────────────────────────────────
            _ = poll.tick() => state.poll_timers(now_ms()),
            _ = keepalive.tick() => state.tick_maintenance(now_ms()),
        };

        if let Some(socket) = broken {
            sockets.rebind(socket, &state, &mut executor).await;
        }
        dispatch(&mut executor, &mut sockets, &state, effects).await;
    }

    executor.close_all();
}

async fn dispatch(
    executor: &mut Executor<Arc<UdpSocket>>,
    sockets: &mut Sockets,
    state: &EngineState,
    effects: Vec<EngineEffect>,
) {
    if effects.is_empty() {
        return;
    }
    for socket in executor.execute(effects).await {
        sockets.rebind(socket, state, executor).await;
    }
}
