//! Effect executor, the only place that touches I/O.
//!
//! - Send -> main or probe sink
//! - OpenPortPool / ClosePortPool -> ephemeral sockets owned here
//! - Emit -> event_tx.try_send()
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use latica_metrics::EngineMetrics;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::effect::{EngineEffect, Socket};
use super::state::TRAVERSAL_LIFETIME_MS;
use super::transport::{is_recoverable, DatagramSink};
use super::EngineEvent;

/// Datagram received by a port-pool socket.
pub(super) type PoolDatagram = (Vec<u8>, SocketAddrV4);

const RECV_BUFFER: usize = 2048;

pub(super) struct Executor<T> {
    main: T,
    probe: T,
    event_tx: mpsc::Sender<EngineEvent>,
    pool_tx: mpsc::Sender<PoolDatagram>,
    pools: HashMap<String, Vec<JoinHandle<()>>>,
    metrics: Arc<EngineMetrics>,
}

impl<T: DatagramSink> Executor<T> {
    pub fn new(
        main: T,
        probe: T,
        event_tx: mpsc::Sender<EngineEvent>,
        pool_tx: mpsc::Sender<PoolDatagram>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            main,
            probe,
            event_tx,
            pool_tx,
            pools: HashMap::new(),
            metrics,
        }
    }

    /// Swap in a freshly bound socket.
    pub fn replace(&mut self, socket: Socket, sink: T) {
        match socket {
            Socket::Main => self.main = sink,
            Socket::Probe => self.probe = sink,
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        // never block the loop on a slow consumer
        if self.event_tx.try_send(event).is_err() {
            debug!("event channel full or closed, dropping event");
        }
    }

    /// Execute effects in order. Returns the sockets that failed with an
    /// error that a rebind should fix.
    pub async fn execute(&mut self, effects: Vec<EngineEffect>) -> Vec<Socket> {
        let mut broken = Vec::new();
        for effect in effects {
            match effect {
                EngineEffect::Send { socket, to, data } => {
                    if broken.contains(&socket) {
                        continue;
                    }
                    let sink = match socket {
                        Socket::Main => &self.main,
                        Socket::Probe => &self.probe,
                    };
                    match sink.send_to(&data, to).await {
                        Ok(()) => self.metrics.datagrams_out.inc(),
                        Err(e) if is_recoverable(&e) => {
                            warn!(
                                socket = socket.name(),
                                %to,
                                error = %e,
                                "send failed, socket needs rebinding"
                            );
                            broken.push(socket);
                        }
                        Err(e) => {
                            debug!(socket = socket.name(), %to, error = %e, "send failed");
                            self.emit(EngineEvent::Error {
                                description: format!("send to {to} failed: {e}"),
                            });
                        }
                    }
                }
                EngineEffect::OpenPortPool {
                    ping_id,
                    to,
                    data,
                    size,
                } => {
                    let handles = self.open_pool(to, &data, size).await;
                    debug!(%ping_id, %to, sockets = handles.len(), "opened port pool");
                    self.pools.insert(ping_id, handles);
                }
                EngineEffect::ClosePortPool { ping_id } => {
                    if let Some(handles) = self.pools.remove(&ping_id) {
                        debug!(%ping_id, "closing port pool");
                        handles.iter().for_each(JoinHandle::abort);
                    }
                }
                EngineEffect::Emit(event) => self.emit(event),
            }
        }
        broken
    }

    /// Bind up to `size` ephemeral sockets, send `data` to `to` from each and
    /// forward whatever they receive until their lifetime runs out.
    async fn open_pool(&self, to: SocketAddrV4, data: &[u8], size: usize) -> Vec<JoinHandle<()>> {
        let lifetime = Duration::from_millis(TRAVERSAL_LIFETIME_MS);
        let mut handles = Vec::with_capacity(size);
        for _ in 0..size {
            let socket = match UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(error = %e, opened = handles.len(), "port pool bind failed");
                    break;
                }
            };
            if let Err(e) = socket.send_to(data, to).await {
                debug!(%to, error = %e, "port pool send failed");
                continue;
            }
            self.metrics.datagrams_out.inc();

            let pool_tx = self.pool_tx.clone();
            handles.push(tokio::spawn(async move {
                let mut buf = vec![0u8; RECV_BUFFER];
                while let Ok(Ok((n, from))) =
                    tokio::time::timeout(lifetime, socket.recv_from(&mut buf)).await
                {
                    let SocketAddr::V4(from) = from else {
                        continue;
                    };
                    if pool_tx.send((buf[..n].to_vec(), from)).await.is_err() {
                        break;
                    }
                }
            }));
        }
        handles
    }

    /// Abort every open pool.
    pub fn close_all(&mut self) {
        for (_, handles) in self.pools.drain() {
            handles.iter().for_each(JoinHandle::abort);
        }
    }
}
