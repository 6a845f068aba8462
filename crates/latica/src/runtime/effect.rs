use std::net::SocketAddrV4;

use super::EngineEvent;

/// Which of the engine's UDP sockets a datagram uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Socket {
    /// Protocol traffic.
    Main,
    /// NAT reflection and hole punching only.
    Probe,
}

impl Socket {
    pub fn name(self) -> &'static str {
        match self {
            Socket::Main => "main",
            Socket::Probe => "probe",
        }
    }
}

/// Intent produced by the pure handlers of `EngineState`.
///
/// Every `handle_*` / `tick_*` / `poll_*` method returns `Vec<EngineEffect>`;
/// the loop hands them to the executor, the only place that performs I/O.
#[derive(Debug)]
pub enum EngineEffect {
    /// Send an encoded frame.
    Send {
        socket: Socket,
        to: SocketAddrV4,
        data: Vec<u8>,
    },

    /// Bind `size` ephemeral sockets, send `data` from each to `to` and
    /// forward anything they receive back into the engine.
    OpenPortPool {
        ping_id: String,
        to: SocketAddrV4,
        data: Vec<u8>,
        size: usize,
    },

    /// Tear down the pool opened for `ping_id`.
    ClosePortPool { ping_id: String },

    /// Notify the application.
    Emit(EngineEvent),
}

impl EngineEffect {
    pub fn send(to: SocketAddrV4, data: Vec<u8>) -> Self {
        EngineEffect::Send {
            socket: Socket::Main,
            to,
            data,
        }
    }
}
