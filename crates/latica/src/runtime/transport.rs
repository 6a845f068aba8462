use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;

/// Outbound datagram path for the executor.
///
/// Production: tokio `UdpSocket`. Tests: `MockSink`, which records sends.
#[async_trait::async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send_to(&self, data: &[u8], to: SocketAddrV4) -> io::Result<()>;
}

#[async_trait::async_trait]
impl DatagramSink for tokio::net::UdpSocket {
    async fn send_to(&self, data: &[u8], to: SocketAddrV4) -> io::Result<()> {
        tokio::net::UdpSocket::send_to(self, data, to).await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl<T: DatagramSink + ?Sized> DatagramSink for Arc<T> {
    async fn send_to(&self, data: &[u8], to: SocketAddrV4) -> io::Result<()> {
        (**self).send_to(data, to).await
    }
}

/// Socket errors that are fixed by binding the socket again.
pub fn is_recoverable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::AddrInUse
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Fake sink that records sends for inspection.
    #[derive(Clone, Default)]
    pub struct MockSink {
        sent: Arc<Mutex<Vec<(SocketAddrV4, Vec<u8>)>>>,
        fail_with: Arc<Mutex<Option<io::ErrorKind>>>,
    }

    impl MockSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<(SocketAddrV4, Vec<u8>)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn fail_with(&self, kind: Option<io::ErrorKind>) {
            *self.fail_with.lock().unwrap() = kind;
        }
    }

    #[async_trait::async_trait]
    impl DatagramSink for MockSink {
        async fn send_to(&self, data: &[u8], to: SocketAddrV4) -> io::Result<()> {
            if let Some(kind) = *self.fail_with.lock().unwrap() {
                return Err(io::Error::new(kind, "mock: send failed"));
            }
            self.sent.lock().unwrap().push((to, data.to_vec()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds() {
        assert!(is_recoverable(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_recoverable(&io::Error::from(io::ErrorKind::AddrInUse)));
        assert!(!is_recoverable(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
