//! Listener layers stacked between the bound socket and the HTTP server.
//!
//! # Responsibilities
//! - Abstract "something that yields connections" behind [`StreamListener`]
//! - Enable TCP keep-alive on every accepted socket
//! - Strip an optional PROXY preamble before the server sees the stream
//!
//! # Design Decisions
//! - Layers compose by ownership: each wraps exactly one inner listener
//! - Keep-alive failures are logged and ignored
//! - A bad preamble closes that connection only, never the listener

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

use crate::net::handoff::Handoff;
use crate::net::preamble::PreambleReader;
use crate::net::stream::{Connection, ProxiedStream};

/// Default keep-alive probe period for accepted sockets.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(180);

/// Default capacity of the sniffed-connection queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Errors that belong to a single connection that failed mid-accept.
///
/// Callers skip these and keep accepting; anything else is a listener failure.
pub fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}

/// A source of accepted connections.
pub trait StreamListener: Send + 'static {
    type Io: Connection;

    /// Wait for the next connection and the address it reports as its peer.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl StreamListener for TcpListener {
    type Io = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Enables TCP keep-alive on every accepted connection.
pub struct KeepAliveListener {
    inner: TcpListener,
    period: Duration,
}

impl KeepAliveListener {
    pub fn new(inner: TcpListener, period: Duration) -> Self {
        Self { inner, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl StreamListener for KeepAliveListener {
    type Io = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, remote) = self.inner.accept().await?;
        if let Err(e) = set_keepalive(&stream, self.period) {
            tracing::warn!(peer_addr = %remote, error = %e, "Failed to enable TCP keep-alive");
        }
        Ok((stream, remote))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let params = TcpKeepalive::new().with_time(period);
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    let params = params.with_interval(period);
    SockRef::from(stream).set_tcp_keepalive(&params)
}

/// Tuning for [`SniffingListener`].
#[derive(Debug, Clone, Copy)]
pub struct SniffingOptions {
    pub queue_capacity: usize,
    /// Upper bound on waiting for the first bytes; `None` waits forever.
    pub preamble_timeout: Option<Duration>,
}

impl Default for SniffingOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            preamble_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Strips a PROXY protocol preamble from each accepted connection.
///
/// Sniffing runs concurrently per connection, so the order connections
/// come out of [`SniffingListener::accept`] may differ from raw accept order.
pub struct SniffingListener<S> {
    queue: Handoff<ProxiedStream<S>>,
}

impl<S: Connection> SniffingListener<S> {
    pub fn new<L>(inner: L, options: SniffingOptions) -> io::Result<Self>
    where
        L: StreamListener<Io = S>,
    {
        let timeout = options.preamble_timeout;
        let queue = Handoff::spawn(inner, options.queue_capacity, move |io, remote| {
            sniff(io, remote, timeout)
        })?;
        Ok(Self { queue })
    }

    /// Stop accepting; queued connections can still be drained.
    pub fn close(&self) {
        self.queue.close();
    }
}

impl<S: Connection> StreamListener for SniffingListener<S> {
    type Io = ProxiedStream<S>;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send {
        self.queue.accept()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.queue.local_addr())
    }
}

async fn sniff<S: Connection>(
    io: S,
    remote: SocketAddr,
    timeout: Option<Duration>,
) -> Option<(ProxiedStream<S>, SocketAddr)> {
    let mut reader = PreambleReader::new(io);
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.consume_preamble()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::debug!(
                    peer_addr = %remote,
                    timeout_ms = limit.as_millis() as u64,
                    "No data before preamble deadline, closing connection"
                );
                return None;
            }
        },
        None => reader.consume_preamble().await,
    };

    match outcome {
        Ok(Some(preamble)) => {
            let (io, buffered) = reader.into_parts();
            let source = preamble.source_addr();
            tracing::debug!(
                peer_addr = %remote,
                source = %source,
                family = %preamble.family,
                "PROXY preamble accepted"
            );
            let stream = ProxiedStream::new(io, buffered)
                .with_addresses(source, preamble.destination_addr());
            Some((stream, source))
        }
        Ok(None) => {
            let (io, buffered) = reader.into_parts();
            Some((ProxiedStream::new(io, buffered), remote))
        }
        Err(e) => {
            tracing::warn!(peer_addr = %remote, error = %e, "Rejected PROXY preamble, closing connection");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn sniffing_listener(timeout: Option<Duration>) -> (SniffingListener<TcpStream>, SocketAddr) {
        let raw = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = raw.local_addr().unwrap();
        let options = SniffingOptions {
            queue_capacity: 4,
            preamble_timeout: timeout,
        };
        (SniffingListener::new(raw, options).unwrap(), addr)
    }

    #[tokio::test]
    async fn preamble_overrides_peer_address() {
        let (mut listener, addr) = sniffing_listener(None).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"PROXY TCP4 10.1.2.3 10.0.0.1 4242 443\r\nhello")
            .await
            .unwrap();

        let (mut conn, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, "10.1.2.3:4242".parse().unwrap());
        assert_eq!(Connection::peer_addr(&conn).unwrap(), peer);
        assert_eq!(
            Connection::local_addr(&conn).unwrap(),
            "10.0.0.1:443".parse().unwrap()
        );

        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn plain_connection_is_replayed_intact() {
        let (mut listener, addr) = sniffing_listener(None).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let local = client.local_addr().unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let (mut conn, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, local);

        let mut buf = [0u8; 16];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn malformed_preamble_drops_only_that_connection() {
        let (mut listener, addr) = sniffing_listener(None).await;

        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(b"PROXY TCP6 1.2.3.4 1.2.3.4 1 2\r\n").await.unwrap();

        let mut good = TcpStream::connect(addr).await.unwrap();
        good.write_all(b"PROXY TCP4 9.9.9.9 10.0.0.1 1 2\r\nok").await.unwrap();

        let (_, peer) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer, "9.9.9.9:1".parse().unwrap());

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), bad.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "rejected connection should be closed");
    }

    #[tokio::test]
    async fn silent_peer_is_dropped_after_deadline() {
        let (mut listener, addr) = sniffing_listener(Some(Duration::from_millis(100))).await;

        let mut silent = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), silent.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        let pending = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(pending.is_err(), "silent peer must not be surfaced");
    }

    #[tokio::test]
    async fn closed_listener_reports_broken_pipe() {
        let (mut listener, _) = sniffing_listener(None).await;
        listener.close();

        let err = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn close_unblocks_accept_while_a_peer_is_still_silent() {
        let (mut listener, addr) = sniffing_listener(None).await;
        let _silent = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        listener.close();

        let err = tokio::time::timeout(Duration::from_secs(3), listener.accept())
            .await
            .expect("accept stayed blocked after close")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn keepalive_listener_enables_keepalive() {
        let raw = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = raw.local_addr().unwrap();
        let mut listener = KeepAliveListener::new(raw, DEFAULT_KEEPALIVE);

        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        assert!(SockRef::from(&stream).keepalive().unwrap());
        assert_eq!(listener.period(), Duration::from_secs(180));
    }

    #[test]
    fn classifies_per_connection_errors() {
        assert!(is_connection_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_connection_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_connection_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_connection_error(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }
}
