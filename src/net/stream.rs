//! Connection stream types shared by every listener layer.
//!
//! # Responsibilities
//! - Replay bytes read ahead during preamble sniffing
//! - Report the effective peer and local addresses of a connection

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// A byte stream accepted by one of the listener layers.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Address of the remote peer as seen by this layer.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Address this side of the connection is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Connection for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }
}

impl<S: Connection> Connection for tokio_rustls::server::TlsStream<S> {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.local_addr()
    }
}

/// A stream that yields a buffered prefix before reading from `inner`.
///
/// Addresses decoded from a PROXY preamble override the socket's own.
#[derive(Debug)]
pub struct ProxiedStream<S> {
    inner: S,
    prefix: Bytes,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl<S> ProxiedStream<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self {
            inner,
            prefix,
            peer_addr: None,
            local_addr: None,
        }
    }

    /// Override the addresses reported for this stream.
    pub fn with_addresses(mut self, peer: SocketAddr, local: SocketAddr) -> Self {
        self.peer_addr = Some(peer);
        self.local_addr = Some(local);
        self
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ProxiedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.prefix.has_remaining() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ProxiedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: Connection> Connection for ProxiedStream<S> {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self.peer_addr {
            Some(addr) => Ok(addr),
            None => self.inner.peer_addr(),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.local_addr {
            Some(addr) => Ok(addr),
            None => self.inner.local_addr(),
        }
    }
}
