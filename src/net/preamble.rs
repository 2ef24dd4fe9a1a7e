//! PROXY protocol v1 preamble parsing.
//!
//! A layer-4 load balancer may prepend one text line to a forwarded TCP
//! connection before any client bytes:
//!
//! ```text
//! PROXY <TCP4|TCP6|UNKNOWN> <src-ip> <dst-ip> <src-port> <dst-port>\r\n
//! ```
//!
//! # Responsibilities
//! - Parse one preamble line into a [`ProxyPreamble`]
//! - Serialize a [`ProxyPreamble`] back to the exact wire line
//! - Sniff a raw stream for the preamble without losing buffered bytes
//!
//! # Design Decisions
//! - A stream that does not start with `PROXY` is left fully replayable
//! - Addresses must be literals; no name resolution happens here

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const SIGNATURE: &[u8] = b"PROXY";
const CRLF: &str = "\r\n";
const READ_CHUNK: usize = 512;

/// Longest legal v1 line, CRLF included.
pub const MAX_LINE_LEN: usize = 107;

/// Error type for preamble parsing.
#[derive(Debug, thiserror::Error)]
pub enum PreambleError {
    /// Missing CRLF, too few fields, or an over-long line.
    #[error("invalid proxy line")]
    Malformed,
    /// An IPv4 literal under `TCP6` or an IPv6 literal under `TCP4`.
    #[error("IP address(es) unmatched with protocol")]
    AddressFamilyMismatch,
    /// The address token is not an IP literal.
    #[error("invalid address {0:?} in proxy line")]
    InvalidAddress(String),
    /// The port token is not a decimal integer in 0..=65535.
    #[error("invalid port number {0:?} (expected [0..65535])")]
    InvalidPort(String),
    /// The stream failed while the preamble was being read.
    #[error("reading proxy line: {0}")]
    Io(#[from] io::Error),
}

/// Transport family declared by the preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    Tcp4,
    Tcp6,
    Unknown,
}

impl ProtocolFamily {
    fn from_token(token: &str) -> Self {
        match token {
            "TCP4" => Self::Tcp4,
            "TCP6" => Self::Tcp6,
            _ => Self::Unknown,
        }
    }

    /// Wire spelling of the family.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp4 => "TCP4",
            Self::Tcp6 => "TCP6",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed PROXY protocol v1 line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyPreamble {
    pub family: ProtocolFamily,
    pub source: IpAddr,
    pub destination: IpAddr,
    pub source_port: u16,
    pub destination_port: u16,
}

impl ProxyPreamble {
    /// Parse one line, CRLF included.
    pub fn parse_line(line: &str) -> Result<Self, PreambleError> {
        let body = line.strip_suffix(CRLF).ok_or(PreambleError::Malformed)?;
        let tokens: Vec<&str> = body.split(' ').collect();
        if tokens.len() < 6 || tokens[0] != "PROXY" {
            return Err(PreambleError::Malformed);
        }

        let family = ProtocolFamily::from_token(tokens[1]);
        let source = parse_address(family, tokens[2])?;
        let destination = parse_address(family, tokens[3])?;
        let source_port = parse_port(tokens[4])?;
        let destination_port = parse_port(tokens[5])?;

        Ok(Self {
            family,
            source,
            destination,
            source_port,
            destination_port,
        })
    }

    /// Original client address.
    pub fn source_addr(&self) -> SocketAddr {
        SocketAddr::new(self.source, self.source_port)
    }

    /// Address the client originally connected to.
    pub fn destination_addr(&self) -> SocketAddr {
        SocketAddr::new(self.destination, self.destination_port)
    }
}

impl fmt::Display for ProxyPreamble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PROXY {} {} {} {} {}\r\n",
            self.family, self.source, self.destination, self.source_port, self.destination_port
        )
    }
}

fn parse_address(family: ProtocolFamily, token: &str) -> Result<IpAddr, PreambleError> {
    let addr: IpAddr = token
        .parse()
        .map_err(|_| PreambleError::InvalidAddress(token.to_string()))?;

    // IPv4-mapped IPv6 literals count as IPv4.
    let v4 = match addr {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    };

    match (family, v4) {
        (ProtocolFamily::Tcp4, None) | (ProtocolFamily::Tcp6, Some(_)) => {
            Err(PreambleError::AddressFamilyMismatch)
        }
        (_, Some(v4)) => Ok(IpAddr::V4(v4)),
        (_, None) => Ok(addr),
    }
}

fn parse_port(token: &str) -> Result<u16, PreambleError> {
    token
        .parse::<u32>()
        .ok()
        .and_then(|port| u16::try_from(port).ok())
        .ok_or_else(|| PreambleError::InvalidPort(token.to_string()))
}

/// Buffered front of a raw connection while it is sniffed for a preamble.
///
/// Every byte pulled off the stream stays in the buffer until the
/// preamble line (if any) is consumed; [`PreambleReader::into_parts`]
/// hands back the stream together with whatever is still buffered.
pub struct PreambleReader<S> {
    inner: S,
    buf: BytesMut,
}

impl<S> PreambleReader<S>
where
    S: AsyncRead + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.inner.read_buf(&mut self.buf).await
    }

    async fn starts_with_signature(&mut self) -> io::Result<bool> {
        while self.buf.len() < SIGNATURE.len() {
            if self.fill().await? == 0 {
                break;
            }
        }
        Ok(self.buf.starts_with(SIGNATURE))
    }

    /// Consume a preamble line if the stream starts with `PROXY`.
    ///
    /// Returns `Ok(None)` without consuming anything otherwise.
    pub async fn consume_preamble(&mut self) -> Result<Option<ProxyPreamble>, PreambleError> {
        if !self.starts_with_signature().await? {
            return Ok(None);
        }

        let line_len = loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                break pos + 1;
            }
            if self.buf.len() >= MAX_LINE_LEN || self.fill().await? == 0 {
                return Err(PreambleError::Malformed);
            }
        };
        if line_len > MAX_LINE_LEN {
            return Err(PreambleError::Malformed);
        }

        let line = self.buf.split_to(line_len);
        let line = std::str::from_utf8(&line).map_err(|_| PreambleError::Malformed)?;
        ProxyPreamble::parse_line(line).map(Some)
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_parts(self) -> (S, Bytes) {
        (self.inner, self.buf.freeze())
    }
}
