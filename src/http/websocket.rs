//! WebSocket tunnelling.
//!
//! # Responsibilities
//! - Answer the client's upgrade handshake
//! - Dial the backend (`ws` or `wss`) with the rewritten handshake request
//! - Relay raw bytes in both directions until either side closes
//!
//! # Data Flow
//! ```text
//! Client ←──── raw bytes ────→ Proxy ←──── raw bytes ────→ Backend
//!
//! Handshaking → Dialing → Tunneling → Closed
//! ```
//!
//! # Design Decisions
//! - The client handshake is committed before the backend is dialled;
//!   a failed dial closes the client connection
//! - No frame parsing: both legs speak the same framing, so bytes pass verbatim
//! - When one direction ends, the other is torn down

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, Method, Request, Response, StatusCode, Version};
use axum::response::IntoResponse;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use crate::http::director::{Director, OutboundDialRequest};
use crate::net::connection::ConnectionTracker;

const WEBSOCKET_VERSION: &str = "13";
const RELAY_BUFFER: usize = 8 * 1024;

/// Lifecycle of one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Handshaking,
    Dialing,
    Tunneling,
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Handshaking => "handshaking",
            Self::Dialing => "dialing",
            Self::Tunneling => "tunneling",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("unsupported backend scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("backend URI has no host")]
    MissingHost,
    #[error("backend host {0:?} is not a valid TLS server name")]
    ServerName(String),
    #[error("timed out connecting to backend")]
    ConnectTimeout,
    #[error("backend connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("backend handshake failed: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("invalid backend handshake request: {0}")]
    Http(#[from] axum::http::Error),
    #[error("backend refused the upgrade with status {0}")]
    Rejected(StatusCode),
    #[error("backend answered with a wrong Sec-WebSocket-Accept")]
    AcceptMismatch,
}

/// Which side ended a relay first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySide {
    Client,
    Backend,
}

/// Byte counts of a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    pub ended_by: RelaySide,
}

/// Upgrades WebSocket requests and tunnels them to the backend.
#[derive(Clone)]
pub struct WebSocketTunnel {
    director: Arc<Director>,
    dialer: BackendDialer,
    tracker: ConnectionTracker,
}

impl WebSocketTunnel {
    pub fn new(
        director: Arc<Director>,
        connect_timeout: Duration,
        backend_tls: Arc<ClientConfig>,
        tracker: ConnectionTracker,
    ) -> Self {
        Self {
            director,
            dialer: BackendDialer {
                connect_timeout,
                tls: TlsConnector::from(backend_tls),
            },
            tracker,
        }
    }

    /// Answer the client handshake and start the tunnel in the background.
    pub fn upgrade(&self, request: Request<Body>, client: SocketAddr) -> Response<Body> {
        let (mut parts, _body) = request.into_parts();

        if parts.method != Method::GET {
            return StatusCode::METHOD_NOT_ALLOWED.into_response();
        }
        let version_ok = parts
            .headers
            .get(header::SEC_WEBSOCKET_VERSION)
            .is_some_and(|v| v.as_bytes() == WEBSOCKET_VERSION.as_bytes());
        if !version_ok {
            return (
                StatusCode::BAD_REQUEST,
                [(header::SEC_WEBSOCKET_VERSION, WEBSOCKET_VERSION)],
                "unsupported WebSocket version",
            )
                .into_response();
        }
        let Some(key) = parts.headers.get(header::SEC_WEBSOCKET_KEY).cloned() else {
            return (StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key").into_response();
        };

        let outbound = match self.director.rewrite_for_tunnel(&parts, client) {
            Ok(outbound) => outbound,
            Err(e) => {
                tracing::error!(error = %e, "Failed to rewrite WebSocket request");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        // HTTP/2 connections and plain test harnesses cannot hand over the socket.
        let Some(on_upgrade) = parts.extensions.remove::<OnUpgrade>() else {
            tracing::error!(peer_addr = %client, version = ?parts.version, "Connection does not support upgrades");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };

        let session = TunnelSession {
            client,
            state: TunnelState::Handshaking,
        };
        let dialer = self.dialer.clone();
        let guard = self.tracker.track();
        tokio::spawn(async move {
            let _guard = guard;
            session.run(on_upgrade, outbound, dialer).await;
        });

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        if let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) {
            headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        }
        response
    }
}

struct TunnelSession {
    client: SocketAddr,
    state: TunnelState,
}

impl TunnelSession {
    fn enter(&mut self, next: TunnelState) {
        tracing::debug!(peer_addr = %self.client, from = %self.state, to = %next, "WebSocket tunnel state change");
        self.state = next;
    }

    async fn run(mut self, on_upgrade: OnUpgrade, outbound: OutboundDialRequest, dialer: BackendDialer) {
        let client_io = match on_upgrade.await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                tracing::warn!(peer_addr = %self.client, error = %e, "Client upgrade failed");
                self.enter(TunnelState::Closed);
                return;
            }
        };

        self.enter(TunnelState::Dialing);
        tracing::info!(peer_addr = %self.client, backend = %outbound.uri, "Establishing outbound websocket");
        let backend_io = match dialer.dial(&outbound).await {
            Ok(io) => io,
            Err(e) => {
                tracing::error!(peer_addr = %self.client, backend = %outbound.uri, error = %e, "Outbound websocket dial failed");
                self.enter(TunnelState::Closed);
                return;
            }
        };

        self.enter(TunnelState::Tunneling);
        let outcome = relay(client_io, backend_io).await;
        tracing::debug!(
            peer_addr = %self.client,
            client_to_backend = outcome.client_to_backend,
            backend_to_client = outcome.backend_to_client,
            ended_by = ?outcome.ended_by,
            "WebSocket tunnel finished"
        );
        self.enter(TunnelState::Closed);
    }
}

/// Opens WebSocket connections to the backend over `ws` or `wss`.
#[derive(Clone)]
pub struct BackendDialer {
    connect_timeout: Duration,
    tls: TlsConnector,
}

impl BackendDialer {
    /// Connect, complete the upgrade handshake and return the raw stream.
    pub async fn dial(&self, outbound: &OutboundDialRequest) -> Result<TokioIo<Upgraded>, TunnelError> {
        let uri = &outbound.uri;
        let secure = match uri.scheme_str() {
            Some("ws") => false,
            Some("wss") => true,
            other => return Err(TunnelError::UnsupportedScheme(other.unwrap_or_default().to_string())),
        };
        let host = uri.host().ok_or(TunnelError::MissingHost)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TunnelError::ConnectTimeout)??;
        stream.set_nodelay(true)?;

        if !secure {
            return handshake(stream, outbound).await;
        }
        let name = ServerName::try_from(host.to_string())
            .map_err(|_| TunnelError::ServerName(host.to_string()))?;
        let stream = tokio::time::timeout(self.connect_timeout, self.tls.connect(name, stream))
            .await
            .map_err(|_| TunnelError::ConnectTimeout)??;
        handshake(stream, outbound).await
    }
}

async fn handshake<S>(stream: S, outbound: &OutboundDialRequest) -> Result<TokioIo<Upgraded>, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let uri = &outbound.uri;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            tracing::debug!(error = %e, "Backend handshake connection ended");
        }
    });

    let key = generate_key();
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let mut request = Request::builder()
        .method(Method::GET)
        .uri(path)
        .version(Version::HTTP_11)
        .body(Empty::<Bytes>::new())?;
    let headers = request.headers_mut();
    *headers = outbound.headers.clone();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static(WEBSOCKET_VERSION));
    headers.insert(
        header::SEC_WEBSOCKET_KEY,
        HeaderValue::from_str(&key).map_err(axum::http::Error::from)?,
    );

    let response = sender.send_request(request).await?;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(TunnelError::Rejected(response.status()));
    }
    let expected = derive_accept_key(key.as_bytes());
    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .is_some_and(|v| v.as_bytes() == expected.as_bytes());
    if !accepted {
        return Err(TunnelError::AcceptMismatch);
    }

    let upgraded = hyper::upgrade::on(response).await?;
    Ok(TokioIo::new(upgraded))
}

/// Copy bytes both ways until one direction ends, then close both streams.
///
/// Client-to-backend runs on a spawned task; backend-to-client runs here.
pub async fn relay<C, B>(client: C, backend: B) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);
    let upstream_bytes = Arc::new(AtomicU64::new(0));
    let downstream_bytes = Arc::new(AtomicU64::new(0));

    let counter = upstream_bytes.clone();
    let mut upstream = tokio::spawn(async move {
        let result = pump(&mut client_read, &mut backend_write, &counter).await;
        let _ = backend_write.shutdown().await;
        result
    });

    let ended_by = {
        let downstream = async {
            let result = pump(&mut backend_read, &mut client_write, &downstream_bytes).await;
            let _ = client_write.shutdown().await;
            result
        };
        tokio::pin!(downstream);

        tokio::select! {
            result = &mut upstream => {
                if let Ok(Err(e)) = result {
                    tracing::debug!(error = %e, "Client side of tunnel failed");
                }
                RelaySide::Client
            }
            result = &mut downstream => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "Backend side of tunnel failed");
                }
                upstream.abort();
                let _ = (&mut upstream).await;
                RelaySide::Backend
            }
        }
    };

    RelayOutcome {
        client_to_backend: upstream_bytes.load(Ordering::Relaxed),
        backend_to_client: downstream_bytes.load(Ordering::Relaxed),
        ended_by,
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
    }
}
