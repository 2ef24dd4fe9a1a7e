//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the listener stack for the selected serving mode
//! - Create the Axum Router and wire up middleware (tracing, request ID,
//!   request log, auth, forwarded proto)
//! - Serve HTTP/1.1 (with upgrades) and HTTP/2 on every accepted connection
//! - Drain open connections on shutdown
//!
//! # Data Flow
//! ```text
//! TcpListener → KeepAlive → [Sniffing] → [Tls] → serve loop → Router → ProtocolSniffingProxy
//! ```
//!
//! # Design Decisions
//! - Serving mode is a two-axis table: behind-proxy × TLS
//! - Listener errors end the serve loop and are reported to the caller;
//!   there is no in-process restart

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderName, Request};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tower::ServiceExt;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::http::director::{Director, DirectorError};
use crate::http::middleware::{
    auth_middleware, forwarded_proto_middleware, request_log_middleware, AuthState,
    HtpasswdAuthorizer, RequestObserver, TracingObserver,
};
use crate::http::proxy::ProtocolSniffingProxy;
use crate::http::transport::{backend_transport, BackendTransport};
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{is_connection_error, KeepAliveListener, SniffingListener, SniffingOptions};
use crate::net::tls::{backend_client_config, load_tls_config, TlsListener, TlsSetupError};
use crate::net::StreamListener;
use crate::security::{Htpasswd, HtpasswdError, Subnet, SubnetParseError};

/// Path answering with the running version instead of being proxied.
pub const VERSION_PATH: &str = "/_proxy/version";
pub const X_PROXY_VERSION: HeaderName = HeaderName::from_static("x-proxy-version");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error type for server setup and the serve loop.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("invalid backend url: {0}")]
    BackendUrl(#[from] url::ParseError),
    #[error(transparent)]
    Director(#[from] DirectorError),
    #[error(transparent)]
    Subnet(#[from] SubnetParseError),
    #[error(transparent)]
    Htpasswd(#[from] HtpasswdError),
    #[error(transparent)]
    Tls(#[from] TlsSetupError),
    #[error("failed to set up listener: {0}")]
    Listener(#[source] io::Error),
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

/// The four deployments selected by `tls` × `behind_tcp_proxy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingMode {
    DirectTls,
    DirectPlaintext,
    BehindProxyTls,
    BehindProxyPlaintext,
}

impl ServingMode {
    pub fn select(tls: bool, behind_tcp_proxy: bool) -> Self {
        match (behind_tcp_proxy, tls) {
            (false, true) => Self::DirectTls,
            (false, false) => Self::DirectPlaintext,
            (true, true) => Self::BehindProxyTls,
            (true, false) => Self::BehindProxyPlaintext,
        }
    }

    pub fn terminates_tls(&self) -> bool {
        matches!(self, Self::DirectTls | Self::BehindProxyTls)
    }

    pub fn sniffs_preamble(&self) -> bool {
        matches!(self, Self::BehindProxyTls | Self::BehindProxyPlaintext)
    }
}

impl fmt::Display for ServingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DirectTls => "direct-tls",
            Self::DirectPlaintext => "direct-plaintext",
            Self::BehindProxyTls => "behind-proxy-tls",
            Self::BehindProxyPlaintext => "behind-proxy-plaintext",
        };
        f.write_str(name)
    }
}

/// TLS-terminating reverse proxy server.
pub struct HttpServer {
    config: ProxyConfig,
    mode: ServingMode,
    tls: Option<Arc<rustls::ServerConfig>>,
    backend_tls: Arc<rustls::ClientConfig>,
    director: Director,
    proxy: ProtocolSniffingProxy,
    auth: Option<AuthState>,
    observer: Option<Arc<dyn RequestObserver>>,
    tracker: ConnectionTracker,
}

impl HttpServer {
    /// Create a server, loading TLS material and credentials up front.
    pub fn new(config: ProxyConfig) -> Result<Self, ServeError> {
        let target = url::Url::parse(&config.backend.url)?;
        let director = Director::new(&target)?;
        let tracker = ConnectionTracker::new();
        let backend_tls = backend_client_config(config.backend.ca_file.as_deref())?;
        let proxy = ProtocolSniffingProxy::new(
            director.clone(),
            backend_transport(config.backend.connect_timeout(), backend_tls.clone()),
            config.backend.connect_timeout(),
            backend_tls.clone(),
            tracker.clone(),
        );

        let mode = ServingMode::select(config.listener.tls, config.listener.behind_tcp_proxy);
        let tls = if mode.terminates_tls() {
            Some(load_tls_config(&config.listener.cert_path, &config.listener.key_path)?)
        } else {
            None
        };

        let auth = match &config.auth.htpasswd_file {
            Some(path) => {
                let store = Htpasswd::load(path)?;
                if store.is_empty() {
                    tracing::warn!(path = %path.display(), "htpasswd file has no usable entries, every request will be refused");
                }
                let bypass = config
                    .auth
                    .bypass_subnet
                    .as_deref()
                    .map(str::parse::<Subnet>)
                    .transpose()?;
                let authorizer = Arc::new(HtpasswdAuthorizer::new(store));
                Some(AuthState::new(authorizer, bypass, &config.backend.url))
            }
            None => {
                if config.auth.bypass_subnet.is_some() {
                    tracing::warn!("bypass_subnet has no effect without an htpasswd file");
                }
                None
            }
        };

        let observer = config
            .observability
            .request_log
            .then(|| Arc::new(TracingObserver) as Arc<dyn RequestObserver>);

        Ok(Self {
            config,
            mode,
            tls,
            backend_tls,
            director,
            proxy,
            auth,
            observer,
            tracker,
        })
    }

    /// Replace the request log sink (enables request logging).
    pub fn with_request_observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Replace the backend transport used for ordinary requests.
    pub fn with_transport(mut self, transport: BackendTransport) -> Self {
        self.proxy = ProtocolSniffingProxy::new(
            self.director.clone(),
            transport,
            self.config.backend.connect_timeout(),
            self.backend_tls.clone(),
            self.tracker.clone(),
        );
        self
    }

    pub fn mode(&self) -> ServingMode {
        self.mode
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Tracker counting open client connections and tunnels.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(&self) -> Router {
        let mut router = Router::new()
            .route(VERSION_PATH, get(version_handler))
            .fallback(proxy_handler)
            .with_state(self.proxy.clone());

        if self.mode.terminates_tls() {
            router = router.layer(axum::middleware::from_fn(forwarded_proto_middleware));
        }
        if let Some(auth) = &self.auth {
            router = router.layer(axum::middleware::from_fn_with_state(auth.clone(), auth_middleware));
        }
        if let Some(observer) = &self.observer {
            router = router.layer(axum::middleware::from_fn_with_state(
                observer.clone(),
                request_log_middleware,
            ));
        }

        router
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server on a bound listener until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: broadcast::Receiver<()>) -> Result<(), ServeError> {
        let addr = listener.local_addr().map_err(ServeError::Listener)?;
        tracing::info!(
            address = %addr,
            mode = %self.mode,
            backend = %self.config.backend.url,
            "HTTP server starting"
        );

        let options = &self.config.listener;
        let keepalive = KeepAliveListener::new(listener, options.keepalive());
        let sniffing = SniffingOptions {
            queue_capacity: options.accept_queue_capacity,
            preamble_timeout: options.preamble_timeout(),
        };
        let capacity = options.accept_queue_capacity;
        let handshake_timeout = options.handshake_timeout();

        let connections = ConnectionServer {
            router: self.build_router(),
            tracker: self.tracker.clone(),
            drain_timeout: self.config.shutdown.drain_timeout(),
        };

        match (self.mode.sniffs_preamble(), self.tls) {
            (false, None) => connections.serve(keepalive, shutdown).await,
            (false, Some(tls)) => {
                let listener = TlsListener::new(keepalive, tls, capacity, handshake_timeout)
                    .map_err(ServeError::Listener)?;
                connections.serve(listener, shutdown).await
            }
            (true, None) => {
                let listener = SniffingListener::new(keepalive, sniffing).map_err(ServeError::Listener)?;
                connections.serve(listener, shutdown).await
            }
            (true, Some(tls)) => {
                let sniffed = SniffingListener::new(keepalive, sniffing).map_err(ServeError::Listener)?;
                let listener = TlsListener::new(sniffed, tls, capacity, handshake_timeout)
                    .map_err(ServeError::Listener)?;
                connections.serve(listener, shutdown).await
            }
        }
    }
}

#[derive(Serialize)]
struct VersionInfo {
    version: &'static str,
}

async fn version_handler() -> impl IntoResponse {
    ([(X_PROXY_VERSION, VERSION)], Json(VersionInfo { version: VERSION }))
}

async fn proxy_handler(
    State(proxy): State<ProtocolSniffingProxy>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    proxy.serve(request, client).await
}

/// Per-connection serving shared by every listener stack.
struct ConnectionServer {
    router: Router,
    tracker: ConnectionTracker,
    drain_timeout: Duration,
}

impl ConnectionServer {
    async fn serve<L: StreamListener>(
        self,
        mut listener: L,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServeError> {
        let (drain_tx, drain_rx) = watch::channel(false);

        let result = loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting connections");
                    break Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let (io, remote) = match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_connection_error(&e) => {
                    tracing::debug!(error = %e, "Connection failed during accept");
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Accept failed");
                    break Err(ServeError::Accept(e));
                }
            };

            let guard = self.tracker.track();
            let span = tracing::info_span!("connection", id = %guard.id(), peer_addr = %remote);
            let service = self
                .router
                .clone()
                .map_request(move |mut request: Request<Incoming>| {
                    request.extensions_mut().insert(ConnectInfo(remote));
                    request
                });
            let service = TowerToHyperService::new(service);
            let mut drain = drain_rx.clone();

            tokio::spawn(
                async move {
                    let _guard = guard;
                    let builder = auto::Builder::new(TokioExecutor::new());
                    let connection = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
                    tokio::pin!(connection);

                    let mut draining = false;
                    loop {
                        tokio::select! {
                            result = connection.as_mut() => {
                                if let Err(e) = result {
                                    tracing::debug!(error = %e, "Connection closed with error");
                                }
                                break;
                            }
                            _ = drain.changed(), if !draining => {
                                draining = true;
                                connection.as_mut().graceful_shutdown();
                            }
                        }
                    }
                }
                .instrument(span),
            );
        };

        drop(listener);
        let _ = drain_tx.send(true);

        let open = self.tracker.active_count();
        if open > 0 {
            tracing::info!(open_connections = open, "Draining connections");
        }
        if !self.tracker.wait_for_drain(self.drain_timeout).await {
            tracing::warn!(
                open_connections = self.tracker.active_count(),
                "Drain timeout elapsed with connections still open"
            );
        }

        tracing::info!("HTTP server stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_table() {
        assert_eq!(ServingMode::select(true, false), ServingMode::DirectTls);
        assert_eq!(ServingMode::select(false, false), ServingMode::DirectPlaintext);
        assert_eq!(ServingMode::select(true, true), ServingMode::BehindProxyTls);
        assert_eq!(ServingMode::select(false, true), ServingMode::BehindProxyPlaintext);

        assert!(ServingMode::BehindProxyTls.terminates_tls());
        assert!(ServingMode::BehindProxyTls.sniffs_preamble());
        assert!(!ServingMode::DirectPlaintext.terminates_tls());
        assert!(!ServingMode::DirectTls.sniffs_preamble());
    }

    fn plaintext_config() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.listener.tls = false;
        config
    }

    #[test]
    fn missing_tls_material_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProxyConfig::default();
        config.listener.cert_path = dir.path().join("cert.pem");
        config.listener.key_path = dir.path().join("key.pem");
        assert!(matches!(HttpServer::new(config), Err(ServeError::Tls(_))));
    }

    #[test]
    fn unreadable_htpasswd_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = plaintext_config();
        config.auth.htpasswd_file = Some(dir.path().join("htpasswd"));
        assert!(matches!(HttpServer::new(config), Err(ServeError::Htpasswd(_))));
    }

    #[test]
    fn missing_backend_ca_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = plaintext_config();
        config.backend.url = "https://backend.internal".to_string();
        config.backend.ca_file = Some(dir.path().join("ca.pem"));
        assert!(matches!(HttpServer::new(config), Err(ServeError::Tls(_))));
    }

    #[test]
    fn bad_backend_url_is_fatal() {
        let mut config = plaintext_config();
        config.backend.url = "not a url".to_string();
        assert!(matches!(HttpServer::new(config), Err(ServeError::BackendUrl(_))));
    }

    #[tokio::test]
    async fn version_route_answers_locally() {
        let server = HttpServer::new(plaintext_config()).unwrap();
        let response = server
            .build_router()
            .oneshot(Request::builder().uri(VERSION_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()[X_PROXY_VERSION], VERSION);
        assert!(response.headers().contains_key("x-request-id"));

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], format!("{{\"version\":\"{VERSION}\"}}").as_bytes());
    }
}
