//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use tls_terminator::http::{HttpServer, ServeError};
use tls_terminator::{ProxyConfig, Shutdown};

/// A proxy running on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub task: JoinHandle<Result<(), ServeError>>,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Start a plaintext proxy in front of `backend`, letting the caller tweak the config.
pub async fn start_proxy(backend: SocketAddr, configure: impl FnOnce(&mut ProxyConfig)) -> TestProxy {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.listener.tls = false;
    config.backend.url = format!("http://{backend}");
    config.backend.connect_timeout_secs = 2;
    config.shutdown.drain_timeout_secs = 2;
    configure(&mut config);

    let server = HttpServer::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let task = tokio::spawn(server.run(listener, shutdown.subscribe()));

    TestProxy { addr, shutdown, task }
}

/// reqwest client without pooling or system proxies.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Backend that answers every request with its own request head as the body.
///
/// The response also carries hop-by-hop headers the proxy must strip.
pub async fn start_echo_backend() -> SocketAddr {
    serve_backend(None, echo_head).await
}

/// [`start_echo_backend`] behind TLS terminated with `acceptor`.
pub async fn start_tls_echo_backend(acceptor: TlsAcceptor) -> SocketAddr {
    serve_backend(Some(acceptor), echo_head).await
}

/// Request line and headers seen by the WebSocket backend, lowercased.
pub type SeenHandshakes = Arc<Mutex<Vec<String>>>;

/// WebSocket backend that echoes text and binary messages.
pub async fn start_ws_echo_backend() -> (SocketAddr, SeenHandshakes) {
    let seen: SeenHandshakes = Arc::default();
    let recorder = seen.clone();
    let addr = serve_backend(None, move |socket| ws_echo(socket, recorder.clone())).await;
    (addr, seen)
}

/// [`start_ws_echo_backend`] behind TLS terminated with `acceptor`.
pub async fn start_wss_echo_backend(acceptor: TlsAcceptor) -> (SocketAddr, SeenHandshakes) {
    let seen: SeenHandshakes = Arc::default();
    let recorder = seen.clone();
    let addr = serve_backend(Some(acceptor), move |socket| ws_echo(socket, recorder.clone())).await;
    (addr, seen)
}

/// Object-safe stream used by the test backends.
pub trait BackendIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> BackendIo for T {}

async fn serve_backend<F, Fut>(acceptor: Option<TlsAcceptor>, handle: F) -> SocketAddr
where
    F: Fn(Box<dyn BackendIo>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = Arc::new(handle);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let io: Box<dyn BackendIo> = match acceptor {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(tls) => Box::new(tls),
                        Err(_) => return,
                    },
                    None => Box::new(socket),
                };
                handle(io).await;
            });
        }
    });

    addr
}

async fn echo_head(mut socket: Box<dyn BackendIo>) {
    let head = read_head(&mut socket).await;
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close, X-Secret\r\n\
         Keep-Alive: timeout=5\r\n\
         X-Secret: hidden\r\n\
         X-Backend: echo\r\n\r\n{}",
        head.len(),
        head
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

async fn ws_echo(socket: Box<dyn BackendIo>, recorder: SeenHandshakes) {
    let callback = |request: &Request, response: Response| {
        let mut head = format!("{} {}\n", request.method(), request.uri());
        for (name, value) in request.headers() {
            head.push_str(&format!("{}: {}\n", name, value.to_str().unwrap_or("")));
        }
        recorder.lock().unwrap().push(head.to_lowercase());
        Ok::<_, ErrorResponse>(response)
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(socket, callback).await else {
        return;
    };
    while let Some(Ok(message)) = ws.next().await {
        if (message.is_text() || message.is_binary()) && ws.send(message).await.is_err() {
            break;
        }
    }
}

async fn read_head<S: AsyncRead + Unpin>(socket: &mut S) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// TLS acceptor for a fresh `localhost` certificate, plus that certificate as a CA file.
pub fn backend_tls(dir: &Path) -> (TlsAcceptor, PathBuf) {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let ca_path = dir.join("backend-ca.pem");
    std::fs::write(&ca_path, generated.cert.pem()).unwrap();

    let key = PrivateKeyDer::Pkcs8(generated.key_pair.serialize_der().into());
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![generated.cert.der().clone()], key)
        .unwrap();
    (TlsAcceptor::from(Arc::new(config)), ca_path)
}

/// Write a self-signed certificate for `localhost` into `dir`.
pub fn write_certificate(dir: &Path) -> (PathBuf, PathBuf, CertificateDer<'static>) {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, generated.cert.pem()).unwrap();
    std::fs::write(&key_path, generated.key_pair.serialize_pem()).unwrap();
    (cert_path, key_path, generated.cert.der().clone())
}

/// htpasswd file with `alice:secret`.
pub fn write_htpasswd(dir: &Path) -> PathBuf {
    let path = dir.join("htpasswd");
    std::fs::write(&path, "alice:{SHA}5en6G6MezRroT3XKqkdPOmY/BfQ=\n").unwrap();
    path
}

/// Send raw bytes and read until the peer closes.
pub async fn raw_exchange(addr: SocketAddr, payload: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response)).await;
    String::from_utf8_lossy(&response).to_lowercase()
}
