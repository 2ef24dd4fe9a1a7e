//! Per-request dispatch between plain forwarding and WebSocket tunnelling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};

use crate::http::director::Director;
use crate::http::forwarder::HttpForwarder;
use crate::http::headers::is_websocket_upgrade;
use crate::http::transport::BackendTransport;
use crate::http::websocket::WebSocketTunnel;
use crate::net::connection::ConnectionTracker;

/// Classifies each request and hands it to the matching strategy.
///
/// Both strategies share one [`Director`], so plain and upgraded
/// requests are rewritten by the same policy.
#[derive(Clone)]
pub struct ProtocolSniffingProxy {
    forwarder: HttpForwarder,
    tunnel: WebSocketTunnel,
}

impl ProtocolSniffingProxy {
    pub fn new(
        director: Director,
        transport: BackendTransport,
        connect_timeout: Duration,
        backend_tls: Arc<rustls::ClientConfig>,
        tracker: ConnectionTracker,
    ) -> Self {
        let director = Arc::new(director);
        Self {
            forwarder: HttpForwarder::new(director.clone(), transport),
            tunnel: WebSocketTunnel::new(director, connect_timeout, backend_tls, tracker),
        }
    }

    pub async fn serve(&self, request: Request<Body>, client: SocketAddr) -> Response<Body> {
        if is_websocket_upgrade(request.headers()) {
            tracing::debug!(peer_addr = %client, uri = %request.uri(), "Tunnelling WebSocket upgrade");
            self.tunnel.upgrade(request, client)
        } else {
            self.forwarder.forward(request, client).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tower::util::BoxCloneSyncService;
    use tower::BoxError;

    fn proxy() -> ProtocolSniffingProxy {
        let director = Director::new(&url::Url::parse("http://127.0.0.1:9").unwrap()).unwrap();
        let transport = BoxCloneSyncService::new(tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, BoxError>(Response::new(Body::from("forwarded")))
        }));
        let tls = crate::net::tls::backend_client_config(None).unwrap();
        ProtocolSniffingProxy::new(director, transport, Duration::from_secs(1), tls, ConnectionTracker::new())
    }

    #[tokio::test]
    async fn ordinary_requests_are_forwarded() {
        let request = Request::builder()
            .uri("/")
            .header("connection", "keep-alive")
            .body(Body::empty())
            .unwrap();
        let response = proxy().serve(request, "127.0.0.1:1".parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn upgrade_requests_go_to_the_tunnel() {
        let request = Request::builder()
            .method("POST")
            .uri("/ws")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .body(Body::empty())
            .unwrap();
        let response = proxy().serve(request, "127.0.0.1:1".parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
