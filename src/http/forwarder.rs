//! Ordinary (non-upgrade) request forwarding.
//!
//! # Responsibilities
//! - Rewrite the request through the [`Director`]
//! - Send it over the backend transport and stream the response back
//! - Strip hop-by-hop headers from the backend response
//!
//! # Design Decisions
//! - Bodies are streamed in both directions; nothing is buffered
//! - Transport errors that survive the health wrapper become 502

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, Version};
use axum::response::IntoResponse;
use tower::ServiceExt;

use crate::http::director::Director;
use crate::http::headers::strip_hop_by_hop;
use crate::http::transport::BackendTransport;

/// Standard reverse-proxy forwarding to one backend.
#[derive(Clone)]
pub struct HttpForwarder {
    director: Arc<Director>,
    transport: BackendTransport,
}

impl HttpForwarder {
    pub fn new(director: Arc<Director>, transport: BackendTransport) -> Self {
        Self { director, transport }
    }

    pub async fn forward(&self, request: Request<Body>, client: SocketAddr) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let outbound = match self.director.rewrite(&parts, client) {
            Ok(outbound) => outbound,
            Err(e) => {
                tracing::error!(error = %e, uri = %parts.uri, "Failed to rewrite request");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        let mut backend_request = Request::new(body);
        *backend_request.method_mut() = parts.method;
        *backend_request.uri_mut() = outbound.uri;
        *backend_request.version_mut() = Version::HTTP_11;
        *backend_request.headers_mut() = outbound.headers;

        match self.transport.clone().oneshot(backend_request).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, body)
            }
            Err(e) => {
                tracing::error!(error = %e, backend = %self.director.authority(), "Backend request failed");
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::sync::Mutex;
    use tower::util::BoxCloneSyncService;
    use tower::BoxError;

    fn director() -> Arc<Director> {
        Arc::new(Director::new(&url::Url::parse("http://backend.internal:8080/base").unwrap()).unwrap())
    }

    #[tokio::test]
    async fn forwards_rewritten_request_and_cleans_response() {
        let seen = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let transport = BoxCloneSyncService::new(tower::service_fn(move |req: Request<Body>| {
            let captured = captured.clone();
            async move {
                *captured.lock().unwrap() = Some((req.uri().clone(), req.headers().clone(), req.version()));
                let mut response = Response::new(Body::from("ok"));
                response
                    .headers_mut()
                    .insert("connection", HeaderValue::from_static("keep-alive"));
                response
                    .headers_mut()
                    .insert("x-backend", HeaderValue::from_static("1"));
                Ok::<_, BoxError>(response)
            }
        }));

        let forwarder = HttpForwarder::new(director(), transport);
        let request = Request::builder()
            .uri("/path?q=1")
            .header("host", "public.example")
            .header("proxy-authorization", "Basic Zm9v")
            .body(Body::empty())
            .unwrap();
        let response = forwarder.forward(request, "198.51.100.7:4000".parse().unwrap()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("connection"));
        assert_eq!(response.headers()["x-backend"], "1");

        let (uri, headers, version) = seen.lock().unwrap().take().unwrap();
        assert_eq!(uri, "http://backend.internal:8080/base/path?q=1");
        assert_eq!(headers["host"], "public.example");
        assert_eq!(headers["x-forwarded-for"], "198.51.100.7");
        assert!(!headers.contains_key("proxy-authorization"));
        assert_eq!(version, Version::HTTP_11);
    }

    #[tokio::test]
    async fn transport_failure_is_bad_gateway() {
        let transport = BoxCloneSyncService::new(tower::service_fn(|_req: Request<Body>| async {
            Err::<Response<Body>, BoxError>("protocol error".into())
        }));
        let forwarder = HttpForwarder::new(director(), transport);
        let response = forwarder
            .forward(Request::new(Body::empty()), "127.0.0.1:1".parse().unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
