//! Outbound HTTP transport to the backend.
//!
//! # Responsibilities
//! - Pooled HTTP/1.1 client with a connect timeout, speaking http or https
//! - Convert connection-level failures into a synthetic 503 page
//!
//! # Data Flow
//! ```text
//! HttpForwarder → BackendHealth → HyperTransport → backend
//!                      │
//!                      └─ network error → 503 Backend Unavailable
//! ```
//!
//! # Design Decisions
//! - The transport is a boxed tower service so tests can substitute fakes
//! - Only network failures become 503; anything else propagates

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response, StatusCode};
use futures_util::future::BoxFuture;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::{self, Client};
use hyper_util::rt::TokioExecutor;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Layer, Service, ServiceBuilder};

/// Body served when the backend cannot be reached.
pub const UNAVAILABLE_BODY: &str = "<!DOCTYPE html><html>
<style>
body {
\tfont-family: fantasy;
\ttext-align: center;
\tpadding-top: 20%;
\tbackground-color: #f1f6f8;
}
</style>
<body>
<h1>503 Backend Unavailable</h1>
<p>Sorry, we&lsquo;re having a brief problem. You can retry.</p>
<p>If the problem persists, please get in touch.</p>
</body>
</html>";

/// Type-erased transport used by the forwarder.
pub type BackendTransport = BoxCloneSyncService<Request<Body>, Response<Body>, BoxError>;

/// Error type for backend requests.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The TCP connection to the backend could not be established.
    #[error("backend unreachable: {0}")]
    Unreachable(#[source] legacy::Error),
    /// The connection was up but the exchange failed.
    #[error("backend request failed: {0}")]
    Request(#[source] legacy::Error),
}

impl TransportError {
    fn classify(err: legacy::Error) -> Self {
        if err.is_connect() {
            Self::Unreachable(err)
        } else {
            Self::Request(err)
        }
    }
}

/// Whether an error, or anything in its source chain, is a network failure.
pub fn is_network_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if matches!(e.downcast_ref::<TransportError>(), Some(TransportError::Unreachable(_))) {
            return true;
        }
        if let Some(client) = e.downcast_ref::<legacy::Error>() {
            if client.is_connect() {
                return true;
            }
        }
        if let Some(hyper) = e.downcast_ref::<hyper::Error>() {
            if hyper.is_incomplete_message() || hyper.is_closed() || hyper.is_timeout() {
                return true;
            }
        }
        if e.is::<io::Error>() || e.is::<tokio::time::error::Elapsed>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// The 503 page returned in place of a transport error.
pub fn unavailable_response() -> Response<Body> {
    let mut response = Response::new(Body::from(UNAVAILABLE_BODY));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

/// hyper client talking to the backend over http or https.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HyperTransport {
    pub fn new(connect_timeout: Duration, tls: Arc<rustls::ClientConfig>) -> Self {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(connect_timeout));
        http.set_nodelay(true);
        http.enforce_http(false);
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config((*tls).clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client }
    }
}

impl Service<Request<Body>> for HyperTransport {
    type Response = Response<Body>;
    type Error = TransportError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let response = client.request(req).await.map_err(TransportError::classify)?;
            Ok(response.map(Body::new))
        })
    }
}

/// Answers network failures of the inner transport with a 503 page.
#[derive(Clone)]
pub struct BackendHealth<S> {
    inner: S,
}

impl<S> BackendHealth<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> Service<Request<Body>> for BackendHealth<S>
where
    S: Service<Request<Body>, Response = Response<Body>>,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let response = self.inner.call(req);
        Box::pin(async move {
            match response.await {
                Ok(response) => Ok(response),
                Err(e) => {
                    let e: BoxError = e.into();
                    if is_network_error(&*e) {
                        tracing::warn!(error = %e, "Backend unavailable");
                        Ok(unavailable_response())
                    } else {
                        Err(e)
                    }
                }
            }
        })
    }
}

/// Layer form of [`BackendHealth`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendHealthLayer;

impl<S> Layer<S> for BackendHealthLayer {
    type Service = BackendHealth<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BackendHealth::new(inner)
    }
}

/// The production transport: hyper client wrapped in [`BackendHealth`].
pub fn backend_transport(connect_timeout: Duration, tls: Arc<rustls::ClientConfig>) -> BackendTransport {
    BoxCloneSyncService::new(
        ServiceBuilder::new()
            .layer(BackendHealthLayer)
            .service(HyperTransport::new(connect_timeout, tls)),
    )
}
