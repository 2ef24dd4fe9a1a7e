//! `X-Forwarded-Proto` injection for TLS-terminated traffic.

use axum::body::Body;
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;

use crate::http::headers::X_FORWARDED_PROTO;

/// Appends `X-Forwarded-Proto: https`; only layered when TLS is terminated here.
pub async fn forwarded_proto_middleware(mut request: Request<Body>, next: Next) -> Response {
    request
        .headers_mut()
        .append(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
    next.run(request).await
}
