//! Basic authentication with an optional trusted-subnet bypass.
//!
//! # Responsibilities
//! - Let clients inside the bypass subnet through untouched
//! - Challenge everyone else for htpasswd credentials
//!
//! # Design Decisions
//! - The realm is the backend URL, so browsers scope credentials per backend
//! - A request without a known client address fails closed with 500

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::security::{Htpasswd, Subnet};

/// Decides whether a request carries acceptable credentials.
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, request: &Request<Body>) -> bool;
}

/// Checks `Authorization: Basic` credentials against an htpasswd store.
pub struct HtpasswdAuthorizer {
    store: Htpasswd,
}

impl HtpasswdAuthorizer {
    pub fn new(store: Htpasswd) -> Self {
        Self { store }
    }
}

impl Authorizer for HtpasswdAuthorizer {
    fn authorize(&self, request: &Request<Body>) -> bool {
        basic_credentials(request).is_some_and(|(user, password)| self.store.verify(&user, &password))
    }
}

fn basic_credentials(request: &Request<Body>) -> Option<(String, String)> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// State for [`auth_middleware`].
#[derive(Clone)]
pub struct AuthState {
    authorizer: Arc<dyn Authorizer>,
    bypass: Option<Subnet>,
    challenge: HeaderValue,
}

impl AuthState {
    pub fn new(authorizer: Arc<dyn Authorizer>, bypass: Option<Subnet>, realm: &str) -> Self {
        let challenge = HeaderValue::from_str(&format!("Basic realm=\"{realm}\""))
            .unwrap_or_else(|_| HeaderValue::from_static("Basic realm=\"proxy\""));
        Self {
            authorizer,
            bypass,
            challenge,
        }
    }
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(subnet) = &state.bypass {
        let Some(ConnectInfo(remote)) = request.extensions().get::<ConnectInfo<SocketAddr>>().copied() else {
            tracing::error!(uri = %request.uri(), "Client address unavailable for subnet check");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };
        if subnet.contains(remote.ip()) {
            return next.run(request).await;
        }
    }

    if state.authorizer.authorize(&request) {
        return next.run(request).await;
    }

    tracing::debug!(uri = %request.uri(), "Rejected unauthenticated request");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, state.challenge.clone())],
        "401 Unauthorized\n",
    )
        .into_response()
}
