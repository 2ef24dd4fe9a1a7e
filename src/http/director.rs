//! Rewrite policy turning an inbound request into the backend request.
//!
//! # Responsibilities
//! - Point the request URI at the configured backend
//! - Apply the shared header policy (hop-by-hop, X-Forwarded-For, Host)
//! - Map the scheme for WebSocket dials (`http`→`ws`, `https`→`wss`)

use std::net::SocketAddr;
use std::str::FromStr;

use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::request::Parts;
use axum::http::uri::{Authority, PathAndQuery, Uri};

use crate::http::headers::{append_forwarded_for, strip_hop_by_hop};

#[derive(Debug, thiserror::Error)]
pub enum DirectorError {
    #[error("invalid backend target {0:?}")]
    InvalidTarget(String),
    #[error("failed to build backend request: {0}")]
    Http(#[from] axum::http::Error),
}

/// The request actually sent to the backend.
#[derive(Debug, Clone)]
pub struct OutboundDialRequest {
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// Backend target plus the rewrite rules applied to every request.
#[derive(Debug, Clone)]
pub struct Director {
    scheme: String,
    authority: Authority,
    base_path: String,
    base_query: Option<String>,
}

impl Director {
    pub fn new(target: &url::Url) -> Result<Self, DirectorError> {
        let invalid = || DirectorError::InvalidTarget(target.to_string());
        let host = target.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let authority = match target.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(Self {
            scheme: target.scheme().to_string(),
            authority: Authority::from_str(&authority).map_err(|_| invalid())?,
            base_path: target.path().to_string(),
            base_query: target.query().filter(|q| !q.is_empty()).map(str::to_string),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Rewrite for the ordinary HTTP forwarder.
    pub fn rewrite(&self, parts: &Parts, client: SocketAddr) -> Result<OutboundDialRequest, DirectorError> {
        self.rewrite_with_scheme(parts, client, &self.scheme)
    }

    /// Rewrite for a WebSocket dial to the same backend.
    pub fn rewrite_for_tunnel(
        &self,
        parts: &Parts,
        client: SocketAddr,
    ) -> Result<OutboundDialRequest, DirectorError> {
        let mut outbound = self.rewrite_with_scheme(parts, client, tunnel_scheme(&self.scheme))?;
        // Bytes are relayed verbatim, so the backend must not negotiate
        // extensions the client was never told about.
        outbound.headers.remove(header::SEC_WEBSOCKET_EXTENSIONS);
        Ok(outbound)
    }

    fn rewrite_with_scheme(
        &self,
        parts: &Parts,
        client: SocketAddr,
        scheme: &str,
    ) -> Result<OutboundDialRequest, DirectorError> {
        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        append_forwarded_for(&mut headers, client.ip());

        let host = match inbound_host(parts) {
            Some(host) => host,
            None => HeaderValue::from_str(self.authority.as_str())
                .map_err(|e| DirectorError::Http(e.into()))?,
        };
        headers.insert(header::HOST, host);

        let uri = Uri::builder()
            .scheme(scheme)
            .authority(self.authority.clone())
            .path_and_query(self.path_and_query(parts.uri.path_and_query()))
            .build()?;

        Ok(OutboundDialRequest { uri, headers })
    }

    fn path_and_query(&self, inbound: Option<&PathAndQuery>) -> String {
        let path = join_paths(&self.base_path, inbound.map_or("/", PathAndQuery::path));
        let query = match (self.base_query.as_deref(), inbound.and_then(PathAndQuery::query)) {
            (Some(base), Some(req)) if !req.is_empty() => Some(format!("{base}&{req}")),
            (Some(base), _) => Some(base.to_string()),
            (None, Some(req)) => Some(req.to_string()),
            (None, None) => None,
        };
        match query {
            Some(query) => format!("{path}?{query}"),
            None => path,
        }
    }
}

/// Host the client addressed: the `Host` header, or the URI authority on HTTP/2.
pub fn inbound_host(parts: &Parts) -> Option<HeaderValue> {
    parts.headers.get(header::HOST).cloned().or_else(|| {
        parts
            .uri
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
    })
}

/// Scheme used when dialling the backend for a WebSocket tunnel.
pub fn tunnel_scheme(scheme: &str) -> &str {
    match scheme {
        "http" | "" => "ws",
        "https" => "wss",
        other => other,
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}
