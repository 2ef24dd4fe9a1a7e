//! TLS-terminating reverse proxy library.
//!
//! Accepts client connections (optionally behind a TCP load balancer that
//! speaks PROXY protocol v1), terminates TLS and forwards every request to a
//! single HTTP backend. WebSocket upgrades are tunnelled as raw bytes.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod security;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
