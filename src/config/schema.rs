//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the TLS terminator.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, TLS, PROXY protocol).
    pub listener: ListenerConfig,

    /// The single backend every request is forwarded to.
    pub backend: BackendConfig,

    /// Optional basic authentication.
    pub auth: AuthConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Graceful shutdown settings.
    pub shutdown: ShutdownConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:443"). A bare ":port" binds all interfaces.
    pub bind_address: String,

    /// Terminate TLS on accepted connections.
    pub tls: bool,

    /// Path to certificate file (PEM).
    pub cert_path: PathBuf,

    /// Path to private key file (PEM).
    pub key_path: PathBuf,

    /// Expect an optional PROXY protocol v1 preamble from a layer-4 balancer.
    pub behind_tcp_proxy: bool,

    /// Connections waiting between sniffing/handshake and the server.
    pub accept_queue_capacity: usize,

    /// Seconds to wait for the first bytes while sniffing (0 waits forever).
    pub preamble_timeout_secs: u64,

    /// Seconds allowed for a TLS handshake.
    pub handshake_timeout_secs: u64,

    /// TCP keep-alive probe period in seconds.
    pub keepalive_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:443".to_string(),
            tls: true,
            cert_path: PathBuf::from("/etc/ssl/private/cert.pem"),
            key_path: PathBuf::from("/etc/ssl/private/key.pem"),
            behind_tcp_proxy: false,
            accept_queue_capacity: 10,
            preamble_timeout_secs: 10,
            handshake_timeout_secs: 10,
            keepalive_secs: 180,
        }
    }
}

impl ListenerConfig {
    /// Parse the bind address, accepting the ":port" shorthand.
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let addr = self.bind_address.trim();
        match addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}").parse(),
            None => addr.parse(),
        }
    }

    pub fn preamble_timeout(&self) -> Option<Duration> {
        (self.preamble_timeout_secs > 0).then(|| Duration::from_secs(self.preamble_timeout_secs))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend base URL (e.g., "http://localhost:80").
    pub url: String,

    /// Timeout for establishing a backend connection.
    pub connect_timeout_secs: u64,

    /// Extra PEM roots trusted for https/wss backends, on top of the system store.
    pub ca_file: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:80".to_string(),
            connect_timeout_secs: 30,
            ca_file: None,
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// htpasswd file; authentication is off when unset.
    pub htpasswd_file: Option<PathBuf>,

    /// Clients inside this CIDR skip authentication.
    pub bypass_subnet: Option<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Emit one event per completed request.
    pub request_log: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            request_log: true,
        }
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Maximum time to wait for open connections after shutdown starts.
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
