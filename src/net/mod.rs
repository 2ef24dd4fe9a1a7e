//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (KeepAliveListener: TCP keep-alive)
//!     → listener.rs (SniffingListener: optional PROXY preamble, behind-proxy mode)
//!     → tls.rs (optional TLS handshake)
//!     → connection.rs (lifecycle tracking)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Sniffing and TLS handshakes run per connection behind a bounded queue
//! - Bytes read while sniffing are replayed through stream.rs
//! - Each connection tracked for graceful shutdown

pub mod connection;
pub mod handoff;
pub mod listener;
pub mod preamble;
pub mod stream;
pub mod tls;

pub use listener::{KeepAliveListener, SniffingListener, SniffingOptions, StreamListener};
pub use preamble::{PreambleError, ProtocolFamily, ProxyPreamble};
pub use stream::{Connection, ProxiedStream};
pub use tls::TlsListener;
