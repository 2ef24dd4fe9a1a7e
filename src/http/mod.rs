//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! accepted connection
//!     → server.rs (listener stack, router, middleware)
//!     → proxy.rs (classify: WebSocket upgrade or ordinary request)
//!         → forwarder.rs → transport.rs (backend health) → backend
//!         → websocket.rs (handshake, dial, byte relay) → backend
//! ```

pub mod director;
pub mod forwarder;
pub mod headers;
pub mod middleware;
pub mod proxy;
pub mod server;
pub mod transport;
pub mod websocket;

pub use director::Director;
pub use proxy::ProtocolSniffingProxy;
pub use server::{HttpServer, ServeError, ServingMode};
