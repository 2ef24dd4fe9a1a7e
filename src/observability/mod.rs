//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems emit tracing events and spans
//!     → logging.rs (EnvFilter + fmt layer, plain or JSON)
//!     → stdout
//! ```
//!
//! # Design Decisions
//! - `RUST_LOG` overrides the configured level
//! - Per-request completion records come from the request log middleware,
//!   not from here
pub mod logging;

pub use logging::{init, LoggingError};
