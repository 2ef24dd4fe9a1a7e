//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → subnet.rs (client inside bypass subnet? skip auth)
//!     → htpasswd.rs (verify basic-auth credentials)
//!     → Pass to proxy
//! ```
//!
//! # Design Decisions
//! - Fail closed: missing or wrong credentials are rejected
//! - Credentials are loaded once at startup

pub mod htpasswd;
pub mod subnet;

pub use htpasswd::{Htpasswd, HtpasswdError};
pub use subnet::{Subnet, SubnetParseError};
