//! Request middleware, outermost first.
//!
//! ```text
//! request_log → auth (subnet bypass or htpasswd) → forwarded_proto → proxy
//! ```

pub mod auth;
pub mod forwarded_proto;
pub mod request_log;

pub use auth::{auth_middleware, AuthState, Authorizer, HtpasswdAuthorizer};
pub use forwarded_proto::forwarded_proto_middleware;
pub use request_log::{request_log_middleware, RequestObserver, RequestRecord, TracingObserver};
