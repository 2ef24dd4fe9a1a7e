//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check the listener address, backend URL and bypass subnet parse
//! - Validate value ranges (queue capacity and handshake timeout > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::config::schema::ProxyConfig;
use crate::security::Subnet;

/// A single semantic problem with the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid bind address {0:?}")]
    BindAddress(String),
    #[error("invalid backend url {url:?}: {reason}")]
    BackendUrl { url: String, reason: String },
    #[error("invalid bypass subnet {0:?}")]
    Subnet(String),
    #[error("listener.accept_queue_capacity must be greater than zero")]
    QueueCapacity,
    #[error("listener.handshake_timeout_secs must be greater than zero")]
    HandshakeTimeout,
    #[error("TLS is enabled but {0} is empty")]
    MissingTlsPath(&'static str),
}

/// Check a parsed configuration, collecting every problem.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.socket_addr().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }

    if let Err(reason) = check_backend_url(&config.backend.url) {
        errors.push(ValidationError::BackendUrl {
            url: config.backend.url.clone(),
            reason,
        });
    }

    if let Some(subnet) = &config.auth.bypass_subnet {
        if subnet.parse::<Subnet>().is_err() {
            errors.push(ValidationError::Subnet(subnet.clone()));
        }
    }

    if config.listener.accept_queue_capacity == 0 {
        errors.push(ValidationError::QueueCapacity);
    }

    if config.listener.tls {
        if config.listener.handshake_timeout_secs == 0 {
            errors.push(ValidationError::HandshakeTimeout);
        }
        if config.listener.cert_path.as_os_str().is_empty() {
            errors.push(ValidationError::MissingTlsPath("listener.cert_path"));
        }
        if config.listener.key_path.as_os_str().is_empty() {
            errors.push(ValidationError::MissingTlsPath("listener.key_path"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_backend_url(raw: &str) -> Result<(), String> {
    let url = url::Url::parse(raw).map_err(|e| e.to_string())?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme {other:?}")),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err("missing host".to_string());
    }
    Ok(())
}
