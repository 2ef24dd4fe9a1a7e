//! TLS-terminating reverse proxy.
//!
//! ```text
//!     client ──TLS──▶ ┌────────────────────────────────────────────┐
//!                     │ keep-alive → [PROXY preamble] → [TLS]      │
//!                     │   → request log → [auth] → forwarded proto │ ──HTTP/ws──▶ backend
//!                     │   → ordinary forwarder | WebSocket tunnel  │
//!                     └────────────────────────────────────────────┘
//! ```
//!
//! Configuration comes from an optional TOML file with CLI flags layered on
//! top. Any startup or listener error exits non-zero.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::net::TcpListener;

use tls_terminator::config::{read_config, validate_config, ConfigError, ProxyConfig};
use tls_terminator::http::HttpServer;
use tls_terminator::lifecycle::{wait_for_termination, Shutdown};
use tls_terminator::observability;

#[derive(Parser, Debug)]
#[command(name = "tls-terminator", version, about = "TLS-terminating reverse proxy")]
struct Cli {
    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address to listen on (":443" binds all interfaces)
    #[arg(long)]
    listen: Option<String>,

    /// Path to PEM certificate chain
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to PEM private key
    #[arg(long)]
    key: Option<PathBuf>,

    /// Backend to forward connections to
    #[arg(long = "where")]
    backend: Option<String>,

    /// htpasswd file protecting access
    #[arg(long)]
    htpasswd_file: Option<PathBuf>,

    /// Subnet allowed to skip htpasswd authorization
    #[arg(long)]
    subnet: Option<String>,

    /// Accept HTTPS connections
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    tls: Option<bool>,

    /// Running behind a TCP proxy that sends PROXY protocol v1 preambles
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    behind_tcp_proxy: Option<bool>,

    /// Log one line per completed request
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    request_log: Option<bool>,
}

impl Cli {
    fn apply(self, config: &mut ProxyConfig) {
        if let Some(listen) = self.listen {
            config.listener.bind_address = listen;
        }
        if let Some(cert) = self.cert {
            config.listener.cert_path = cert;
        }
        if let Some(key) = self.key {
            config.listener.key_path = key;
        }
        if let Some(backend) = self.backend {
            config.backend.url = backend;
        }
        if let Some(path) = self.htpasswd_file {
            config.auth.htpasswd_file = Some(path);
        }
        if let Some(subnet) = self.subnet {
            config.auth.bypass_subnet = Some(subnet);
        }
        if let Some(tls) = self.tls {
            config.listener.tls = tls;
        }
        if let Some(behind) = self.behind_tcp_proxy {
            config.listener.behind_tcp_proxy = behind;
        }
        if let Some(request_log) = self.request_log {
            config.observability.request_log = request_log;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match read_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => ProxyConfig::default(),
    };
    cli.apply(&mut config);

    if let Err(e) = observability::init(&config.observability) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    if let Err(errors) = validate_config(&config) {
        tracing::error!(error = %ConfigError::Validation(errors), "Invalid configuration");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Proxy stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ProxyConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tls-terminator starting");

    let addr = config.listener.socket_addr()?;
    let server = HttpServer::new(config)?;
    let listener = TcpListener::bind(addr).await?;

    let shutdown = Shutdown::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_termination().await {
            Ok(signal) => tracing::info!(signal, "Termination signal received"),
            Err(e) => tracing::error!(error = %e, "Signal handler failed, shutting down"),
        }
        signal_shutdown.trigger();
    });

    server.run(listener, shutdown.subscribe()).await?;
    Ok(())
}
