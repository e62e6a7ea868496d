// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Aquaman — credential-isolation reverse proxy
//
//  Clients speak plain HTTP to a loopback endpoint; credentials
//  live only in this process and enter requests on the way out.
//  Every access lands in a hash-chained audit log.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use aquaman_core::AquamanConfig;
use aquaman_core::ServiceRegistry;
use aquaman_observability::AuditLog;
use aquaman_proxy::pipeline::{AuditSink, ProxyContext};
use aquaman_proxy::ProxyDaemon;

#[derive(Parser, Debug)]
#[command(name = "aquaman", version, about = "Credential-isolation reverse proxy for local AI agents")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print a machine-readable ready line to stdout once the listener is up
    #[arg(long)]
    plugin_mode: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Aquaman starting");

    // ── Config ──
    let mut config = AquamanConfig::load(cli.config.as_deref())?;
    if cli.plugin_mode {
        config.plugin_mode = true;
    }

    // ── Service registry ──
    let registry = Arc::new(ServiceRegistry::load(config.registry.services_file.clone()));

    // ── Credential store; unreachable backends are fatal ──
    let store = match aquaman_store::build_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!("aquaman: credential store unavailable: {e}");
            std::process::exit(1);
        }
    };

    // ── Audit log ──
    let audit = Arc::new(AuditLog::open(config.audit_dir())?);
    let sink_audit = Arc::clone(&audit);
    let sink: AuditSink = Arc::new(move |request_info| {
        sink_audit.record_credential_access(
            &request_info.service,
            &format!("{} {}", request_info.method, request_info.path),
            request_info.error.is_none(),
            request_info.error.as_deref(),
        );
    });

    // ── Client token ──
    let client_token = if config.client_auth.enabled {
        Some(
            config
                .client_auth
                .token
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
        )
    } else {
        None
    };

    // ── Daemon ──
    let ctx = Arc::new(ProxyContext::new(
        Arc::clone(&registry),
        store,
        sink,
        client_token.clone(),
        config.registry.allowed_services.clone(),
        Duration::from_millis(config.proxy.upstream_timeout_ms),
    ));

    let mut daemon = ProxyDaemon::new(
        Arc::clone(&ctx),
        config.listen.clone(),
        Duration::from_millis(config.proxy.shutdown_grace_ms),
    );
    daemon.start().await?;

    // ── Plugin-mode ready line ──
    // One JSON line on stdout so a managing host process can read the bound
    // endpoint (logs go to stderr for exactly this reason).
    if config.plugin_mode {
        let mut ready = serde_json::json!({
            "ready": true,
            "services": registry.names(),
        });
        if let Some(port) = daemon.port() {
            ready["port"] = serde_json::json!(port);
        }
        if let Some(socket_path) = daemon.socket_path() {
            ready["socketPath"] = serde_json::json!(socket_path.display().to_string());
        }
        if let Some(token) = &client_token {
            ready["token"] = serde_json::json!(token);
        }
        println!("{ready}");
    }

    info!(port = ?daemon.port(), socket = ?daemon.socket_path(), "Aquaman is ready");

    // ── Graceful shutdown on SIGINT/SIGTERM ──
    shutdown_signal().await;
    info!("shutdown signal received, draining");
    daemon.stop().await?;

    info!("Aquaman stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
