//! Daemon lifecycle: bind, serve, drain, release.
//!
//! Three listener shapes share one router: plain TCP (port 0 honored for
//! dynamic allocation), TLS over TCP when cert/key paths are configured, and
//! a Unix domain socket created with owner-only permissions after any stale
//! file at the path is removed. `stop` drains in-flight handlers inside a
//! bounded grace period, releases the socket file, and clears the client
//! token from memory.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use aquaman_core::config::{ListenConfig, TlsConfig};

use crate::pipeline::ProxyContext;

pub struct ProxyDaemon {
    ctx: Arc<ProxyContext>,
    listen: ListenConfig,
    grace: Duration,
    running: Option<Running>,
}

struct Running {
    shutdown: Shutdown,
    join: JoinHandle<()>,
    port: Option<u16>,
    socket_path: Option<PathBuf>,
}

enum Shutdown {
    /// Plain axum serve loops stop accepting when this fires.
    Signal(oneshot::Sender<()>),
    /// TLS serve loop owned by axum-server.
    Tls(Handle<SocketAddr>),
}

impl ProxyDaemon {
    pub fn new(ctx: Arc<ProxyContext>, listen: ListenConfig, grace: Duration) -> Self {
        Self { ctx, listen, grace, running: None }
    }

    /// Bind the configured listener and start serving.
    ///
    /// A second call while running is refused loudly rather than rebinding.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.running.is_some() {
            anyhow::bail!("daemon is already running");
        }

        let app = crate::pipeline::build_router(Arc::clone(&self.ctx));

        let running = if let Some(socket_path) = self.listen.socket_path.clone() {
            Self::serve_unix(app, socket_path).await?
        } else if let Some(tls) = self.listen.tls.clone() {
            Self::serve_tls(app, &self.listen.host, self.listen.port, tls).await?
        } else {
            Self::serve_tcp(app, &self.listen.host, self.listen.port).await?
        };

        self.running = Some(running);
        Ok(())
    }

    async fn serve_tcp(app: axum::Router, host: &str, port: u16) -> anyhow::Result<Running> {
        let listener = TcpListener::bind((host, port)).await?;
        let actual = listener.local_addr()?;
        info!(addr = %actual, "proxy listening");

        let (tx, rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "proxy server exited with error");
            }
        });

        Ok(Running {
            shutdown: Shutdown::Signal(tx),
            join,
            port: Some(actual.port()),
            socket_path: None,
        })
    }

    async fn serve_tls(
        app: axum::Router,
        host: &str,
        port: u16,
        tls: TlsConfig,
    ) -> anyhow::Result<Running> {
        let rustls = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
            .await
            .map_err(|e| anyhow::anyhow!("loading TLS cert/key: {e}"))?;

        let addr: SocketAddr = format!("{host}:{port}").parse()?;
        let handle = Handle::new();

        let serve_handle = handle.clone();
        let join = tokio::spawn(async move {
            let server = axum_server::bind_rustls(addr, rustls)
                .handle(serve_handle)
                .serve(app.into_make_service());
            if let Err(e) = server.await {
                warn!(error = %e, "TLS proxy server exited with error");
            }
        });

        let actual = handle
            .listening()
            .await
            .ok_or_else(|| anyhow::anyhow!("TLS listener failed to bind {addr}"))?;
        info!(addr = %actual, "proxy listening (TLS)");

        Ok(Running {
            shutdown: Shutdown::Tls(handle),
            join,
            port: Some(actual.port()),
            socket_path: None,
        })
    }

    async fn serve_unix(app: axum::Router, socket_path: PathBuf) -> anyhow::Result<Running> {
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(path = %socket_path.display(), "proxy listening on unix socket");

        let (tx, rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "proxy server exited with error");
            }
        });

        Ok(Running {
            shutdown: Shutdown::Signal(tx),
            join,
            port: None,
            socket_path: Some(socket_path),
        })
    }

    /// Stop accepting, drain in-flight handlers within the grace period,
    /// release the socket file, and clear the client token.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        let Some(mut running) = self.running.take() else {
            anyhow::bail!("daemon is not running");
        };

        match running.shutdown {
            Shutdown::Signal(tx) => {
                let _ = tx.send(());
            }
            Shutdown::Tls(handle) => {
                handle.graceful_shutdown(Some(self.grace));
            }
        }

        if tokio::time::timeout(self.grace, &mut running.join).await.is_err() {
            warn!("in-flight handlers outlived the grace period; aborting");
            running.join.abort();
        }

        if let Some(socket_path) = running.socket_path
            && socket_path.exists()
        {
            let _ = std::fs::remove_file(&socket_path);
        }

        if let Ok(mut token) = self.ctx.client_token.write() {
            token.take();
        }

        info!("proxy stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Actual bound port for TCP/TLS listeners, also when configured as 0.
    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().and_then(|r| r.port)
    }

    pub fn socket_path(&self) -> Option<&PathBuf> {
        self.running.as_ref().and_then(|r| r.socket_path.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AuditSink;
    use aquaman_core::ServiceRegistry;
    use aquaman_store::CredentialStore;
    use aquaman_store::memory::MemoryStore;

    fn context() -> Arc<ProxyContext> {
        let registry = Arc::new(ServiceRegistry::load(None));
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::new());
        let sink: AuditSink = Arc::new(|_| {});
        Arc::new(ProxyContext::new(
            registry,
            store,
            sink,
            None,
            None,
            Duration::from_secs(30),
        ))
    }

    fn listen_on_port_zero() -> ListenConfig {
        ListenConfig {
            host: "127.0.0.1".into(),
            port: 0,
            socket_path: None,
            tls: None,
        }
    }

    #[tokio::test]
    async fn start_binds_dynamic_port_and_serves_health() {
        let mut daemon = ProxyDaemon::new(context(), listen_on_port_zero(), Duration::from_secs(5));
        daemon.start().await.unwrap();

        let port = daemon.port().expect("port must be known after start");
        assert_ne!(port, 0);
        assert!(daemon.is_running());

        let body: serde_json::Value =
            reqwest::get(format!("http://127.0.0.1:{port}/_health"))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        assert_eq!(body["status"], "ok");

        daemon.stop().await.unwrap();
        assert!(!daemon.is_running());
    }

    #[tokio::test]
    async fn double_start_fails_loudly() {
        let mut daemon = ProxyDaemon::new(context(), listen_on_port_zero(), Duration::from_secs(5));
        daemon.start().await.unwrap();
        assert!(daemon.start().await.is_err());
        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_fails() {
        let mut daemon = ProxyDaemon::new(context(), listen_on_port_zero(), Duration::from_secs(5));
        assert!(daemon.stop().await.is_err());
    }

    #[tokio::test]
    async fn stop_clears_the_client_token() {
        let registry = Arc::new(ServiceRegistry::load(None));
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::new());
        let sink: AuditSink = Arc::new(|_| {});
        let ctx = Arc::new(ProxyContext::new(
            registry,
            store,
            sink,
            Some("tok-123".into()),
            None,
            Duration::from_secs(30),
        ));

        let mut daemon =
            ProxyDaemon::new(Arc::clone(&ctx), listen_on_port_zero(), Duration::from_secs(5));
        daemon.start().await.unwrap();
        daemon.stop().await.unwrap();

        assert!(ctx.client_token.read().unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_is_created_owner_only_and_released() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("aquaman.sock");
        // Stale file from a previous run gets cleared.
        std::fs::write(&socket_path, b"stale").unwrap();

        let listen = ListenConfig {
            host: "127.0.0.1".into(),
            port: 0,
            socket_path: Some(socket_path.clone()),
            tls: None,
        };
        let mut daemon = ProxyDaemon::new(context(), listen, Duration::from_secs(5));
        daemon.start().await.unwrap();

        assert_eq!(daemon.socket_path(), Some(&socket_path));
        assert!(daemon.port().is_none());
        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        daemon.stop().await.unwrap();
        assert!(!socket_path.exists());
    }
}
