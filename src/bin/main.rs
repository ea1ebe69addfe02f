use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use log::{error, info, warn};
use spi_core::{router, AppState, CommandAuthority, KeyStore, ServerSettings, SessionStore};
use tokio::net::TcpListener;
use tokio_native_tls::TlsAcceptor;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let settings = ServerSettings::from_env()?;
    info!("Starting server on port {}", settings.port);
    if settings.allowed_commands.is_empty() {
        warn!("SPI_ALLOWED_COMMANDS is empty, every /exec request will be refused");
    }

    // Without the server key pair there is nothing to serve.
    let keys = match KeyStore::load(
        &settings.private_key_path,
        settings.public_key_path.as_deref(),
    ) {
        Ok(keys) => Arc::new(keys),
        Err(e) => {
            error!("Failed to load server key pair: {}", e);
            return Err(e.into());
        }
    };

    let sessions = Arc::new(SessionStore::new(settings.session_ttl));
    let commands = CommandAuthority::new(
        settings.allowed_commands.clone(),
        settings.payload_encryption,
        settings.exec_timeout,
        keys.clone(),
    );
    let app = router(Arc::new(AppState::new(keys, sessions.clone(), commands)));

    spawn_session_sweeper(sessions, settings.sweep_interval);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on: {}", addr);

    if settings.tls_enabled {
        let tls_acceptor = TlsAcceptor::from(load_tls_config(
            &settings.tls_cert_path,
            &settings.tls_key_path,
        )?);
        serve_tls(listener, tls_acceptor, app).await;
    } else {
        warn!("TLS_CERT_PATH not set, serving plain HTTP");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    info!("Server stopped");
    Ok(())
}

fn spawn_session_sweeper(sessions: Arc<SessionStore>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match sessions.purge_expired() {
                Ok(0) => {}
                Ok(removed) => info!(
                    "Removed {} expired sessions, {} remain",
                    removed,
                    sessions.len()
                ),
                Err(e) => error!("Session sweep failed: {}", e),
            }
        }
    });
}

async fn serve_tls(listener: TcpListener, tls_acceptor: TlsAcceptor, app: Router) {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        let tls_acceptor = tls_acceptor.clone();
        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            let tls_stream = match tls_acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    warn!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
            {
                warn!("Connection with {} ended with error: {}", peer, e);
            }
        });
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn load_tls_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<native_tls::TlsAcceptor, Box<dyn std::error::Error>> {
    let cert = std::fs::read(cert_path)?;
    let key = std::fs::read(key_path)?;

    let identity = native_tls::Identity::from_pkcs8(&cert, &key)?;
    let acceptor = native_tls::TlsAcceptor::new(identity)?;

    Ok(acceptor)
}
