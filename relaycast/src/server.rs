//! Relay server orchestration
//!
//! Starts the relay loops, binds the HTTP ingress and drives the coordinator
//! from `Running` to `Stopped` on SIGINT/SIGTERM or a fatal ingress error.

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use relaycast_api::{create_router, AppState};
use relaycast_cluster::Coordinator;
use relaycast_core::{Config, Error};

pub struct RelayServer {
    config: Config,
    coordinator: Coordinator,
}

impl RelayServer {
    pub const fn new(config: Config, coordinator: Coordinator) -> Self {
        Self {
            config,
            coordinator,
        }
    }

    /// Start everything and wait for a shutdown signal
    pub async fn run(mut self) -> anyhow::Result<()> {
        let handles = self.coordinator.start()?;

        let http_address = self.config.http_address();
        let listener = match TcpListener::bind(&http_address).await {
            Ok(listener) => listener,
            Err(e) => {
                // Nothing is accepting yet, but the loops are running
                let _ = self.coordinator.shutdown().await;
                return Err(e).with_context(|| format!("Failed to bind HTTP address {http_address}"));
            }
        };
        info!("HTTP server listening on {}", http_address);

        let router = create_router(AppState::new(&handles), &self.config.server);
        let http_handle = tokio::spawn(serve_http(listener, router, handles.ingress_shutdown.clone()));
        self.coordinator.attach_ingress(http_handle);

        let stopped_by = self.coordinator.run_until(shutdown_signal()).await;
        if stopped_by.is_ok() {
            info!("Shutdown signal received, starting graceful shutdown...");
        }

        let shutdown = self.coordinator.shutdown().await;

        match (stopped_by, shutdown) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(fatal), Ok(())) => Err(fatal).context("Ingress failed"),
            (_, Err(e)) => Err(e).context("Graceful shutdown failed"),
        }
    }
}

async fn serve_http(
    listener: TcpListener,
    router: axum::Router,
    shutdown: CancellationToken,
) -> relaycast_core::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| {
            error!("HTTP server error: {}", e);
            Error::Transport(format!("HTTP server error: {e}"))
        })?;

    info!("HTTP server shut down gracefully");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
