//! HTTP server wiring the cache and security guard together

mod admission;
mod router;

pub use admission::{Admission, admission_middleware, client_id, with_admission};
pub use router::{AppState, create_router};

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::cache::TtlCache;
use crate::config::Config;
use crate::security::SecurityGuard;
use crate::{Error, Result};

/// Guard server
pub struct Server {
    config: Config,
    cache: Arc<TtlCache<Value>>,
    guard: Arc<SecurityGuard>,
}

impl Server {
    /// Build the shared cache and guard from `config`
    pub fn new(config: Config) -> Self {
        let cache = Arc::new(TtlCache::from_config(&config.cache));
        let guard = Arc::new(SecurityGuard::new(&config.security));

        for endpoint in guard.endpoints() {
            if let Some(policy) = guard.policy(endpoint) {
                info!(
                    endpoint,
                    max_requests = policy.max_requests,
                    window = ?policy.window,
                    "Registered rate limit"
                );
            }
        }

        Self {
            config,
            cache,
            guard,
        }
    }

    /// Shared response cache
    pub fn cache(&self) -> &Arc<TtlCache<Value>> {
        &self.cache
    }

    /// Shared security guard
    pub fn guard(&self) -> &Arc<SecurityGuard> {
        &self.guard
    }

    /// Router over this server's state
    pub fn router(&self) -> axum::Router {
        create_router(
            Arc::new(AppState {
                cache: Arc::clone(&self.cache),
                guard: Arc::clone(&self.guard),
            }),
            &self.config.server,
        )
    }

    /// Serve until SIGINT/SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let listener = TcpListener::bind(addr).await?;
        info!(
            %addr,
            trusted_proxies = self.config.server.trusted_proxies.len(),
            "Listening"
        );

        let cache_sweeper =
            TtlCache::spawn_sweeper(Arc::clone(&self.cache), self.config.cache.sweep_interval);
        let guard_sweeper = SecurityGuard::spawn_sweeper(
            Arc::clone(&self.guard),
            self.config.security.sweep_interval,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let drain_timeout = self.config.server.shutdown_timeout;

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let serve =
            axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown_tx));

        let result = tokio::select! {
            res = serve.into_future() => res.map_err(|e| Error::Internal(e.to_string())),
            () = async {
                let _ = shutdown_rx.recv().await;
                tokio::time::sleep(drain_timeout).await;
            } => {
                warn!(timeout = ?drain_timeout, "Connections still open after shutdown timeout");
                Ok(())
            }
        };

        cache_sweeper.abort();
        guard_sweeper.abort();
        result
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
