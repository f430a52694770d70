//! Gateway service for running the complete HTTP gateway.
//!
//! The gateway is the unified entry point that wires together:
//! - Session controller and registry
//! - Lifecycle event bus and optional webhook forwarder
//! - HTTP server
//! - Session restore on start and client shutdown on stop

use crate::bus::EventBus;
use crate::client::SharedClientFactory;
use crate::client::process::ProcessClientFactory;
use crate::config::{GatewayConfig, ensure_valid, load_config};
use crate::error::{GatewayError, Result};
use crate::http;
use crate::media::MediaFetcher;
use crate::session::{ControllerOptions, CredentialStore, SessionController, SessionState};
use crate::webhook::WebhookForwarder;
use axum::Router;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Gateway service that serves the session API.
pub struct Gateway {
    config: GatewayConfig,
    controller: Arc<SessionController>,
    webhook: Option<WebhookForwarder>,
    running: Arc<RwLock<bool>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Create a gateway for `config` using `factory` for clients.
    ///
    /// # Errors
    ///
    /// Returns an error if the media or webhook HTTP clients cannot be built.
    pub fn new(config: GatewayConfig, factory: SharedClientFactory) -> Result<Self> {
        let bus = EventBus::new();
        let media = MediaFetcher::new(config.media)?;
        let controller = SessionController::new(
            factory,
            CredentialStore::new(config.sessions_dir()),
            media,
        )
        .with_bus(bus)
        .with_options(ControllerOptions::from(&config));
        let webhook = WebhookForwarder::from_config(&config.webhook)?;

        Ok(Self {
            config,
            controller: Arc::new(controller),
            webhook,
            running: Arc::new(RwLock::new(false)),
        })
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The session controller.
    #[must_use]
    pub const fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    /// The lifecycle event bus.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        self.controller.bus()
    }

    /// HTTP router for this gateway.
    #[must_use]
    pub fn router(&self) -> Router {
        http::router(Arc::clone(&self.controller))
    }

    /// Bind the configured listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or cannot be bound.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = self
            .config
            .server
            .addr()
            .parse()
            .map_err(|e| GatewayError::config(format!("invalid listen address: {e}")))?;
        TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::server(format!("failed to bind {addr}: {e}")))
    }

    /// Run the gateway until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be started.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` resolves, then release every
    /// client. Credential directories are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be created or the server
    /// fails.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        *self.running.write().await = true;
        info!("Gateway starting...");

        tokio::fs::create_dir_all(self.controller.credentials().root()).await?;

        let webhook_task = self
            .webhook
            .clone()
            .map(|forwarder| forwarder.spawn(self.bus()));

        if self.config.restore_sessions {
            self.controller.restore_sessions().await;
        }

        let local = listener.local_addr()?;
        info!(addr = %local, "Gateway listening. Press Ctrl+C to stop.");

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| GatewayError::server(e.to_string()));
        if let Err(e) = &result {
            error!(error = %e, "HTTP server failed");
        }

        info!("Gateway stopping...");
        self.controller.shutdown().await;
        if let Some(task) = webhook_task {
            task.abort();
        }
        *self.running.write().await = false;

        info!("Gateway stopped");
        result
    }

    /// Check if the gateway is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Current gateway status.
    pub async fn status(&self) -> GatewayStatus {
        let sessions = self.controller.list().await;
        let mut by_state = BTreeMap::new();
        for info in &sessions {
            *by_state.entry(info.state).or_insert(0) += 1;
        }
        let bus = self.bus().stats();

        GatewayStatus {
            running: *self.running.read().await,
            sessions: sessions.len(),
            by_state,
            events_published: bus.published,
            webhook: self.webhook.as_ref().map(|w| w.url().to_string()),
        }
    }
}

/// Gateway status information.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    /// Whether the gateway is running.
    pub running: bool,
    /// Number of live sessions.
    pub sessions: usize,
    /// Live sessions per state.
    pub by_state: BTreeMap<SessionState, usize>,
    /// Total lifecycle events published.
    pub events_published: u64,
    /// Webhook target, if configured.
    pub webhook: Option<String>,
}

/// Resolves on Ctrl+C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// Builder for creating a Gateway.
#[derive(Default)]
pub struct GatewayBuilder {
    config: GatewayConfig,
    factory: Option<SharedClientFactory>,
}

impl std::fmt::Debug for GatewayBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GatewayBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    #[must_use]
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom client backend instead of the bridge process.
    #[must_use]
    pub fn factory(mut self, factory: SharedClientFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Load configuration from the default file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub async fn load_config(mut self) -> Result<Self> {
        self.config = load_config().await?;
        Ok(self)
    }

    /// Validate the configuration and build the gateway.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configuration or if HTTP clients cannot
    /// be built.
    pub fn build(self) -> Result<Gateway> {
        ensure_valid(&self.config)?;
        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(ProcessClientFactory::new(self.config.bridge.clone()))
        });
        Gateway::new(self.config, factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AuthMode, ClientEvent};
    use crate::testing::ScriptedClientFactory;
    use assert_fs::TempDir;
    use tokio::sync::oneshot;

    fn config(tmp: &TempDir) -> GatewayConfig {
        let mut config = GatewayConfig {
            data_dir: tmp.path().to_path_buf(),
            ..GatewayConfig::default()
        };
        config.server.port = 0;
        config
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = GatewayConfig::default();
        config.bridge.command = String::new();
        assert!(GatewayBuilder::new().config(config).build().is_err());
    }

    #[tokio::test]
    async fn test_serve_restores_and_shuts_down() {
        let tmp = TempDir::new().unwrap();
        let factory = ScriptedClientFactory::new();
        let gateway = GatewayBuilder::new()
            .config(config(&tmp))
            .factory(Arc::new(factory.clone()))
            .build()
            .unwrap();

        let restored_dir = gateway.controller().credentials().dir_for("15550001111");
        tokio::fs::create_dir_all(&restored_dir).await.unwrap();

        let listener = gateway.bind().await.unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let gateway = Arc::new(gateway);
        let server = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .serve(listener, async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        for _ in 0..200 {
            if gateway.status().await.sessions == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(gateway.is_running().await);
        assert_eq!(factory.created().await[0].mode, AuthMode::Qr);
        assert!(factory.emit("15550001111", ClientEvent::Authenticated).await);

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();

        assert!(!gateway.is_running().await);
        assert_eq!(factory.shutdowns().await, vec!["15550001111"]);
        assert!(restored_dir.exists());
    }
}
