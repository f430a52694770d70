//! Forwards lifecycle events to an HTTP endpoint.
//!
//! Each [`LifecycleEvent`] on the bus is POSTed as JSON. Delivery is
//! fire-and-forget: failures are logged and the next event is tried.

use crate::bus::EventBus;
use crate::config::WebhookConfig;
use crate::error::{GatewayError, Result};
use crate::events::LifecycleEvent;
use crate::util::generate_id;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Header carrying the event type.
pub const EVENT_HEADER: &str = "x-machi-wa-event";

/// Header carrying a unique id per delivery attempt.
pub const DELIVERY_HEADER: &str = "x-machi-wa-delivery";

/// Posts lifecycle events to a single URL.
#[derive(Debug, Clone)]
pub struct WebhookForwarder {
    client: reqwest::Client,
    url: String,
}

impl WebhookForwarder {
    /// Create a forwarder posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::internal(format!("webhook client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Build a forwarder from config, or `None` when no URL is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &WebhookConfig) -> Result<Option<Self>> {
        match config.url.as_deref() {
            Some(url) if !url.trim().is_empty() => Ok(Some(Self::new(
                url.trim(),
                Duration::from_millis(config.timeout_ms),
            )?)),
            _ => Ok(None),
        }
    }

    /// Target URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST one event.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response.
    pub async fn deliver(&self, event: &LifecycleEvent) -> Result<()> {
        let kind = serde_json::to_value(&event.kind)?
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("unknown")
            .to_string();

        let response = self
            .client
            .post(&self.url)
            .header(EVENT_HEADER, kind)
            .header(DELIVERY_HEADER, generate_id("dlv"))
            .json(event)
            .send()
            .await
            .map_err(|e| GatewayError::server(format!("webhook request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::server(format!("webhook returned HTTP {status}")));
        }
        Ok(())
    }

    /// Forward every event published on `bus` until the task is aborted.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        info!(url = %self.url, "webhook forwarder started");

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match self.deliver(&event).await {
                        Ok(()) => debug!(token = %event.token, "webhook delivered"),
                        Err(e) => warn!(token = %event.token, error = %e, "webhook delivery failed"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "webhook forwarder lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("webhook forwarder stopped");
        })
    }
}
