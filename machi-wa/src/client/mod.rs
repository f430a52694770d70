//! Contract with the underlying messaging client.
//!
//! The protocol implementation lives outside this crate. The session
//! controller only needs to create a client for a token, push outbound
//! payloads through it, observe its lifecycle events, and shut it down.
//! [`ClientFactory`] and [`MessagingClient`] are that seam;
//! [`process::ProcessClientFactory`] is the production backend.

pub mod process;

use crate::error::ClientResult;
use crate::events::{AuthMode, ClientEvent, OutboundPayload};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A live client bound to exactly one session token.
#[async_trait]
pub trait MessagingClient: std::fmt::Debug + Send + Sync {
    /// Deliver `payload` to `recipient` (already normalised) and wait for the
    /// client's acknowledgement.
    async fn send(&self, recipient: &str, payload: &OutboundPayload) -> ClientResult<()>;

    /// Release the client. Called at most once, on removal or process exit.
    async fn shutdown(&self) -> ClientResult<()>;
}

/// Shared handle to a client.
pub type ClientHandle = Arc<dyn MessagingClient>;

/// Creates clients and starts their handshakes.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Create a client for `token`, storing credentials under
    /// `credentials_dir`, and start its handshake.
    ///
    /// Lifecycle events must be reported through `events` in the order they
    /// happen.
    async fn create(
        &self,
        token: &str,
        credentials_dir: &Path,
        mode: &AuthMode,
        events: ClientEventSender,
    ) -> ClientResult<ClientHandle>;
}

/// Shared handle to a factory.
pub type SharedClientFactory = Arc<dyn ClientFactory>;

/// Sending half of a session's event channel.
///
/// Handed to the factory; the controller owns the receiving half and applies
/// events one at a time.
#[derive(Debug, Clone)]
pub struct ClientEventSender {
    token: Arc<str>,
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientEventSender {
    /// Create a connected sender/receiver pair for `token`.
    #[must_use]
    pub fn channel(token: &str) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                token: Arc::from(token),
                tx,
            },
            rx,
        )
    }

    /// Token this sender reports for.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Report an event. Returns `false` once the session is gone.
    pub fn emit(&self, event: ClientEvent) -> bool {
        let name = event.name();
        let delivered = self.tx.send(event).is_ok();
        if !delivered {
            debug!(token = %self.token, event = name, "event dropped, session gone");
        }
        delivered
    }

    /// Whether the session still listens.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
