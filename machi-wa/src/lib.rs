//! Machi WA - a multi-session messaging gateway.
//!
//! This crate exposes an HTTP API that manages many independent messaging
//! client sessions, one per token (usually a phone number). Each session
//! goes through an asynchronous QR or pairing-code handshake before it may
//! send messages.
//!
//! # Architecture
//!
//! - **Registry** ([`session::SessionRegistry`]) - token → session map with
//!   atomic create/lookup/list/remove
//! - **Controller** ([`session::SessionController`]) - applies client events
//!   as state transitions, gates sends, handles artifacts and teardown
//! - **Client** ([`client`]) - the seam to the underlying messaging client,
//!   with a bridge-process backend in [`client::process`]
//! - **Event Bus** ([`bus`]) - fan-out of lifecycle events, forwarded by
//!   [`webhook`]
//! - **HTTP** ([`http`]) - axum router over the controller
//! - **Gateway** ([`gateway`]) - wiring, restore and graceful shutdown
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use machi_wa::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let gateway = GatewayBuilder::new().load_config().await?.build()?;
//!     gateway.run().await
//! }
//! ```

pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod http;
pub mod media;
pub mod recipient;
pub mod session;
pub mod testing;
pub mod util;
pub mod webhook;

/// Prelude module for convenient imports.
pub mod prelude {
    // Error types
    pub use crate::error::{
        ClientError, ClientResult, ConfigError, ConfigResult, ErrorContext, GatewayError,
        MediaError, MediaResult, Result, SessionError, SessionResult,
    };

    // Bus
    pub use crate::bus::{BusStats, EventBus};

    // Client
    pub use crate::client::process::{ProcessClient, ProcessClientFactory};
    pub use crate::client::{
        ClientEventSender, ClientFactory, ClientHandle, MessagingClient, SharedClientFactory,
    };

    // Config
    pub use crate::config::{
        BridgeConfig, ConfigIssue, GatewayConfig, IssueLevel, MediaConfig, ServerConfig,
        WebhookConfig, config_path, init_config, load_config, load_config_from, save_config,
    };

    // Events
    pub use crate::events::{
        ArtifactKind, AuthArtifact, AuthMode, ClientEvent, LifecycleEvent, LifecycleKind,
        MediaPayload, OutboundPayload,
    };

    // Gateway
    pub use crate::gateway::{Gateway, GatewayBuilder, GatewayStatus};

    // Media
    pub use crate::media::MediaFetcher;

    // Recipient
    pub use crate::recipient::normalize_recipient;

    // Session
    pub use crate::session::{
        ArtifactStatus, ControllerOptions, CredentialStore, SessionController, SessionInfo,
        SessionRegistry, SessionState,
    };

    // Utilities
    pub use crate::util::{decode_token, encode_token, generate_id, timestamp_ms};

    // Webhook
    pub use crate::webhook::WebhookForwarder;
}
