//! In-memory client backend for tests.
//!
//! [`ScriptedClientFactory`] hands out clients that record what they are
//! asked to send and let the test push lifecycle events for any token, so the
//! controller can be driven through every state without a real bridge.

use crate::client::{ClientEventSender, ClientFactory, ClientHandle, MessagingClient};
use crate::error::{ClientError, ClientResult};
use crate::events::{AuthMode, ClientEvent, OutboundPayload};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// A message accepted by a scripted client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Session token.
    pub token: String,
    /// Normalised recipient.
    pub recipient: String,
    /// Delivered payload.
    pub payload: OutboundPayload,
}

/// A client creation observed by the factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedClient {
    /// Session token.
    pub token: String,
    /// Requested authentication mode.
    pub mode: AuthMode,
    /// Credential directory handed to the client.
    pub credentials_dir: PathBuf,
}

#[derive(Default)]
struct Script {
    senders: HashMap<String, ClientEventSender>,
    created: Vec<CreatedClient>,
    startup_events: Vec<ClientEvent>,
    fail_create: HashSet<String>,
    fail_send: Option<String>,
    fail_shutdown: bool,
    sent: Vec<SentMessage>,
    shutdowns: Vec<String>,
}

/// Factory producing [`ScriptedClient`]s.
#[derive(Clone, Default)]
pub struct ScriptedClientFactory {
    script: Arc<Mutex<Script>>,
}

impl std::fmt::Debug for ScriptedClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedClientFactory").finish_non_exhaustive()
    }
}

impl ScriptedClientFactory {
    /// Create a factory with no scripted behaviour.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events every subsequently created client emits right away.
    pub async fn set_startup_events(&self, events: Vec<ClientEvent>) {
        self.script.lock().await.startup_events = events;
    }

    /// Make the next creation for `token` fail.
    pub async fn fail_next_create(&self, token: &str) {
        self.script.lock().await.fail_create.insert(token.to_string());
    }

    /// Make every send fail with `reason`, or succeed again with `None`.
    pub async fn fail_sends(&self, reason: Option<&str>) {
        self.script.lock().await.fail_send = reason.map(str::to_string);
    }

    /// Make client shutdowns fail.
    pub async fn fail_shutdowns(&self, fail: bool) {
        self.script.lock().await.fail_shutdown = fail;
    }

    /// Push `event` from the most recent client for `token`.
    ///
    /// Returns `false` when no client exists or its session is gone.
    pub async fn emit(&self, token: &str, event: ClientEvent) -> bool {
        let sender = self.script.lock().await.senders.get(token).cloned();
        sender.is_some_and(|s| s.emit(event))
    }

    /// Messages accepted so far.
    pub async fn sent(&self) -> Vec<SentMessage> {
        self.script.lock().await.sent.clone()
    }

    /// Clients created so far, oldest first.
    pub async fn created(&self) -> Vec<CreatedClient> {
        self.script.lock().await.created.clone()
    }

    /// Tokens whose clients were shut down, in order.
    pub async fn shutdowns(&self) -> Vec<String> {
        self.script.lock().await.shutdowns.clone()
    }
}

#[async_trait]
impl ClientFactory for ScriptedClientFactory {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create(
        &self,
        token: &str,
        credentials_dir: &Path,
        mode: &AuthMode,
        events: ClientEventSender,
    ) -> ClientResult<ClientHandle> {
        let mut script = self.script.lock().await;
        if script.fail_create.remove(token) {
            return Err(ClientError::LaunchFailed(format!("scripted failure for {token}")));
        }

        tokio::fs::create_dir_all(credentials_dir).await?;
        tokio::fs::write(credentials_dir.join("session.json"), "{}").await?;

        for event in &script.startup_events {
            events.emit(event.clone());
        }
        script.created.push(CreatedClient {
            token: token.to_string(),
            mode: mode.clone(),
            credentials_dir: credentials_dir.to_path_buf(),
        });
        script.senders.insert(token.to_string(), events);

        Ok(Arc::new(ScriptedClient {
            token: token.to_string(),
            script: Arc::clone(&self.script),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Client created by [`ScriptedClientFactory`].
pub struct ScriptedClient {
    token: String,
    script: Arc<Mutex<Script>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ScriptedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedClient")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MessagingClient for ScriptedClient {
    async fn send(&self, recipient: &str, payload: &OutboundPayload) -> ClientResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let mut script = self.script.lock().await;
        if let Some(reason) = &script.fail_send {
            return Err(ClientError::rejected(reason.clone()));
        }
        script.sent.push(SentMessage {
            token: self.token.clone(),
            recipient: recipient.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn shutdown(&self) -> ClientResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut script = self.script.lock().await;
        script.shutdowns.push(self.token.clone());
        script.senders.remove(&self.token);
        if script.fail_shutdown {
            return Err(ClientError::rejected("scripted shutdown failure"));
        }
        Ok(())
    }
}
