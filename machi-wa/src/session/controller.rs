//! Session lifecycle controller.
//!
//! Owns the path from a create request to a live client: it allocates the
//! registry entry, asks the [`ClientFactory`](crate::client::ClientFactory)
//! for a client, and runs one dispatcher task per session that applies the
//! client's events in order. Outbound sends, artifact reads, re-initialisation
//! and removal all go through here so state checks and teardown happen in one
//! place.
//!
//! Create, remove and re-initialise for the same token are serialised by a
//! per-token operation lock; different tokens never contend.

use super::registry::{ArtifactStatus, SessionEntry, SessionInfo, SessionRegistry};
use super::state::SessionState;
use super::storage::CredentialStore;
use crate::bus::EventBus;
use crate::client::{ClientEventSender, ClientHandle, SharedClientFactory};
use crate::config::GatewayConfig;
use crate::error::{SessionError, SessionResult};
use crate::events::{AuthMode, ClientEvent, LifecycleEvent, LifecycleKind, OutboundPayload};
use crate::media::MediaFetcher;
use crate::recipient::{DEFAULT_SUFFIX, normalize_recipient, pairing_phone};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tracing::{debug, info, warn};

/// Tunables for the controller.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Upper bound for artifact waits.
    pub artifact_timeout: Duration,
    /// Routing suffix appended to bare recipients.
    pub recipient_suffix: String,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            artifact_timeout: Duration::from_secs(10),
            recipient_suffix: DEFAULT_SUFFIX.to_string(),
        }
    }
}

impl From<&GatewayConfig> for ControllerOptions {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            artifact_timeout: config.artifact_timeout(),
            recipient_suffix: config.recipient_suffix.clone(),
        }
    }
}

/// Drives sessions through their lifecycle and gates outbound operations.
pub struct SessionController {
    registry: Arc<SessionRegistry>,
    factory: SharedClientFactory,
    store: CredentialStore,
    media: MediaFetcher,
    bus: EventBus,
    options: ControllerOptions,
    op_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("factory", &self.factory.name())
            .field("store", &self.store)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Create a controller with a fresh registry and event bus.
    pub fn new(factory: SharedClientFactory, store: CredentialStore, media: MediaFetcher) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            factory,
            store,
            media,
            bus: EventBus::new(),
            options: ControllerOptions::default(),
            op_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Publish lifecycle events on `bus`.
    #[must_use]
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    /// Override the default options.
    #[must_use]
    pub fn with_options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    /// The session registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The lifecycle event bus.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Credential storage.
    #[must_use]
    pub const fn credentials(&self) -> &CredentialStore {
        &self.store
    }

    /// Active options.
    #[must_use]
    pub const fn options(&self) -> &ControllerOptions {
        &self.options
    }

    // ------------------------------------------------------------------
    // Creation and removal
    // ------------------------------------------------------------------

    /// Create a session for `token` and start its handshake.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AlreadyExists`] if a live session exists.
    /// - [`SessionError::StartFailed`] if the client cannot be created; no
    ///   entry is left behind.
    pub async fn create(&self, token: &str, mode: AuthMode) -> SessionResult<SessionInfo> {
        let _guard = self.op_lock(token).await;
        let entry = self.start(token, mode).await?;
        Ok(entry.info().await)
    }

    /// Tear down the session for `token` and delete its credentials.
    ///
    /// Client shutdown and credential deletion are best-effort; the session
    /// is always purged.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if no live session exists, including
    /// when a concurrent removal got there first.
    pub async fn remove(&self, token: &str) -> SessionResult<()> {
        let _guard = self.op_lock(token).await;
        let entry = self.live_entry(token).await?;
        if self.teardown(&entry, true).await {
            Ok(())
        } else {
            Err(SessionError::not_found(token))
        }
    }

    /// Log the session out. Same as [`remove`](Self::remove).
    ///
    /// # Errors
    ///
    /// See [`remove`](Self::remove).
    pub async fn logout(&self, token: &str) -> SessionResult<()> {
        self.remove(token).await
    }

    /// Remove-then-recreate the session, keeping its authentication mode.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotFound`] if no live session exists.
    /// - [`SessionError::StartFailed`] if the new client cannot be created.
    pub async fn reinitialize(&self, token: &str) -> SessionResult<SessionInfo> {
        let _guard = self.op_lock(token).await;
        let entry = self.live_entry(token).await?;
        let mode = entry.mode().clone();
        self.teardown(&entry, true).await;
        let fresh = self.start(token, mode).await?;
        info!(token = %token, "session reinitialized");
        Ok(fresh.info().await)
    }

    // ------------------------------------------------------------------
    // Status and artifacts
    // ------------------------------------------------------------------

    /// Snapshot of one session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if no live session exists.
    pub async fn status(&self, token: &str) -> SessionResult<SessionInfo> {
        Ok(self.live_entry(token).await?.info().await)
    }

    /// Snapshots of all live sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        self.registry.infos().await
    }

    /// Current artifact for `token`.
    ///
    /// An authenticated session reports [`ArtifactStatus::Authenticated`]. A
    /// logged-out or failed session is recreated and the call waits for the
    /// fresh artifact. Otherwise the current artifact, or
    /// [`ArtifactStatus::Pending`], is returned immediately.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotFound`] if no live session exists.
    /// - [`SessionError::StartFailed`] if re-creation fails.
    /// - [`SessionError::ArtifactTimeout`] if the fresh artifact does not
    ///   arrive in time. The new handshake keeps running.
    pub async fn artifact(&self, token: &str) -> SessionResult<ArtifactStatus> {
        let entry = self.live_entry(token).await?;
        if !entry.state().await.needs_reinit() {
            return Ok(entry.artifact_status().await);
        }

        let fresh = self.recreate_if_stale(token).await?;
        self.await_artifact(&fresh).await
    }

    /// Block until `token` has an artifact, up to `timeout`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotFound`] if no live session exists.
    /// - [`SessionError::ArtifactTimeout`] when `timeout` elapses first.
    pub async fn wait_for_artifact(
        &self,
        token: &str,
        timeout: Duration,
    ) -> SessionResult<ArtifactStatus> {
        let entry = self.live_entry(token).await?;
        entry.wait_for_artifact(timeout).await
    }

    /// Pairing-code flow.
    ///
    /// Creates the session in pairing mode when absent (or recreates a stale
    /// one), then waits for the code. `phone` defaults to the token, which
    /// must then itself be a phone number.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidPhoneNumber`] if no usable phone number is given.
    /// - [`SessionError::StartFailed`] if the client cannot be created.
    /// - [`SessionError::ArtifactTimeout`] if no code arrives in time.
    pub async fn request_pairing_code(
        &self,
        token: &str,
        phone: Option<&str>,
    ) -> SessionResult<ArtifactStatus> {
        let phone = pairing_phone(phone.unwrap_or(token))?;
        let mode = AuthMode::PairingCode { phone };

        let entry = {
            let _guard = self.op_lock(token).await;
            match self.live_entry(token).await {
                Ok(entry) if entry.state().await.needs_reinit() => {
                    self.teardown(&entry, true).await;
                    self.start(token, mode).await?
                }
                Ok(entry) => entry,
                Err(_) => self.start(token, mode).await?,
            }
        };

        self.await_artifact(&entry).await
    }

    /// Re-create a session for every credential directory on disk.
    ///
    /// Tokens that already have a live session are skipped; failures are
    /// logged per token. Returns the tokens that were started.
    pub async fn restore_sessions(&self) -> Vec<String> {
        let tokens = match self.store.list_tokens().await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(root = %self.store.root().display(), error = %e, "failed to scan credentials");
                return Vec::new();
            }
        };

        let mut restored = Vec::new();
        for token in tokens {
            match self.create(&token, AuthMode::Qr).await {
                Ok(_) => restored.push(token),
                Err(SessionError::AlreadyExists(_)) => {
                    debug!(token = %token, "session already live, not restoring");
                }
                Err(e) => warn!(token = %token, error = %e, "failed to restore session"),
            }
        }

        if !restored.is_empty() {
            info!(count = restored.len(), "sessions restored");
        }
        restored
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send a text message. Returns the normalised recipient.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotFound`] / [`SessionError::NotAuthenticated`]
    ///   without touching the client.
    /// - [`SessionError::InvalidRecipientFormat`] for a malformed recipient.
    /// - [`SessionError::DeliveryFailed`] when the client rejects the send.
    pub async fn send_text(&self, token: &str, to: &str, text: &str) -> SessionResult<String> {
        let (client, recipient) = self.prepare_send(token, to).await?;
        self.deliver(token, &client, &recipient, &OutboundPayload::text(text))
            .await?;
        Ok(recipient)
    }

    /// Fetch `url` and send it as media. Returns the normalised recipient.
    ///
    /// State and recipient are checked before anything is downloaded.
    ///
    /// # Errors
    ///
    /// As [`send_text`](Self::send_text), plus [`SessionError::Media`] when
    /// the source cannot be fetched.
    pub async fn send_media(
        &self,
        token: &str,
        to: &str,
        url: &str,
        caption: Option<String>,
    ) -> SessionResult<String> {
        let (client, recipient) = self.prepare_send(token, to).await?;
        let media = self.media.fetch(url, caption).await?;
        self.deliver(token, &client, &recipient, &OutboundPayload::Media(media))
            .await?;
        Ok(recipient)
    }

    /// Send an already-built payload. Returns the normalised recipient.
    ///
    /// # Errors
    ///
    /// As [`send_text`](Self::send_text).
    pub async fn send(
        &self,
        token: &str,
        to: &str,
        payload: &OutboundPayload,
    ) -> SessionResult<String> {
        let (client, recipient) = self.prepare_send(token, to).await?;
        self.deliver(token, &client, &recipient, payload).await?;
        Ok(recipient)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Release every client and empty the registry.
    ///
    /// Credentials stay on disk so sessions can be restored on the next
    /// start.
    pub async fn shutdown(&self) {
        let entries = self.registry.drain().await;
        let count = entries.len();
        for entry in entries {
            if let Some(Some(client)) = entry.begin_removal().await {
                release_client(entry.token(), &client).await;
            }
        }
        self.op_locks.lock().await.clear();
        info!(count, "all sessions shut down");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn op_lock(&self, token: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.op_locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(token.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    async fn live_entry(&self, token: &str) -> SessionResult<Arc<SessionEntry>> {
        match self.registry.get(token).await {
            Some(entry) if entry.state().await.is_live() => Ok(entry),
            _ => Err(SessionError::not_found(token)),
        }
    }

    /// Allocate the entry, create the client and start dispatching its
    /// events. Caller holds the operation lock.
    async fn start(&self, token: &str, mode: AuthMode) -> SessionResult<Arc<SessionEntry>> {
        let entry = self.registry.create(token, mode).await?;
        let (events, rx) = ClientEventSender::channel(token);
        let dir = self.store.dir_for(token);

        let client = match self
            .factory
            .create(token, &dir, entry.mode(), events)
            .await
        {
            Ok(client) => client,
            Err(e) => {
                entry.begin_removal().await;
                let _ = self.registry.remove(&entry).await;
                warn!(token = %token, factory = self.factory.name(), error = %e, "client start failed");
                return Err(SessionError::StartFailed(e.to_string()));
            }
        };

        if let Err(client) = entry.attach_client(client).await {
            release_client(token, &client).await;
            return Err(SessionError::not_found(token));
        }

        tokio::spawn(dispatch_events(Arc::clone(&entry), rx, self.bus.clone()));
        info!(token = %token, mode = entry.mode().as_str(), "session started");
        Ok(entry)
    }

    /// Remove `entry`: mark it removed, release the client, optionally
    /// delete credentials, then purge it. Returns `false` if another caller
    /// already started removing it.
    async fn teardown(&self, entry: &Arc<SessionEntry>, delete_credentials: bool) -> bool {
        let token = entry.token();
        let Some(client) = entry.begin_removal().await else {
            return false;
        };
        self.bus
            .publish(LifecycleEvent::new(token, LifecycleKind::Removed));

        if let Some(client) = client {
            release_client(token, &client).await;
        }

        if delete_credentials && let Err(e) = self.store.delete(token).await {
            warn!(token = %token, error = %e, "failed to delete credentials");
        }

        if let Err(e) = self.registry.remove(entry).await {
            debug!(token = %token, error = %e, "entry already purged");
        }
        info!(token = %token, "session removed");
        true
    }

    async fn recreate_if_stale(&self, token: &str) -> SessionResult<Arc<SessionEntry>> {
        let _guard = self.op_lock(token).await;
        let entry = self.live_entry(token).await?;
        if !entry.state().await.needs_reinit() {
            return Ok(entry);
        }

        let mode = entry.mode().clone();
        self.teardown(&entry, true).await;
        info!(token = %token, "stale session recreated for a fresh artifact");
        self.start(token, mode).await
    }

    async fn await_artifact(&self, entry: &SessionEntry) -> SessionResult<ArtifactStatus> {
        match entry.artifact_status().await {
            ArtifactStatus::Pending => {
                entry
                    .wait_for_artifact(self.options.artifact_timeout)
                    .await
            }
            ready => Ok(ready),
        }
    }

    async fn prepare_send(&self, token: &str, to: &str) -> SessionResult<(ClientHandle, String)> {
        let entry = self.live_entry(token).await?;
        let client = entry.sendable_client().await?;
        let recipient = normalize_recipient(to, &self.options.recipient_suffix)?;
        Ok((client, recipient))
    }

    async fn deliver(
        &self,
        token: &str,
        client: &ClientHandle,
        recipient: &str,
        payload: &OutboundPayload,
    ) -> SessionResult<()> {
        client.send(recipient, payload).await.map_err(|e| {
            warn!(token = %token, to = %recipient, error = %e, "delivery failed");
            SessionError::DeliveryFailed(e.to_string())
        })?;
        debug!(token = %token, to = %recipient, "message delivered");
        Ok(())
    }
}

/// Best-effort client shutdown; failures are logged as teardown failures.
async fn release_client(token: &str, client: &ClientHandle) {
    if let Err(e) = client.shutdown().await {
        let err = SessionError::TeardownFailed(e.to_string());
        warn!(token = %token, error = %err, "client shutdown failed");
    }
}

/// Apply one session's events in arrival order until its channel closes or
/// the session is removed.
async fn dispatch_events(
    entry: Arc<SessionEntry>,
    mut rx: mpsc::UnboundedReceiver<ClientEvent>,
    bus: EventBus,
) {
    let token = entry.token().to_string();

    while let Some(event) = rx.recv().await {
        let Some(transition) = entry.apply(&event).await else {
            let state = entry.state().await;
            if state == SessionState::Removed {
                break;
            }
            warn!(token = %token, event = event.name(), state = %state, "event ignored");
            continue;
        };

        info!(
            token = %token,
            from = %transition.from,
            to = %transition.to,
            event = event.name(),
            "session transition"
        );

        let kind = match event {
            ClientEvent::Artifact(artifact) => {
                info!(token = %token, kind = ?artifact.kind, value = %artifact.value, "auth artifact issued");
                LifecycleKind::Artifact { artifact }
            }
            ClientEvent::Authenticated => LifecycleKind::Authenticated,
            ClientEvent::AuthFailed(reason) => LifecycleKind::AuthFailed { reason },
            ClientEvent::Disconnected(reason) if transition.to == SessionState::LoggedOut => {
                LifecycleKind::LoggedOut { reason }
            }
            ClientEvent::Disconnected(reason) => LifecycleKind::AuthFailed { reason },
        };
        bus.publish(LifecycleEvent::new(token.as_str(), kind));
    }

    debug!(token = %token, "event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use crate::events::AuthArtifact;
    use crate::testing::ScriptedClientFactory;
    use assert_fs::TempDir;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        _tmp: TempDir,
        factory: ScriptedClientFactory,
        controller: Arc<SessionController>,
    }

    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap();
        let factory = ScriptedClientFactory::new();
        let controller = SessionController::new(
            Arc::new(factory.clone()),
            CredentialStore::new(tmp.path().join("sessions")),
            MediaFetcher::new(MediaConfig::default()).unwrap(),
        )
        .with_options(ControllerOptions {
            artifact_timeout: Duration::from_millis(300),
            ..ControllerOptions::default()
        });
        Harness {
            _tmp: tmp,
            factory,
            controller: Arc::new(controller),
        }
    }

    /// Wait until the dispatcher has moved `token` into `state`.
    async fn settle(controller: &SessionController, token: &str, state: SessionState) {
        for _ in 0..200 {
            if controller.status(token).await.map(|i| i.state).ok() == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{token} never reached {state}");
    }

    async fn authenticated(h: &Harness, token: &str) {
        h.controller.create(token, AuthMode::Qr).await.unwrap();
        assert!(h.factory.emit(token, ClientEvent::Authenticated).await);
        settle(&h.controller, token, SessionState::Authenticated).await;
    }

    #[tokio::test]
    async fn test_qr_handshake() {
        let h = harness();
        let info = assert_ok!(h.controller.create("+15551234567", AuthMode::Qr).await);
        assert_eq!(info.state, SessionState::Initializing);
        assert_eq!(
            h.controller.artifact("+15551234567").await.unwrap(),
            ArtifactStatus::Pending
        );

        h.factory
            .emit("+15551234567", ClientEvent::Artifact(AuthArtifact::qr("2@abc")))
            .await;
        settle(&h.controller, "+15551234567", SessionState::AwaitingCode).await;
        assert_eq!(
            h.controller.artifact("+15551234567").await.unwrap(),
            ArtifactStatus::Ready(AuthArtifact::qr("2@abc"))
        );

        h.factory
            .emit("+15551234567", ClientEvent::Authenticated)
            .await;
        settle(&h.controller, "+15551234567", SessionState::Authenticated).await;
        assert_eq!(
            h.controller.artifact("+15551234567").await.unwrap(),
            ArtifactStatus::Authenticated
        );
        assert!(!h.controller.status("+15551234567").await.unwrap().has_artifact);
    }

    #[tokio::test]
    async fn test_duplicate_create() {
        let h = harness();
        assert_ok!(h.controller.create("T1", AuthMode::Qr).await);
        let err = assert_err!(h.controller.create("T1", AuthMode::Qr).await);
        assert!(matches!(err, SessionError::AlreadyExists(_)));
        assert_eq!(h.factory.created().await.len(), 1);
    }

    #[tokio::test]
    async fn test_send_normalizes_recipient() {
        let h = harness();
        authenticated(&h, "T2").await;

        let to = assert_ok!(h.controller.send_text("T2", "15550001111", "hi").await);
        assert_eq!(to, "15550001111@c.us");
        let to = assert_ok!(h.controller.send_text("T2", "15550001111@c.us", "hi").await);
        assert_eq!(to, "15550001111@c.us");

        let sent = h.factory.sent().await;
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.recipient == "15550001111@c.us"));
        assert_eq!(sent[0].payload, OutboundPayload::text("hi"));
    }

    #[tokio::test]
    async fn test_send_gated_on_state() {
        let h = harness();
        let err = assert_err!(h.controller.send_text("nobody", "1555", "hi").await);
        assert!(matches!(err, SessionError::NotFound(_)));

        h.controller.create("T1", AuthMode::Qr).await.unwrap();
        let err = assert_err!(h.controller.send_text("T1", "1555", "hi").await);
        assert!(matches!(err, SessionError::NotAuthenticated { .. }));

        h.factory
            .emit("T1", ClientEvent::AuthFailed("bad".into()))
            .await;
        settle(&h.controller, "T1", SessionState::AuthFailed).await;
        let err = assert_err!(
            h.controller
                .send_media("T1", "1555", "http://127.0.0.1:1/x.png", None)
                .await
        );
        assert!(matches!(err, SessionError::NotAuthenticated { .. }));

        assert!(h.factory.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_errors_classified() {
        let h = harness();
        authenticated(&h, "T1").await;

        let err = assert_err!(h.controller.send_text("T1", "not-a-number", "hi").await);
        assert!(matches!(err, SessionError::InvalidRecipientFormat(_)));

        h.factory.fail_sends(Some("rate limited")).await;
        let err = assert_err!(h.controller.send_text("T1", "15550001111", "hi").await);
        assert!(matches!(err, SessionError::DeliveryFailed(ref d) if d.contains("rate limited")));
    }

    #[tokio::test]
    async fn test_remove_twice() {
        let h = harness();
        h.controller.create("T1", AuthMode::Qr).await.unwrap();
        let dir = h.controller.credentials().dir_for("T1");
        assert!(dir.exists());

        assert_ok!(h.controller.remove("T1").await);
        let err = assert_err!(h.controller.remove("T1").await);
        assert!(matches!(err, SessionError::NotFound(_)));
        assert!(!dir.exists());
        assert_eq!(h.factory.shutdowns().await, vec!["T1"]);
        assert!(h.controller.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_remove() {
        let h = harness();
        h.controller.create("T1", AuthMode::Qr).await.unwrap();

        let a = {
            let c = Arc::clone(&h.controller);
            tokio::spawn(async move { c.remove("T1").await })
        };
        let b = {
            let c = Arc::clone(&h.controller);
            tokio::spawn(async move { c.remove("T1").await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(SessionError::NotFound(_)))));
        assert_eq!(h.factory.shutdowns().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_unknown() {
        let h = harness();
        let err = assert_err!(h.controller.remove("unknown-token").await);
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_teardown_failure_still_removes() {
        let h = harness();
        h.controller.create("T1", AuthMode::Qr).await.unwrap();
        h.factory.fail_shutdowns(true).await;

        assert_ok!(h.controller.remove("T1").await);
        assert!(h.controller.registry().get("T1").await.is_none());
        assert_ok!(h.controller.create("T1", AuthMode::Qr).await);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_nothing() {
        let h = harness();
        h.factory.fail_next_create("T1").await;

        let err = assert_err!(h.controller.create("T1", AuthMode::Qr).await);
        assert!(matches!(err, SessionError::StartFailed(_)));
        assert!(h.controller.registry().is_empty().await);
        assert_ok!(h.controller.create("T1", AuthMode::Qr).await);
    }

    #[tokio::test]
    async fn test_logged_out_recreated_for_artifact() {
        let h = harness();
        authenticated(&h, "T3").await;
        h.factory
            .emit("T3", ClientEvent::Disconnected("phone unlinked".into()))
            .await;
        settle(&h.controller, "T3", SessionState::LoggedOut).await;

        h.factory
            .set_startup_events(vec![ClientEvent::Artifact(AuthArtifact::qr("fresh"))])
            .await;
        let status = assert_ok!(h.controller.artifact("T3").await);
        assert_eq!(status, ArtifactStatus::Ready(AuthArtifact::qr("fresh")));

        assert_eq!(h.factory.created().await.len(), 2);
        assert_eq!(h.factory.shutdowns().await, vec!["T3"]);
    }

    #[tokio::test]
    async fn test_recreated_artifact_times_out() {
        let h = harness();
        h.controller.create("T3", AuthMode::Qr).await.unwrap();
        h.factory
            .emit("T3", ClientEvent::AuthFailed("rejected".into()))
            .await;
        settle(&h.controller, "T3", SessionState::AuthFailed).await;

        let err = assert_err!(h.controller.artifact("T3").await);
        assert!(matches!(err, SessionError::ArtifactTimeout { .. }));

        // The handshake keeps going; a late artifact is served next time.
        assert_eq!(
            h.controller.status("T3").await.unwrap().state,
            SessionState::Initializing
        );
        h.factory
            .emit("T3", ClientEvent::Artifact(AuthArtifact::qr("late")))
            .await;
        settle(&h.controller, "T3", SessionState::AwaitingCode).await;
        assert_eq!(
            h.controller.artifact("T3").await.unwrap(),
            ArtifactStatus::Ready(AuthArtifact::qr("late"))
        );
    }

    #[tokio::test]
    async fn test_pairing_code_flow() {
        let h = harness();
        let waiter = {
            let c = Arc::clone(&h.controller);
            tokio::spawn(async move { c.request_pairing_code("+1 555 123 4567", None).await })
        };

        for _ in 0..200 {
            if h.factory
                .emit(
                    "+1 555 123 4567",
                    ClientEvent::Artifact(AuthArtifact::pairing_code("WXYZ-1234")),
                )
                .await
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let status = waiter.await.unwrap().unwrap();
        assert_eq!(
            status,
            ArtifactStatus::Ready(AuthArtifact::pairing_code("WXYZ-1234"))
        );
        let created = h.factory.created().await;
        assert_eq!(
            created[0].mode,
            AuthMode::PairingCode {
                phone: "15551234567".into()
            }
        );
    }

    #[tokio::test]
    async fn test_pairing_code_needs_phone_number() {
        let h = harness();
        for (token, phone) in [("T1", None), ("session-a", None), ("T1", Some("12"))] {
            let err = assert_err!(h.controller.request_pairing_code(token, phone).await);
            assert!(matches!(err, SessionError::InvalidPhoneNumber(_)), "{token} {phone:?}");
        }
        assert!(h.factory.created().await.is_empty());
        assert!(h.controller.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_reinitialize_keeps_mode() {
        let h = harness();
        let mode = AuthMode::PairingCode {
            phone: "15550001111".into(),
        };
        h.controller.create("T1", mode.clone()).await.unwrap();
        h.factory.emit("T1", ClientEvent::Authenticated).await;
        settle(&h.controller, "T1", SessionState::Authenticated).await;

        let info = assert_ok!(h.controller.reinitialize("T1").await);
        assert_eq!(info.state, SessionState::Initializing);
        assert_eq!(info.auth_mode, "pairing_code");

        let created = h.factory.created().await;
        assert_eq!(created.len(), 2);
        assert_eq!(created[1].mode, mode);
    }

    #[tokio::test]
    async fn test_lifecycle_events_published() {
        let h = harness();
        let mut rx = h.controller.bus().subscribe();

        h.controller.create("T1", AuthMode::Qr).await.unwrap();
        h.factory
            .emit("T1", ClientEvent::Artifact(AuthArtifact::qr("q")))
            .await;
        h.factory.emit("T1", ClientEvent::Authenticated).await;
        h.factory
            .emit("T1", ClientEvent::Disconnected("bye".into()))
            .await;

        let mut kinds = Vec::new();
        for _ in 0..3 {
            kinds.push(rx.recv().await.unwrap().kind);
        }
        h.controller.remove("T1").await.unwrap();
        kinds.push(rx.recv().await.unwrap().kind);
        assert_eq!(
            kinds,
            vec![
                LifecycleKind::Artifact {
                    artifact: AuthArtifact::qr("q")
                },
                LifecycleKind::Authenticated,
                LifecycleKind::LoggedOut {
                    reason: "bye".into()
                },
                LifecycleKind::Removed,
            ]
        );
    }

    #[tokio::test]
    async fn test_restore_sessions() {
        let h = harness();
        for token in ["A1", "B2"] {
            tokio::fs::create_dir_all(h.controller.credentials().dir_for(token))
                .await
                .unwrap();
        }
        h.controller.create("B2", AuthMode::Qr).await.unwrap();

        let restored = h.controller.restore_sessions().await;
        assert_eq!(restored, vec!["A1"]);
        assert_eq!(h.controller.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_similar_tokens_keep_separate_credentials() {
        let h = harness();
        h.controller.create("a/b", AuthMode::Qr).await.unwrap();
        h.controller.create("a_b", AuthMode::Qr).await.unwrap();
        let store = h.controller.credentials();
        assert_ne!(store.dir_for("a/b"), store.dir_for("a_b"));

        assert_ok!(h.controller.remove("a/b").await);
        assert_eq!(
            h.controller.status("a_b").await.unwrap().state,
            SessionState::Initializing
        );
        assert!(store.exists("a_b").await);
        assert!(!store.exists("a/b").await);
    }

    #[tokio::test]
    async fn test_restore_keeps_exact_token() {
        let h = harness();
        tokio::fs::create_dir_all(h.controller.credentials().dir_for("+1 555"))
            .await
            .unwrap();

        assert_eq!(h.controller.restore_sessions().await, vec!["+1 555"]);
        assert_ok!(h.controller.status("+1 555").await);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_credentials() {
        let h = harness();
        authenticated(&h, "T1").await;
        let dir = h.controller.credentials().dir_for("T1");

        h.controller.shutdown().await;
        assert!(h.controller.registry().is_empty().await);
        assert!(dir.exists());
        assert_eq!(h.factory.shutdowns().await, vec!["T1"]);
    }
}
