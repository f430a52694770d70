//! Process-wide token → session map.

use super::state::SessionState;
use crate::client::ClientHandle;
use crate::error::{SessionError, SessionResult};
use crate::events::{AuthArtifact, AuthMode, ClientEvent};
use crate::util::timestamp_ms;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::debug;

/// Serializable snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Session token.
    pub token: String,
    /// Current state.
    pub state: SessionState,
    /// `qr` or `pairing_code`.
    pub auth_mode: &'static str,
    /// Whether an artifact is currently available.
    pub has_artifact: bool,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Unix milliseconds of the last state change.
    pub last_transition_at: u64,
}

/// A state change applied to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State before the event.
    pub from: SessionState,
    /// State after the event.
    pub to: SessionState,
}

/// Result of waiting for an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactStatus {
    /// An artifact is available.
    Ready(AuthArtifact),
    /// The handshake is running but nothing has been issued yet.
    Pending,
    /// No artifact needed; the session is authenticated.
    Authenticated,
}

/// State and artifact as seen by artifact waiters.
#[derive(Debug, Clone)]
struct HandshakeView {
    state: SessionState,
    artifact: Option<AuthArtifact>,
}

struct EntryInner {
    state: SessionState,
    artifact: Option<AuthArtifact>,
    last_transition_at: u64,
    client: Option<ClientHandle>,
}

impl EntryInner {
    const fn state(&self) -> SessionState {
        self.state
    }
}

/// One session. Owned by the registry, mutated by the controller.
pub struct SessionEntry {
    token: String,
    mode: AuthMode,
    created_at: u64,
    inner: Mutex<EntryInner>,
    view: watch::Sender<HandshakeView>,
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("token", &self.token)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl SessionEntry {
    fn new(token: &str, mode: AuthMode) -> Self {
        let now = timestamp_ms();
        let (view, _) = watch::channel(HandshakeView {
            state: SessionState::Initializing,
            artifact: None,
        });
        Self {
            token: token.to_string(),
            mode,
            created_at: now,
            inner: Mutex::new(EntryInner {
                state: SessionState::Initializing,
                artifact: None,
                last_transition_at: now,
                client: None,
            }),
            view,
        }
    }

    /// Session token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Authentication mode the session was created with.
    #[must_use]
    pub const fn mode(&self) -> &AuthMode {
        &self.mode
    }

    /// Current state.
    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state()
    }

    /// Current artifact, if any.
    pub async fn artifact(&self) -> Option<AuthArtifact> {
        self.inner.lock().await.artifact.clone()
    }

    /// Consistent snapshot of the session.
    pub async fn info(&self) -> SessionInfo {
        let inner = self.inner.lock().await;
        SessionInfo {
            token: self.token.clone(),
            state: inner.state(),
            auth_mode: self.mode.as_str(),
            has_artifact: inner.artifact.is_some(),
            created_at: self.created_at,
            last_transition_at: inner.last_transition_at,
        }
    }

    /// Artifact state for a non-blocking read.
    pub async fn artifact_status(&self) -> ArtifactStatus {
        let inner = self.inner.lock().await;
        match (&inner.artifact, inner.state()) {
            (Some(artifact), _) => ArtifactStatus::Ready(artifact.clone()),
            (None, SessionState::Authenticated) => ArtifactStatus::Authenticated,
            (None, _) => ArtifactStatus::Pending,
        }
    }

    /// Apply a client event. Returns the transition, or `None` when the event
    /// is not valid in the current state.
    pub async fn apply(&self, event: &ClientEvent) -> Option<Transition> {
        let mut inner = self.inner.lock().await;
        let from = inner.state();
        let to = from.on_event(event)?;

        inner.artifact = match event {
            ClientEvent::Artifact(artifact) if to.allows_artifact() => Some(artifact.clone()),
            _ => None,
        };
        self.set_state(&mut inner, to);
        Some(Transition { from, to })
    }

    /// Store the client handle. Hands it back if the session was removed in
    /// the meantime so the caller can release it.
    pub(crate) async fn attach_client(&self, client: ClientHandle) -> Result<(), ClientHandle> {
        let mut inner = self.inner.lock().await;
        if inner.state().is_live() {
            inner.client = Some(client);
            Ok(())
        } else {
            Err(client)
        }
    }

    /// Client handle for a send, if the session may send.
    pub(crate) async fn sendable_client(&self) -> SessionResult<ClientHandle> {
        let inner = self.inner.lock().await;
        let state = inner.state();
        if !state.can_send() {
            return Err(SessionError::NotAuthenticated {
                token: self.token.clone(),
                state,
            });
        }
        inner
            .client
            .clone()
            .ok_or_else(|| SessionError::DeliveryFailed("client not attached".into()))
    }

    /// Move the session to `Removed` and hand out its client for release.
    ///
    /// Returns `None` if removal already started elsewhere.
    pub(crate) async fn begin_removal(&self) -> Option<Option<ClientHandle>> {
        let mut inner = self.inner.lock().await;
        if !inner.state().is_live() {
            return None;
        }
        inner.artifact = None;
        self.set_state(&mut inner, SessionState::Removed);
        Some(inner.client.take())
    }

    /// Wait until an artifact is available or the handshake ends.
    ///
    /// Every concurrent waiter is released by the same artifact.
    ///
    /// # Errors
    ///
    /// - [`SessionError::ArtifactTimeout`] when `timeout` elapses first.
    /// - [`SessionError::NotAuthenticated`] when the handshake fails or the
    ///   session is logged out while waiting.
    /// - [`SessionError::NotFound`] when the session is removed while waiting.
    pub async fn wait_for_artifact(&self, timeout: Duration) -> SessionResult<ArtifactStatus> {
        let mut rx = self.view.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|view| view.artifact.is_some() || !view.state.allows_artifact()),
        )
        .await;

        let view = match waited {
            Ok(Ok(view)) => view.clone(),
            Ok(Err(_)) => return Err(SessionError::not_found(&self.token)),
            Err(_) => {
                return Err(SessionError::ArtifactTimeout {
                    token: self.token.clone(),
                    waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        };

        match (view.artifact, view.state) {
            (Some(artifact), _) => Ok(ArtifactStatus::Ready(artifact)),
            (None, SessionState::Authenticated) => Ok(ArtifactStatus::Authenticated),
            (None, SessionState::Removed) => Err(SessionError::not_found(&self.token)),
            (None, state) => Err(SessionError::NotAuthenticated {
                token: self.token.clone(),
                state,
            }),
        }
    }

    fn set_state(&self, inner: &mut EntryInner, state: SessionState) {
        inner.state = state;
        inner.last_transition_at = timestamp_ms();
        self.view.send_replace(HandshakeView {
            state,
            artifact: inner.artifact.clone(),
        });
    }
}

/// Thread-safe mapping from token to session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new `Initializing` session for `token`.
    ///
    /// Atomic with respect to concurrent creates: exactly one caller wins.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyExists`] if a live session exists.
    pub async fn create(&self, token: &str, mode: AuthMode) -> SessionResult<Arc<SessionEntry>> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(token)
            && existing.state().await.is_live()
        {
            return Err(SessionError::AlreadyExists(token.to_string()));
        }

        let entry = Arc::new(SessionEntry::new(token, mode));
        sessions.insert(token.to_string(), Arc::clone(&entry));
        debug!(token = %token, "session entry created");
        Ok(entry)
    }

    /// Look up a session.
    pub async fn get(&self, token: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.read().await.get(token).cloned()
    }

    /// Tokens and states of all live sessions.
    pub async fn list(&self) -> Vec<(String, SessionState)> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::with_capacity(sessions.len());
        for (token, entry) in sessions.iter() {
            let state = entry.state().await;
            if state.is_live() {
                out.push((token.clone(), state));
            }
        }
        out
    }

    /// Snapshots of all live sessions, sorted by token.
    pub async fn infos(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::with_capacity(sessions.len());
        for entry in sessions.values() {
            let info = entry.info().await;
            if info.state.is_live() {
                out.push(info);
            }
        }
        out.sort_by(|a, b| a.token.cmp(&b.token));
        out
    }

    /// Remove `entry` from the map once its client has been released.
    ///
    /// Only the exact entry is removed; a newer session for the same token is
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if `entry` is no longer mapped.
    pub async fn remove(&self, entry: &Arc<SessionEntry>) -> SessionResult<()> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(entry.token()) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                sessions.remove(entry.token());
                debug!(token = %entry.token(), "session entry purged");
                Ok(())
            }
            _ => Err(SessionError::not_found(entry.token())),
        }
    }

    /// Take every entry out of the registry.
    pub async fn drain(&self) -> Vec<Arc<SessionEntry>> {
        self.sessions.write().await.drain().map(|(_, e)| e).collect()
    }

    /// Number of mapped entries.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
