//! Session lifecycle states and the transition function.

use crate::events::ClientEvent;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a session.
///
/// ```text
/// Initializing --artifact--> AwaitingCode --ready--> Authenticated --disconnect--> LoggedOut
///      |  \--ready--> Authenticated          |
///      \--auth failure / disconnect--> AuthFailed <--/
/// any --removal--> Removed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Client created, handshake started, nothing heard back yet.
    Initializing,
    /// An artifact (QR or pairing code) is waiting for the user.
    AwaitingCode,
    /// Handshake complete; sends are allowed.
    Authenticated,
    /// Handshake was rejected.
    AuthFailed,
    /// The remote side ended an authenticated session.
    LoggedOut,
    /// Being torn down; terminal.
    Removed,
}

impl SessionState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Initializing,
        Self::AwaitingCode,
        Self::Authenticated,
        Self::AuthFailed,
        Self::LoggedOut,
        Self::Removed,
    ];

    /// Snake-case name, as used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::AwaitingCode => "awaiting_code",
            Self::Authenticated => "authenticated",
            Self::AuthFailed => "auth_failed",
            Self::LoggedOut => "logged_out",
            Self::Removed => "removed",
        }
    }

    /// Whether the session still occupies its token.
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Removed)
    }

    /// Whether an artifact may be held in this state.
    #[must_use]
    pub const fn allows_artifact(self) -> bool {
        matches!(self, Self::Initializing | Self::AwaitingCode)
    }

    /// Whether the underlying client is unrecoverable and must be recreated.
    #[must_use]
    pub const fn needs_reinit(self) -> bool {
        matches!(self, Self::AuthFailed | Self::LoggedOut)
    }

    /// Whether outbound sends are permitted.
    #[must_use]
    pub const fn can_send(self) -> bool {
        matches!(self, Self::Authenticated)
    }

    /// Compute the state reached when `event` arrives in this state.
    ///
    /// Returns `None` when the event has no effect here. A fresh artifact while
    /// already `AwaitingCode` (QR rotation) yields `AwaitingCode` again so the
    /// caller can replace the stored artifact.
    #[must_use]
    pub const fn on_event(self, event: &ClientEvent) -> Option<Self> {
        match (self, event) {
            (Self::Initializing | Self::AwaitingCode, ClientEvent::Artifact(_)) => {
                Some(Self::AwaitingCode)
            }
            (Self::Initializing | Self::AwaitingCode, ClientEvent::Authenticated) => {
                Some(Self::Authenticated)
            }
            (
                Self::Initializing | Self::AwaitingCode,
                ClientEvent::AuthFailed(_) | ClientEvent::Disconnected(_),
            ) => Some(Self::AuthFailed),
            (Self::Authenticated, ClientEvent::Disconnected(_)) => Some(Self::LoggedOut),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
