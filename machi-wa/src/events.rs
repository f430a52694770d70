//! Event and payload types exchanged with the underlying client.
//!
//! [`ClientEvent`]s flow from a messaging client into the session
//! controller; [`LifecycleEvent`]s flow from the controller out to external
//! observers through the [`EventBus`](crate::bus::EventBus).

use crate::util::timestamp_ms;
use serde::{Deserialize, Serialize};

/// Kind of authentication artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// QR payload to be rendered and scanned.
    Qr,
    /// Short code typed on the phone.
    PairingCode,
}

/// Ephemeral authentication payload presented to a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthArtifact {
    /// What the value is.
    pub kind: ArtifactKind,
    /// Raw QR data or pairing code.
    pub value: String,
}

impl AuthArtifact {
    /// Create a QR artifact.
    pub fn qr(value: impl Into<String>) -> Self {
        Self {
            kind: ArtifactKind::Qr,
            value: value.into(),
        }
    }

    /// Create a pairing-code artifact.
    pub fn pairing_code(value: impl Into<String>) -> Self {
        Self {
            kind: ArtifactKind::PairingCode,
            value: value.into(),
        }
    }
}

/// How a new session should authenticate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthMode {
    /// Scan a QR code.
    #[default]
    Qr,
    /// Enter a pairing code issued for `phone`.
    PairingCode {
        /// Phone number the code is requested for, digits only.
        phone: String,
    },
}

impl AuthMode {
    /// Wire name of the mode.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Qr => "qr",
            Self::PairingCode { .. } => "pairing_code",
        }
    }
}

/// Lifecycle signal raised by an underlying client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A QR payload or pairing code was produced.
    Artifact(AuthArtifact),
    /// The handshake completed.
    Authenticated,
    /// The handshake was rejected.
    AuthFailed(String),
    /// The remote side closed the session.
    Disconnected(String),
}

impl ClientEvent {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Artifact(_) => "artifact",
            Self::Authenticated => "authenticated",
            Self::AuthFailed(_) => "auth_failed",
            Self::Disconnected(_) => "disconnected",
        }
    }
}

/// What happened to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleKind {
    /// A new artifact is available.
    Artifact {
        /// The artifact.
        artifact: AuthArtifact,
    },
    /// The session authenticated.
    Authenticated,
    /// The handshake failed.
    AuthFailed {
        /// Reason reported by the client.
        reason: String,
    },
    /// The remote side logged the session out.
    LoggedOut {
        /// Reason reported by the client.
        reason: String,
    },
    /// The session was removed.
    Removed,
}

/// Observable lifecycle event, published on the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Session token.
    pub token: String,
    /// Event details.
    #[serde(flatten)]
    pub kind: LifecycleKind,
    /// Unix milliseconds.
    pub timestamp: u64,
}

impl LifecycleEvent {
    /// Create an event stamped with the current time.
    pub fn new(token: impl Into<String>, kind: LifecycleKind) -> Self {
        Self {
            token: token.into(),
            kind,
            timestamp: timestamp_ms(),
        }
    }
}

/// Media ready to hand to the underlying client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaPayload {
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
    /// File name presented to the recipient.
    pub file_name: String,
    /// Base64-encoded body.
    pub data: String,
    /// Optional caption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// Message body delegated to the underlying client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundPayload {
    /// Plain text.
    Text {
        /// Message text.
        text: String,
    },
    /// Media with optional caption.
    Media(MediaPayload),
}

impl OutboundPayload {
    /// Create a text payload.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_event_json_shape() {
        let event = LifecycleEvent::new(
            "+15551234567",
            LifecycleKind::Artifact {
                artifact: AuthArtifact::qr("2@xyz"),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["token"], "+15551234567");
        assert_eq!(json["type"], "artifact");
        assert_eq!(json["artifact"]["kind"], "qr");
        assert_eq!(json["artifact"]["value"], "2@xyz");
        assert!(json["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_auth_mode_serde() {
        let mode: AuthMode =
            serde_json::from_str(r#"{"mode":"pairing_code","phone":"15550001111"}"#).unwrap();
        assert_eq!(
            mode,
            AuthMode::PairingCode {
                phone: "15550001111".into()
            }
        );
        assert_eq!(mode.as_str(), "pairing_code");
        assert_eq!(AuthMode::default().as_str(), "qr");
    }

    #[test]
    fn test_payload_serde() {
        let json = serde_json::to_value(OutboundPayload::text("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "text": "hi"}));

        let media = OutboundPayload::Media(MediaPayload {
            mime_type: "image/png".into(),
            file_name: "a.png".into(),
            data: "AAAA".into(),
            caption: None,
        });
        let json = serde_json::to_value(media).unwrap();
        assert_eq!(json["type"], "media");
        assert_eq!(json["mimeType"], "image/png");
        assert!(json.get("caption").is_none());
    }
}
