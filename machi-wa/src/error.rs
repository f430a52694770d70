//! Unified error types for machi-wa.
//!
//! Every module has its own error enum; all of them convert into the
//! top-level [`GatewayError`]. Session operations surface [`SessionError`],
//! whose variants are the user-facing failure taxonomy of the HTTP API.

use crate::session::SessionState;
use std::fmt;

// ============================================================================
// Main Error Type
// ============================================================================

/// The main error type for machi-wa operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Session lifecycle error.
    #[error("session: {0}")]
    Session(#[from] SessionError),

    /// Underlying messaging client error.
    #[error("client: {0}")]
    Client(#[from] ClientError),

    /// Configuration error.
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// Media fetch error.
    #[error("media: {0}")]
    Media(#[from] MediaError),

    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP server error.
    #[error("server: {0}")]
    Server(String),

    /// Task join error.
    #[error("task: {0}")]
    Task(String),

    /// Generic internal error.
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// Create a config error from a string.
    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(ConfigError::Invalid(msg.into()))
    }

    /// Create a server error.
    #[inline]
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }

    /// Create an internal error.
    #[inline]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<tokio::task::JoinError> for GatewayError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

/// Result type alias for machi-wa operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

// ============================================================================
// Session Errors
// ============================================================================

/// Error type for session lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A live session already exists for the token.
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    /// No session exists for the token.
    #[error("session not found: {0}")]
    NotFound(String),

    /// The session is not in the `Authenticated` state.
    #[error("session {token} is not authenticated (state: {state})")]
    NotAuthenticated {
        /// Session token.
        token: String,
        /// State the session was in when the operation was attempted.
        state: SessionState,
    },

    /// No authentication artifact arrived before the deadline.
    #[error("no authentication artifact for {token} within {waited_ms}ms")]
    ArtifactTimeout {
        /// Session token.
        token: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The underlying client rejected or failed a send.
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    /// The recipient could not be parsed as a platform address.
    #[error("invalid recipient: {0:?}")]
    InvalidRecipientFormat(String),

    /// The phone number for a pairing-code handshake is missing or malformed.
    #[error("invalid phone number: {0:?}")]
    InvalidPhoneNumber(String),

    /// Releasing the underlying client or its credentials failed.
    ///
    /// Never returned from removal; only logged.
    #[error("teardown failed: {0}")]
    TeardownFailed(String),

    /// The underlying client could not be created.
    #[error("client start failed: {0}")]
    StartFailed(String),

    /// The media source for a send could not be fetched.
    #[error(transparent)]
    Media(#[from] MediaError),
}

impl SessionError {
    /// Stable machine-readable code for API responses.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::NotFound(_) => "NOT_FOUND",
            Self::NotAuthenticated { .. } => "NOT_AUTHENTICATED",
            Self::ArtifactTimeout { .. } => "ARTIFACT_TIMEOUT",
            Self::DeliveryFailed(_) => "DELIVERY_FAILED",
            Self::InvalidRecipientFormat(_) => "INVALID_RECIPIENT",
            Self::InvalidPhoneNumber(_) => "INVALID_PHONE",
            Self::TeardownFailed(_) => "TEARDOWN_FAILED",
            Self::StartFailed(_) => "START_FAILED",
            Self::Media(_) => "MEDIA_UNAVAILABLE",
        }
    }

    /// Create a not found error.
    #[inline]
    pub fn not_found(token: impl Into<String>) -> Self {
        Self::NotFound(token.into())
    }
}

/// Result type for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

// ============================================================================
// Client Errors
// ============================================================================

/// Error type for the underlying messaging client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The client process could not be started.
    #[error("launch failed: {0}")]
    LaunchFailed(String),

    /// The client reported an error for a request.
    #[error("{0}")]
    Rejected(String),

    /// The client sent something that does not follow the bridge protocol.
    #[error("protocol: {0}")]
    Protocol(String),

    /// No response arrived in time.
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// The client is gone.
    #[error("client closed")]
    Closed,

    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Create a rejected error.
    #[inline]
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }
}

/// Result type for client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Configuration Errors
// ============================================================================

/// Error type for configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),

    /// Invalid value.
    #[error("invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Create an invalid value error.
    #[inline]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Media Errors
// ============================================================================

/// Error type for fetching outbound media.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The source URL is malformed or uses an unsupported scheme.
    #[error("invalid media url: {0}")]
    InvalidUrl(String),

    /// The request could not be completed.
    #[error("media request failed: {0}")]
    Request(String),

    /// The server answered with a non-success status.
    #[error("media source returned HTTP {0}")]
    Status(u16),

    /// The body exceeds the configured limit.
    #[error("media too large: {size} bytes (limit {limit})")]
    TooLarge {
        /// Observed or announced size.
        size: u64,
        /// Configured limit.
        limit: u64,
    },
}

/// Result type for media operations.
pub type MediaResult<T> = std::result::Result<T, MediaError>;

// ============================================================================
// Error Context Extension
// ============================================================================

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    ///
    /// # Errors
    ///
    /// Returns the original error wrapped as [`GatewayError::Internal`].
    fn context(self, msg: impl Into<String>) -> Result<T>;

    /// Add context using a closure (lazy evaluation).
    ///
    /// # Errors
    ///
    /// Returns the original error wrapped as [`GatewayError::Internal`].
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<GatewayError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            GatewayError::Internal(format!("{}: {}", msg.into(), err))
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            GatewayError::Internal(format!("{}: {}", f(), err))
        })
    }
}

// ============================================================================
// Display Helpers
// ============================================================================

/// A wrapper that displays errors in a user-friendly format.
#[derive(Debug)]
pub struct DisplayError<'a>(pub &'a GatewayError);

impl fmt::Display for DisplayError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            GatewayError::Session(e) => write!(f, "Session error: {e}"),
            GatewayError::Client(e) => write!(f, "Client error: {e}"),
            GatewayError::Config(e) => write!(f, "Configuration error: {e}"),
            GatewayError::Media(e) => write!(f, "Media error: {e}"),
            GatewayError::Io(e) => write!(f, "IO error: {e}"),
            GatewayError::Json(e) => write!(f, "JSON error: {e}"),
            GatewayError::Server(e) => write!(f, "Server error: {e}"),
            GatewayError::Task(e) => write!(f, "Task error: {e}"),
            GatewayError::Internal(e) => write!(f, "Internal error: {e}"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let session_err = SessionError::not_found("T1");
        let err: GatewayError = session_err.into();
        assert!(matches!(err, GatewayError::Session(_)));

        let client_err = ClientError::Closed;
        let err: GatewayError = client_err.into();
        assert!(matches!(err, GatewayError::Client(_)));
    }

    #[test]
    fn test_session_error_codes() {
        assert_eq!(SessionError::AlreadyExists("T".into()).code(), "ALREADY_EXISTS");
        assert_eq!(
            SessionError::NotAuthenticated {
                token: "T".into(),
                state: SessionState::AwaitingCode,
            }
            .code(),
            "NOT_AUTHENTICATED"
        );
        let media: SessionError = MediaError::Status(404).into();
        assert_eq!(media.code(), "MEDIA_UNAVAILABLE");
    }

    #[test]
    fn test_not_authenticated_message() {
        let err = SessionError::NotAuthenticated {
            token: "T2".into(),
            state: SessionState::LoggedOut,
        };
        assert_eq!(
            err.to_string(),
            "session T2 is not authenticated (state: logged_out)"
        );
    }

    #[test]
    fn test_context() {
        let res: std::result::Result<(), ConfigError> = Err(ConfigError::invalid("port"));
        let err = res.context("loading config").unwrap_err();
        assert_eq!(err.to_string(), "loading config: config: invalid: port");
    }
}
