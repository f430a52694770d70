//! Gateway configuration.
//!
//! Configuration lives in `~/.machi-wa/config.json`. Every field has a
//! default, so an empty object (or no file at all) is a valid configuration.

use crate::error::{ConfigError, ConfigResult};
use crate::recipient::DEFAULT_SUFFIX;
use crate::util::default_data_dir;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Configuration file name inside the data directory.
const CONFIG_FILE: &str = "config.json";

/// Sub-directory of the data directory holding per-token credentials.
const SESSIONS_DIR: &str = "sessions";

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// HTTP listener.
    pub server: ServerConfig,
    /// Root for configuration and credentials.
    pub data_dir: PathBuf,
    /// How long artifact requests wait for a fresh artifact.
    pub artifact_timeout_ms: u64,
    /// Routing suffix appended to bare recipients.
    pub recipient_suffix: String,
    /// Re-create sessions for existing credential directories on start-up.
    pub restore_sessions: bool,
    /// Process bridge backend.
    pub bridge: BridgeConfig,
    /// Lifecycle webhook.
    pub webhook: WebhookConfig,
    /// Media fetching for send-media.
    pub media: MediaConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            data_dir: default_data_dir(),
            artifact_timeout_ms: 10_000,
            recipient_suffix: DEFAULT_SUFFIX.to_string(),
            restore_sessions: true,
            bridge: BridgeConfig::default(),
            webhook: WebhookConfig::default(),
            media: MediaConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Directory holding one credential directory per token.
    #[must_use]
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join(SESSIONS_DIR)
    }

    /// Artifact wait timeout.
    #[must_use]
    pub const fn artifact_timeout(&self) -> Duration {
        Duration::from_millis(self.artifact_timeout_ms)
    }

    /// Check the configuration for problems.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue::warning(
                "server.port",
                "port 0 binds an ephemeral port",
            ));
        }
        if self.artifact_timeout_ms == 0 {
            issues.push(ConfigIssue::error(
                "artifactTimeoutMs",
                "must be greater than zero",
            ));
        }
        if self.recipient_suffix.trim().is_empty() || self.recipient_suffix.contains('@') {
            issues.push(ConfigIssue::error(
                "recipientSuffix",
                "must be a bare domain such as c.us",
            ));
        }
        if self.bridge.command.trim().is_empty() {
            issues.push(ConfigIssue::error(
                "bridge.command",
                "no bridge command configured",
            ));
        }
        if self.bridge.request_timeout_ms == 0 {
            issues.push(ConfigIssue::error(
                "bridge.requestTimeoutMs",
                "must be greater than zero",
            ));
        }
        if let Some(url) = &self.webhook.url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            issues.push(ConfigIssue::error(
                "webhook.url",
                "must start with http:// or https://",
            ));
        }
        if self.media.max_bytes == 0 {
            issues.push(ConfigIssue::error("media.maxBytes", "must be greater than zero"));
        }

        issues
    }

    /// Whether validation found any error-level issue.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.validate()
            .iter()
            .any(|issue| issue.level == IssueLevel::Error)
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Settings for the process bridge backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Executable to run per session.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Extra environment for the bridge.
    pub env: HashMap<String, String>,
    /// How long the bridge must survive after spawn to count as started.
    pub startup_grace_ms: u64,
    /// Timeout for a single request (e.g. a send).
    pub request_timeout_ms: u64,
    /// How long to wait for a graceful exit before killing the bridge.
    pub shutdown_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: "node".to_string(),
            args: vec!["bridge/index.js".to_string()],
            env: HashMap::new(),
            startup_grace_ms: 100,
            request_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

/// Lifecycle webhook settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Target URL; `None` disables the webhook.
    pub url: Option<String>,
    /// Per-request timeout.
    pub timeout_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 5_000,
        }
    }
}

/// Media fetch settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaConfig {
    /// Largest accepted body.
    pub max_bytes: u64,
    /// Per-request timeout.
    pub timeout_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_bytes: 16 * 1024 * 1024,
            timeout_ms: 30_000,
        }
    }
}

/// Severity of a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueLevel {
    /// Works, but probably not what was intended.
    Warning,
    /// The gateway cannot run with this value.
    Error,
}

/// A single problem found by [`GatewayConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Severity.
    pub level: IssueLevel,
    /// Dotted path of the offending field.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl ConfigIssue {
    fn warning(field: &str, message: &str) -> Self {
        Self {
            level: IssueLevel::Warning,
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    fn error(field: &str, message: &str) -> Self {
        Self {
            level: IssueLevel::Error,
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.level {
            IssueLevel::Warning => "warning",
            IssueLevel::Error => "error",
        };
        write!(f, "{level}: {}: {}", self.field, self.message)
    }
}

/// Default configuration file path (`~/.machi-wa/config.json`).
#[must_use]
pub fn config_path() -> PathBuf {
    default_data_dir().join(CONFIG_FILE)
}

/// Load configuration from the default path, falling back to defaults when
/// the file does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub async fn load_config() -> ConfigResult<GatewayConfig> {
    let path = config_path();
    if !tokio::fs::try_exists(&path).await? {
        debug!(path = %path.display(), "no config file, using defaults");
        return Ok(GatewayConfig::default());
    }
    load_config_from(&path).await
}

/// Load configuration from an explicit path.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub async fn load_config_from(path: &Path) -> ConfigResult<GatewayConfig> {
    let content = tokio::fs::read_to_string(path).await?;
    let config = serde_json::from_str(&content)?;
    debug!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Write configuration to `path`, creating parent directories.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub async fn save_config(config: &GatewayConfig, path: &Path) -> ConfigResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(config)?;
    tokio::fs::write(path, content).await?;
    debug!(path = %path.display(), "saved config");
    Ok(())
}

/// Write a default configuration to the default path.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub async fn init_config() -> ConfigResult<PathBuf> {
    let path = config_path();
    save_config(&GatewayConfig::default(), &path).await?;
    Ok(path)
}

/// Reject configurations with error-level issues.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] listing every error-level issue.
pub fn ensure_valid(config: &GatewayConfig) -> ConfigResult<()> {
    let errors: Vec<String> = config
        .validate()
        .into_iter()
        .filter(|issue| issue.level == IssueLevel::Error)
        .map(|issue| issue.to_string())
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::invalid(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.addr(), "127.0.0.1:3000");
        assert_eq!(config.artifact_timeout(), Duration::from_secs(10));
        assert_eq!(config.recipient_suffix, "c.us");
        assert!(config.sessions_dir().ends_with("sessions"));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"server":{"port":8080},"artifactTimeoutMs":2500}"#).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.artifact_timeout_ms, 2500);
        assert_eq!(config.bridge.startup_grace_ms, 100);
    }

    #[test]
    fn test_validation_issues() {
        let mut config = GatewayConfig::default();
        config.bridge.command = String::new();
        config.artifact_timeout_ms = 0;
        config.webhook.url = Some("example.com/hook".into());
        config.server.port = 0;

        let issues = config.validate();
        let errors: Vec<_> = issues
            .iter()
            .filter(|i| i.level == IssueLevel::Error)
            .map(|i| i.field.as_str())
            .collect();
        assert_eq!(errors, vec!["artifactTimeoutMs", "bridge.command", "webhook.url"]);
        assert!(issues.iter().any(|i| i.level == IssueLevel::Warning));
        assert!(config.has_errors());
        assert!(ensure_valid(&config).is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = GatewayConfig::default();
        config.server.port = 4010;
        config.webhook.url = Some("http://localhost:9000/events".into());
        save_config(&config, &path).await.unwrap();

        let loaded = load_config_from(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let err = load_config_from(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
