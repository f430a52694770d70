//! Process bridge backend.
//!
//! Each session runs its own bridge executable (typically a Node.js script
//! wrapping a web automation client). The bridge talks newline-delimited JSON
//! over stdio:
//!
//! ```text
//! bridge -> core   {"event":"qr","data":"2@..."}
//!                  {"event":"pairing_code","data":"ABCD-EFGH"}
//!                  {"event":"ready"}
//!                  {"event":"auth_failure","reason":"..."}
//!                  {"event":"disconnected","reason":"..."}
//!                  {"id":1,"result":{...}} | {"id":1,"error":"..."}
//! core -> bridge   {"id":1,"method":"send","params":{"to":"...","payload":{...}}}
//!                  {"id":2,"method":"shutdown"}
//! ```
//!
//! The bridge receives its token, credential directory and auth mode through
//! `MACHI_WA_*` environment variables.

use super::{ClientEventSender, ClientFactory, ClientHandle, MessagingClient};
use crate::config::BridgeConfig;
use crate::error::{ClientError, ClientResult};
use crate::events::{AuthArtifact, AuthMode, ClientEvent, OutboundPayload};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// Reason reported when the bridge closes its stdout.
const EXIT_REASON: &str = "bridge exited";

/// Message written by the bridge.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeMessage {
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Event(BridgeEvent),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BridgeEvent {
    Qr {
        data: String,
    },
    PairingCode {
        data: String,
    },
    Ready,
    AuthFailure {
        #[serde(default)]
        reason: String,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
}

impl From<BridgeEvent> for ClientEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Qr { data } => Self::Artifact(AuthArtifact::qr(data)),
            BridgeEvent::PairingCode { data } => Self::Artifact(AuthArtifact::pairing_code(data)),
            BridgeEvent::Ready => Self::Authenticated,
            BridgeEvent::AuthFailure { reason } => Self::AuthFailed(reason),
            BridgeEvent::Disconnected { reason } => Self::Disconnected(reason),
        }
    }
}

/// Request written to the bridge.
#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    params: Value,
}

/// Factory spawning one bridge process per session.
#[derive(Debug, Clone)]
pub struct ProcessClientFactory {
    config: BridgeConfig,
}

impl ProcessClientFactory {
    /// Create a factory for the given bridge settings.
    #[must_use]
    pub const fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    fn command(&self, token: &str, credentials_dir: &Path, mode: &AuthMode) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .env("MACHI_WA_TOKEN", token)
            .env("MACHI_WA_CREDENTIALS_DIR", credentials_dir)
            .env("MACHI_WA_AUTH_MODE", mode.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let AuthMode::PairingCode { phone } = mode {
            cmd.env("MACHI_WA_PAIRING_PHONE", phone);
        }
        cmd
    }
}

#[async_trait]
impl ClientFactory for ProcessClientFactory {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn create(
        &self,
        token: &str,
        credentials_dir: &Path,
        mode: &AuthMode,
        events: ClientEventSender,
    ) -> ClientResult<ClientHandle> {
        tokio::fs::create_dir_all(credentials_dir).await?;

        let mut child = self
            .command(token, credentials_dir, mode)
            .spawn()
            .map_err(|e| {
                ClientError::LaunchFailed(format!("failed to spawn {}: {e}", self.config.command))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::LaunchFailed("bridge stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::LaunchFailed("bridge stdout unavailable".into()))?;

        tokio::time::sleep(Duration::from_millis(self.config.startup_grace_ms)).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(ClientError::LaunchFailed(format!(
                    "bridge exited immediately with {status}"
                )));
            }
            Ok(None) => {}
            Err(e) => {
                return Err(ClientError::LaunchFailed(format!(
                    "failed to check bridge status: {e}"
                )));
            }
        }

        info!(token = %token, pid = ?child.id(), mode = mode.as_str(), "bridge started");
        Ok(Arc::new(ProcessClient::start(
            child,
            stdin,
            stdout,
            events,
            &self.config,
        )))
    }
}

/// A running bridge process.
pub struct ProcessClient {
    token: Arc<str>,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
    pending: PendingMap,
    next_id: AtomicU64,
    closing: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    request_timeout: Duration,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for ProcessClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessClient")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl ProcessClient {
    fn start(
        child: Child,
        stdin: ChildStdin,
        stdout: ChildStdout,
        events: ClientEventSender,
        config: &BridgeConfig,
    ) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closing = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            stdout,
            events.clone(),
            Arc::clone(&pending),
            Arc::clone(&closing),
        ));

        Self {
            token: Arc::from(events.token()),
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            pending,
            next_id: AtomicU64::new(1),
            closing,
            reader,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
        }
    }

    async fn request(&self, method: &str, params: Value, timeout: Duration) -> ClientResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&BridgeRequest { id, method, params })
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&id);
            debug!(token = %self.token, method, error = %e, "bridge write failed");
            return Err(ClientError::Closed);
        }
        trace!(token = %self.token, id, method, "bridge request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(ClientError::Rejected(message)),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ClientError::Timeout(duration_ms(timeout)))
            }
        }
    }
}

#[async_trait]
impl MessagingClient for ProcessClient {
    async fn send(&self, recipient: &str, payload: &OutboundPayload) -> ClientResult<()> {
        let params = serde_json::json!({ "to": recipient, "payload": payload });
        self.request("send", params, self.request_timeout)
            .await
            .map(|_| ())
    }

    async fn shutdown(&self) -> ClientResult<()> {
        self.closing.store(true, Ordering::SeqCst);

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = self
            .request("shutdown", Value::Null, self.shutdown_timeout)
            .await
        {
            debug!(token = %self.token, error = %e, "bridge did not acknowledge shutdown");
        }

        let result = match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(token = %self.token, %status, "bridge exited");
                Ok(())
            }
            Ok(Err(e)) => Err(ClientError::Io(e)),
            Err(_) => {
                warn!(token = %self.token, "bridge shutdown timed out, killing");
                child.kill().await.map_err(ClientError::Io)
            }
        };

        self.reader.abort();
        result
    }
}

impl Drop for ProcessClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    stdout: ChildStdout,
    events: ClientEventSender,
    pending: PendingMap,
    closing: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => handle_line(&line, &events, &pending).await,
            Ok(None) => break,
            Err(e) => {
                warn!(token = %events.token(), error = %e, "bridge read failed");
                break;
            }
        }
    }

    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(EXIT_REASON.to_string()));
    }
    if !closing.load(Ordering::SeqCst) {
        events.emit(ClientEvent::Disconnected(EXIT_REASON.to_string()));
    }
}

async fn handle_line(line: &str, events: &ClientEventSender, pending: &PendingMap) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match serde_json::from_str::<BridgeMessage>(line) {
        Ok(BridgeMessage::Response { id, result, error }) => {
            let outcome = error.map_or_else(|| Ok(result.unwrap_or(Value::Null)), Err);
            if let Some(tx) = pending.lock().await.remove(&id) {
                let _ = tx.send(outcome);
            } else {
                warn!(token = %events.token(), id, "response for unknown request");
            }
        }
        Ok(BridgeMessage::Event(event)) => {
            let event = ClientEvent::from(event);
            debug!(token = %events.token(), event = event.name(), "bridge event");
            events.emit(event);
        }
        Err(e) => {
            warn!(token = %events.token(), error = %e, line, "unrecognised bridge output");
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
