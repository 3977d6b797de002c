//! Client for a bridge session socket.
//!
//! Every call opens its own connection, sends one command and reads one
//! reply, which is how the broker expects to be used.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use pair_bridge_core::{
    ActivityEvent, BridgeConfig, BridgeStatus, ControlEvent, ControlKind, FeedbackEvent, WaitOutcome,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::UnixStream,
};

use crate::protocol::{BridgeCommand, BridgeResponse, encode_line, read_frame};

/// Default deadline for non-blocking commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Bridge not running (socket not found: {0})")]
    NotRunning(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Bridge rejected request: {0}")]
    Rejected(String),
    #[error("Connection closed before a reply arrived")]
    Closed,
    #[error("Request timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Unexpected reply: {0}")]
    Unexpected(Value),
}

/// Talks to one session's broker.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl BridgeClient {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Client for the session's socket under `config`.
    #[must_use]
    pub fn for_session(config: &BridgeConfig, session_id: &str) -> Self {
        Self::new(config.socket_path(session_id))
    }

    /// Deadline for every command except `wait`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a command and return the raw JSON reply.
    ///
    /// # Errors
    /// Returns error if the broker is unreachable, the exchange fails, or
    /// no reply arrives within the timeout.
    pub async fn send(&self, command: &BridgeCommand) -> Result<Value, ClientError> {
        tokio::time::timeout(self.timeout, self.exchange(command))
            .await
            .map_err(|_| ClientError::TimedOut(self.timeout))?
    }

    async fn exchange(&self, command: &BridgeCommand) -> Result<Value, ClientError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ClientError::NotRunning(self.socket_path.clone()),
                _ => ClientError::Io(e),
            })?;

        let mut reader = BufReader::new(stream);
        let line = encode_line(&command.to_envelope())?;
        reader.get_mut().write_all(&line).await?;
        reader.get_mut().flush().await?;

        let mut frame = Vec::new();
        if !read_frame(&mut reader, &mut frame).await? {
            return Err(ClientError::Closed);
        }
        Ok(serde_json::from_slice(&frame)?)
    }

    /// Emit a raw payload; its `type` decides where it goes.
    ///
    /// # Errors
    /// Returns error if the exchange fails or the broker rejects the payload.
    pub async fn emit(&self, payload: Value) -> Result<(), ClientError> {
        let reply = self
            .send(&BridgeCommand::Emit {
                payload: Some(payload),
            })
            .await?;
        let response: BridgeResponse = serde_json::from_value(reply)?;
        if response.ok {
            Ok(())
        } else {
            Err(ClientError::Rejected(response.error.unwrap_or_default()))
        }
    }

    /// Record an activity or prompt.
    ///
    /// # Errors
    /// Returns error if the exchange fails or the broker rejects the event.
    pub async fn emit_activity(&self, event: &ActivityEvent) -> Result<(), ClientError> {
        self.emit(serde_json::to_value(event)?).await
    }

    /// Queue feedback for the main agent.
    ///
    /// # Errors
    /// Returns error if the exchange fails or the broker rejects the event.
    pub async fn emit_feedback(&self, event: &FeedbackEvent) -> Result<(), ClientError> {
        self.emit(serde_json::to_value(event)?).await
    }

    /// Block until there is activity at or after `last_seen`, or the
    /// session stops. No timeout applies.
    ///
    /// # Errors
    /// Returns error if the exchange fails or the reply has an unknown shape.
    pub async fn wait(&self, last_seen: u64) -> Result<WaitOutcome, ClientError> {
        let reply = self.exchange(&BridgeCommand::Wait { last_seen }).await?;
        if reply.is_array() {
            return Ok(WaitOutcome::Activities(serde_json::from_value(reply)?));
        }
        check_rejected(&reply)?;
        match serde_json::from_value::<ControlEvent>(reply.clone()) {
            Ok(event) if event.kind == ControlKind::Stop => Ok(WaitOutcome::Stopped(event)),
            _ => Err(ClientError::Unexpected(reply)),
        }
    }

    /// Take the oldest pending feedback.
    ///
    /// # Errors
    /// Returns error if the exchange fails.
    pub async fn poll(&self) -> Result<Option<FeedbackEvent>, ClientError> {
        self.typed(&BridgeCommand::Poll).await
    }

    /// Last `last` activities, oldest first.
    ///
    /// # Errors
    /// Returns error if the exchange fails.
    pub async fn history(&self, last: usize) -> Result<Vec<ActivityEvent>, ClientError> {
        self.typed(&BridgeCommand::History { last }).await
    }

    /// Current session snapshot.
    ///
    /// # Errors
    /// Returns error if the exchange fails.
    pub async fn status(&self) -> Result<BridgeStatus, ClientError> {
        self.typed(&BridgeCommand::Status).await
    }

    /// Ask the broker to shut down. Returns once the request is acknowledged;
    /// teardown finishes in the background.
    ///
    /// # Errors
    /// Returns error if the exchange fails or the broker refuses.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let reply = self.send(&BridgeCommand::Stop).await?;
        let response: BridgeResponse = serde_json::from_value(reply)?;
        if response.ok {
            Ok(())
        } else {
            Err(ClientError::Rejected(response.error.unwrap_or_default()))
        }
    }

    async fn typed<T: DeserializeOwned>(&self, command: &BridgeCommand) -> Result<T, ClientError> {
        let reply = self.send(command).await?;
        check_rejected(&reply)?;
        Ok(serde_json::from_value(reply)?)
    }
}

/// Turn an `{ok:false,error}` envelope into an error.
fn check_rejected(reply: &Value) -> Result<(), ClientError> {
    if reply.get("ok") == Some(&Value::Bool(false)) {
        let message = reply
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(ClientError::Rejected(message));
    }
    Ok(())
}
