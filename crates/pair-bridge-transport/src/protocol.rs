//! Wire protocol: one JSON document per `\n`-terminated line.

use pair_bridge_core::{
    ActivityEvent, BridgeStatus, ControlEvent, FeedbackEvent, PayloadError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Activities returned by `history` when the request does not say.
pub const DEFAULT_HISTORY: usize = 10;

/// Longest accepted line, terminator excluded.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Request-level protocol error, reported back as `{ok:false,error}`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid JSON")]
    InvalidJson,
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Missing command")]
    MissingCommand,
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Missing payload")]
    MissingPayload,
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Request as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(rename = "lastSeen", default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<usize>,
}

/// Decoded request.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCommand {
    /// Record an activity/prompt or queue feedback. The payload is checked
    /// at dispatch so a missing one is reported, not dropped.
    Emit { payload: Option<Value> },
    /// Long-poll for activity at or after `last_seen`.
    Wait { last_seen: u64 },
    /// Take the oldest queued feedback.
    Poll,
    /// Last `last` activities.
    History { last: usize },
    /// Session snapshot.
    Status,
    /// Shut the broker down.
    Stop,
}

impl BridgeCommand {
    /// Command name on the wire.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Emit { .. } => "emit",
            Self::Wait { .. } => "wait",
            Self::Poll => "poll",
            Self::History { .. } => "history",
            Self::Status => "status",
            Self::Stop => "stop",
        }
    }

    /// Decode one frame.
    ///
    /// # Errors
    /// Returns error if the frame is not JSON, has mistyped fields, or names
    /// no known command.
    pub fn parse(frame: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(frame).map_err(|_| ProtocolError::InvalidJson)?;
        let envelope: CommandEnvelope =
            serde_json::from_value(value).map_err(|e| ProtocolError::InvalidCommand(e.to_string()))?;
        Self::from_envelope(envelope)
    }

    /// Interpret a wire envelope, filling in defaults.
    ///
    /// # Errors
    /// Returns error if the command is missing or unknown.
    pub fn from_envelope(envelope: CommandEnvelope) -> Result<Self, ProtocolError> {
        let name = envelope.command.ok_or(ProtocolError::MissingCommand)?;
        match name.as_str() {
            "emit" => Ok(Self::Emit {
                payload: envelope.payload,
            }),
            "wait" => Ok(Self::Wait {
                last_seen: envelope.last_seen.unwrap_or(0),
            }),
            "poll" => Ok(Self::Poll),
            "history" => Ok(Self::History {
                last: envelope.last.unwrap_or(DEFAULT_HISTORY),
            }),
            "status" => Ok(Self::Status),
            "stop" => Ok(Self::Stop),
            _ => Err(ProtocolError::UnknownCommand(name)),
        }
    }

    /// Wire envelope for this command.
    #[must_use]
    pub fn to_envelope(&self) -> CommandEnvelope {
        let mut envelope = CommandEnvelope {
            command: Some(self.name().to_string()),
            ..CommandEnvelope::default()
        };
        match self {
            Self::Emit { payload } => envelope.payload.clone_from(payload),
            Self::Wait { last_seen } => envelope.last_seen = Some(*last_seen),
            Self::History { last } => envelope.last = Some(*last),
            Self::Poll | Self::Status | Self::Stop => {}
        }
        envelope
    }
}

/// Enveloped response used by `emit`, `stop` and every error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeResponse {
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            ok: true,
            data: None,
            error: None,
        }
    }

    #[must_use]
    pub const fn ok_with(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

impl From<ProtocolError> for BridgeResponse {
    fn from(err: ProtocolError) -> Self {
        Self::error(err.to_string())
    }
}

/// Anything the broker writes back. Each command has its own shape, so the
/// enum is untagged: `wait` and `history` send a bare array, `poll` sends
/// the feedback or `null`, `status` sends the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Response(BridgeResponse),
    Activities(Vec<ActivityEvent>),
    Feedback(Option<FeedbackEvent>),
    Status(BridgeStatus),
    Control(ControlEvent),
}

/// Serialize a message as one newline-terminated frame.
///
/// # Errors
/// Returns error if the message cannot be serialized.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Read the next complete frame into `buf`, without its terminator.
///
/// Returns `false` at end of stream. A trailing partial line at end of
/// stream is discarded.
///
/// # Errors
/// Returns error if the underlying read fails or the line is longer than
/// [`MAX_FRAME_LEN`].
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    finish_frame(reader, buf).await
}

/// Like [`read_frame`], but whatever is already in `buf` is the start of
/// the frame.
///
/// # Errors
/// Returns error if the underlying read fails or the line is longer than
/// [`MAX_FRAME_LEN`].
pub async fn finish_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    // one byte past the cap, so an overlong line is told apart from a full one
    let budget = (MAX_FRAME_LEN + 1).saturating_sub(buf.len());
    let budget = u64::try_from(budget).unwrap_or(u64::MAX);
    if budget > 0 {
        (&mut *reader).take(budget).read_until(b'\n', buf).await?;
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        return Ok(true);
    }
    if buf.len() > MAX_FRAME_LEN {
        return Err(frame_too_long());
    }
    Ok(false)
}

pub(crate) fn frame_too_long() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("frame exceeds {MAX_FRAME_LEN} bytes"),
    )
}

#[cfg(test)]
mod tests {
    use pair_bridge_core::{FeedbackEvent, Severity};
    use serde_json::json;
    use tokio::io::BufReader;

    use super::*;

    #[test]
    fn test_parse_defaults() {
        assert_eq!(
            BridgeCommand::parse(br#"{"command":"wait"}"#).unwrap(),
            BridgeCommand::Wait { last_seen: 0 }
        );
        assert_eq!(
            BridgeCommand::parse(br#"{"command":"history"}"#).unwrap(),
            BridgeCommand::History { last: 10 }
        );
        assert_eq!(
            BridgeCommand::parse(br#"{"command":"wait","lastSeen":7}"#).unwrap(),
            BridgeCommand::Wait { last_seen: 7 }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(BridgeCommand::parse(b"{not json"), Err(ProtocolError::InvalidJson));
        assert_eq!(BridgeCommand::parse(b"{}"), Err(ProtocolError::MissingCommand));
        assert_eq!(
            BridgeCommand::parse(br#"{"command":"dance"}"#),
            Err(ProtocolError::UnknownCommand("dance".to_string()))
        );
        assert!(matches!(
            BridgeCommand::parse(br#"{"command":"wait","lastSeen":"soon"}"#),
            Err(ProtocolError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_error_messages() {
        let response = BridgeResponse::from(ProtocolError::UnknownCommand("dance".to_string()));
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"ok": false, "error": "Unknown command: dance"})
        );
        assert_eq!(
            BridgeResponse::from(ProtocolError::InvalidJson).error.as_deref(),
            Some("Invalid JSON")
        );
    }

    #[test]
    fn test_envelope_uses_camel_case_cursor() {
        let json = serde_json::to_value(BridgeCommand::Wait { last_seen: 3 }.to_envelope()).unwrap();
        assert_eq!(json, json!({"command": "wait", "lastSeen": 3}));
    }

    #[test]
    fn test_reply_shapes() {
        let line = encode_line(&Reply::Feedback(None)).unwrap();
        assert_eq!(line, b"null\n");

        let line = encode_line(&Reply::Activities(Vec::new())).unwrap();
        assert_eq!(line, b"[]\n");

        let feedback = FeedbackEvent::new(Severity::Low, "rename");
        let value: Value = serde_json::to_value(Reply::Feedback(Some(feedback))).unwrap();
        assert_eq!(value["type"], "feedback");
        assert_eq!(value["severity"], "low");
    }

    #[tokio::test]
    async fn test_read_frame_splits_and_drops_partial_tail() {
        let data: &[u8] = b"{\"command\":\"poll\"}\n\n{\"command\":\"status\"}\n{\"command\":";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();

        assert!(read_frame(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf, br#"{"command":"poll"}"#);
        assert!(read_frame(&mut reader, &mut buf).await.unwrap());
        assert!(buf.is_empty());
        assert!(read_frame(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf, br#"{"command":"status"}"#);
        assert!(!read_frame(&mut reader, &mut buf).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_frame_caps_line_length() {
        let mut data = vec![b'a'; MAX_FRAME_LEN];
        data.push(b'\n');
        data.extend(std::iter::repeat_n(b'b', MAX_FRAME_LEN + 5));
        let mut reader = BufReader::new(data.as_slice());
        let mut buf = Vec::new();

        assert!(read_frame(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf.len(), MAX_FRAME_LEN);

        let err = read_frame(&mut reader, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_finish_frame_keeps_held_prefix() {
        let data: &[u8] = b"and\":\"poll\"}\n";
        let mut reader = BufReader::new(data);
        let mut buf = b"{\"comm".to_vec();

        assert!(finish_frame(&mut reader, &mut buf).await.unwrap());
        assert_eq!(buf, br#"{"command":"poll"}"#);
    }
}
