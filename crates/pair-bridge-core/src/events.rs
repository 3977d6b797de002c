//! Event types exchanged between the main agent, the broker and the pair agent.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Current time as an RFC 3339 string with millisecond precision.
#[must_use]
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Kind of observable work recorded in the activity log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A tool invocation by the main agent.
    Activity,
    /// A user prompt giving the pair agent context.
    Prompt,
}

/// One unit of observable work by the main agent.
///
/// `sequence` and `session_id` are owned by the session log: whatever the
/// sender puts there is overwritten on append. Fields the broker does not
/// know about are kept in `extra` and echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub output_summary: String,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub session_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ActivityEvent {
    /// Tool invocation with the given input and summary.
    #[must_use]
    pub fn tool_call(tool: impl Into<String>, input: Value, output_summary: impl Into<String>) -> Self {
        Self {
            kind: ActivityKind::Activity,
            timestamp: None,
            tool: Some(tool.into()),
            input,
            content: None,
            output_summary: output_summary.into(),
            sequence: 0,
            session_id: String::new(),
            extra: Map::new(),
        }
    }

    /// User prompt carrying free-form context.
    #[must_use]
    pub fn prompt(content: impl Into<String>) -> Self {
        Self {
            kind: ActivityKind::Prompt,
            timestamp: None,
            tool: None,
            input: Value::Null,
            content: Some(content.into()),
            output_summary: String::new(),
            sequence: 0,
            session_id: String::new(),
            extra: Map::new(),
        }
    }
}

/// Free-form text from a sender: strings pass through, `null` is absent,
/// anything else is kept as its JSON text.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    })
}

fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_string(deserializer).map(Option::unwrap_or_default)
}

/// How urgently the main agent should look at a piece of feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    #[default]
    Feedback,
}

/// Where in the main agent's work a piece of feedback applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// Feedback raised by the pair agent for the main agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    #[serde(rename = "type", default)]
    pub kind: FeedbackKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<FeedbackContext>,
}

impl FeedbackEvent {
    #[must_use]
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind: FeedbackKind::Feedback,
            timestamp: None,
            severity,
            message: message.into(),
            context: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: FeedbackContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Session control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Start,
    Stop,
    Ping,
    Pong,
}

/// Control message; the broker pushes `stop` to waiters when a session ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEvent {
    #[serde(rename = "type")]
    pub kind: ControlKind,
    pub timestamp: String,
    pub session_id: String,
}

impl ControlEvent {
    #[must_use]
    pub fn stop(session_id: impl Into<String>) -> Self {
        Self {
            kind: ControlKind::Stop,
            timestamp: now_timestamp(),
            session_id: session_id.into(),
        }
    }
}

/// Point-in-time view of a session, reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub session_id: String,
    pub activity_count: u64,
    pub pending_feedback: usize,
    pub pair_connected: bool,
    pub uptime_seconds: u64,
}

/// Payload rejected by `emit`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Missing payload type")]
    MissingType,
    #[error("Unknown payload type: {0}")]
    UnknownType(String),
    #[error("Invalid payload: {0}")]
    Invalid(String),
}

/// An `emit` payload after routing on its `type` field.
#[derive(Debug, Clone, PartialEq)]
pub enum EmitPayload {
    Activity(ActivityEvent),
    Feedback(FeedbackEvent),
}

impl EmitPayload {
    /// Route a raw JSON payload by its `type` tag.
    ///
    /// `sequence` and `session_id` on activities belong to the session log,
    /// so whatever the sender put there is dropped before decoding.
    ///
    /// # Errors
    /// Returns error if the tag is missing or unknown, or the body does not
    /// match the tagged event.
    pub fn from_value(mut payload: Value) -> Result<Self, PayloadError> {
        let kind = match payload.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => return Err(PayloadError::UnknownType(other.to_string())),
            None => return Err(PayloadError::MissingType),
        };

        match kind.as_str() {
            "activity" | "prompt" => {
                if let Value::Object(fields) = &mut payload {
                    fields.remove("sequence");
                    fields.remove("session_id");
                }
                serde_json::from_value(payload)
                    .map(Self::Activity)
                    .map_err(|e| PayloadError::Invalid(e.to_string()))
            }
            "feedback" => serde_json::from_value(payload)
                .map(Self::Feedback)
                .map_err(|e| PayloadError::Invalid(e.to_string())),
            _ => Err(PayloadError::UnknownType(kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_activity_keeps_unknown_fields() {
        let payload = json!({
            "type": "activity",
            "tool": "Edit",
            "input": {"file": "a.ts"},
            "output_summary": "ok",
            "duration_ms": 42
        });

        let EmitPayload::Activity(event) = EmitPayload::from_value(payload).unwrap() else {
            panic!("expected activity");
        };
        assert_eq!(event.kind, ActivityKind::Activity);
        assert_eq!(event.tool.as_deref(), Some("Edit"));
        assert_eq!(event.extra.get("duration_ms"), Some(&json!(42)));

        let out = serde_json::to_value(&event).unwrap();
        assert_eq!(out["type"], "activity");
        assert_eq!(out["duration_ms"], 42);
        assert_eq!(out["input"]["file"], "a.ts");
    }

    #[test]
    fn test_sender_owned_fields_are_tolerated() {
        let payload = json!({
            "type": "activity",
            "tool": 7,
            "output_summary": null,
            "sequence": -1,
            "session_id": 42
        });

        let EmitPayload::Activity(event) = EmitPayload::from_value(payload).unwrap() else {
            panic!("expected activity");
        };
        assert_eq!(event.tool.as_deref(), Some("7"));
        assert_eq!(event.output_summary, "");
        assert_eq!(event.sequence, 0);
        assert_eq!(event.session_id, "");
        assert!(event.extra.is_empty());
    }

    #[test]
    fn test_prompt_routes_to_activity_log() {
        let payload = json!({"type": "prompt", "content": "fix the parser"});
        let EmitPayload::Activity(event) = EmitPayload::from_value(payload).unwrap() else {
            panic!("expected prompt");
        };
        assert_eq!(event.kind, ActivityKind::Prompt);
        assert_eq!(event.content.as_deref(), Some("fix the parser"));
        assert!(event.input.is_null());
    }

    #[test]
    fn test_feedback_payload() {
        let payload = json!({
            "type": "feedback",
            "severity": "high",
            "message": "null deref",
            "context": {"file": "a.ts", "line": 12}
        });
        let EmitPayload::Feedback(event) = EmitPayload::from_value(payload).unwrap() else {
            panic!("expected feedback");
        };
        assert_eq!(event.severity, Severity::High);
        assert_eq!(event.context.unwrap().line, Some(12));
    }

    #[test]
    fn test_payload_routing_errors() {
        assert_eq!(
            EmitPayload::from_value(json!({"message": "x"})),
            Err(PayloadError::MissingType)
        );
        assert_eq!(
            EmitPayload::from_value(json!({"type": "ping"})),
            Err(PayloadError::UnknownType("ping".to_string()))
        );
        assert!(matches!(
            EmitPayload::from_value(json!({"type": "feedback", "severity": "urgent", "message": "x"})),
            Err(PayloadError::Invalid(_))
        ));
    }

    #[test]
    fn test_stop_control_serialization() {
        let json = serde_json::to_value(ControlEvent::stop("abc")).unwrap();
        assert_eq!(json["type"], "stop");
        assert_eq!(json["session_id"], "abc");
    }
}
