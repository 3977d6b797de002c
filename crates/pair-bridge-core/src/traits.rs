//! Pair agent adapter abstraction.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pair agent backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Claude Opus running inside the host agent's own session.
    ClaudeOpus,
    /// OpenAI Codex CLI running as a subprocess.
    Codex,
}

impl Backend {
    /// Every known backend.
    pub const ALL: [Self; 2] = [Self::ClaudeOpus, Self::Codex];

    /// Wire tag, e.g. `claude-opus`.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::ClaudeOpus => "claude-opus",
            Self::Codex => "codex",
        }
    }

    /// Human readable name.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::ClaudeOpus => "Claude Opus",
            Self::Codex => "Codex",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Backend {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|b| b.tag() == s)
            .ok_or_else(|| AdapterError::UnknownBackend(s.to_string()))
    }
}

/// Adapter error.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),
    #[error("No adapter registered for backend: {0}")]
    NotRegistered(Backend),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Agent exited immediately with {0}")]
    ExitedEarly(String),
    #[error("Agent already running")]
    AlreadyRunning,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Launches and supervises a pair agent for one session.
///
/// The broker never calls adapters; only the session orchestrator does.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Human readable adapter name.
    fn name(&self) -> &'static str;

    /// Backend this adapter implements.
    fn backend(&self) -> Backend;

    /// Start the pair agent for `session_id`.
    async fn spawn(&self, session_id: &str, system_prompt: &str) -> Result<(), AdapterError>;

    /// Stop the pair agent. Stopping an idle adapter is a no-op.
    async fn stop(&self) -> Result<(), AdapterError>;

    /// Whether the pair agent is alive.
    fn is_running(&self) -> bool;

    /// Process or task identifier of the running agent.
    fn process_id(&self) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_tags_roundtrip() {
        for backend in Backend::ALL {
            assert_eq!(backend.tag().parse::<Backend>().unwrap(), backend);
        }
        assert!(matches!(
            "gemini".parse::<Backend>(),
            Err(AdapterError::UnknownBackend(name)) if name == "gemini"
        ));
    }

    #[test]
    fn test_backend_serde_uses_tag() {
        assert_eq!(serde_json::to_string(&Backend::ClaudeOpus).unwrap(), "\"claude-opus\"");
    }
}
