//! Bridge configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;

/// File name prefix shared by every session socket.
pub const SOCKET_PREFIX: &str = "claude-pair-";

/// Retained activities per session unless configured otherwise.
pub const DEFAULT_MAX_HISTORY: usize = 10_000;

/// Configuration error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),
}

/// Settings shared by the broker, the orchestrator and the adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Directory holding the per-session sockets.
    pub socket_dir: PathBuf,
    /// Activities kept in memory per session; `None` keeps everything.
    pub max_history: Option<usize>,
    /// How long `stop` waits for open connections to drain.
    pub shutdown_grace: Duration,
    /// Command line used to launch the Codex pair agent.
    pub codex_command: String,
    /// Delay before checking that a spawned agent is still alive.
    pub spawn_settle: Duration,
    /// How long an agent gets to exit after SIGTERM before it is killed.
    pub adapter_stop_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/tmp"),
            max_history: Some(DEFAULT_MAX_HISTORY),
            shutdown_grace: Duration::from_secs(2),
            codex_command: "codex".to_string(),
            spawn_settle: Duration::from_millis(100),
            adapter_stop_grace: Duration::from_secs(5),
        }
    }
}

impl BridgeConfig {
    /// Build a config from `PAIR_BRIDGE_*` environment variables.
    ///
    /// # Errors
    /// Returns error if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    ///
    /// # Errors
    /// Returns error if a numeric variable does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("PAIR_BRIDGE_SOCKET_DIR").filter(|d| !d.is_empty()) {
            config.socket_dir = PathBuf::from(dir);
        }
        if let Some(cap) = parse_var::<usize>(&lookup, "PAIR_BRIDGE_MAX_HISTORY")? {
            config.max_history = (cap > 0).then_some(cap);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "PAIR_BRIDGE_SHUTDOWN_GRACE_MS")? {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(cmd) = lookup("PAIR_BRIDGE_CODEX_COMMAND").filter(|c| !c.trim().is_empty()) {
            config.codex_command = cmd;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "PAIR_BRIDGE_SPAWN_SETTLE_MS")? {
            config.spawn_settle = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "PAIR_BRIDGE_ADAPTER_STOP_GRACE_MS")? {
            config.adapter_stop_grace = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Use a different socket directory.
    #[must_use]
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    /// Socket path for a session under this config.
    #[must_use]
    pub fn socket_path(&self, session_id: &str) -> PathBuf {
        socket_path_in(&self.socket_dir, session_id)
    }
}

/// Socket path for a session in `dir`.
///
/// Pair agents reconstruct this path from the session id alone, so the
/// format must not change.
#[must_use]
pub fn socket_path_in(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{SOCKET_PREFIX}{session_id}.sock"))
}

/// Check that a session id can be embedded in a socket file name.
///
/// # Errors
/// Returns error if the id is empty or contains a path separator or NUL.
pub fn validate_session_id(session_id: &str) -> Result<(), ConfigError> {
    if session_id.is_empty() || session_id.contains(['/', '\0']) || session_id == ".." {
        return Err(ConfigError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
    }
}
