//! Codex pair agent, run as a detached subprocess group.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use pair_bridge_core::{AdapterError, AgentAdapter, Backend, BridgeConfig};
use tokio::process::Command;

use crate::{command::CommandBuilder, prompt::task_prompt};

/// Environment variable telling the agent which session it serves.
pub const SESSION_ENV: &str = "CLAUDE_PAIR_SESSION";

/// Codex CLI adapter.
pub struct CodexAdapter {
    command: String,
    socket_dir: PathBuf,
    spawn_settle: Duration,
    stop_grace: Duration,
    // held for the whole of `spawn` and `stop` so they never interleave
    lifecycle: tokio::sync::Mutex<()>,
    child: Mutex<Option<AsyncGroupChild>>,
}

impl CodexAdapter {
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            command: config.codex_command.clone(),
            socket_dir: config.socket_dir.clone(),
            spawn_settle: config.spawn_settle,
            stop_grace: config.adapter_stop_grace,
            lifecycle: tokio::sync::Mutex::new(()),
            child: Mutex::new(None),
        }
    }

    fn take_child(&self) -> Option<AsyncGroupChild> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[async_trait]
impl AgentAdapter for CodexAdapter {
    fn name(&self) -> &'static str {
        Backend::Codex.display_name()
    }

    fn backend(&self) -> Backend {
        Backend::Codex
    }

    async fn spawn(&self, session_id: &str, system_prompt: &str) -> Result<(), AdapterError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Err(AdapterError::AlreadyRunning);
        }

        let socket_path = pair_bridge_core::config::socket_path_in(&self.socket_dir, session_id);
        let prompt = task_prompt(system_prompt, session_id, &socket_path);
        let (program, args) = CommandBuilder::new(self.command.as_str())
            .arg("--prompt")
            .arg(prompt)
            .build()?
            .into_resolved()
            .await?;

        let mut child = Command::new(&program)
            .args(&args)
            .env(SESSION_ENV, session_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .group_spawn()
            .map_err(|e| AdapterError::SpawnFailed(format!("{}: {e}", program.display())))?;

        tokio::time::sleep(self.spawn_settle).await;
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => return Err(AdapterError::ExitedEarly(status.to_string())),
            Err(e) => {
                if let Err(kill_err) = child.kill().await {
                    tracing::warn!("Failed to kill pair agent after failed status check: {kill_err}");
                }
                return Err(e.into());
            }
        }

        tracing::info!(
            session_id,
            pid = ?child.id(),
            program = %program.display(),
            "Spawned Codex pair agent"
        );
        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(mut child) = self.take_child() else {
            return Ok(());
        };
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use command_group::{Signal, UnixChildExt};
            if let Err(e) = child.signal(Signal::SIGTERM) {
                tracing::debug!("SIGTERM to pair agent failed: {e}");
            }
        }

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(status) => {
                tracing::info!(status = ?status.ok(), "Codex pair agent exited");
            }
            Err(_) => {
                tracing::warn!(grace = ?self.stop_grace, "Codex pair agent ignored SIGTERM, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    fn process_id(&self) -> Option<String> {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(AsyncGroupChild::id)
            .map(|pid| pid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(command: &str) -> CodexAdapter {
        let config = BridgeConfig {
            codex_command: command.to_string(),
            adapter_stop_grace: Duration::from_secs(2),
            ..BridgeConfig::default()
        };
        CodexAdapter::new(&config)
    }

    #[tokio::test]
    async fn test_spawn_and_stop_process_group() {
        // the appended `--prompt <text>` become $0 and $1 of the script
        let adapter = adapter("sh -c 'sleep 30'");
        adapter.spawn("abc", "watch closely").await.unwrap();
        assert!(adapter.is_running());
        assert!(adapter.process_id().is_some());

        adapter.stop().await.unwrap();
        assert!(!adapter.is_running());
        assert!(adapter.process_id().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_spawns_launch_one_agent() {
        let adapter = adapter("sh -c 'sleep 30'");
        let (first, second) = tokio::join!(adapter.spawn("abc", "watch"), adapter.spawn("abc", "watch"));

        let failures: Vec<_> = [first, second].into_iter().filter_map(Result::err).collect();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], AdapterError::AlreadyRunning));
        assert!(adapter.is_running());

        adapter.stop().await.unwrap();
        assert!(!adapter.is_running());
    }

    #[tokio::test]
    async fn test_immediate_exit_is_an_error() {
        let adapter = adapter("sh -c 'exit 3'");
        let err = adapter.spawn("abc", "watch").await.unwrap_err();
        assert!(matches!(err, AdapterError::ExitedEarly(_)), "got {err:?}");
        assert!(!adapter.is_running());
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let adapter = adapter("definitely-not-codex-5f2a");
        let err = adapter.spawn("abc", "watch").await.unwrap_err();
        assert!(matches!(err, AdapterError::ExecutableNotFound(name) if name == "definitely-not-codex-5f2a"));
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        adapter("codex").stop().await.unwrap();
    }
}
