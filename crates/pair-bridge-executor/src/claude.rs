//! Claude Opus pair agent, run inside the host agent's own session.
//!
//! Nothing is spawned here: the host launches a background task with the
//! prompt this adapter prepares. The adapter tracks the task id and whether
//! the task is considered live.

use std::{
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use pair_bridge_core::{AdapterError, AgentAdapter, Backend, BridgeConfig};
use uuid::Uuid;

use crate::prompt::task_prompt;

#[derive(Debug, Clone)]
struct Task {
    id: String,
    prompt: String,
}

/// In-session Claude Opus adapter.
pub struct ClaudeOpusAdapter {
    socket_dir: PathBuf,
    task: Mutex<Option<Task>>,
}

impl ClaudeOpusAdapter {
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            socket_dir: config.socket_dir.clone(),
            task: Mutex::new(None),
        }
    }

    /// Prompt the host must run as a background task, while running.
    #[must_use]
    pub fn task_prompt(&self) -> Option<String> {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| t.prompt.clone())
    }
}

#[async_trait]
impl AgentAdapter for ClaudeOpusAdapter {
    fn name(&self) -> &'static str {
        Backend::ClaudeOpus.display_name()
    }

    fn backend(&self) -> Backend {
        Backend::ClaudeOpus
    }

    async fn spawn(&self, session_id: &str, system_prompt: &str) -> Result<(), AdapterError> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(AdapterError::AlreadyRunning);
        }

        let socket_path = pair_bridge_core::config::socket_path_in(&self.socket_dir, session_id);
        let id = Uuid::new_v4().to_string();
        tracing::info!(session_id, task_id = %id, "Prepared in-session pair agent task");

        *task = Some(Task {
            id,
            prompt: task_prompt(system_prompt, session_id, &socket_path),
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            tracing::info!(task_id = %task.id, "Released in-session pair agent task");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.task.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    fn process_id(&self) -> Option<String> {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| t.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let adapter = ClaudeOpusAdapter::new(&BridgeConfig::default());
        assert!(!adapter.is_running());
        assert!(adapter.process_id().is_none());

        adapter.spawn("abc", "Be picky.").await.unwrap();
        assert!(adapter.is_running());
        assert!(adapter.process_id().is_some());
        let prompt = adapter.task_prompt().unwrap();
        assert!(prompt.starts_with("Be picky."));
        assert!(prompt.contains("/tmp/claude-pair-abc.sock"));

        assert!(matches!(
            adapter.spawn("abc", "again").await,
            Err(AdapterError::AlreadyRunning)
        ));

        adapter.stop().await.unwrap();
        assert!(!adapter.is_running());
        assert!(adapter.task_prompt().is_none());
        adapter.stop().await.unwrap();
    }
}
