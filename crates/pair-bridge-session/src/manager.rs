//! Session manager for orchestrating a broker and its pair agent.

use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use pair_bridge_core::{AdapterError, AgentAdapter, Backend, BridgeConfig, BridgeStatus};
use pair_bridge_executor::{AdapterRegistry, DEFAULT_SYSTEM_PROMPT};
use pair_bridge_transport::{BridgeServer, BrokerError};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Session already active: {0}")]
    AlreadyActive(String),
    #[error("No active session")]
    NoActiveSession,
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),
}

/// How to start a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Pair agent to spawn; `None` runs the broker alone.
    pub backend: Option<Backend>,
    /// System prompt for the pair agent, replacing the built-in one.
    pub custom_prompt: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            backend: Some(Backend::ClaudeOpus),
            custom_prompt: None,
        }
    }
}

impl SessionOptions {
    /// Broker with no pair agent.
    #[must_use]
    pub const fn broker_only() -> Self {
        Self {
            backend: None,
            custom_prompt: None,
        }
    }

    #[must_use]
    pub const fn with_backend(backend: Backend) -> Self {
        Self {
            backend: Some(backend),
            custom_prompt: None,
        }
    }

    #[must_use]
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_prompt = Some(prompt.into());
        self
    }
}

/// Returned by [`SessionManager::start_session`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub socket_path: PathBuf,
    pub backend: Option<Backend>,
}

/// Returned by [`SessionManager::stop_session`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub duration_secs: u64,
    /// Broker snapshot taken just before shutdown.
    pub status: Option<BridgeStatus>,
    /// Whether the socket file was cleaned up. The session ends either way.
    pub socket_removed: bool,
}

/// Returned by [`SessionManager::get_status`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStatusReport {
    pub active: bool,
    pub session_id: Option<String>,
    pub backend: Option<Backend>,
    pub socket_path: Option<PathBuf>,
    pub uptime_secs: Option<u64>,
    pub pair_running: bool,
    pub bridge: Option<BridgeStatus>,
}

struct ActiveSession {
    id: String,
    server: BridgeServer,
    adapter: Option<Box<dyn AgentAdapter>>,
    started_at: Instant,
}

impl ActiveSession {
    fn backend(&self) -> Option<Backend> {
        self.adapter.as_ref().map(|a| a.backend())
    }
}

/// Owns the single active pair session.
pub struct SessionManager {
    config: BridgeConfig,
    registry: AdapterRegistry,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: BridgeConfig, registry: AdapterRegistry) -> Self {
        Self {
            config,
            registry,
            active: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Start the broker for a fresh session id, then the pair agent.
    ///
    /// # Errors
    /// Returns error if a session is already active, the broker cannot bind,
    /// or the pair agent fails to spawn. A failed spawn stops the broker.
    pub async fn start_session(&self, options: SessionOptions) -> Result<SessionInfo, ManagerError> {
        let mut active = self.active.lock().await;
        if let Some(session) = active.as_ref() {
            return Err(ManagerError::AlreadyActive(session.id.clone()));
        }

        let id = new_session_id();
        let server = BridgeServer::new(id.clone(), &self.config)?;
        server.start().await?;

        let adapter = match options.backend {
            Some(backend) => {
                let prompt = options.custom_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT);
                match self.spawn_adapter(backend, &id, prompt).await {
                    Ok(adapter) => Some(adapter),
                    Err(e) => {
                        tracing::error!(session_id = %id, %backend, "Pair agent failed to start: {e}");
                        if let Err(stop_err) = server.stop().await {
                            tracing::warn!(session_id = %id, "Broker cleanup failed: {stop_err}");
                        }
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };

        let info = SessionInfo {
            session_id: id.clone(),
            socket_path: server.socket_path().to_path_buf(),
            backend: options.backend,
        };
        tracing::info!(session_id = %id, backend = ?options.backend, "Pair session started");

        *active = Some(ActiveSession {
            id,
            server,
            adapter,
            started_at: Instant::now(),
        });
        Ok(info)
    }

    async fn spawn_adapter(
        &self,
        backend: Backend,
        session_id: &str,
        prompt: &str,
    ) -> Result<Box<dyn AgentAdapter>, AdapterError> {
        let adapter = self.registry.create(backend, &self.config)?;
        adapter.spawn(session_id, prompt).await?;
        Ok(adapter)
    }

    /// Stop the pair agent, then the broker.
    ///
    /// Pair agent failures are logged and do not prevent the broker from
    /// stopping. A socket file that cannot be removed is logged and reported
    /// in the summary; the session is over regardless.
    ///
    /// # Errors
    /// Returns error if no session is active.
    pub async fn stop_session(&self) -> Result<SessionSummary, ManagerError> {
        let session = self.active.lock().await.take().ok_or(ManagerError::NoActiveSession)?;
        let status = session.server.snapshot();

        if let Some(adapter) = &session.adapter {
            if let Err(e) = adapter.stop().await {
                tracing::warn!(session_id = %session.id, adapter = adapter.name(), "Pair agent stop failed: {e}");
            }
        }
        let socket_removed = match session.server.stop().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session_id = %session.id, "Broker cleanup failed: {e}");
                false
            }
        };

        let duration = session.started_at.elapsed();
        tracing::info!(session_id = %session.id, duration = ?duration, "Pair session stopped");
        Ok(SessionSummary {
            session_id: session.id,
            duration_secs: duration.as_secs(),
            status,
            socket_removed,
        })
    }

    pub async fn get_status(&self) -> SessionStatusReport {
        let active = self.active.lock().await;
        let Some(session) = active.as_ref() else {
            return SessionStatusReport::default();
        };
        SessionStatusReport {
            active: true,
            session_id: Some(session.id.clone()),
            backend: session.backend(),
            socket_path: Some(session.server.socket_path().to_path_buf()),
            uptime_secs: Some(session.started_at.elapsed().as_secs()),
            pair_running: session.adapter.as_ref().is_some_and(|a| a.is_running()),
            bridge: session.server.snapshot(),
        }
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|s| s.id.clone())
    }

    /// How long the active session has been running.
    pub async fn uptime(&self) -> Option<Duration> {
        self.active.lock().await.as_ref().map(|s| s.started_at.elapsed())
    }
}

fn new_session_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use async_trait::async_trait;
    use pair_bridge_core::ActivityEvent;
    use pair_bridge_transport::BridgeClient;
    use tempfile::TempDir;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        running: AtomicBool,
        stopped: AtomicBool,
        prompt: std::sync::Mutex<Option<String>>,
    }

    struct FakeAdapter {
        recorder: Arc<Recorder>,
        fail_spawn: bool,
        fail_stop: bool,
    }

    #[async_trait]
    impl AgentAdapter for FakeAdapter {
        fn name(&self) -> &'static str {
            "Fake"
        }

        fn backend(&self) -> Backend {
            Backend::Codex
        }

        async fn spawn(&self, _session_id: &str, system_prompt: &str) -> Result<(), AdapterError> {
            if self.fail_spawn {
                return Err(AdapterError::ExitedEarly("exit status: 1".into()));
            }
            *self.recorder.prompt.lock().unwrap() = Some(system_prompt.to_string());
            self.recorder.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), AdapterError> {
            self.recorder.running.store(false, Ordering::SeqCst);
            self.recorder.stopped.store(true, Ordering::SeqCst);
            if self.fail_stop {
                return Err(AdapterError::SpawnFailed("gone".into()));
            }
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.recorder.running.load(Ordering::SeqCst)
        }

        fn process_id(&self) -> Option<String> {
            self.is_running().then(|| "42".to_string())
        }
    }

    fn manager(dir: &TempDir, fail_spawn: bool, fail_stop: bool) -> (SessionManager, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut registry = AdapterRegistry::new();
        let shared = Arc::clone(&recorder);
        registry.register(Backend::Codex, move |_| {
            Box::new(FakeAdapter {
                recorder: Arc::clone(&shared),
                fail_spawn,
                fail_stop,
            })
        });
        let config = BridgeConfig::default().with_socket_dir(dir.path());
        (SessionManager::new(config, registry), recorder)
    }

    #[tokio::test]
    async fn test_broker_only_lifecycle() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = manager(&dir, false, false);
        assert!(!manager.get_status().await.active);

        let info = manager.start_session(SessionOptions::broker_only()).await.unwrap();
        assert_eq!(info.session_id.len(), 8);
        assert!(info.session_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(info.socket_path, dir.path().join(format!("claude-pair-{}.sock", info.session_id)));
        assert!(info.socket_path.exists());
        assert!(info.backend.is_none());

        let client = BridgeClient::new(&info.socket_path);
        client.emit_activity(&ActivityEvent::tool_call("Read", serde_json::Value::Null, "ok")).await.unwrap();

        let status = manager.get_status().await;
        assert!(status.active);
        assert_eq!(status.session_id.as_deref(), Some(info.session_id.as_str()));
        assert!(!status.pair_running);
        assert_eq!(status.bridge.unwrap().activity_count, 1);
        assert_eq!(manager.session_id().await, Some(info.session_id.clone()));

        let summary = manager.stop_session().await.unwrap();
        assert_eq!(summary.session_id, info.session_id);
        assert_eq!(summary.status.unwrap().activity_count, 1);
        assert!(summary.socket_removed);
        assert!(!info.socket_path.exists());
        assert!(!manager.is_active().await);
    }

    #[tokio::test]
    async fn test_double_start_and_idle_stop_rejected() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = manager(&dir, false, false);

        assert!(matches!(manager.stop_session().await, Err(ManagerError::NoActiveSession)));

        let info = manager.start_session(SessionOptions::broker_only()).await.unwrap();
        let err = manager.start_session(SessionOptions::broker_only()).await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyActive(id) if id == info.session_id));

        manager.stop_session().await.unwrap();
        assert!(matches!(manager.stop_session().await, Err(ManagerError::NoActiveSession)));
    }

    #[tokio::test]
    async fn test_adapter_receives_prompt_and_is_stopped() {
        let dir = TempDir::new().unwrap();
        let (manager, recorder) = manager(&dir, false, false);

        let info = manager
            .start_session(SessionOptions::with_backend(Backend::Codex).prompt("Only flag races."))
            .await
            .unwrap();
        assert_eq!(info.backend, Some(Backend::Codex));
        assert_eq!(recorder.prompt.lock().unwrap().as_deref(), Some("Only flag races."));

        let status = manager.get_status().await;
        assert!(status.pair_running);
        assert_eq!(status.backend, Some(Backend::Codex));

        manager.stop_session().await.unwrap();
        assert!(recorder.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_default_prompt_used() {
        let dir = TempDir::new().unwrap();
        let (manager, recorder) = manager(&dir, false, false);

        manager.start_session(SessionOptions::with_backend(Backend::Codex)).await.unwrap();
        assert_eq!(recorder.prompt.lock().unwrap().as_deref(), Some(DEFAULT_SYSTEM_PROMPT));
        manager.stop_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_spawn_leaves_no_socket() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = manager(&dir, true, false);

        let err = manager
            .start_session(SessionOptions::with_backend(Backend::Codex))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Adapter(AdapterError::ExitedEarly(_))));
        assert!(!manager.is_active().await);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_adapter_stop_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let (manager, recorder) = manager(&dir, false, true);

        let info = manager
            .start_session(SessionOptions::with_backend(Backend::Codex))
            .await
            .unwrap();
        manager.stop_session().await.unwrap();
        assert!(recorder.stopped.load(Ordering::SeqCst));
        assert!(!info.socket_path.exists());
    }

    #[tokio::test]
    async fn test_cleanup_failure_still_ends_session() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = manager(&dir, false, false);
        let info = manager.start_session(SessionOptions::broker_only()).await.unwrap();

        // a directory where the socket file was cannot be removed as a file
        std::fs::remove_file(&info.socket_path).unwrap();
        std::fs::create_dir(&info.socket_path).unwrap();

        let summary = manager.stop_session().await.unwrap();
        assert_eq!(summary.session_id, info.session_id);
        assert!(!summary.socket_removed);
        assert!(summary.status.is_some());
        assert!(!manager.is_active().await);
    }

    #[tokio::test]
    async fn test_unregistered_backend() {
        let dir = TempDir::new().unwrap();
        let config = BridgeConfig::default().with_socket_dir(dir.path());
        let manager = SessionManager::new(config, AdapterRegistry::empty());

        let err = manager.start_session(SessionOptions::default()).await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Adapter(AdapterError::NotRegistered(Backend::ClaudeOpus))
        ));
        assert!(!manager.is_active().await);
    }
}
