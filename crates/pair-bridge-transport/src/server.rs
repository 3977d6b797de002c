//! Broker server: owns the session socket and its lifecycle.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use pair_bridge_core::{BridgeConfig, BridgeStatus, ConfigError, SessionState, config::validate_session_id};
use thiserror::Error;
use tokio::{net::UnixListener, sync::watch, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::connection::{ConnectionContext, handle_connection};

/// Broker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

/// Broker error.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Broker already running on {0}")]
    AlreadyRunning(PathBuf),
    #[error("Failed to prepare socket path {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to remove socket file {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

struct Running {
    cancel: CancellationToken,
    connections: TaskTracker,
    accept_task: JoinHandle<()>,
}

struct Inner {
    session_id: String,
    socket_path: PathBuf,
    max_history: Option<usize>,
    shutdown_grace: Duration,
    state: watch::Sender<BrokerState>,
    session: Mutex<Option<Arc<SessionState>>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
            if let Some(session) = self
                .session
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                session.close();
            }
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                tracing::debug!(path = %self.socket_path.display(), "Socket cleanup on drop failed: {e}");
            }
        }
    }
}

/// Bridge broker for one session.
///
/// Cheap to clone; clones share the same socket and session.
#[derive(Clone)]
pub struct BridgeServer {
    inner: Arc<Inner>,
}

impl BridgeServer {
    /// Create a stopped broker for `session_id`.
    ///
    /// # Errors
    /// Returns error if the session id cannot be used in a socket path.
    pub fn new(session_id: impl Into<String>, config: &BridgeConfig) -> Result<Self, BrokerError> {
        let session_id = session_id.into();
        validate_session_id(&session_id)?;
        let (state, _) = watch::channel(BrokerState::Stopped);

        Ok(Self {
            inner: Arc::new(Inner {
                socket_path: config.socket_path(&session_id),
                session_id,
                max_history: config.max_history,
                shutdown_grace: config.shutdown_grace,
                state,
                session: Mutex::new(None),
                running: tokio::sync::Mutex::new(None),
            }),
        })
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.inner.socket_path
    }

    #[must_use]
    pub fn state(&self) -> BrokerState {
        *self.inner.state.borrow()
    }

    /// Session state while listening.
    #[must_use]
    pub fn session(&self) -> Option<Arc<SessionState>> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the live session, if listening.
    #[must_use]
    pub fn snapshot(&self) -> Option<BridgeStatus> {
        self.session().map(|s| s.snapshot())
    }

    /// Resolves once the broker is stopped. Returns immediately if it is
    /// already stopped, so call it after `start`.
    pub async fn stopped(&self) {
        let mut rx = self.inner.state.subscribe();
        // the sender lives in `inner`, which `self` keeps alive
        let _ = rx.wait_for(|state| *state == BrokerState::Stopped).await;
    }

    fn set_state(&self, state: BrokerState) {
        self.inner.state.send_replace(state);
    }

    /// Bind the socket and start accepting connections.
    ///
    /// A stale socket file from an earlier instance is removed first. Each
    /// start begins with an empty session.
    ///
    /// # Errors
    /// Returns error if the broker is already running or the socket cannot
    /// be bound.
    pub async fn start(&self) -> Result<(), BrokerError> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Err(BrokerError::AlreadyRunning(self.inner.socket_path.clone()));
        }

        self.set_state(BrokerState::Starting);
        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(e) => {
                self.set_state(BrokerState::Stopped);
                return Err(e);
            }
        };

        let session = Arc::new(SessionState::new(
            self.inner.session_id.clone(),
            self.inner.max_history,
        ));
        *self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));

        let cancel = CancellationToken::new();
        let connections = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            session,
            StopHandle(Arc::downgrade(&self.inner)),
            cancel.clone(),
            connections.clone(),
        ));

        *running = Some(Running {
            cancel,
            connections,
            accept_task,
        });
        self.set_state(BrokerState::Listening);

        tracing::info!(
            session_id = %self.inner.session_id,
            path = %self.inner.socket_path.display(),
            "Bridge listening"
        );
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener, BrokerError> {
        let path = &self.inner.socket_path;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| BrokerError::Prepare {
                path: path.clone(),
                source,
            })?;
        }

        match std::fs::remove_file(path) {
            Ok(()) => tracing::warn!(path = %path.display(), "Removed stale socket file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(BrokerError::Prepare {
                    path: path.clone(),
                    source,
                });
            }
        }

        UnixListener::bind(path).map_err(|source| BrokerError::Bind {
            path: path.clone(),
            source,
        })
    }

    /// Stop the broker.
    ///
    /// Every waiter receives a stop event, open connections get up to the
    /// configured grace period to finish, then the listener is closed and
    /// the socket file removed. Stopping a stopped broker is a no-op.
    ///
    /// # Errors
    /// Returns error if the socket file cannot be removed.
    pub async fn stop(&self) -> Result<(), BrokerError> {
        let mut running = self.inner.running.lock().await;
        let Some(Running {
            cancel,
            connections,
            accept_task,
        }) = running.take()
        else {
            return Ok(());
        };

        self.set_state(BrokerState::Stopping);

        let session = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let notified = session.as_ref().map_or(0, |s| s.close());

        cancel.cancel();
        if let Err(e) = accept_task.await {
            tracing::warn!("Accept loop ended abnormally: {e}");
        }

        connections.close();
        if tokio::time::timeout(self.inner.shutdown_grace, connections.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                session_id = %self.inner.session_id,
                open = connections.len(),
                "Connections still open after shutdown grace period"
            );
        }

        let removed = match std::fs::remove_file(&self.inner.socket_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BrokerError::Cleanup {
                path: self.inner.socket_path.clone(),
                source,
            }),
        };

        self.set_state(BrokerState::Stopped);
        tracing::info!(session_id = %self.inner.session_id, notified, "Bridge stopped");
        removed
    }
}

/// Lets a connection stop its broker without keeping it alive.
#[derive(Clone)]
pub(crate) struct StopHandle(Weak<Inner>);

impl StopHandle {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self(Weak::new())
    }

    /// Stop the broker in the background so the caller can finish writing.
    pub(crate) fn request_stop(&self) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        let server = BridgeServer { inner };
        tokio::spawn(async move {
            if let Err(e) = server.stop().await {
                tracing::error!(session_id = %server.session_id(), "Failed to stop bridge: {e}");
            }
        });
    }
}

async fn accept_loop(
    listener: UnixListener,
    session: Arc<SessionState>,
    stop: StopHandle,
    cancel: CancellationToken,
    connections: TaskTracker,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let ctx = ConnectionContext {
                        session: Arc::clone(&session),
                        cancel: cancel.clone(),
                        stop: stop.clone(),
                    };
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, ctx).await {
                            tracing::warn!("Connection error: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(session_id = %session.id(), "Accept error: {e}");
                    // avoid a hot loop on persistent accept failures
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    tracing::debug!(session_id = %session.id(), "Accept loop stopped");
}
