//! Standalone pair bridge broker.
//!
//! Run with: cargo run -p bridge-server
//!
//! Serves the session named by `CLAUDE_SESSION_ID` (or `SESSION_ID`) until a
//! client sends `stop` or the process receives SIGINT/SIGTERM.

use anyhow::Context;
use pair_bridge_core::BridgeConfig;
use pair_bridge_transport::BridgeServer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_SESSION_ID: &str = "default";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = BridgeConfig::from_env().context("invalid bridge configuration")?;
    let session_id = std::env::var("CLAUDE_SESSION_ID")
        .or_else(|_| std::env::var("SESSION_ID"))
        .unwrap_or_else(|_| DEFAULT_SESSION_ID.to_string());

    let server = BridgeServer::new(session_id, &config)?;
    server
        .start()
        .await
        .with_context(|| format!("failed to start broker on {}", server.socket_path().display()))?;
    tracing::info!(path = %server.socket_path().display(), "Pair bridge listening");

    tokio::select! {
        () = server.stopped() => {
            tracing::info!("Stopped by client");
        }
        () = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
        }
    }

    server.stop().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
