//! Match Relay Server
//!
//! Serves `/ws/game/{gameId}?token=...` and keeps match state in a
//! file-backed session store.

use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use match_relay::{
    network::{AuthConfig, GameServer, Hub, ServerConfig, TokenVerifier},
    FileSessionStore, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Match Relay v{}", VERSION);

    let config = ServerConfig::from_env()?;
    let verifier = match TokenVerifier::new(&AuthConfig::from_env()) {
        Ok(verifier) => verifier,
        Err(e) => bail!("cannot verify session tokens: {e} (set JWT_SECRET)"),
    };

    let store = FileSessionStore::open(&config.state_dir)
        .await
        .with_context(|| format!("opening state dir {}", config.state_dir.display()))?;
    info!("State directory: {}", config.state_dir.display());

    let (hub, hub_task) = Hub::spawn(Arc::new(store), config.hub.clone());
    let server = Arc::new(GameServer::new(config, hub, verifier));

    let runner = server.clone();
    let mut serving = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for ctrl-c")?;
            info!("Interrupted, shutting down");
            server.shutdown();
            serving.await??;
        }
        result = &mut serving => {
            // Server exited on its own (bind failure).
            result??;
        }
    }

    hub_task.await?;
    info!("Server stopped");
    Ok(())
}
