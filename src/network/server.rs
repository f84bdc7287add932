//! WebSocket Game Server
//!
//! Accepts TCP connections, performs the WebSocket upgrade on
//! `/ws/game/{gameId}?token=...`, authenticates the token, and hands the
//! socket to the hub. Everything after the upgrade lives in
//! [`connection`](crate::network::connection).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tracing::{debug, error, info, instrument, warn};

use crate::core::{MatchId, ParticipantId};
use crate::network::auth::TokenVerifier;
use crate::network::connection::serve_connection;
use crate::network::hub::{HubConfig, HubError, HubHandle};

/// Path prefix of the upgrade endpoint.
pub const UPGRADE_PATH_PREFIX: &str = "/ws/game/";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Directory for the file-backed session store.
    pub state_dir: PathBuf,
    /// Hub settings.
    pub hub: HubConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            state_dir: PathBuf::from("./match-state"),
            hub: HubConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    ///
    /// `BIND_ADDR` wins over `PORT`; `MAX_CONNECTIONS`, `STATE_DIR` and
    /// `OUTBOUND_CAPACITY` override the defaults.
    pub fn from_env() -> Result<Self, GameServerError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDR") {
            config.bind_addr = addr
                .parse()
                .map_err(|_| GameServerError::Config(format!("invalid BIND_ADDR: {addr}")))?;
        } else if let Ok(port) = std::env::var("PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| GameServerError::Config(format!("invalid PORT: {port}")))?;
            config.bind_addr.set_port(port);
        }

        if let Ok(max) = std::env::var("MAX_CONNECTIONS") {
            config.max_connections = max
                .parse()
                .map_err(|_| GameServerError::Config(format!("invalid MAX_CONNECTIONS: {max}")))?;
        }
        if let Ok(dir) = std::env::var("STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Ok(capacity) = std::env::var("OUTBOUND_CAPACITY") {
            config.hub.outbound_capacity = capacity
                .parse()
                .map_err(|_| GameServerError::Config(format!("invalid OUTBOUND_CAPACITY: {capacity}")))?;
        }

        Ok(config)
    }
}

/// Game server errors.
#[derive(Debug, Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Hub error.
    #[error("Hub error: {0}")]
    Hub(#[from] HubError),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

// =============================================================================
// UPGRADE HANDSHAKE
// =============================================================================

/// Why an upgrade request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeRejection {
    /// Path is not the game endpoint.
    #[error("Not found")]
    NotFound,
    /// Game id segment is not an integer.
    #[error("Invalid game ID")]
    InvalidMatchId,
    /// No `token` query parameter.
    #[error("Token required")]
    MissingToken,
    /// Token failed validation.
    #[error("Invalid token")]
    InvalidToken,
}

impl UpgradeRejection {
    /// HTTP status sent back.
    pub fn status(&self) -> StatusCode {
        match self {
            UpgradeRejection::NotFound => StatusCode::NOT_FOUND,
            UpgradeRejection::InvalidMatchId => StatusCode::BAD_REQUEST,
            UpgradeRejection::MissingToken | UpgradeRejection::InvalidToken => StatusCode::UNAUTHORIZED,
        }
    }

    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = self.status();
        response
    }
}

/// Authenticated target of an upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeTarget {
    /// Match to join.
    pub match_id: MatchId,
    /// Authenticated participant.
    pub participant_id: ParticipantId,
}

/// Extract the match id and token from an upgrade URI.
pub fn parse_upgrade_uri(uri: &Uri) -> Result<(MatchId, Option<String>), UpgradeRejection> {
    let segment = uri
        .path()
        .strip_prefix(UPGRADE_PATH_PREFIX)
        .ok_or(UpgradeRejection::NotFound)?;
    if segment.is_empty() || segment.contains('/') {
        return Err(UpgradeRejection::NotFound);
    }

    let match_id = segment
        .parse::<i64>()
        .map(MatchId::new)
        .map_err(|_| UpgradeRejection::InvalidMatchId)?;

    let token = uri
        .query()
        .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("token=")))
        .filter(|t| !t.is_empty())
        .map(str::to_owned);

    Ok((match_id, token))
}

/// Check an upgrade request and resolve who is joining which match.
pub fn authorize_upgrade(uri: &Uri, verifier: &TokenVerifier) -> Result<UpgradeTarget, UpgradeRejection> {
    let (match_id, token) = parse_upgrade_uri(uri)?;
    let token = token.ok_or(UpgradeRejection::MissingToken)?;

    let participant_id = verifier.authenticate(&token).map_err(|e| {
        debug!(match_id = %match_id, error = %e, "rejected token");
        UpgradeRejection::InvalidToken
    })?;

    Ok(UpgradeTarget { match_id, participant_id })
}

// =============================================================================
// SERVER
// =============================================================================

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Session hub.
    hub: HubHandle,
    /// Session token checks.
    verifier: Arc<TokenVerifier>,
    /// Connections currently being served.
    active: Arc<AtomicUsize>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server around a running hub.
    pub fn new(config: ServerConfig, hub: HubHandle, verifier: TokenVerifier) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            hub,
            verifier: Arc::new(verifier),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Bind the configured address and run the server.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.active.load(Ordering::Relaxed) >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Closes every queue so clients get a Close frame.
        self.hub.shutdown().await;
        Ok(())
    }

    /// Upgrade and serve one connection on its own task.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let hub = self.hub.clone();
        let verifier = self.verifier.clone();
        let active = self.active.clone();
        let capacity = self.config.hub.outbound_capacity;

        active.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let mut target = None;
            let callback = |request: &Request, response: Response| {
                match authorize_upgrade(request.uri(), &verifier) {
                    Ok(t) => {
                        target = Some(t);
                        Ok(response)
                    }
                    Err(rejection) => {
                        debug!("Rejected upgrade from {}: {}", addr, rejection);
                        Err(rejection.into_response())
                    }
                }
            };

            let handshake = accept_hdr_async(stream, callback).await;
            match (handshake, target) {
                (Ok(ws), Some(UpgradeTarget { match_id, participant_id })) => {
                    info!(match_id = %match_id, participant = %participant_id, "client {} joined", addr);
                    if let Err(e) = serve_connection(ws, hub, participant_id, match_id, capacity).await {
                        warn!(match_id = %match_id, participant = %participant_id, error = %e, "connection not served");
                    }
                }
                (Ok(_), None) => {}
                (Err(e), _) => debug!("WebSocket handshake failed for {}: {}", addr, e),
            }

            active.fetch_sub(1, Ordering::Relaxed);
            debug!("Client {} cleaned up", addr);
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// The hub this server feeds.
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }
}
