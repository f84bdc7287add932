//! Network Layer
//!
//! WebSocket upgrade, per-connection pumps, rooms and the hub that owns
//! them. State persistence sits behind [`crate::store::SessionStore`].

pub mod auth;
pub mod connection;
pub mod hub;
pub mod protocol;
pub mod room;
pub mod server;

pub use auth::{AuthConfig, AuthError, SessionClaims, TokenVerifier};
pub use connection::{serve_connection, Connection, ConnectionId, ConnectionKey, EnqueueError};
pub use hub::{Hub, HubConfig, HubError, HubHandle, HubStatsSnapshot};
pub use protocol::{ClientEvent, Envelope, EventType, ProtocolError};
pub use room::{MoveOutcome, Room};
pub use server::{GameServer, GameServerError, ServerConfig, UpgradeRejection};
