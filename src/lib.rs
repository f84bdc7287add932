//! # Match Relay
//!
//! Real-time session hub for turn-based matches. Players connect over
//! WebSocket, moves are validated against whose turn it is, persisted, and
//! fanned out to everyone watching the same match.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       MATCH RELAY                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/            - Shared value types                       │
//! │  ├── ids.rs       - Match and participant ids                │
//! │  └── state.rs     - Opaque match state + move application    │
//! │                                                              │
//! │  store/           - Durable state (one blob per match)       │
//! │  ├── file.rs      - JSON file per match                      │
//! │  └── memory.rs    - In-process map                           │
//! │                                                              │
//! │  network/         - Live sessions                            │
//! │  ├── server.rs    - Upgrade + auth                           │
//! │  ├── connection.rs- Reader/writer pumps                      │
//! │  ├── room.rs      - Members + cached state per match         │
//! │  ├── hub.rs       - Room registry and control loop           │
//! │  ├── protocol.rs  - Wire envelopes                           │
//! │  └── auth.rs      - JWT validation                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering
//!
//! - A connection is registered before its reader starts, so its first
//!   frames are always `connected` then the current `game_state`.
//! - Moves for one match are serialized by the room lock: store write,
//!   then in-memory commit, then broadcast.
//! - Each connection's outbound queue is bounded; a consumer that falls
//!   behind is disconnected instead of stalling the room.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use core::{MatchId, MatchState, ParticipantId};
pub use network::{Hub, HubConfig, HubError, HubHandle, GameServer, ServerConfig};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, StoreError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
