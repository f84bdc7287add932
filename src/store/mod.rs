//! Session Store
//!
//! Durable keeper of each match's last-known state blob. The hub treats the
//! blob as opaque bytes on this side of the boundary; decoding happens in
//! [`MatchState::from_blob`](crate::core::MatchState::from_blob).

pub mod file;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::MatchId;

pub use file::FileSessionStore;
pub use memory::MemorySessionStore;

/// Session store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failed.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend-specific failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// One row per match holding the latest serialized state.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the stored blob. `Ok(None)` means no row exists.
    async fn load(&self, match_id: MatchId) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the stored blob.
    async fn save(&self, match_id: MatchId, blob: &[u8]) -> Result<(), StoreError>;
}
