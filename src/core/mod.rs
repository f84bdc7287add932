//! Core types shared by the store and network layers.

pub mod ids;
pub mod state;

// Re-export core types
pub use ids::{MatchId, ParticipantId};
pub use state::MatchState;
