//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON envelope `{type, game_id, user_id, payload}`;
//! the payload is opaque match data the hub never interprets beyond
//! `currentPlayer`.

use serde::{Serialize, Deserialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::{MatchId, MatchState, ParticipantId};

/// Payload text of the `connected` acknowledgement.
pub const CONNECTED_MESSAGE: &str = "Connected to game";

// =============================================================================
// ENVELOPE
// =============================================================================

/// Event types exchanged over a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Server -> client: registration acknowledged.
    Connected,
    /// Server -> client: full state snapshot.
    GameState,
    /// Server -> client: state after an accepted move.
    GameUpdate,
    /// Client -> server: a move by the sender.
    Move,
    /// Client -> server: ask for a `game_state` snapshot.
    GameStateRequest,
}

/// Message wrapper for every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventType,
    /// Match the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<MatchId>,
    /// Participant the event originates from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<ParticipantId>,
    /// Event data.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    /// Acknowledgement pushed right after registration.
    pub fn connected() -> Self {
        Self {
            kind: EventType::Connected,
            game_id: None,
            user_id: None,
            payload: json!({ "message": CONNECTED_MESSAGE }),
        }
    }

    /// Snapshot of the current state.
    pub fn game_state(match_id: MatchId, state: &MatchState) -> Self {
        Self {
            kind: EventType::GameState,
            game_id: Some(match_id),
            user_id: None,
            payload: state.to_value(),
        }
    }

    /// State after `mover`'s move was applied.
    pub fn game_update(match_id: MatchId, mover: ParticipantId, state: &MatchState) -> Self {
        Self {
            kind: EventType::GameUpdate,
            game_id: Some(match_id),
            user_id: Some(mover),
            payload: state.to_value(),
        }
    }

    /// A move as a client would send it.
    pub fn player_move(match_id: MatchId, payload: Value) -> Self {
        Self {
            kind: EventType::Move,
            game_id: Some(match_id),
            user_id: None,
            payload,
        }
    }

    /// A snapshot request as a client would send it.
    pub fn state_request(match_id: MatchId) -> Self {
        Self {
            kind: EventType::GameStateRequest,
            game_id: Some(match_id),
            user_id: None,
            payload: Value::Null,
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// CLIENT -> SERVER EVENTS
// =============================================================================

/// Inbound events the hub acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Apply a move. Payload is an object or null.
    Move {
        /// Move data recorded as `lastMove`.
        payload: Value,
    },
    /// Reply with the current state.
    StateRequest,
}

/// Reasons an inbound frame is ignored.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not a JSON envelope.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Valid envelope of a server-only type.
    #[error("unsupported inbound event: {0:?}")]
    Unsupported(EventType),

    /// Payload is neither an object nor null.
    #[error("payload must be an object")]
    InvalidPayload,
}

impl ClientEvent {
    /// Decode an inbound text frame.
    ///
    /// `game_id` and `user_id` sent by the client are ignored; the
    /// connection's own identity is authoritative.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope = Envelope::from_json(text)?;
        if !matches!(envelope.payload, Value::Object(_) | Value::Null) {
            return Err(ProtocolError::InvalidPayload);
        }

        match envelope.kind {
            EventType::Move => Ok(ClientEvent::Move { payload: envelope.payload }),
            EventType::GameStateRequest => Ok(ClientEvent::StateRequest),
            other => Err(ProtocolError::Unsupported(other)),
        }
    }
}
