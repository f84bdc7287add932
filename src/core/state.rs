//! Match State
//!
//! The authoritative state of a match is an opaque JSON object owned by the
//! clients' game rules. The hub only ever reads `currentPlayer` and writes
//! `lastMove` / `lastMoveBy`; every other key passes through untouched.

use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};

use super::ids::ParticipantId;

/// Key holding the participant whose turn it is.
pub const CURRENT_PLAYER_KEY: &str = "currentPlayer";
/// Key receiving the payload of the last accepted move.
pub const LAST_MOVE_KEY: &str = "lastMove";
/// Key receiving the participant who made the last accepted move.
pub const LAST_MOVE_BY_KEY: &str = "lastMoveBy";

/// Opaque match state (a JSON object).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchState(Map<String, Value>);

impl MatchState {
    /// Wrap an existing JSON object.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Decode a stored blob.
    ///
    /// Returns `None` for anything that is not a JSON object, including
    /// `null`, so callers treat corrupt rows the same as missing ones.
    pub fn from_blob(blob: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Value>(blob) {
            Ok(Value::Object(fields)) => Some(Self(fields)),
            _ => None,
        }
    }

    /// Encode for the session store.
    pub fn to_blob(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.0)
    }

    /// Participant whose turn it is.
    ///
    /// Only JSON numbers count; fractional values truncate toward zero.
    pub fn current_player(&self) -> Option<ParticipantId> {
        let value = self.0.get(CURRENT_PLAYER_KEY)?;
        let raw = match value.as_i64() {
            Some(n) => n,
            None => value.as_f64().filter(|f| f.is_finite())?.trunc() as i64,
        };
        Some(ParticipantId::new(raw))
    }

    /// Whether `participant` may move next.
    pub fn is_turn_of(&self, participant: ParticipantId) -> bool {
        self.current_player() == Some(participant)
    }

    /// Copy of this state with the move recorded.
    ///
    /// No turn advancement or scoring happens here; that belongs to the
    /// payload the mover sends.
    pub fn with_move(&self, participant: ParticipantId, payload: Value) -> Self {
        let mut next = self.0.clone();
        next.insert(LAST_MOVE_KEY.to_string(), payload);
        next.insert(LAST_MOVE_BY_KEY.to_string(), Value::from(participant.get()));
        Self(next)
    }

    /// Look up a raw field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Convert into a JSON value for an envelope payload.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for MatchState {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> MatchState {
        match value {
            Value::Object(fields) => MatchState::new(fields),
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_from_blob_accepts_objects_only() {
        assert!(MatchState::from_blob(br#"{"currentPlayer":7,"round":1}"#).is_some());
        assert!(MatchState::from_blob(b"null").is_none());
        assert!(MatchState::from_blob(b"[1,2]").is_none());
        assert!(MatchState::from_blob(b"{not json").is_none());
        assert!(MatchState::from_blob(b"").is_none());
    }

    #[test]
    fn test_current_player_parsing() {
        assert_eq!(state(json!({"currentPlayer": 7})).current_player(), Some(ParticipantId::new(7)));
        assert_eq!(state(json!({"currentPlayer": 7.9})).current_player(), Some(ParticipantId::new(7)));
        assert_eq!(state(json!({"currentPlayer": "7"})).current_player(), None);
        assert_eq!(state(json!({"currentPlayer": null})).current_player(), None);
        assert_eq!(state(json!({"round": 1})).current_player(), None);
    }

    #[test]
    fn test_with_move_keeps_other_fields() {
        let before = state(json!({"currentPlayer": 7, "round": 1}));
        let after = before.with_move(ParticipantId::new(7), json!({"card": "X"}));

        assert_eq!(after.get("round"), Some(&json!(1)));
        assert_eq!(after.get(LAST_MOVE_KEY), Some(&json!({"card": "X"})));
        assert_eq!(after.get(LAST_MOVE_BY_KEY), Some(&json!(7)));
        // Original untouched
        assert!(before.get(LAST_MOVE_KEY).is_none());
    }

    #[test]
    fn test_blob_roundtrip_preserves_state() {
        let original = state(json!({"currentPlayer": 9, "board": {"rows": [[1], [2]]}}));
        let blob = original.to_blob().unwrap();
        assert_eq!(MatchState::from_blob(&blob), Some(original));
    }
}
