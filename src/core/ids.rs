//! Match and participant identifiers.
//!
//! Both are issued outside this crate (the persistence layer assigns match
//! ids, the auth layer assigns user ids) and are carried through the hub
//! as plain integers on the wire.

use std::fmt;
use serde::{Serialize, Deserialize};

// =============================================================================
// MATCH ID
// =============================================================================

/// Identifier of a live match.
///
/// Implements Ord for BTreeMap ordering in the room registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(pub i64);

impl MatchId {
    /// Create from a raw id.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw id.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// PARTICIPANT ID
// =============================================================================

/// Identifier of an authenticated user taking part in a match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub i64);

impl ParticipantId {
    /// Create from a raw id.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw id.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_bare_integers() {
        assert_eq!(serde_json::to_string(&MatchId::new(42)).unwrap(), "42");
        let id: ParticipantId = serde_json::from_str("7").unwrap();
        assert_eq!(id, ParticipantId::new(7));
    }

    #[test]
    fn test_display() {
        assert_eq!(MatchId::new(-3).to_string(), "-3");
        assert_eq!(ParticipantId::new(9).to_string(), "9");
    }
}
