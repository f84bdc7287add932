//! Match Rooms
//!
//! A room is the authoritative in-memory copy of one match plus the
//! connections currently attached to it. Members and state sit behind one
//! async mutex so a move is checked, persisted and broadcast against the
//! state it was validated on.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::{MatchId, MatchState, ParticipantId};
use crate::network::connection::{Connection, ConnectionKey};
use crate::network::hub::{HubError, HubStats};
use crate::network::protocol::Envelope;
use crate::store::SessionStore;

/// Result of a move that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Recorded, persisted and broadcast to `recipients` members.
    Applied {
        /// Members the update was queued for.
        recipients: usize,
    },
    /// No room is registered for the match.
    UnknownRoom,
    /// The room has no usable state.
    NoState,
    /// Sender is not `currentPlayer` (or it is unset).
    NotYourTurn,
}

/// Result of attaching a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attached {
    /// Connection that was displaced for the same participant.
    pub replaced: Option<ConnectionKey>,
    /// Whether the `game_state` snapshot was pushed.
    pub sent_state: bool,
}

struct RoomInner {
    members: BTreeMap<ParticipantId, Connection>,
    state: Option<MatchState>,
}

/// One live match.
pub struct Room {
    id: MatchId,
    inner: Mutex<RoomInner>,
    stats: Arc<HubStats>,
}

impl Room {
    /// Create an empty room with hydrated (or absent) state.
    pub(crate) fn new(id: MatchId, state: Option<MatchState>, stats: Arc<HubStats>) -> Self {
        Self {
            id,
            inner: Mutex::new(RoomInner {
                members: BTreeMap::new(),
                state,
            }),
            stats,
        }
    }

    /// Match id.
    pub fn id(&self) -> MatchId {
        self.id
    }

    /// Number of attached connections.
    pub async fn member_count(&self) -> usize {
        self.inner.lock().await.members.len()
    }

    /// Participants currently attached.
    pub async fn participants(&self) -> Vec<ParticipantId> {
        self.inner.lock().await.members.keys().copied().collect()
    }

    /// Copy of the current state.
    pub async fn state(&self) -> Option<MatchState> {
        self.inner.lock().await.state.clone()
    }

    /// Insert a connection and push `connected` (+ `game_state`) to it.
    ///
    /// A previous connection of the same participant is dropped, which
    /// closes its queue.
    pub(crate) async fn attach(&self, connection: Connection) -> Result<Attached, HubError> {
        let connected = Envelope::connected().to_json()?;

        let mut inner = self.inner.lock().await;
        let snapshot = match &inner.state {
            Some(state) => Some(Envelope::game_state(self.id, state).to_json()?),
            None => None,
        };

        let participant = connection.participant_id();
        let replaced = inner.members.insert(participant, connection).map(|old| old.key());
        if let Some(old) = replaced {
            self.stats.record_replaced();
            warn!(match_id = %self.id, participant = %participant, replaced = %old, "participant reconnected, closing previous connection");
        }

        let mut sent_state = false;
        if self.deliver(&mut inner, participant, connected) {
            if let Some(snapshot) = snapshot {
                sent_state = self.deliver(&mut inner, participant, snapshot);
            }
        }

        Ok(Attached { replaced, sent_state })
    }

    /// Remove `key` if it is still the registered connection for its
    /// participant. Returns `(removed, now_empty)`.
    pub(crate) async fn detach(&self, key: ConnectionKey) -> (bool, bool) {
        let mut inner = self.inner.lock().await;
        let current = inner.members.get(&key.participant_id).map(|c| c.key().id);

        let removed = current == Some(key.id);
        if removed {
            inner.members.remove(&key.participant_id);
        }
        (removed, inner.members.is_empty())
    }

    /// Close every member's queue.
    pub(crate) async fn close_all(&self) {
        self.inner.lock().await.members.clear();
    }

    /// Apply a move from `participant`.
    ///
    /// The only rule enforced is that the sender matches `currentPlayer`.
    /// On success the new state is persisted before it is committed and
    /// broadcast; if persisting fails the room keeps its previous state.
    pub async fn apply_move(
        &self,
        participant: ParticipantId,
        payload: Value,
        store: &dyn SessionStore,
    ) -> Result<MoveOutcome, HubError> {
        let mut inner = self.inner.lock().await;

        if inner.state.is_none() {
            let blob = store
                .load(self.id)
                .await?
                .ok_or(HubError::StateUnavailable(self.id))?;
            inner.state = MatchState::from_blob(&blob);
        }

        let Some(state) = inner.state.as_ref() else {
            return Ok(MoveOutcome::NoState);
        };
        if !state.is_turn_of(participant) {
            debug!(match_id = %self.id, participant = %participant, "ignoring out-of-turn move");
            return Ok(MoveOutcome::NotYourTurn);
        }

        let next = state.with_move(participant, payload);
        let blob = next.to_blob()?;
        let update = Envelope::game_update(self.id, participant, &next).to_json()?;

        store.save(self.id, &blob).await?;
        inner.state = Some(next);

        let recipients = self.deliver_all(&mut inner, &update);
        Ok(MoveOutcome::Applied { recipients })
    }

    /// Send an envelope to every member. Returns how many accepted it.
    pub async fn broadcast(&self, envelope: &Envelope) -> Result<usize, HubError> {
        let text = envelope.to_json()?;
        let mut inner = self.inner.lock().await;
        Ok(self.deliver_all(&mut inner, &text))
    }

    /// Push a `game_state` snapshot to `key` if it is still attached and
    /// there is state to send.
    pub(crate) async fn send_state_to(&self, key: ConnectionKey) -> Result<bool, HubError> {
        let mut inner = self.inner.lock().await;
        let attached = inner
            .members
            .get(&key.participant_id)
            .is_some_and(|c| c.key().id == key.id);
        if !attached {
            return Ok(false);
        }

        let Some(state) = inner.state.as_ref() else {
            return Ok(false);
        };
        let snapshot = Envelope::game_state(self.id, state).to_json()?;
        Ok(self.deliver(&mut inner, key.participant_id, snapshot))
    }

    fn deliver_all(&self, inner: &mut RoomInner, text: &str) -> usize {
        let participants: Vec<ParticipantId> = inner.members.keys().copied().collect();
        let mut delivered = 0;
        for participant in participants {
            if self.deliver(inner, participant, text.to_owned()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Queue `text` for one member. A member whose queue is full or closed
    /// is removed and cancelled so its socket is torn down.
    fn deliver(&self, inner: &mut RoomInner, participant: ParticipantId, text: String) -> bool {
        let Some(connection) = inner.members.get(&participant) else {
            return false;
        };

        match connection.try_enqueue(text) {
            Ok(()) => true,
            Err(reason) => {
                let capacity = connection.capacity();
                let key = connection.key();
                if let Some(dropped) = inner.members.remove(&participant) {
                    dropped.disconnect();
                }
                self.stats.record_slow_consumer();
                warn!(
                    match_id = %self.id,
                    participant = %participant,
                    connection = %key,
                    capacity,
                    ?reason,
                    "outbound queue unavailable, disconnecting member"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::store::{MemorySessionStore, StoreError};

    const MATCH: MatchId = MatchId::new(42);
    const P7: ParticipantId = ParticipantId::new(7);
    const P9: ParticipantId = ParticipantId::new(9);

    fn state(value: Value) -> MatchState {
        match value {
            Value::Object(fields) => MatchState::new(fields),
            other => panic!("not an object: {other}"),
        }
    }

    fn room_with(value: Option<Value>) -> Room {
        Room::new(MATCH, value.map(state), Arc::new(HubStats::default()))
    }

    fn drain(queue: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = queue.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    /// Store whose saves always fail.
    struct FailingStore;

    #[async_trait::async_trait]
    impl SessionStore for FailingStore {
        async fn load(&self, _: MatchId) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }

        async fn save(&self, _: MatchId, _: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
    }

    #[tokio::test]
    async fn test_attach_pushes_connected_then_state() {
        let room = room_with(Some(json!({"currentPlayer": 7, "round": 1})));
        let (conn, mut queue) = Connection::new(P7, MATCH, 8);

        let attached = room.attach(conn).await.unwrap();
        assert!(attached.sent_state);
        assert!(attached.replaced.is_none());

        let msgs = drain(&mut queue);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["type"], "connected");
        assert_eq!(msgs[1]["type"], "game_state");
        assert_eq!(msgs[1]["payload"], json!({"currentPlayer": 7, "round": 1}));
    }

    #[tokio::test]
    async fn test_attach_without_state_only_acknowledges() {
        let room = room_with(None);
        let (conn, mut queue) = Connection::new(P7, MATCH, 8);

        let attached = room.attach(conn).await.unwrap();
        assert!(!attached.sent_state);
        assert_eq!(drain(&mut queue).len(), 1);
    }

    #[tokio::test]
    async fn test_reattach_closes_previous_queue() {
        let room = room_with(Some(json!({"currentPlayer": 7})));
        let (first, mut first_queue) = Connection::new(P7, MATCH, 8);
        let first_key = first.key();
        let (second, mut second_queue) = Connection::new(P7, MATCH, 8);

        room.attach(first).await.unwrap();
        let attached = room.attach(second).await.unwrap();
        assert_eq!(attached.replaced, Some(first_key));
        assert_eq!(room.member_count().await, 1);

        drain(&mut first_queue);
        drain(&mut second_queue);
        room.broadcast(&Envelope::connected()).await.unwrap();

        assert!(first_queue.recv().await.is_none());
        assert_eq!(drain(&mut second_queue).len(), 1);

        // Stale key does not remove the replacement.
        assert_eq!(room.detach(first_key).await, (false, false));
        assert_eq!(room.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_out_of_turn_move_is_ignored() {
        let store = MemorySessionStore::new();
        let room = room_with(Some(json!({"currentPlayer": 7})));
        let (c7, mut q7) = Connection::new(P7, MATCH, 8);
        let (c9, mut q9) = Connection::new(P9, MATCH, 8);
        room.attach(c7).await.unwrap();
        room.attach(c9).await.unwrap();
        drain(&mut q7);
        drain(&mut q9);

        let outcome = room.apply_move(P9, json!({"card": "X"}), &store).await.unwrap();

        assert_eq!(outcome, MoveOutcome::NotYourTurn);
        assert_eq!(room.state().await, Some(state(json!({"currentPlayer": 7}))));
        assert_eq!(store.save_count(), 0);
        assert!(drain(&mut q7).is_empty());
        assert!(drain(&mut q9).is_empty());
    }

    #[tokio::test]
    async fn test_move_without_current_player_is_ignored() {
        let store = MemorySessionStore::new();
        let room = room_with(Some(json!({"round": 1})));

        let outcome = room.apply_move(P7, json!({}), &store).await.unwrap();
        assert_eq!(outcome, MoveOutcome::NotYourTurn);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_accepted_move_persists_once_and_broadcasts() {
        let store = MemorySessionStore::new();
        let room = room_with(Some(json!({"currentPlayer": 7, "round": 1})));
        let (c7, mut q7) = Connection::new(P7, MATCH, 8);
        let (c9, mut q9) = Connection::new(P9, MATCH, 8);
        room.attach(c7).await.unwrap();
        room.attach(c9).await.unwrap();
        drain(&mut q7);
        drain(&mut q9);

        let outcome = room.apply_move(P7, json!({"card": "X"}), &store).await.unwrap();
        assert_eq!(outcome, MoveOutcome::Applied { recipients: 2 });
        assert_eq!(store.save_count(), 1);

        let expected = json!({"currentPlayer": 7, "round": 1, "lastMove": {"card": "X"}, "lastMoveBy": 7});
        let saved: Value = serde_json::from_slice(&store.get(MATCH).await.unwrap()).unwrap();
        assert_eq!(saved, expected);

        for queue in [&mut q7, &mut q9] {
            let msgs = drain(queue);
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0]["type"], "game_update");
            assert_eq!(msgs[0]["game_id"], 42);
            assert_eq!(msgs[0]["user_id"], 7);
            assert_eq!(msgs[0]["payload"], expected);
        }
    }

    #[tokio::test]
    async fn test_move_hydrates_missing_state() {
        let store = MemorySessionStore::new();
        store.insert(MATCH, br#"{"currentPlayer":7}"#.to_vec()).await;
        let room = room_with(None);

        let outcome = room.apply_move(P7, json!({"card": "Y"}), &store).await.unwrap();
        assert_eq!(outcome, MoveOutcome::Applied { recipients: 0 });
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test]
    async fn test_move_without_stored_row_is_an_error() {
        let store = MemorySessionStore::new();
        let room = room_with(None);

        let result = room.apply_move(P7, json!({}), &store).await;
        assert!(matches!(result, Err(HubError::StateUnavailable(id)) if id == MATCH));
    }

    #[tokio::test]
    async fn test_move_with_corrupt_row_is_ignored() {
        let store = MemorySessionStore::new();
        store.insert(MATCH, b"{corrupt".to_vec()).await;
        let room = room_with(None);

        let outcome = room.apply_move(P7, json!({}), &store).await.unwrap();
        assert_eq!(outcome, MoveOutcome::NoState);
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_state_and_skips_broadcast() {
        let before = json!({"currentPlayer": 7});
        let room = room_with(Some(before.clone()));
        let (c7, mut q7) = Connection::new(P7, MATCH, 8);
        room.attach(c7).await.unwrap();
        drain(&mut q7);

        let result = room.apply_move(P7, json!({"card": "X"}), &FailingStore).await;

        assert!(matches!(result, Err(HubError::Store(_))));
        assert_eq!(room.state().await, Some(state(before)));
        assert!(drain(&mut q7).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_drops_saturated_member() {
        let room = room_with(Some(json!({"currentPlayer": 7})));
        let (slow, _slow_queue) = Connection::new(P7, MATCH, 2);
        let (fast, mut fast_queue) = Connection::new(P9, MATCH, 8);
        room.attach(slow).await.unwrap(); // fills both slots
        room.attach(fast).await.unwrap();
        drain(&mut fast_queue);

        let delivered = room.broadcast(&Envelope::connected()).await.unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(room.participants().await, vec![P9]);
        assert_eq!(room.stats.snapshot().slow_consumer_disconnects, 1);
    }

    #[tokio::test]
    async fn test_state_request_only_for_current_connection() {
        let room = room_with(Some(json!({"currentPlayer": 7})));
        let (first, _q1) = Connection::new(P7, MATCH, 8);
        let stale = first.key();
        let (second, mut q2) = Connection::new(P7, MATCH, 8);
        let current = second.key();
        room.attach(first).await.unwrap();
        room.attach(second).await.unwrap();
        drain(&mut q2);

        assert!(!room.send_state_to(stale).await.unwrap());
        assert!(room.send_state_to(current).await.unwrap());
        assert_eq!(drain(&mut q2)[0]["type"], "game_state");
    }
}
