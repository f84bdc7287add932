//! Session Hub
//!
//! Process-wide registry of live rooms. Room creation, membership changes
//! and eviction all go through one control task, so concurrent connects
//! and disconnects for the same match never interleave. Move handling and
//! state requests read the registry concurrently under a read lock.
//!
//! A room is in the registry iff it has at least one member; eviction
//! discards its in-memory state (the last accepted move is already in
//! the store).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{MatchId, MatchState, ParticipantId};
use crate::network::connection::{Connection, ConnectionKey, DEFAULT_OUTBOUND_CAPACITY};
use crate::network::protocol::Envelope;
use crate::network::room::{MoveOutcome, Room};
use crate::store::{SessionStore, StoreError};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Session store failed.
    #[error("session store error: {0}")]
    Store(#[from] StoreError),

    /// No stored state to hydrate a room from.
    #[error("no stored state for match {0}")]
    StateUnavailable(MatchId),

    /// Envelope or state could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The control loop has stopped.
    #[error("hub is shut down")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound queue capacity per connection.
    pub outbound_capacity: usize,
    /// Pending register/unregister commands before callers wait.
    pub control_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            control_capacity: 1024,
        }
    }
}

// =============================================================================
// STATS
// =============================================================================

/// Counters for events the hub otherwise handles silently.
#[derive(Debug, Default)]
pub struct HubStats {
    slow_consumer_disconnects: AtomicU64,
    replaced_connections: AtomicU64,
    dropped_moves: AtomicU64,
    rooms_created: AtomicU64,
    rooms_evicted: AtomicU64,
}

/// Point-in-time copy of [`HubStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStatsSnapshot {
    /// Members disconnected because their queue was full.
    pub slow_consumer_disconnects: u64,
    /// Connections closed because the participant connected again.
    pub replaced_connections: u64,
    /// Moves that failed on load or persist.
    pub dropped_moves: u64,
    /// Rooms created.
    pub rooms_created: u64,
    /// Rooms evicted after their last member left.
    pub rooms_evicted: u64,
}

impl HubStats {
    pub(crate) fn record_slow_consumer(&self) {
        self.slow_consumer_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replaced(&self) {
        self.replaced_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped_move(&self) {
        self.dropped_moves.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> HubStatsSnapshot {
        HubStatsSnapshot {
            slow_consumer_disconnects: self.slow_consumer_disconnects.load(Ordering::Relaxed),
            replaced_connections: self.replaced_connections.load(Ordering::Relaxed),
            dropped_moves: self.dropped_moves.load(Ordering::Relaxed),
            rooms_created: self.rooms_created.load(Ordering::Relaxed),
            rooms_evicted: self.rooms_evicted.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// HUB
// =============================================================================

enum HubCommand {
    Register {
        connection: Connection,
        done: oneshot::Sender<()>,
    },
    Unregister {
        key: ConnectionKey,
        done: oneshot::Sender<()>,
    },
    Reap {
        match_id: MatchId,
    },
    Shutdown,
}

struct HubShared {
    rooms: RwLock<BTreeMap<MatchId, Arc<Room>>>,
    store: Arc<dyn SessionStore>,
    stats: Arc<HubStats>,
    config: HubConfig,
}

/// The control loop. Owns registry mutation.
pub struct Hub {
    shared: Arc<HubShared>,
    commands: mpsc::Receiver<HubCommand>,
}

/// Cloneable handle used by connections and the server.
#[derive(Clone)]
pub struct HubHandle {
    shared: Arc<HubShared>,
    commands: mpsc::Sender<HubCommand>,
}

impl Hub {
    /// Create a hub and its handle. Call [`Hub::run`] to start processing.
    pub fn new(store: Arc<dyn SessionStore>, config: HubConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.control_capacity.max(1));
        let shared = Arc::new(HubShared {
            rooms: RwLock::new(BTreeMap::new()),
            store,
            stats: Arc::new(HubStats::default()),
            config,
        });

        let hub = Self {
            shared: shared.clone(),
            commands: rx,
        };
        (hub, HubHandle { shared, commands: tx })
    }

    /// Create a hub and run its control loop on a new task.
    pub fn spawn(store: Arc<dyn SessionStore>, config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(store, config);
        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    /// Process commands until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Register { connection, done } => {
                    self.register(connection).await;
                    let _ = done.send(());
                }
                HubCommand::Unregister { key, done } => {
                    self.unregister(key).await;
                    let _ = done.send(());
                }
                HubCommand::Reap { match_id } => self.reap(match_id).await,
                HubCommand::Shutdown => break,
            }
        }

        // Closing every queue lets each writer send its Close frame.
        let rooms = std::mem::take(&mut *self.shared.rooms.write().await);
        for room in rooms.values() {
            room.close_all().await;
        }
        info!(rooms = rooms.len(), "hub stopped");
    }

    async fn register(&self, connection: Connection) {
        let key = connection.key();
        let room = match self.lookup(key.match_id).await {
            Some(room) => room,
            None => self.create_room(key.match_id).await,
        };

        match room.attach(connection).await {
            Ok(attached) => {
                info!(connection = %key, sent_state = attached.sent_state, "connection registered");
            }
            Err(e) => warn!(connection = %key, error = %e, "failed to push initial messages"),
        }

        // The initial push can fail on a tiny queue and drop the member.
        if room.member_count().await == 0 {
            self.evict(key.match_id).await;
        }
    }

    async fn unregister(&self, key: ConnectionKey) {
        let Some(room) = self.lookup(key.match_id).await else {
            return;
        };

        let (removed, empty) = room.detach(key).await;
        if removed {
            debug!(connection = %key, "connection unregistered");
        }
        // Also reaps rooms emptied by a slow-consumer drop.
        if empty {
            self.evict(key.match_id).await;
        }
    }

    /// Evict a room emptied by slow-consumer drops.
    async fn reap(&self, match_id: MatchId) {
        let Some(room) = self.lookup(match_id).await else {
            return;
        };
        if room.member_count().await == 0 {
            debug!(match_id = %match_id, "reaping room emptied by backpressure");
            self.evict(match_id).await;
        }
    }

    async fn lookup(&self, match_id: MatchId) -> Option<Arc<Room>> {
        self.shared.rooms.read().await.get(&match_id).cloned()
    }

    async fn create_room(&self, match_id: MatchId) -> Arc<Room> {
        // Only this task inserts, so loading outside the write lock is safe.
        let state = self.hydrate(match_id).await;
        let room = Arc::new(Room::new(match_id, state, self.shared.stats.clone()));

        self.shared.rooms.write().await.insert(match_id, room.clone());
        self.shared.stats.rooms_created.fetch_add(1, Ordering::Relaxed);
        info!(match_id = %match_id, "room created");
        room
    }

    /// Load state for a new room. Missing or unreadable state is not an
    /// error; the room starts empty and hydrates on the first move.
    async fn hydrate(&self, match_id: MatchId) -> Option<MatchState> {
        match self.shared.store.load(match_id).await {
            Ok(Some(blob)) => {
                let state = MatchState::from_blob(&blob);
                if state.is_none() {
                    warn!(match_id = %match_id, "stored state is not a JSON object");
                }
                state
            }
            Ok(None) => {
                debug!(match_id = %match_id, "no stored state");
                None
            }
            Err(e) => {
                warn!(match_id = %match_id, error = %e, "failed to load state");
                None
            }
        }
    }

    async fn evict(&self, match_id: MatchId) {
        if self.shared.rooms.write().await.remove(&match_id).is_some() {
            self.shared.stats.rooms_evicted.fetch_add(1, Ordering::Relaxed);
            info!(match_id = %match_id, "room evicted");
        }
    }
}

impl HubHandle {
    /// Register a connection and wait until it has been attached and sent
    /// its initial messages.
    pub async fn register(&self, connection: Connection) -> Result<(), HubError> {
        let (done, ack) = oneshot::channel();
        self.commands
            .send(HubCommand::Register { connection, done })
            .await
            .map_err(|_| HubError::Closed)?;
        ack.await.map_err(|_| HubError::Closed)
    }

    /// Detach a connection and wait until it is processed.
    pub async fn unregister(&self, key: ConnectionKey) -> Result<(), HubError> {
        let (done, ack) = oneshot::channel();
        self.commands
            .send(HubCommand::Unregister { key, done })
            .await
            .map_err(|_| HubError::Closed)?;
        ack.await.map_err(|_| HubError::Closed)
    }

    /// Stop the control loop and close every connection queue.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(HubCommand::Shutdown).await;
    }

    /// Apply a move to the match's room.
    ///
    /// Unknown rooms and out-of-turn moves are `Ok` no-ops. Errors are
    /// logged and counted here; the caller only decides whether to care.
    pub async fn apply_move(
        &self,
        match_id: MatchId,
        participant: ParticipantId,
        payload: Value,
    ) -> Result<MoveOutcome, HubError> {
        let Some(room) = self.room(match_id).await else {
            return Ok(MoveOutcome::UnknownRoom);
        };

        let result = room
            .apply_move(participant, payload, self.shared.store.as_ref())
            .await;
        self.reap_if_empty(&room).await;
        match &result {
            Ok(MoveOutcome::Applied { recipients }) => {
                debug!(match_id = %match_id, participant = %participant, recipients, "move applied");
            }
            Ok(_) => {}
            Err(e) => {
                self.shared.stats.record_dropped_move();
                warn!(match_id = %match_id, participant = %participant, error = %e, "move dropped");
            }
        }
        result
    }

    /// Send an envelope to every member of a match.
    pub async fn broadcast(&self, match_id: MatchId, envelope: &Envelope) -> Result<usize, HubError> {
        let Some(room) = self.room(match_id).await else {
            return Ok(0);
        };
        let delivered = room.broadcast(envelope).await;
        self.reap_if_empty(&room).await;
        delivered
    }

    /// Reply to a state request with a `game_state` snapshot, if any.
    pub async fn request_state(&self, key: ConnectionKey) {
        let Some(room) = self.room(key.match_id).await else {
            return;
        };
        if let Err(e) = room.send_state_to(key).await {
            warn!(connection = %key, error = %e, "failed to send state snapshot");
        }
        self.reap_if_empty(&room).await;
    }

    /// Ask the control loop to evict `room` if deliveries left it empty.
    /// The loop re-checks, so a concurrent register keeps the room alive.
    async fn reap_if_empty(&self, room: &Room) {
        if room.member_count().await > 0 {
            return;
        }
        // A full control queue is fine: the dropped member's teardown
        // unregisters and reaps as well.
        let _ = self.commands.try_send(HubCommand::Reap { match_id: room.id() });
    }

    /// Look up a live room.
    pub async fn room(&self, match_id: MatchId) -> Option<Arc<Room>> {
        self.shared.rooms.read().await.get(&match_id).cloned()
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    /// Members of a match's room (0 if none).
    pub async fn member_count(&self, match_id: MatchId) -> usize {
        match self.room(match_id).await {
            Some(room) => room.member_count().await,
            None => 0,
        }
    }

    /// In-memory state of a match's room.
    pub async fn state_of(&self, match_id: MatchId) -> Option<MatchState> {
        self.room(match_id).await?.state().await
    }

    /// Queue capacity for new connections.
    pub fn outbound_capacity(&self) -> usize {
        self.shared.config.outbound_capacity
    }

    /// Counters.
    pub fn stats(&self) -> HubStatsSnapshot {
        self.shared.stats.snapshot()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    use crate::store::MemorySessionStore;

    #[derive(Debug, Clone)]
    enum Op {
        Join { matched: i64, participant: i64 },
        Leave { index: usize },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..3, 0i64..4).prop_map(|(matched, participant)| Op::Join { matched, participant }),
            any::<usize>().prop_map(|index| Op::Leave { index }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn room_exists_iff_it_has_members(ops in proptest::collection::vec(op(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async move {
                let (hub, _task) = Hub::spawn(Arc::new(MemorySessionStore::new()), HubConfig::default());
                let mut keys: Vec<ConnectionKey> = Vec::new();
                let mut queues = Vec::new();

                for op in ops {
                    match op {
                        Op::Join { matched, participant } => {
                            let (conn, queue) = Connection::new(
                                ParticipantId::new(participant),
                                MatchId::new(matched),
                                4,
                            );
                            keys.push(conn.key());
                            queues.push(queue);
                            hub.register(conn).await.unwrap();
                        }
                        Op::Leave { index } => {
                            if !keys.is_empty() {
                                let key = keys.remove(index % keys.len());
                                hub.unregister(key).await.unwrap();
                            }
                        }
                    }

                    for matched in 0..3 {
                        let id = MatchId::new(matched);
                        let exists = hub.room(id).await.is_some();
                        let members = hub.member_count(id).await;
                        assert_eq!(exists, members > 0, "match {matched}");
                    }
                }
            });
        }
    }
}
