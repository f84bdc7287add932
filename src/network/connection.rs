//! Connection Lifecycle
//!
//! One participant's live link to a match. The socket is split into a
//! reader task and a writer task that share nothing but the bounded
//! outbound queue and a [`Teardown`] that unregisters exactly once.
//!
//! ```text
//!   socket ──> reader ──> Hub (move / state request)
//!   socket <── writer <── outbound queue <── Room (pushes, broadcasts)
//! ```
//!
//! The Room's membership map holds the only sending half of the queue, so
//! removing a member closes its queue; the writer then drains what was
//! already queued, sends a Close frame and exits. A member dropped for
//! falling behind is also cancelled, which stops both directions at once
//! without waiting on a socket nobody is reading.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::{MatchId, ParticipantId};
use crate::network::hub::{HubError, HubHandle};
use crate::network::protocol::ClientEvent;

/// Default outbound queue capacity per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Identity of a registered connection.
///
/// Two connections of the same participant differ by `id`, which is what
/// keeps a stale teardown from removing its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Connection instance.
    pub id: ConnectionId,
    /// Authenticated participant.
    pub participant_id: ParticipantId,
    /// Match the connection is tied to.
    pub match_id: MatchId,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.participant_id, self.match_id, &self.id.simple().to_string()[..8])
    }
}

/// Why a message could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Queue at capacity.
    Full,
    /// Writer already gone.
    Closed,
}

/// Sending side of a connection, owned by the Room it is registered in.
#[derive(Debug)]
pub struct Connection {
    key: ConnectionKey,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Connection {
    /// Create a connection and the receiving end of its outbound queue.
    pub fn new(
        participant_id: ParticipantId,
        match_id: MatchId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<String>) {
        let (outbound, queue) = mpsc::channel(capacity.max(1));
        let key = ConnectionKey {
            id: Uuid::new_v4(),
            participant_id,
            match_id,
        };
        let cancel = CancellationToken::new();
        (Self { key, outbound, cancel }, queue)
    }

    /// Connection identity.
    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    /// Participant this connection belongs to.
    pub fn participant_id(&self) -> ParticipantId {
        self.key.participant_id
    }

    /// Match this connection is tied to.
    pub fn match_id(&self) -> MatchId {
        self.key.match_id
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.outbound.max_capacity()
    }

    /// Token that stops this connection's reader and writer.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Disconnect without draining the queue.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Queue a serialized message without waiting.
    pub fn try_enqueue(&self, message: String) -> Result<(), EnqueueError> {
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

// =============================================================================
// TEARDOWN
// =============================================================================

/// Shared shutdown for both directions of one connection.
pub struct Teardown {
    key: ConnectionKey,
    hub: HubHandle,
    fired: AtomicBool,
    cancel: CancellationToken,
}

impl Teardown {
    /// Create the teardown for a registered connection, sharing its
    /// cancel token.
    pub fn new(hub: HubHandle, key: ConnectionKey, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            key,
            hub,
            fired: AtomicBool::new(false),
            cancel,
        })
    }

    /// Whether teardown already ran.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Unregister, then cancel the other direction. Only the first call
    /// does anything.
    pub async fn run(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.hub.unregister(self.key).await {
            debug!(connection = %self.key, error = %e, "unregister after hub shutdown");
        }
        self.cancel.cancel();
    }

    async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

// =============================================================================
// READER / WRITER
// =============================================================================

/// Read inbound frames until the transport fails or teardown fires.
pub async fn run_reader<S, E>(
    mut inbound: S,
    hub: HubHandle,
    key: ConnectionKey,
    teardown: Arc<Teardown>,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = teardown.cancelled() => break,
            frame = inbound.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => handle_frame(&hub, key, &text).await,
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => handle_frame(&hub, key, text).await,
                Err(_) => debug!(connection = %key, "ignoring non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(_))) | None => {
                debug!(connection = %key, "client closed connection");
                break;
            }
            Some(Err(e)) => {
                debug!(connection = %key, error = %e, "read failed");
                break;
            }
            Some(Ok(_)) => {}
        }
    }

    teardown.run().await;
}

async fn handle_frame(hub: &HubHandle, key: ConnectionKey, text: &str) {
    match ClientEvent::decode(text) {
        Ok(ClientEvent::Move { payload }) => {
            // Failures are logged and counted by the hub; the client is not told.
            let _ = hub.apply_move(key.match_id, key.participant_id, payload).await;
        }
        Ok(ClientEvent::StateRequest) => hub.request_state(key).await,
        Err(e) => debug!(connection = %key, error = %e, "ignoring inbound frame"),
    }
}

/// Write queued messages in order until the queue closes or a write fails.
pub async fn run_writer<S>(
    mut outbound: S,
    mut queue: mpsc::Receiver<String>,
    teardown: Arc<Teardown>,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    loop {
        // Queued frames win over cancellation so a normal close still drains.
        let text = tokio::select! {
            biased;
            next = queue.recv() => match next {
                Some(text) => text,
                None => break,
            },
            _ = teardown.cancelled() => {
                teardown.run().await;
                return;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = teardown.cancelled() => {
                debug!(connection = %teardown.key, "write abandoned, connection cancelled");
                teardown.run().await;
                return;
            }
            sent = outbound.send(Message::Text(text)) => sent,
        };
        if let Err(e) = sent {
            debug!(connection = %teardown.key, error = %e, "write failed");
            teardown.run().await;
            return;
        }
    }

    // Queue closed: unregistered, replaced, or the hub shut down.
    let _ = outbound.send(Message::Close(None)).await;
    let _ = outbound.close().await;
    teardown.run().await;
}

/// Register an accepted WebSocket with the hub and drive it to completion.
pub async fn serve_connection<T>(
    ws: WebSocketStream<T>,
    hub: HubHandle,
    participant_id: ParticipantId,
    match_id: MatchId,
    capacity: usize,
) -> Result<(), HubError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let (connection, queue) = Connection::new(participant_id, match_id, capacity);
    let key = connection.key();
    let cancel = connection.cancel_token();

    hub.register(connection).await?;
    let teardown = Teardown::new(hub.clone(), key, cancel);

    let writer = tokio::spawn(run_writer(sink, queue, teardown.clone()));
    run_reader(stream, hub, key, teardown).await;

    if let Err(e) = writer.await {
        warn!(connection = %key, error = %e, "writer task failed");
    }
    Ok(())
}
