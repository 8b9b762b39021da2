use tokio::sync::{mpsc, oneshot};
use tracing::info;

use super::registry::{JoinOutcome, RoomRegistry};
use super::types::{ConnectionId, OutboundMessage, Payload, RoomKey, SignalKind, SignalingError, UserId};

/// Commands sent to the coordinator actor
pub(crate) enum Command {
    Join {
        conn: ConnectionId,
        room_key: RoomKey,
        user_id: UserId,
        tx: mpsc::UnboundedSender<OutboundMessage>,
        reply: oneshot::Sender<JoinOutcome>,
    },
    Relay {
        conn: ConnectionId,
        kind: SignalKind,
        payload: Payload,
        room_key: RoomKey,
    },
    Leave {
        conn: ConnectionId,
        room_key: RoomKey,
    },
    Disconnect {
        conn: ConnectionId,
    },
    RoomSize {
        room_key: RoomKey,
        reply: oneshot::Sender<usize>,
    },
}

/// Owns the registry and applies commands strictly one at a time, so no
/// mutation ever observes another half-done.
pub(crate) async fn coordinator_actor(mut registry: RoomRegistry, mut rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Join {
                conn,
                room_key,
                user_id,
                tx,
                reply,
            } => {
                let outcome = registry.join(conn, room_key, user_id, tx);
                let _ = reply.send(outcome);
            }

            Command::Relay {
                conn,
                kind,
                payload,
                room_key,
            } => {
                registry.relay(&conn, kind, payload, &room_key);
            }

            Command::Leave { conn, room_key } => {
                registry.leave(&conn, &room_key);
            }

            Command::Disconnect { conn } => {
                if let Some(room_key) = registry.disconnect(&conn) {
                    info!("Connection {} dropped from room {}", conn, room_key);
                }
            }

            Command::RoomSize { room_key, reply } => {
                let _ = reply.send(registry.room_size(&room_key));
            }
        }
    }

    info!(
        "Coordinator stopped with {} room(s), {} connection(s)",
        registry.room_count(),
        registry.connection_count()
    );
}

/// Handle to communicate with the coordinator actor
#[derive(Clone)]
pub struct CoordinatorHandle {
    pub(crate) tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    /// Spawn a coordinator task that owns `registry`.
    pub fn spawn(registry: RoomRegistry, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Command>(buffer);
        tokio::spawn(coordinator_actor(registry, rx));
        Self { tx }
    }

    /// Join `room_key`, delivering room events to `tx`
    pub async fn join(
        &self,
        conn: ConnectionId,
        room_key: RoomKey,
        user_id: UserId,
        tx: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Result<JoinOutcome, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::Join {
                conn,
                room_key,
                user_id,
                tx,
                reply: reply_tx,
            })
            .await;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("coordinator channel closed".to_string()))
    }

    /// Forward a signaling payload to the other members of a room
    pub async fn relay(&self, conn: ConnectionId, kind: SignalKind, payload: Payload, room_key: RoomKey) {
        let _ = self
            .tx
            .send(Command::Relay {
                conn,
                kind,
                payload,
                room_key,
            })
            .await;
    }

    /// Leave the named room
    pub async fn leave(&self, conn: ConnectionId, room_key: RoomKey) {
        let _ = self.tx.send(Command::Leave { conn, room_key }).await;
    }

    /// Drop the connection from whatever room it is in
    pub async fn disconnect(&self, conn: ConnectionId) {
        let _ = self.tx.send(Command::Disconnect { conn }).await;
    }

    /// Current member count of a room (0 if it does not exist)
    pub async fn room_size(&self, room_key: RoomKey) -> Result<usize, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::RoomSize {
                room_key,
                reply: reply_tx,
            })
            .await;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("coordinator channel closed".to_string()))
    }
}
