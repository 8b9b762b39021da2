//! WebSocket signaling coordinator for two-party WebRTC rooms

mod actor;
mod messages;
mod registry;
mod server;
mod types;

pub use actor::CoordinatorHandle;
pub use messages::{ClientMessage, ServerMessage};
pub use registry::{JoinOutcome, RoomRegistry};
pub use server::{DEFAULT_SIGNALING_PORT, Keepalive, SignalingServer};
pub use types::{
    ConnectionId, OutboundMessage, Payload, ROOM_CAPACITY, RoomKey, SignalKind, SignalingError,
    UserId,
};
