use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use super::types::{OutboundMessage, Payload, RoomKey, SignalKind, SignalingError, UserId};

/// Wire frame: a named event plus its data, as a socket.io-style client
/// sends it.
#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Option<Box<RawValue>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRoomData {
    room_id: RoomKey,
    user_id: UserId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferData {
    offer: Payload,
    room_id: RoomKey,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerData {
    answer: Payload,
    room_id: RoomKey,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IceCandidateData {
    candidate: Payload,
    room_id: RoomKey,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaveRoomData {
    room_id: RoomKey,
}

/// Messages sent from client to server
#[derive(Debug)]
pub enum ClientMessage {
    /// `join-room { roomId, userId }`
    JoinRoom { room_id: RoomKey, user_id: UserId },

    /// `offer`, `answer` or `ice-candidate`, addressed to a room
    Signal {
        kind: SignalKind,
        payload: Payload,
        room_id: RoomKey,
    },

    /// `leave-room { roomId }`
    LeaveRoom { room_id: RoomKey },
}

impl ClientMessage {
    /// Decode one text frame. Signaling payloads are kept as raw JSON and
    /// never looked into.
    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let data = envelope.data.as_deref().map_or("null", RawValue::get);

        let msg = match envelope.event.as_str() {
            "join-room" => {
                let d: JoinRoomData = serde_json::from_str(data)?;
                ClientMessage::JoinRoom {
                    room_id: d.room_id,
                    user_id: d.user_id,
                }
            }
            "offer" => {
                let d: OfferData = serde_json::from_str(data)?;
                ClientMessage::Signal {
                    kind: SignalKind::Offer,
                    payload: d.offer,
                    room_id: d.room_id,
                }
            }
            "answer" => {
                let d: AnswerData = serde_json::from_str(data)?;
                ClientMessage::Signal {
                    kind: SignalKind::Answer,
                    payload: d.answer,
                    room_id: d.room_id,
                }
            }
            "ice-candidate" => {
                let d: IceCandidateData = serde_json::from_str(data)?;
                ClientMessage::Signal {
                    kind: SignalKind::IceCandidate,
                    payload: d.candidate,
                    room_id: d.room_id,
                }
            }
            "leave-room" => {
                let d: LeaveRoomData = serde_json::from_str(data)?;
                ClientMessage::LeaveRoom { room_id: d.room_id }
            }
            other => return Err(SignalingError::UnknownEvent(other.to_string())),
        };
        Ok(msg)
    }
}

/// Messages sent from server to client
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Join rejected, the room already holds two connections
    RoomFull,

    /// A peer joined your room
    UserJoined(UserId),

    Offer(Payload),
    Answer(Payload),
    IceCandidate(Payload),

    /// Your peer left or disconnected
    UserLeft,

    /// The last frame could not be decoded
    Error { message: String },
}

impl ServerMessage {
    pub fn signal(kind: SignalKind, payload: Payload) -> Self {
        match kind {
            SignalKind::Offer => ServerMessage::Offer(payload),
            SignalKind::Answer => ServerMessage::Answer(payload),
            SignalKind::IceCandidate => ServerMessage::IceCandidate(payload),
        }
    }

    /// Serialize once so the frame can be cloned cheaply per recipient.
    pub fn encode(&self) -> Result<OutboundMessage, SignalingError> {
        Ok(OutboundMessage::from(serde_json::to_string(self)?))
    }
}
