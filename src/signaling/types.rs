use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rand::Rng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Utf8Bytes;

/// Signaling server errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("invalid room key: {0:?}")]
    InvalidRoomKey(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Maximum number of connections sharing one room.
pub const ROOM_CAPACITY: usize = 2;

const CONNECTION_ID_PREFIX: &[u8] = b"conn_";
const CONNECTION_ID_LEN: usize = 21;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

/// Connection ID: 21-byte fixed array ("conn_" + 16 hex)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    bytes: [u8; CONNECTION_ID_LEN],
    len: u8,
}

impl ConnectionId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; CONNECTION_ID_LEN];
        bytes[..CONNECTION_ID_PREFIX.len()].copy_from_slice(CONNECTION_ID_PREFIX);

        let mut rng = rand::rng();
        let value: u64 = rng.random();

        for i in 0..16 {
            let nibble = ((value >> (60 - i * 4)) & 0xF) as usize;
            bytes[CONNECTION_ID_PREFIX.len() + i] = HEX_CHARS[nibble];
        }
        Self {
            bytes,
            len: CONNECTION_ID_LEN as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        let mut bytes = [0u8; CONNECTION_ID_LEN];
        let src = s.as_bytes();
        let len = src.len().min(CONNECTION_ID_LEN);
        bytes[..len].copy_from_slice(&src[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }
}

/// Room key chosen by the caller.
///
/// Numeric room ids are coerced to their decimal string form so that `42`
/// and `"42"` address the same room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey(Arc<str>);

impl RoomKey {
    /// Build a room key, rejecting the empty string.
    pub fn parse(s: &str) -> Result<Self, SignalingError> {
        if s.is_empty() {
            return Err(SignalingError::InvalidRoomKey(s.to_string()));
        }
        Ok(Self(Arc::from(s)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomKey {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

struct RoomKeyVisitor;

impl Visitor<'_> for RoomKeyVisitor {
    type Value = RoomKey;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-empty string or a number")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<RoomKey, E> {
        RoomKey::parse(v).map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<RoomKey, E> {
        Ok(RoomKey(Arc::from(js_number_string(v as f64))))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<RoomKey, E> {
        Ok(RoomKey(Arc::from(js_number_string(v as f64))))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<RoomKey, E> {
        Ok(RoomKey(Arc::from(js_number_string(v))))
    }
}

/// Format a number the way JavaScript's `String(n)` does, so browser clients
/// that stringify room ids themselves land in the same room.
///
/// Integers are first rounded to the nearest double, as a JS client would have
/// parsed them.
fn js_number_string(v: f64) -> String {
    if v == 0.0 {
        return "0".to_string();
    }
    if (1e-6..1e21).contains(&v.abs()) {
        return v.to_string();
    }
    let sci = format!("{:e}", v);
    match sci.split_once('e') {
        Some((mantissa, exp)) if !exp.starts_with('-') => format!("{}e+{}", mantissa, exp),
        _ => sci,
    }
}

impl<'de> Deserialize<'de> for RoomKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(RoomKeyVisitor)
    }
}

/// User identity supplied by the client at join time. Never inspected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Box<RawValue>);

impl UserId {
    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        Ok(Self(RawValue::from_string(json.to_string())?))
    }

    /// The identity exactly as the client sent it.
    pub fn as_json(&self) -> &str {
        self.0.get()
    }
}

/// Session description or ICE candidate body, relayed verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Box<RawValue>);

impl Payload {
    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        Ok(Self(RawValue::from_string(json.to_string())?))
    }

    pub fn as_json(&self) -> &str {
        self.0.get()
    }
}

/// The three relayable signaling event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn event_name(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// Wrapper for outbound WebSocket messages using tungstenite's Utf8Bytes.
#[derive(Debug, Clone)]
pub struct OutboundMessage(Utf8Bytes);

impl OutboundMessage {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Get the inner Utf8Bytes for tungstenite Message::Text
    pub fn into_inner(self) -> Utf8Bytes {
        self.0
    }
}

impl From<String> for OutboundMessage {
    fn from(s: String) -> Self {
        Self(Utf8Bytes::from(s))
    }
}

#[derive(Debug)]
pub(crate) struct Member {
    pub user_id: UserId,
    /// Channel for outbound messages to this connection.
    /// Uses OutboundMessage (Utf8Bytes) for O(1) broadcast cloning.
    pub tx: mpsc::UnboundedSender<OutboundMessage>,
}

#[derive(Debug, Default)]
pub(crate) struct Room {
    pub members: HashMap<ConnectionId, Member>,
}

impl Room {
    pub fn is_full(&self) -> bool {
        self.members.len() >= ROOM_CAPACITY
    }

    /// Push `msg` to every member except `sender`.
    pub fn broadcast_except(&self, sender: &ConnectionId, msg: &OutboundMessage) -> usize {
        let mut delivered = 0;
        for (id, member) in &self.members {
            if id != sender && member.tx.send(msg.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}
