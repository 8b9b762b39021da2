use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::ServerMessage;
use super::types::{ConnectionId, Member, OutboundMessage, Payload, Room, RoomKey, SignalKind, UserId};

/// Result of a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The connection was added to the room
    Joined,
    /// The connection was already alone in the room; its user id was refreshed
    Rejoined,
    /// The room already holds two connections; nothing changed
    RoomFull,
}

/// In-memory room membership.
///
/// Holds the rooms and a reverse index from connection to room key. Both are
/// updated together by every mutation, so a connection's room can always be
/// found on disconnect. The registry does no locking; callers must serialize
/// access (the coordinator actor owns the only instance).
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomKey, Room>,
    connections: HashMap<ConnectionId, RoomKey>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(
        &mut self,
        conn: ConnectionId,
        room_key: RoomKey,
        user_id: UserId,
        tx: mpsc::UnboundedSender<OutboundMessage>,
    ) -> JoinOutcome {
        if self.rooms.get(&room_key).is_some_and(Room::is_full) {
            if let Some(msg) = encode(&ServerMessage::RoomFull) {
                let _ = tx.send(msg);
            }
            info!("Connection {} rejected, room {} is full", conn, room_key);
            return JoinOutcome::RoomFull;
        }

        let current = self.connections.get(&conn).cloned();

        // Only reachable while alone in the room, so there is no peer to notify.
        if current.as_ref() == Some(&room_key) {
            if let Some(room) = self.rooms.get_mut(&room_key) {
                room.members.insert(conn, Member { user_id, tx });
            }
            info!("Connection {} re-joined room {}", conn, room_key);
            return JoinOutcome::Rejoined;
        }

        if let Some(previous) = current {
            info!("Connection {} switching from room {} to {}", conn, previous, room_key);
            self.remove_member(&conn, &previous);
        }

        let room = self.rooms.entry(room_key.clone()).or_default();
        if let Some(msg) = encode(&ServerMessage::UserJoined(user_id.clone())) {
            room.broadcast_except(&conn, &msg);
        }
        room.members.insert(conn, Member { user_id, tx });
        let size = room.members.len();
        self.connections.insert(conn, room_key.clone());

        info!("Connection {} joined room {} ({} members)", conn, room_key, size);
        JoinOutcome::Joined
    }

    /// Forward a signaling payload to the other members of `room_key`.
    /// Returns how many connections it was delivered to.
    pub fn relay(
        &self,
        sender: &ConnectionId,
        kind: SignalKind,
        payload: Payload,
        room_key: &RoomKey,
    ) -> usize {
        let Some(room) = self.rooms.get(room_key) else {
            debug!("Dropping {} from {}: no room {}", kind, sender, room_key);
            return 0;
        };
        let Some(msg) = encode(&ServerMessage::signal(kind, payload)) else {
            return 0;
        };

        let delivered = room.broadcast_except(sender, &msg);
        debug!("Relayed {} in room {} to {} peer(s)", kind, room_key, delivered);
        delivered
    }

    /// Explicit leave. Only acts if `conn` is currently a member of `room_key`.
    pub fn leave(&mut self, conn: &ConnectionId, room_key: &RoomKey) -> bool {
        if self.connections.get(conn) != Some(room_key) {
            debug!("Connection {} is not in room {}, ignoring leave", conn, room_key);
            return false;
        }
        self.remove_member(conn, room_key);
        true
    }

    /// Transport-level disconnect. Returns the room the connection was in.
    pub fn disconnect(&mut self, conn: &ConnectionId) -> Option<RoomKey> {
        let room_key = self.connections.get(conn).cloned()?;
        self.remove_member(conn, &room_key);
        Some(room_key)
    }

    pub fn room_size(&self, room_key: &RoomKey) -> usize {
        self.rooms.get(room_key).map_or(0, |room| room.members.len())
    }

    pub fn contains_room(&self, room_key: &RoomKey) -> bool {
        self.rooms.contains_key(room_key)
    }

    pub fn room_of(&self, conn: &ConnectionId) -> Option<&RoomKey> {
        self.connections.get(conn)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn remove_member(&mut self, conn: &ConnectionId, room_key: &RoomKey) {
        self.connections.remove(conn);

        let Some(room) = self.rooms.get_mut(room_key) else {
            return;
        };
        if room.members.remove(conn).is_none() {
            return;
        }
        if let Some(msg) = encode(&ServerMessage::UserLeft) {
            room.broadcast_except(conn, &msg);
        }
        info!("Connection {} left room {}", conn, room_key);

        if room.members.is_empty() {
            self.rooms.remove(room_key);
            info!("Room {} removed (empty)", room_key);
        }
    }
}

fn encode(msg: &ServerMessage) -> Option<OutboundMessage> {
    match msg.encode() {
        Ok(out) => Some(out),
        Err(e) => {
            warn!("Failed to encode {:?}: {}", msg, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    struct Client {
        id: ConnectionId,
        tx: mpsc::UnboundedSender<OutboundMessage>,
        rx: mpsc::UnboundedReceiver<OutboundMessage>,
    }

    impl Client {
        fn new(name: &str) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                id: ConnectionId::from(name),
                tx,
                rx,
            }
        }

        fn join(&self, registry: &mut RoomRegistry, room: &str, user: &str) -> JoinOutcome {
            registry.join(
                self.id,
                RoomKey::from(room),
                UserId::from_json(&format!("\"{}\"", user)).unwrap(),
                self.tx.clone(),
            )
        }

        fn drain(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(serde_json::from_str(msg.as_str()).unwrap());
            }
            out
        }
    }

    fn events(msgs: &[Value]) -> Vec<&str> {
        msgs.iter().map(|m| m["event"].as_str().unwrap()).collect()
    }

    fn offer() -> Payload {
        Payload::from_json(r#"{"type":"offer","sdp":"v=0\r\no=- 1 2 IN IP4 127.0.0.1"}"#).unwrap()
    }

    #[test]
    fn third_join_gets_room_full() {
        let mut registry = RoomRegistry::new();
        let mut u1 = Client::new("c1");
        let mut u2 = Client::new("c2");
        let mut u3 = Client::new("c3");

        assert_eq!(u1.join(&mut registry, "R1", "u1"), JoinOutcome::Joined);
        assert_eq!(u2.join(&mut registry, "R1", "u2"), JoinOutcome::Joined);
        assert_eq!(u3.join(&mut registry, "R1", "u3"), JoinOutcome::RoomFull);

        let key = RoomKey::from("R1");
        assert_eq!(registry.room_size(&key), 2);
        assert_eq!(registry.room_of(&u1.id), Some(&key));
        assert_eq!(registry.room_of(&u2.id), Some(&key));
        assert_eq!(registry.room_of(&u3.id), None);

        let u1_msgs = u1.drain();
        assert_eq!(events(&u1_msgs), ["user-joined"]);
        assert_eq!(u1_msgs[0]["data"], "u2");

        assert!(u2.drain().is_empty());
        assert_eq!(events(&u3.drain()), ["room-full"]);
    }

    #[test]
    fn first_join_creates_room_without_notifications() {
        let mut registry = RoomRegistry::new();
        let mut u1 = Client::new("c1");

        assert!(!registry.contains_room(&RoomKey::from("R1")));
        u1.join(&mut registry, "R1", "u1");
        assert!(registry.contains_room(&RoomKey::from("R1")));
        assert!(u1.drain().is_empty());
    }

    #[test]
    fn offer_reaches_only_the_peer() {
        let mut registry = RoomRegistry::new();
        let mut u1 = Client::new("c1");
        let mut u2 = Client::new("c2");
        let mut other = Client::new("c3");
        u1.join(&mut registry, "R1", "u1");
        u2.join(&mut registry, "R1", "u2");
        other.join(&mut registry, "R2", "u3");
        u1.drain();

        let payload = offer();
        let expected = payload.as_json().to_string();
        let delivered = registry.relay(&u1.id, SignalKind::Offer, payload, &RoomKey::from("R1"));
        assert_eq!(delivered, 1);

        let u2_msgs = u2.drain();
        assert_eq!(events(&u2_msgs), ["offer"]);
        let expected: Value = serde_json::from_str(&expected).unwrap();
        assert_eq!(u2_msgs[0]["data"], expected);

        assert!(u1.drain().is_empty());
        assert!(other.drain().is_empty());
    }

    #[test]
    fn relay_payload_bytes_are_untouched() {
        let mut registry = RoomRegistry::new();
        let u1 = Client::new("c1");
        let mut u2 = Client::new("c2");
        u1.join(&mut registry, "R1", "u1");
        u2.join(&mut registry, "R1", "u2");

        let raw = r#"{ "candidate" : "candidate:0 1 UDP 2122252543 10.0.0.1 5000 typ host" }"#;
        registry.relay(
            &u1.id,
            SignalKind::IceCandidate,
            Payload::from_json(raw).unwrap(),
            &RoomKey::from("R1"),
        );

        let msg = u2.rx.try_recv().unwrap();
        assert!(msg.as_str().contains(raw));
    }

    #[test]
    fn relay_to_missing_or_lonely_room_is_noop() {
        let mut registry = RoomRegistry::new();
        let mut u1 = Client::new("c1");

        assert_eq!(
            registry.relay(&u1.id, SignalKind::Answer, offer(), &RoomKey::from("nowhere")),
            0
        );

        u1.join(&mut registry, "R1", "u1");
        assert_eq!(
            registry.relay(&u1.id, SignalKind::Answer, offer(), &RoomKey::from("R1")),
            0
        );
        assert!(u1.drain().is_empty());
    }

    #[test]
    fn disconnect_notifies_remaining_peer_once() {
        let mut registry = RoomRegistry::new();
        let u1 = Client::new("c1");
        let mut u2 = Client::new("c2");
        u1.join(&mut registry, "R1", "u1");
        u2.join(&mut registry, "R1", "u2");

        assert_eq!(registry.disconnect(&u1.id), Some(RoomKey::from("R1")));
        assert_eq!(events(&u2.drain()), ["user-left"]);
        assert_eq!(registry.room_size(&RoomKey::from("R1")), 1);
        assert_eq!(registry.room_of(&u2.id), Some(&RoomKey::from("R1")));

        assert_eq!(registry.disconnect(&u1.id), None);
        assert!(u2.drain().is_empty());
    }

    #[test]
    fn last_member_leaving_deletes_room() {
        let mut registry = RoomRegistry::new();
        let u1 = Client::new("c1");
        u1.join(&mut registry, "R1", "u1");

        assert!(registry.leave(&u1.id, &RoomKey::from("R1")));
        assert!(!registry.contains_room(&RoomKey::from("R1")));
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn leave_twice_is_noop_the_second_time() {
        let mut registry = RoomRegistry::new();
        let u1 = Client::new("c1");
        let mut u2 = Client::new("c2");
        u1.join(&mut registry, "R1", "u1");
        u2.join(&mut registry, "R1", "u2");

        let key = RoomKey::from("R1");
        assert!(registry.leave(&u1.id, &key));
        assert!(!registry.leave(&u1.id, &key));
        assert_eq!(events(&u2.drain()), ["user-left"]);
        assert_eq!(registry.room_size(&key), 1);
    }

    #[test]
    fn leave_of_foreign_room_is_ignored() {
        let mut registry = RoomRegistry::new();
        let u1 = Client::new("c1");
        let mut u2 = Client::new("c2");
        let u3 = Client::new("c3");
        u1.join(&mut registry, "R1", "u1");
        u2.join(&mut registry, "R1", "u2");
        u3.join(&mut registry, "R2", "u3");
        u2.drain();

        assert!(!registry.leave(&u3.id, &RoomKey::from("R1")));
        assert!(u2.drain().is_empty());
        assert_eq!(registry.room_size(&RoomKey::from("R1")), 2);
        assert_eq!(registry.room_size(&RoomKey::from("R2")), 1);
    }

    #[test]
    fn join_other_room_leaves_the_old_one() {
        let mut registry = RoomRegistry::new();
        let mut u1 = Client::new("c1");
        let mut u2 = Client::new("c2");
        let mut u3 = Client::new("c3");
        u1.join(&mut registry, "R1", "u1");
        u2.join(&mut registry, "R1", "u2");
        u3.join(&mut registry, "R2", "u3");
        u1.drain();

        assert_eq!(u2.join(&mut registry, "R2", "u2"), JoinOutcome::Joined);

        assert_eq!(events(&u1.drain()), ["user-left"]);
        assert_eq!(events(&u3.drain()), ["user-joined"]);
        assert!(u2.drain().is_empty());
        assert_eq!(registry.room_size(&RoomKey::from("R1")), 1);
        assert_eq!(registry.room_size(&RoomKey::from("R2")), 2);
        assert_eq!(registry.room_of(&u2.id), Some(&RoomKey::from("R2")));
    }

    #[test]
    fn switch_into_full_room_keeps_old_membership() {
        let mut registry = RoomRegistry::new();
        let mut a = Client::new("a");
        let b = Client::new("b");
        let c = Client::new("c");
        let mut d = Client::new("d");
        a.join(&mut registry, "R1", "a");
        b.join(&mut registry, "R2", "b");
        c.join(&mut registry, "R2", "c");

        assert_eq!(a.join(&mut registry, "R2", "a"), JoinOutcome::RoomFull);
        assert_eq!(events(&a.drain()), ["room-full"]);
        assert_eq!(registry.room_of(&a.id), Some(&RoomKey::from("R1")));

        d.join(&mut registry, "R1", "d");
        assert!(d.drain().is_empty());
        assert_eq!(registry.room_size(&RoomKey::from("R1")), 2);
    }

    #[test]
    fn member_rejoining_full_room_gets_room_full() {
        let mut registry = RoomRegistry::new();
        let mut a = Client::new("a");
        let mut b = Client::new("b");
        a.join(&mut registry, "R1", "a");
        b.join(&mut registry, "R1", "b");
        a.drain();

        assert_eq!(a.join(&mut registry, "R1", "impostor"), JoinOutcome::RoomFull);
        assert_eq!(events(&a.drain()), ["room-full"]);
        assert!(b.drain().is_empty());

        let key = RoomKey::from("R1");
        assert_eq!(registry.room_size(&key), 2);
        assert_eq!(registry.room_of(&a.id), Some(&key));
        assert_eq!(registry.rooms[&key].members[&a.id].user_id.as_json(), "\"a\"");
    }

    #[test]
    fn lone_member_rejoin_refreshes_user_id_silently() {
        let mut registry = RoomRegistry::new();
        let mut a = Client::new("a");
        a.join(&mut registry, "R1", "a");

        assert_eq!(a.join(&mut registry, "R1", "a2"), JoinOutcome::Rejoined);
        assert!(a.drain().is_empty());

        let key = RoomKey::from("R1");
        assert_eq!(registry.room_size(&key), 1);
        assert_eq!(registry.rooms[&key].members[&a.id].user_id.as_json(), "\"a2\"");
    }

    #[test]
    fn closed_receiver_does_not_break_relay() {
        let mut registry = RoomRegistry::new();
        let u1 = Client::new("c1");
        let u2 = Client::new("c2");
        u1.join(&mut registry, "R1", "u1");
        u2.join(&mut registry, "R1", "u2");
        drop(u2);

        let delivered = registry.relay(
            &ConnectionId::from("c1"),
            SignalKind::Offer,
            offer(),
            &RoomKey::from("R1"),
        );
        assert_eq!(delivered, 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Join(usize, usize),
        Leave(usize, usize),
        Disconnect(usize),
        Relay(usize, usize),
    }

    const CONNS: usize = 5;
    const ROOMS: usize = 3;

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0..CONNS, 0..ROOMS).prop_map(|(c, r)| Op::Join(c, r)),
            1 => (0..CONNS, 0..ROOMS).prop_map(|(c, r)| Op::Leave(c, r)),
            1 => (0..CONNS).prop_map(Op::Disconnect),
            2 => (0..CONNS, 0..ROOMS).prop_map(|(c, r)| Op::Relay(c, r)),
        ]
    }

    fn assert_consistent(registry: &RoomRegistry) {
        for (key, room) in &registry.rooms {
            assert!(!room.members.is_empty(), "empty room {} kept", key);
            assert!(room.members.len() <= 2, "room {} over capacity", key);
            for conn in room.members.keys() {
                assert_eq!(registry.connections.get(conn), Some(key));
            }
        }
        for (conn, key) in &registry.connections {
            let room = registry.rooms.get(key).expect("index points at missing room");
            assert!(room.members.contains_key(conn));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_registry_stays_consistent(ops in prop::collection::vec(op_strategy(), 1..60)) {
            let mut registry = RoomRegistry::new();
            let mut clients: Vec<Client> = (0..CONNS).map(|i| Client::new(&format!("c{}", i))).collect();
            let rooms: Vec<RoomKey> = (0..ROOMS).map(|i| RoomKey::from(format!("R{}", i).as_str())).collect();

            for op in ops {
                match op {
                    Op::Join(c, r) => {
                        let before = registry.room_size(&rooms[r]);
                        let outcome = clients[c].join(&mut registry, rooms[r].as_str(), "u");
                        if before >= 2 {
                            prop_assert_eq!(outcome, JoinOutcome::RoomFull);
                            prop_assert_eq!(registry.room_size(&rooms[r]), before);
                        }
                    }
                    Op::Leave(c, r) => {
                        registry.leave(&clients[c].id, &rooms[r]);
                    }
                    Op::Disconnect(c) => {
                        registry.disconnect(&clients[c].id);
                        prop_assert!(registry.room_of(&clients[c].id).is_none());
                    }
                    Op::Relay(c, r) => {
                        let sender = clients[c].id;
                        let sender_in_room = registry.room_of(&sender) == Some(&rooms[r]);
                        let expected = registry.room_size(&rooms[r]) - usize::from(sender_in_room);
                        let delivered = registry.relay(&sender, SignalKind::Offer, offer(), &rooms[r]);
                        prop_assert_eq!(delivered, expected);
                    }
                }
                assert_consistent(&registry);
                for client in &mut clients {
                    client.drain();
                }
            }
        }

        #[test]
        fn prop_only_two_of_many_joiners_fit(joiners in 3usize..10) {
            let mut registry = RoomRegistry::new();
            let mut clients: Vec<Client> = (0..joiners).map(|i| Client::new(&format!("c{}", i))).collect();

            for (i, client) in clients.iter().enumerate() {
                let outcome = client.join(&mut registry, "R1", "u");
                let expected = if i < 2 { JoinOutcome::Joined } else { JoinOutcome::RoomFull };
                prop_assert_eq!(outcome, expected);
            }
            prop_assert_eq!(registry.room_size(&RoomKey::from("R1")), 2);
            for client in clients.iter_mut().skip(2) {
                let msgs = client.drain();
                prop_assert_eq!(events(&msgs), vec!["room-full"]);
            }
        }
    }
}
