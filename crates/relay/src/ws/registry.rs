// Room registry: session token -> live member connections.
//
// One coarse lock guards the whole map. Every critical section is a few map
// operations with no await inside, so a std mutex is enough and lets
// membership be released from `Drop`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use axum::extract::ws::Utf8Bytes;
use collab_common::token::SessionToken;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::metrics;

pub type ConnectionId = Uuid;

/// Result of queueing one frame for one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Recipient's queue is full; this frame is dropped for it.
    Full,
    /// Recipient's socket task has gone away.
    Closed,
}

/// A room's view of one member: its id and the sending half of its outbound
/// queue. The socket task owns the receiving half and therefore the
/// connection's lifetime.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Utf8Bytes>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Utf8Bytes>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Queue a frame without waiting. Never blocks the caller.
    pub fn try_deliver(&self, frame: Utf8Bytes) -> Delivery {
        match self.outbound.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<SessionToken, HashMap<ConnectionId, ConnectionHandle>>>,
}

impl RoomRegistry {
    /// Add `connection` to the room for `token`, creating the room if needed.
    /// Returns the room size after the join.
    pub fn join(&self, token: &SessionToken, connection: ConnectionHandle) -> usize {
        let mut guard = self.rooms.lock().expect("room registry lock poisoned");
        let members = guard.entry(token.clone()).or_default();
        members.insert(connection.id(), connection);
        let room_size = members.len();
        metrics::set_rooms_active(guard.len());
        room_size
    }

    /// Remove `connection_id` from the room for `token`. The room is dropped
    /// as soon as it has no members. Unknown tokens or ids are a no-op.
    ///
    /// Returns true when a member was actually removed.
    pub fn leave(&self, token: &SessionToken, connection_id: ConnectionId) -> bool {
        let mut guard = self.rooms.lock().expect("room registry lock poisoned");
        let Some(members) = guard.get_mut(token) else {
            return false;
        };

        let removed = members.remove(&connection_id).is_some();
        if members.is_empty() {
            guard.remove(token);
        }
        metrics::set_rooms_active(guard.len());
        removed
    }

    /// Snapshot of the room's members minus `excluding`. Empty if the room
    /// does not exist.
    pub fn broadcast_targets(
        &self,
        token: &SessionToken,
        excluding: ConnectionId,
    ) -> Vec<ConnectionHandle> {
        let guard = self.rooms.lock().expect("room registry lock poisoned");
        guard
            .get(token)
            .map(|members| {
                members.values().filter(|member| member.id() != excluding).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn room_size(&self, token: &SessionToken) -> usize {
        self.rooms
            .lock()
            .expect("room registry lock poisoned")
            .get(token)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub fn contains_room(&self, token: &SessionToken) -> bool {
        self.rooms.lock().expect("room registry lock poisoned").contains_key(token)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().expect("room registry lock poisoned").len()
    }

    /// Ids of the members of `token`'s room, sorted.
    pub fn members(&self, token: &SessionToken) -> Vec<ConnectionId> {
        let mut members = self
            .rooms
            .lock()
            .expect("room registry lock poisoned")
            .get(token)
            .map(|members| members.keys().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        members.sort();
        members
    }
}

/// Membership of one connection in one room.
///
/// Leaving happens exactly once: either through [`RoomMembership::leave`] or
/// when the value is dropped.
#[derive(Debug)]
pub struct RoomMembership {
    registry: Arc<RoomRegistry>,
    token: SessionToken,
    connection_id: ConnectionId,
    active: bool,
}

impl RoomMembership {
    pub fn join(
        registry: Arc<RoomRegistry>,
        token: SessionToken,
        connection: ConnectionHandle,
    ) -> (Self, usize) {
        let connection_id = connection.id();
        let room_size = registry.join(&token, connection);
        (Self { registry, token, connection_id, active: true }, room_size)
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn leave(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.active) {
            self.registry.leave(&self.token, self.connection_id);
        }
    }
}

impl Drop for RoomMembership {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::ws::Utf8Bytes;
    use collab_common::token::SessionToken;
    use proptest::prelude::*;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::{ConnectionHandle, Delivery, RoomMembership, RoomRegistry};

    fn token(value: &str) -> SessionToken {
        SessionToken::from_segment(value).expect("test token should be valid")
    }

    fn fake_connection(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Utf8Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (ConnectionHandle::new(Uuid::new_v4(), sender), receiver)
    }

    #[test]
    fn join_creates_room_and_leave_removes_it_when_empty() {
        let registry = RoomRegistry::default();
        let room = token("sess-42");
        let (a, _a_rx) = fake_connection(4);
        let (b, _b_rx) = fake_connection(4);
        let (a_id, b_id) = (a.id(), b.id());

        assert!(!registry.contains_room(&room));
        assert_eq!(registry.join(&room, a), 1);
        assert_eq!(registry.join(&room, b), 2);
        assert_eq!(registry.room_count(), 1);

        assert!(registry.leave(&room, b_id));
        assert!(registry.contains_room(&room));
        assert_eq!(registry.members(&room), vec![a_id]);

        assert!(registry.leave(&room, a_id));
        assert!(!registry.contains_room(&room));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn leave_for_unknown_room_or_member_is_a_noop() {
        let registry = RoomRegistry::default();
        let room = token("sess-42");
        let (a, _a_rx) = fake_connection(4);
        let a_id = a.id();

        assert!(!registry.leave(&room, a_id));
        registry.join(&room, a);
        assert!(!registry.leave(&room, Uuid::new_v4()));
        assert!(!registry.leave(&token("other"), a_id));
        assert_eq!(registry.room_size(&room), 1);

        assert!(registry.leave(&room, a_id));
        assert!(!registry.leave(&room, a_id));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn broadcast_targets_exclude_sender() {
        let registry = RoomRegistry::default();
        let room = token("sess-42");
        let (a, _a_rx) = fake_connection(4);
        let (b, _b_rx) = fake_connection(4);
        let (c, _c_rx) = fake_connection(4);
        let (a_id, b_id, c_id) = (a.id(), b.id(), c.id());
        registry.join(&room, a);
        registry.join(&room, b);
        registry.join(&room, c);

        let mut targets =
            registry.broadcast_targets(&room, a_id).iter().map(|t| t.id()).collect::<Vec<_>>();
        targets.sort();
        let mut expected = vec![b_id, c_id];
        expected.sort();
        assert_eq!(targets, expected);
    }

    #[test]
    fn broadcast_targets_for_missing_room_is_empty() {
        let registry = RoomRegistry::default();
        assert!(registry.broadcast_targets(&token("nobody"), Uuid::new_v4()).is_empty());
    }

    #[test]
    fn rooms_are_isolated() {
        let registry = RoomRegistry::default();
        let (a, _a_rx) = fake_connection(4);
        let (c, _c_rx) = fake_connection(4);
        let (a_id, c_id) = (a.id(), c.id());
        registry.join(&token("tok1"), a);
        registry.join(&token("tok2"), c);

        assert!(registry.broadcast_targets(&token("tok1"), a_id).is_empty());
        assert!(registry.broadcast_targets(&token("tok2"), c_id).is_empty());
        assert_eq!(registry.room_count(), 2);
    }

    #[derive(Debug, Clone)]
    enum RoomOp {
        Join { room: usize },
        Leave { pick: usize },
        LeaveUnknown { room: usize },
    }

    fn room_op() -> impl Strategy<Value = RoomOp> {
        prop_oneof![
            3 => (0usize..3).prop_map(|room| RoomOp::Join { room }),
            2 => any::<usize>().prop_map(|pick| RoomOp::Leave { pick }),
            1 => (0usize..3).prop_map(|room| RoomOp::LeaveUnknown { room }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            max_shrink_iters: 128,
            .. ProptestConfig::default()
        })]

        #[test]
        fn room_exists_iff_it_has_members_for_interleaved_sequences(
            ops in prop::collection::vec(room_op(), 1..200),
        ) {
            let registry = RoomRegistry::default();
            let rooms = [token("r0"), token("r1"), token("r2")];
            let mut joined: Vec<(usize, Uuid)> = Vec::new();
            let mut receivers = Vec::new();

            for op in ops {
                match op {
                    RoomOp::Join { room } => {
                        let (handle, receiver) = fake_connection(1);
                        joined.push((room, handle.id()));
                        receivers.push(receiver);
                        registry.join(&rooms[room], handle);
                    }
                    RoomOp::Leave { pick } if !joined.is_empty() => {
                        let (room, id) = joined.remove(pick % joined.len());
                        prop_assert!(registry.leave(&rooms[room], id));
                    }
                    RoomOp::Leave { .. } => {}
                    RoomOp::LeaveUnknown { room } => {
                        prop_assert!(!registry.leave(&rooms[room], Uuid::new_v4()));
                    }
                }

                for (index, room) in rooms.iter().enumerate() {
                    let expected = joined.iter().filter(|(i, _)| *i == index).count();
                    prop_assert_eq!(registry.room_size(room), expected);
                    prop_assert_eq!(registry.contains_room(room), expected > 0);
                }
                prop_assert_eq!(
                    registry.room_count(),
                    (0..rooms.len()).filter(|i| joined.iter().any(|(r, _)| r == i)).count()
                );
            }
        }
    }

    #[test]
    fn membership_leaves_exactly_once() {
        let registry = Arc::new(RoomRegistry::default());
        let room = token("sess-42");
        let (a, _a_rx) = fake_connection(4);
        let (b, _b_rx) = fake_connection(4);

        let (membership_a, size) = RoomMembership::join(Arc::clone(&registry), room.clone(), a);
        assert_eq!(size, 1);
        let (membership_b, size) = RoomMembership::join(Arc::clone(&registry), room.clone(), b);
        assert_eq!(size, 2);

        membership_a.leave();
        assert_eq!(registry.room_size(&room), 1);

        drop(membership_b);
        assert!(!registry.contains_room(&room));
    }

    #[test]
    fn try_deliver_reports_full_and_closed_queues() {
        let (handle, mut receiver) = fake_connection(1);

        assert_eq!(handle.try_deliver("one".into()), Delivery::Queued);
        assert_eq!(handle.try_deliver("two".into()), Delivery::Full);
        assert_eq!(receiver.try_recv().expect("first frame should be queued").as_str(), "one");

        drop(receiver);
        assert!(!handle.is_open());
        assert_eq!(handle.try_deliver("three".into()), Delivery::Closed);
    }

    #[tokio::test]
    async fn concurrent_joins_and_leaves_keep_invariant() {
        let registry = Arc::new(RoomRegistry::default());
        let room = token("busy");

        let tasks = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let room = room.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let (handle, _receiver) = fake_connection(1);
                        let (membership, _) =
                            RoomMembership::join(Arc::clone(&registry), room.clone(), handle);
                        let _ = registry.broadcast_targets(&room, membership.connection_id());
                        tokio::task::yield_now().await;
                        membership.leave();
                    }
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            task.await.expect("join/leave task should not panic");
        }

        assert_eq!(registry.room_count(), 0);
        assert!(!registry.contains_room(&room));
    }
}
