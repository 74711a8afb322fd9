use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use collab_common::token::SessionToken;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::registry::{ConnectionHandle, ConnectionId, RoomMembership, RoomRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    /// Admitted by the router, not yet in a room.
    Connecting,
    /// Member of its room; sends and receives relayed frames.
    Joined,
    /// Terminal. The room no longer lists this connection.
    Closed,
}

/// One client socket's relay-side state.
///
/// The token is fixed at admission. `close` may be called any number of
/// times; the room is left once, and dropping a joined connection leaves it
/// as well.
#[derive(Debug)]
pub(crate) struct Connection {
    id: ConnectionId,
    token: SessionToken,
    state: ConnectionState,
    membership: Option<RoomMembership>,
}

impl Connection {
    pub(crate) fn admit(token: SessionToken) -> Self {
        Self { id: Uuid::new_v4(), token, state: ConnectionState::Connecting, membership: None }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn token(&self) -> &SessionToken {
        &self.token
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    /// `Connecting -> Joined`. Returns the room size after joining, or `None`
    /// when the connection is not in the `Connecting` state.
    pub(crate) fn join(
        &mut self,
        registry: Arc<RoomRegistry>,
        outbound: mpsc::Sender<Utf8Bytes>,
    ) -> Option<usize> {
        if self.state != ConnectionState::Connecting {
            return None;
        }

        let (membership, room_size) = RoomMembership::join(
            registry,
            self.token.clone(),
            ConnectionHandle::new(self.id, outbound),
        );
        self.membership = Some(membership);
        self.state = ConnectionState::Joined;
        Some(room_size)
    }

    /// Move to `Closed`, leaving the room if joined. Returns true only for the
    /// call that performed the transition.
    pub(crate) fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }

        if let Some(membership) = self.membership.take() {
            membership.leave();
        }
        self.state = ConnectionState::Closed;
        true
    }
}
