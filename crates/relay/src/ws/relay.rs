// Steady-state fan-out: stamp one inbound payload and queue it for every
// other member of the sender's room.

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use collab_common::{
    protocol::collab::{PayloadError, RelayPayload},
    token::SessionToken,
};
use tracing::debug;

use super::registry::{ConnectionId, Delivery, RoomRegistry};
use crate::metrics;

/// Inbound data as it came off the socket.
#[derive(Debug, Clone, Copy)]
pub(crate) enum InboundFrame<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RelayOutcome {
    pub(crate) delivered: usize,
    pub(crate) skipped: usize,
}

/// Parse, stamp and fan out one message from `sender` in `token`'s room.
///
/// Errors only describe why the payload was dropped; nothing is sent back to
/// the sender and the connection stays joined.
pub(crate) fn relay_message(
    registry: &RoomRegistry,
    token: &SessionToken,
    sender: ConnectionId,
    frame: InboundFrame<'_>,
    received_at: DateTime<Utc>,
) -> Result<RelayOutcome, PayloadError> {
    let payload = match frame {
        InboundFrame::Text(raw) => RelayPayload::parse(raw),
        InboundFrame::Binary(raw) => RelayPayload::parse_bytes(raw),
    };
    let payload = match payload {
        Ok(payload) => payload,
        Err(error) => {
            metrics::record_malformed_message();
            return Err(error);
        }
    };

    let encoded = Utf8Bytes::from(payload.stamp(received_at).encode()?);

    let mut outcome = RelayOutcome::default();
    for target in registry.broadcast_targets(token, sender) {
        match target.try_deliver(encoded.clone()) {
            Delivery::Queued => outcome.delivered += 1,
            Delivery::Full | Delivery::Closed => {
                debug!(
                    session_token = %token,
                    connection_id = %target.id(),
                    sender_id = %sender,
                    "skipping recipient that is not ready"
                );
                outcome.skipped += 1;
            }
        }
    }

    metrics::record_relay(outcome.delivered, outcome.skipped);
    Ok(outcome)
}
