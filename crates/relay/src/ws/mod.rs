// Collaboration WebSocket surface: admission on `/collaboration/{token}`,
// then one task per socket relaying frames through the room registry.

mod connection;
mod registry;
mod relay;

pub use registry::RoomRegistry;

use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use collab_common::{protocol::collab::ServerMessage, token::SessionToken};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use self::{
    connection::Connection,
    relay::{relay_message, InboundFrame},
};
use crate::config::RelaySettings;
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope,
    AdmissionRejected,
};
use crate::metrics;

pub(crate) const COLLABORATION_ROUTE: &str = "/collaboration/{token}";

#[derive(Clone)]
struct RelayRouterState {
    registry: Arc<RoomRegistry>,
    settings: Arc<RelaySettings>,
}

/// Routes for the upgrade listener. Anything that is not a collaboration
/// upgrade falls through to [`reject_admission`].
pub fn router(registry: Arc<RoomRegistry>, settings: RelaySettings) -> Router {
    let state = RelayRouterState { registry, settings: Arc::new(settings) };

    Router::new()
        .route(COLLABORATION_ROUTE, get(ws_upgrade).fallback(reject_admission))
        .fallback(reject_admission)
        .with_state(state)
}

async fn reject_admission(uri: Uri) -> AdmissionRejected {
    debug!(path = %uri.path(), "rejecting non-collaboration request");
    metrics::record_connection_rejected();
    AdmissionRejected
}

async fn ws_upgrade(
    State(state): State<RelayRouterState>,
    uri: Uri,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = match SessionToken::from_collaboration_path(uri.path()) {
        Ok(token) => token,
        Err(error) => {
            debug!(path = %uri.path(), error = %error, "rejecting collaboration request");
            metrics::record_connection_rejected();
            return AdmissionRejected.into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!(
                session_token = %token,
                rejection = %rejection,
                "rejecting collaboration request without websocket upgrade"
            );
            metrics::record_connection_rejected();
            return AdmissionRejected.into_response();
        }
    };

    let RelayRouterState { registry, settings } = state;
    let request_id = request_id_from_headers_or_generate(&headers);
    upgrade
        .max_message_size(settings.max_message_bytes)
        .max_frame_size(settings.max_message_bytes)
        .on_upgrade(move |socket| {
            with_request_id_scope(request_id, handle_socket(registry, settings, token, socket))
        })
}

async fn handle_socket(
    registry: Arc<RoomRegistry>,
    settings: Arc<RelaySettings>,
    token: SessionToken,
    mut socket: WebSocket,
) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let mut connection = Connection::admit(token);
    let (outbound_sender, mut outbound_receiver) =
        mpsc::channel::<Utf8Bytes>(settings.outbound_queue_capacity);

    let Some(room_size) = connection.join(Arc::clone(&registry), outbound_sender) else {
        return;
    };
    metrics::record_connection_admitted();
    info!(
        session_token = %connection.token(),
        connection_id = %connection.id(),
        request_id = %request_id,
        room_size,
        "connection joined room"
    );

    if send_connected_confirmation(&mut socket, &settings.connected_message).await {
        loop {
            tokio::select! {
                maybe_outbound = outbound_receiver.recv() => {
                    let Some(frame) = maybe_outbound else {
                        break;
                    };
                    // A dead socket only ends this connection; senders never see it.
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                maybe_message = socket.recv() => {
                    let Some(message) = maybe_message else {
                        break;
                    };

                    match message {
                        Ok(Message::Text(raw)) => {
                            relay_inbound(&registry, &connection, InboundFrame::Text(raw.as_str()));
                        }
                        Ok(Message::Binary(raw)) => {
                            relay_inbound(&registry, &connection, InboundFrame::Binary(&raw));
                        }
                        Ok(Message::Close(_)) => break,
                        // tungstenite answers pings itself.
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                        Err(error) => {
                            warn!(
                                session_token = %connection.token(),
                                connection_id = %connection.id(),
                                error = %error,
                                "websocket receive failed"
                            );
                            break;
                        }
                    }
                }
            }
        }
    }

    connection.close();
    metrics::record_connection_closed();
    info!(
        session_token = %connection.token(),
        connection_id = %connection.id(),
        request_id = %request_id,
        "connection closed"
    );
}

async fn send_connected_confirmation(socket: &mut WebSocket, text: &str) -> bool {
    let encoded = match ServerMessage::connected(text).encode() {
        Ok(encoded) => encoded,
        Err(error) => {
            error!(error = %error, "failed to encode connection confirmation");
            return false;
        }
    };

    socket.send(Message::Text(encoded.into())).await.is_ok()
}

fn relay_inbound(registry: &RoomRegistry, connection: &Connection, frame: InboundFrame<'_>) {
    match relay_message(registry, connection.token(), connection.id(), frame, Utc::now()) {
        Ok(outcome) => {
            debug!(
                session_token = %connection.token(),
                connection_id = %connection.id(),
                delivered = outcome.delivered,
                skipped = outcome.skipped,
                "relayed message"
            );
        }
        Err(error) => {
            debug!(
                session_token = %connection.token(),
                connection_id = %connection.id(),
                error = %error,
                "dropping malformed message"
            );
        }
    }
}
