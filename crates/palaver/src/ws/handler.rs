//! WebSocket endpoint: upgrade, read loop, and the action dispatch table.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::header::ORIGIN;
use axum::response::Response;
use futures::StreamExt;
use futures::stream::SplitStream;
use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::api::{ApiError, AppState};
use crate::auth::Principal;

use super::connection::{ConnectionHandle, write_loop};
use super::types::{EventKind, InboundMessage, OutboundMessage};

/// GET /ws: upgrade an authenticated request to a hub connection.
///
/// The principal was established by the auth middleware; here we only gate
/// on the browser origin and the frame-size cap before handing the socket
/// to the connection loops.
pub async fn ws_handler(
    State(state): State<AppState>,
    principal: Principal,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    check_origin(&headers, &state.ws.allowed_origin)?;

    let ws = ws.max_message_size(state.ws.max_frame_bytes);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, principal)))
}

/// Browsers always send `Origin`; it must match the configured value.
/// Non-browser clients send none, which is allowed since they cannot carry
/// an ambient cookie session the way a browser can.
fn check_origin(headers: &HeaderMap, allowed_origin: &str) -> Result<(), ApiError> {
    match headers.get(ORIGIN) {
        None => Ok(()),
        Some(origin) if origin.as_bytes() == allowed_origin.as_bytes() => Ok(()),
        Some(origin) => {
            warn!("rejecting upgrade from origin {origin:?}");
            Err(ApiError::forbidden("origin not allowed"))
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, principal: Principal) {
    let (sink, mut stream) = socket.split();

    let (outbound_tx, outbound_rx) = mpsc::channel(state.ws.outbound_queue);
    let conn = ConnectionHandle::new(&principal.id, outbound_tx);
    info!("connection {} opened for {}", conn.id(), conn.principal());

    state.hub.register(conn.clone()).await;
    let writer = tokio::spawn(write_loop(
        sink,
        outbound_rx,
        state.ws.heartbeat_interval(),
    ));

    // Room memberships held by this connection, by id. All dereferencing
    // goes through the hub.
    let mut joined: HashSet<String> = HashSet::new();

    read_loop(&mut stream, &state, &conn, &mut joined).await;

    disconnect(&state, &conn, &joined).await;
    writer.abort();
    info!("connection {} closed", conn.id());
}

/// Block on socket reads until an error, a close frame, or a read-deadline
/// expiry. Each complete text frame is decoded and dispatched inline;
/// handlers only call collaborator services and enqueue outbound frames.
async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    state: &AppState,
    conn: &ConnectionHandle,
    joined: &mut HashSet<String>,
) {
    let deadline = state.ws.read_deadline();

    loop {
        let frame = match tokio::time::timeout(deadline, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) => {
                debug!("connection {}: read error: {err}", conn.id());
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!("connection {}: read deadline expired", conn.id());
                break;
            }
        };

        match frame {
            Message::Text(text) => match serde_json::from_str::<InboundMessage>(text.as_str()) {
                Ok(msg) => dispatch(state, conn, joined, msg).await,
                Err(err) => {
                    // Malformed or unknown action: drop the frame, keep the
                    // connection.
                    warn!("connection {}: unreadable envelope: {err}", conn.id());
                }
            },
            Message::Binary(_) => {
                debug!("connection {}: ignoring binary frame", conn.id());
            }
            // Any frame counts as liveness; pings are answered by axum.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }
}

/// Idempotent teardown: deregistration is id-based, so a second invocation
/// finds nothing left to remove.
async fn disconnect(state: &AppState, conn: &ConnectionHandle, joined: &HashSet<String>) {
    if !conn.begin_close() {
        return;
    }
    for room_id in joined {
        state.hub.leave(room_id, conn.id()).await;
    }
    state.hub.unregister(conn.id()).await;
}

async fn dispatch(
    state: &AppState,
    conn: &ConnectionHandle,
    joined: &mut HashSet<String>,
    msg: InboundMessage,
) {
    match msg {
        InboundMessage::JoinUser => join_user(state, conn, joined).await,
        InboundMessage::JoinGuild { room } => join_guild(state, conn, joined, room).await,
        InboundMessage::JoinChannel { room } => join_channel(state, conn, joined, room).await,
        InboundMessage::LeaveRoom { room } => leave_room(state, conn, joined, &room).await,
        InboundMessage::LeaveGuild { room } => leave_guild(state, conn, joined, room).await,
        InboundMessage::StartTyping { room, message } => {
            typing_event(state, &room, message, EventKind::AddToTyping).await;
        }
        InboundMessage::StopTyping { room, message } => {
            typing_event(state, &room, message, EventKind::RemoveFromTyping).await;
        }
        InboundMessage::ToggleOnline => toggle_online(state, conn, true).await,
        InboundMessage::ToggleOffline => toggle_online(state, conn, false).await,
        InboundMessage::GetRequestCount => request_count(state, conn).await,
    }
}

/// Join the caller's personal room: its name is the principal id and no
/// authorization applies.
async fn join_user(state: &AppState, conn: &ConnectionHandle, joined: &mut HashSet<String>) {
    let room = conn.principal().to_string();
    join_room(state, conn, joined, room).await;
}

async fn join_channel(
    state: &AppState,
    conn: &ConnectionHandle,
    joined: &mut HashSet<String>,
    room: String,
) {
    // Unauthorized and failed lookups fall through silently; the client
    // sees nothing either way.
    match state.channels.channel_member(&room, conn.principal()).await {
        Ok(true) => join_room(state, conn, joined, room).await,
        Ok(false) => debug!(
            "connection {}: {} is not a member of channel {room}",
            conn.id(),
            conn.principal()
        ),
        Err(err) => debug!("channel lookup for {room} failed: {err:#}"),
    }
}

async fn join_guild(
    state: &AppState,
    conn: &ConnectionHandle,
    joined: &mut HashSet<String>,
    room: String,
) {
    match state.guilds.guild_member(&room, conn.principal()).await {
        Ok(true) => join_room(state, conn, joined, room).await,
        Ok(false) => debug!(
            "connection {}: {} is not a member of guild {room}",
            conn.id(),
            conn.principal()
        ),
        Err(err) => debug!("guild lookup for {room} failed: {err:#}"),
    }
}

async fn join_room(
    state: &AppState,
    conn: &ConnectionHandle,
    joined: &mut HashSet<String>,
    room: String,
) {
    state.hub.join(&room, conn.clone()).await;
    joined.insert(room);
}

async fn leave_room(
    state: &AppState,
    conn: &ConnectionHandle,
    joined: &mut HashSet<String>,
    room: &str,
) {
    joined.remove(room);
    state.hub.leave(room, conn.id()).await;
}

/// Leaving a guild also records when the member last saw it, so unread
/// markers start from the right point on the next visit.
async fn leave_guild(
    state: &AppState,
    conn: &ConnectionHandle,
    joined: &mut HashSet<String>,
    room: String,
) {
    if let Err(err) = state
        .guilds
        .update_member_last_seen(conn.principal(), &room)
        .await
    {
        debug!("last-seen update for guild {room} failed: {err:#}");
    }
    leave_room(state, conn, joined, &room).await;
}

/// Re-wrap the typing payload under the indicator action and publish it to
/// the room. Nothing is persisted.
async fn typing_event(state: &AppState, room_id: &str, message: Option<String>, kind: EventKind) {
    let Some(room) = state.hub.room(room_id).await else {
        return;
    };
    let data = message.map_or(Value::Null, Value::String);
    room.publish(&OutboundMessage::new(kind, data)).await;
}

/// Persist the presence flip, then tell everyone who can see this user:
/// the personal rooms of their friends and the rooms of their guilds.
async fn toggle_online(state: &AppState, conn: &ConnectionHandle, online: bool) {
    let principal = conn.principal();

    if let Err(err) = state.users.set_online(principal, online).await {
        warn!("presence update for {principal} failed: {err:#}");
        return;
    }

    let ids = match state.users.friend_and_guild_ids(principal).await {
        Ok(ids) => ids,
        Err(err) => {
            warn!("social graph lookup for {principal} failed: {err:#}");
            return;
        }
    };

    let kind = if online {
        EventKind::ToggleOnline
    } else {
        EventKind::ToggleOffline
    };
    // One encode: every room republishes the identical bytes.
    let payload = OutboundMessage::new(kind, Value::String(principal.to_string())).encode();

    for id in ids {
        if let Some(room) = state.hub.room(&id).await {
            room.publish_bytes(payload.clone()).await;
        }
    }
}

/// Push the pending-request count into the caller's personal room.
async fn request_count(state: &AppState, conn: &ConnectionHandle) {
    let Some(room) = state.hub.room(conn.principal()).await else {
        return;
    };
    match state.users.request_count(conn.principal()).await {
        Ok(count) => {
            room.publish(&OutboundMessage::new(EventKind::RequestCount, json!(count)))
                .await;
        }
        Err(err) => debug!(
            "request count lookup for {} failed: {err:#}",
            conn.principal()
        ),
    }
}
