//! Event fan-out to live connections.

use std::collections::HashSet;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::database;
use crate::protocol;
use crate::registry::ConnId;
use crate::websocket::ServerState;

/// Deliver an event to a chat.
///
/// If any connection has joined the chat's live room, exactly that set
/// receives the event. Otherwise every live connection of every persisted
/// member receives it, deduplicated by connection.
pub async fn to_chat(state: &ServerState, chat_id: &str, kind: &str, data: Value) -> Result<()> {
    let frame = protocol::make_event(kind, data);

    let live = state.rooms.live_members_of(chat_id);
    if !live.is_empty() {
        deliver(state, live, &frame);
        return Ok(());
    }

    let mut targets: HashSet<ConnId> = HashSet::new();
    for user_id in database::list_user_ids_for_chat(&state.db_pool, chat_id).await? {
        targets.extend(state.sessions.connections_of(&user_id));
    }
    deliver(state, targets, &frame);
    Ok(())
}

/// Deliver an event to every live connection of one user.
pub fn to_user(state: &ServerState, user_id: &str, kind: &str, data: Value) {
    let frame = protocol::make_event(kind, data);
    deliver(state, state.sessions.connections_of(user_id), &frame);
}

/// Deliver an event to every connection of every user sharing at least one
/// chat with `user_id`, the user's own other connections included. Used
/// for presence propagation.
pub async fn to_related(state: &ServerState, user_id: &str, kind: &str, data: Value) -> Result<()> {
    let frame = protocol::make_event(kind, data);

    let mut targets: HashSet<ConnId> = HashSet::new();
    for related in database::list_related_user_ids(&state.db_pool, user_id).await? {
        targets.extend(state.sessions.connections_of(&related));
    }
    deliver(state, targets, &frame);
    Ok(())
}

/// Best-effort delivery. Sender handles are snapshotted out of the shared
/// maps before any write; a failed send means the peer is already
/// disconnecting, and the close path reconciles registry state.
fn deliver(state: &ServerState, targets: impl IntoIterator<Item = ConnId>, frame: &str) {
    let handles: Vec<(ConnId, mpsc::Sender<String>)> = targets
        .into_iter()
        .filter_map(|conn| state.sender_of(conn).map(|tx| (conn, tx)))
        .collect();

    for (conn, tx) in handles {
        if let Err(e) = tx.try_send(frame.to_string()) {
            debug!("dropping event for connection {}: {}", conn, e);
        }
    }
}
