//! WebSocket handling: connection lifecycle and event dispatch

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::{json, Value};
use sqlx::{Pool, Sqlite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::{self, TokenError};
use crate::broadcast;
use crate::config::ServerConfig;
use crate::database;
use crate::protocol::{self, Envelope, PresenceStatus};
use crate::registry::{ConnId, RoomTracker, SessionRegistry};

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

/// Server state shared across connections
pub struct ServerState {
    pub db_pool: Pool<Sqlite>,
    pub config: ServerConfig,
    /// Connection <-> user bindings; the authentication source of truth
    pub sessions: SessionRegistry,
    /// Live per-chat room membership
    pub rooms: RoomTracker,
    /// Outbound sender handle per live connection
    connections: dashmap::DashMap<ConnId, mpsc::Sender<String>>,
    next_conn_id: AtomicU64,
}

impl ServerState {
    pub fn new(db_pool: Pool<Sqlite>, config: ServerConfig) -> Self {
        Self {
            db_pool,
            config,
            sessions: SessionRegistry::new(),
            rooms: RoomTracker::new(),
            connections: dashmap::DashMap::new(),
            next_conn_id: AtomicU64::new(0),
        }
    }

    /// Register a new live connection and hand back its id.
    pub fn register_connection(&self, tx: mpsc::Sender<String>) -> ConnId {
        let conn = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections.insert(conn, tx);
        conn
    }

    /// Outbound handle for a connection, if it is still live.
    pub fn sender_of(&self, conn: ConnId) -> Option<mpsc::Sender<String>> {
        self.connections.get(&conn).map(|tx| tx.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// One live client connection as seen by the dispatch router.
pub struct Client {
    pub id: ConnId,
    pub tx: mpsc::Sender<String>,
}

impl Client {
    /// Send one event back to this client.
    pub async fn send(&self, kind: &str, data: Value) -> Result<()> {
        self.tx
            .send(protocol::make_event(kind, data))
            .await
            .map_err(|_| anyhow!("connection closed"))
    }
}

// ---------------------------------------------------------------------------
// WebSocket upgrade handler
// ---------------------------------------------------------------------------

pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

// ---------------------------------------------------------------------------
// Socket lifecycle
// ---------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, addr: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let conn_id = state.register_connection(tx.clone());
    let client = Client { id: conn_id, tx };

    info!("New connection {} from {}", conn_id, addr);

    // Forward outbound frames and send periodic pings
    let ping_interval_secs = state.config.ws_ping_interval;
    let forward_task = tokio::spawn(async move {
        let mut ping_ticker =
            tokio::time::interval(std::time::Duration::from_secs(ping_interval_secs));
        ping_ticker.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(text) => {
                            if ws_sender.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_ticker.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Main receive loop
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_frame(&state, &client, &text).await,
            Ok(Message::Binary(_)) => { /* ignore binary frames */ }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => { /* axum auto-responds to pings */ }
            Err(e) => {
                debug!("Socket error on connection {}: {}", conn_id, e);
                break;
            }
        }
    }

    close_connection(&state, conn_id).await;
    forward_task.abort();
    info!("Connection {} closed", conn_id);
}

/// Decode and route one inbound frame. Malformed frames and failed
/// operations are reported to the client; the connection stays open.
async fn handle_frame(state: &ServerState, client: &Client, text: &str) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            let _ = client.send("error", json!({ "message": e.to_string() })).await;
            return;
        }
    };
    if let Err(e) = dispatch(state, client, envelope).await {
        // Log the full error server-side but keep the client message generic.
        error!("Error handling event on connection {}: {}", client.id, e);
        let _ = client
            .send("error", json!({ "message": "request failed" }))
            .await;
    }
}

/// Authoritative cleanup for a closed connection: drop the outbound
/// handle, leave every live room, unbind the session, and if that was the
/// user's last connection, persist and broadcast `offline`.
pub async fn close_connection(state: &ServerState, conn: ConnId) {
    state.connections.remove(&conn);
    let unbound = state.sessions.unbind(conn);
    state.rooms.leave_all(conn);

    let Some(user_id) = unbound else {
        return;
    };
    if !state.sessions.connections_of(&user_id).is_empty() {
        return;
    }

    if let Err(e) = database::set_user_status(&state.db_pool, &user_id, "offline").await {
        warn!("Failed to persist offline status for {}: {}", user_id, e);
    }
    let presence = json!({ "userId": user_id, "status": "offline" });
    if let Err(e) = broadcast::to_related(state, &user_id, "presence:update", presence).await {
        warn!("Failed to broadcast offline presence for {}: {}", user_id, e);
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// The closed set of client operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Hello,
    Register,
    Login,
    ChatList,
    ChatCreateDirect,
    GroupCreate,
    GroupInvite,
    UserFindByUsername,
    RoomJoin,
    MessageSend,
    PresenceUpdate,
}

impl OpKind {
    fn from_type(kind: &str) -> Option<Self> {
        match kind {
            "hello" => Some(OpKind::Hello),
            "auth:register" => Some(OpKind::Register),
            "auth:login" => Some(OpKind::Login),
            "chat:list" => Some(OpKind::ChatList),
            "chat:createDirect" => Some(OpKind::ChatCreateDirect),
            "group:create" => Some(OpKind::GroupCreate),
            "group:invite" => Some(OpKind::GroupInvite),
            "user:findByUsername" => Some(OpKind::UserFindByUsername),
            "room:join" => Some(OpKind::RoomJoin),
            "message:send" => Some(OpKind::MessageSend),
            "presence:update" => Some(OpKind::PresenceUpdate),
            _ => None,
        }
    }
}

/// Route one decoded envelope. A bound session is the only thing that
/// makes a connection "authenticated"; pre-auth operations are refused
/// once it exists, everything else is refused until it does.
pub async fn dispatch(state: &ServerState, client: &Client, envelope: Envelope) -> Result<()> {
    let Some(op) = OpKind::from_type(&envelope.kind) else {
        return client
            .send("error", json!({ "message": format!("unsupported event: {}", envelope.kind) }))
            .await;
    };

    let data = &envelope.data;
    let user_id = state.sessions.user_of(client.id);

    match (op, user_id) {
        (OpKind::Hello, None) => handle_hello(state, client, data).await,
        (OpKind::Register, None) => handle_register(state, client, data).await,
        (OpKind::Login, None) => handle_login(state, client, data).await,
        (OpKind::Hello | OpKind::Register | OpKind::Login, Some(_)) => {
            client
                .send("error", json!({ "message": "already authenticated" }))
                .await
        }
        (_, None) => {
            client
                .send("error", json!({ "message": "not authenticated" }))
                .await
        }
        (OpKind::ChatList, Some(user_id)) => handle_chat_list(state, client, &user_id).await,
        (OpKind::ChatCreateDirect, Some(user_id)) => {
            handle_chat_create_direct(state, client, &user_id, data).await
        }
        (OpKind::GroupCreate, Some(user_id)) => {
            handle_group_create(state, client, &user_id, data).await
        }
        (OpKind::GroupInvite, Some(user_id)) => {
            handle_group_invite(state, client, &user_id, data).await
        }
        (OpKind::UserFindByUsername, Some(_)) => handle_user_find(state, client, data).await,
        (OpKind::RoomJoin, Some(user_id)) => handle_room_join(state, client, &user_id, data).await,
        (OpKind::MessageSend, Some(user_id)) => {
            handle_message_send(state, client, &user_id, data).await
        }
        (OpKind::PresenceUpdate, Some(user_id)) => {
            handle_presence_update(state, client, &user_id, data).await
        }
    }
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

// ---------------------------------------------------------------------------
// Pre-auth handlers
// ---------------------------------------------------------------------------

async fn handle_hello(state: &ServerState, client: &Client, data: &Value) -> Result<()> {
    let Some(token) = str_field(data, "token") else {
        return client.send("error", json!({ "message": "missing token" })).await;
    };

    let claims = match auth::verify_token(&state.config.jwt_secret, token) {
        Ok(claims) => claims,
        Err(TokenError::Expired) => {
            return client.send("error", json!({ "message": "token expired" })).await;
        }
        Err(TokenError::Invalid) => {
            return client.send("error", json!({ "message": "invalid token" })).await;
        }
    };
    let user_id = claims.sub;

    state.sessions.bind(client.id, &user_id);
    database::set_user_status(&state.db_pool, &user_id, "online").await?;

    client.send("hello:ok", json!({ "userId": user_id })).await?;
    let presence = json!({ "userId": user_id, "status": "online" });
    broadcast::to_related(state, &user_id, "presence:update", presence).await
}

async fn handle_register(state: &ServerState, client: &Client, data: &Value) -> Result<()> {
    let display_name = str_field(data, "displayName").map(str::trim).unwrap_or_default();
    let username = str_field(data, "username")
        .map(|u| u.trim().to_lowercase())
        .unwrap_or_default();
    let password = str_field(data, "password").unwrap_or_default();
    let email = str_field(data, "email")
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty());

    if display_name.is_empty() || username.is_empty() || password.is_empty() {
        return client.send("auth:error", json!({ "message": "missing fields" })).await;
    }

    if database::get_user_by_username(&state.db_pool, &username).await?.is_some() {
        return client
            .send("auth:error", json!({ "message": "username already taken" }))
            .await;
    }
    if let Some(email) = email.as_deref() {
        if database::get_user_by_email(&state.db_pool, email).await?.is_some() {
            return client
                .send("auth:error", json!({ "message": "email already taken" }))
                .await;
        }
    }

    let password_hash = auth::hash_password(password)?;
    let mut user = database::create_user(
        &state.db_pool,
        &username,
        display_name,
        email.as_deref(),
        &password_hash,
    )
    .await?;

    let token = auth::mint_token(
        &state.config.jwt_secret,
        &user.id,
        &user.username,
        state.config.token_ttl_seconds,
    )?;

    state.sessions.bind(client.id, &user.id);
    database::set_user_status(&state.db_pool, &user.id, "online").await?;
    user.status = "online".to_string();

    let user_id = user.id.clone();
    client.send("auth:ok", json!({ "token": token, "user": user })).await?;
    client.send("hello:ok", json!({ "userId": user_id })).await
}

async fn handle_login(state: &ServerState, client: &Client, data: &Value) -> Result<()> {
    let username_or_email = str_field(data, "usernameOrEmail")
        .map(|v| v.trim().to_lowercase())
        .unwrap_or_default();
    let password = str_field(data, "password").unwrap_or_default();

    if username_or_email.is_empty() || password.is_empty() {
        return client
            .send("auth:error", json!({ "message": "missing credentials" }))
            .await;
    }

    let mut user = None;
    if username_or_email.contains('@') {
        user = database::get_user_by_email(&state.db_pool, &username_or_email).await?;
    }
    if user.is_none() {
        user = database::get_user_by_username(&state.db_pool, &username_or_email).await?;
    }

    // Unknown user and wrong password answer identically.
    let Some(user) = user else {
        return client
            .send("auth:error", json!({ "message": "invalid credentials" }))
            .await;
    };
    if !auth::verify_password(&user.password_hash, password) {
        return client
            .send("auth:error", json!({ "message": "invalid credentials" }))
            .await;
    }

    let token = auth::mint_token(
        &state.config.jwt_secret,
        &user.id,
        &user.username,
        state.config.token_ttl_seconds,
    )?;

    state.sessions.bind(client.id, &user.id);
    database::set_user_status(&state.db_pool, &user.id, "online").await?;

    let mut public = database::PublicUser::from(user);
    public.status = "online".to_string();
    let user_id = public.id.clone();

    client.send("auth:ok", json!({ "token": token, "user": public })).await?;
    client.send("hello:ok", json!({ "userId": user_id })).await
}

// ---------------------------------------------------------------------------
// Chats and groups
// ---------------------------------------------------------------------------

async fn handle_chat_list(state: &ServerState, client: &Client, user_id: &str) -> Result<()> {
    let chats = database::list_chats_for_user(&state.db_pool, user_id).await?;
    client.send("chat:list:ok", json!({ "chats": chats })).await
}

async fn handle_chat_create_direct(
    state: &ServerState,
    client: &Client,
    user_id: &str,
    data: &Value,
) -> Result<()> {
    let Some(target_id) = str_field(data, "userId") else {
        return client.send("error", json!({ "message": "missing userId" })).await;
    };
    if target_id == user_id {
        return client
            .send("error", json!({ "message": "cannot open a direct chat with yourself" }))
            .await;
    }

    // Idempotent: an existing chat is returned, and the other party is
    // only notified on first creation.
    if let Some(existing) = database::find_direct_chat_between(&state.db_pool, user_id, target_id).await? {
        return client
            .send("chat:created", json!({ "chat": existing, "autoSelect": true }))
            .await;
    }

    if database::get_user_public_by_id(&state.db_pool, target_id).await?.is_none() {
        return client
            .send("error", json!({ "message": "target user does not exist" }))
            .await;
    }

    let chat = database::create_direct_chat(&state.db_pool, user_id, target_id).await?;
    let chat_id = chat.id.clone();
    client
        .send("chat:created", json!({ "chat": chat, "autoSelect": true }))
        .await?;

    if let Some(target_view) = database::get_chat_for_user(&state.db_pool, &chat_id, target_id).await? {
        broadcast::to_user(
            state,
            target_id,
            "chat:created",
            json!({ "chat": target_view, "autoSelect": false }),
        );
    }
    Ok(())
}

async fn handle_group_create(
    state: &ServerState,
    client: &Client,
    user_id: &str,
    data: &Value,
) -> Result<()> {
    let title = str_field(data, "title").map(str::trim).unwrap_or_default();
    if title.is_empty() {
        return client.send("error", json!({ "message": "missing title" })).await;
    }
    let description = str_field(data, "description");

    let chat = database::create_group_chat(&state.db_pool, title, description, user_id).await?;
    client.send("group:created", json!({ "chat": chat })).await
}

async fn handle_group_invite(
    state: &ServerState,
    client: &Client,
    user_id: &str,
    data: &Value,
) -> Result<()> {
    let (Some(group_id), Some(invite_user_id)) =
        (str_field(data, "groupId"), str_field(data, "userId"))
    else {
        return client.send("error", json!({ "message": "missing fields" })).await;
    };

    if !database::user_is_member(&state.db_pool, group_id, user_id).await? {
        return client
            .send("error", json!({ "message": "not a member of this group" }))
            .await;
    }

    database::add_chat_member(&state.db_pool, group_id, invite_user_id, "member").await?;
    client
        .send("group:invite:ok", json!({ "groupId": group_id, "userId": invite_user_id }))
        .await
}

async fn handle_user_find(state: &ServerState, client: &Client, data: &Value) -> Result<()> {
    let username = str_field(data, "username")
        .map(|u| u.trim().to_lowercase())
        .unwrap_or_default();
    if username.is_empty() {
        return client.send("user:notFound", json!({ "username": "" })).await;
    }

    match database::get_user_public_by_username(&state.db_pool, &username).await? {
        Some(user) => client.send("user:found", json!({ "user": user })).await,
        None => client.send("user:notFound", json!({ "username": username })).await,
    }
}

// ---------------------------------------------------------------------------
// Rooms, messages, presence
// ---------------------------------------------------------------------------

async fn handle_room_join(
    state: &ServerState,
    client: &Client,
    user_id: &str,
    data: &Value,
) -> Result<()> {
    let Some(chat_id) = str_field(data, "chatId") else {
        return client.send("error", json!({ "message": "missing chatId" })).await;
    };

    // Persisted membership is checked at join time, not re-checked while
    // the connection stays in the room.
    if !database::user_is_member(&state.db_pool, chat_id, user_id).await? {
        return client
            .send("error", json!({ "message": "not a member of this chat" }))
            .await;
    }

    state.rooms.join(chat_id, client.id);
    client.send("room:join:ok", json!({ "chatId": chat_id })).await?;

    let messages =
        database::list_messages(&state.db_pool, chat_id, state.config.history_limit).await?;
    client
        .send("message:list:ok", json!({ "chatId": chat_id, "messages": messages }))
        .await
}

async fn handle_message_send(
    state: &ServerState,
    client: &Client,
    user_id: &str,
    data: &Value,
) -> Result<()> {
    let (Some(chat_id), Some(kind), Some(content)) = (
        str_field(data, "chatId"),
        str_field(data, "kind"),
        str_field(data, "content"),
    ) else {
        return client.send("error", json!({ "message": "missing fields" })).await;
    };
    if content.is_empty() {
        return client.send("error", json!({ "message": "missing fields" })).await;
    }
    if content.len() > state.config.max_message_size {
        return client.send("error", json!({ "message": "message too large" })).await;
    }

    // Persisted membership, not room membership, is what authorizes a send.
    if !database::user_is_member(&state.db_pool, chat_id, user_id).await? {
        return client
            .send("error", json!({ "message": "not a member of this chat" }))
            .await;
    }

    let message = database::save_message(&state.db_pool, chat_id, user_id, kind, content).await?;
    broadcast::to_chat(state, chat_id, "message:receive", serde_json::to_value(&message)?).await
}

async fn handle_presence_update(
    state: &ServerState,
    client: &Client,
    user_id: &str,
    data: &Value,
) -> Result<()> {
    let status = str_field(data, "status")
        .map(|s| s.trim().to_lowercase())
        .and_then(|s| PresenceStatus::parse(&s));
    let Some(status) = status else {
        return client.send("error", json!({ "message": "invalid status" })).await;
    };

    database::set_user_status(&state.db_pool, user_id, status.as_str()).await?;
    let presence = json!({ "userId": user_id, "status": status.as_str() });
    broadcast::to_related(state, user_id, "presence:update", presence).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
