//! Database operations

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::info;
use uuid::Uuid;

/// Full user row, including credentials. Never serialized to clients.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub password_hash: String,
    pub status: String,
}

/// The user view that leaves the server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub status: String,
}

impl From<UserRow> for PublicUser {
    fn from(row: UserRow) -> Self {
        PublicUser {
            id: row.id,
            username: row.username,
            display_name: row.display_name,
            avatar_url: row.avatar_url,
            status: row.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub kind: String,
    pub content: String,
    /// Creation timestamp, unix milliseconds. The ordering key.
    pub created_at: i64,
}

/// A chat hydrated for one viewing user: members, last message, and for
/// direct chats the other party's name as the title.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub description: Option<String>,
    pub members: Vec<PublicUser>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}

type ChatRow = (String, String, String, Option<String>);

/// Initialize the database connection pool
pub async fn init(database_url: &str) -> Result<Pool<Sqlite>> {
    // Create database file if it doesn't exist
    if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
        info!("Creating database at {}", database_url);
        Sqlite::create_database(database_url).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT,
            display_name TEXT NOT NULL,
            avatar_url TEXT,
            password_hash TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'offline',
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chats (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL CHECK (kind IN ('direct', 'group')),
            title TEXT NOT NULL DEFAULT '',
            description TEXT,
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_members (
            chat_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'member',
            joined_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            PRIMARY KEY (chat_id, user_id),
            FOREIGN KEY (chat_id) REFERENCES chats(id),
            FOREIGN KEY (user_id) REFERENCES users(id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (chat_id) REFERENCES chats(id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_chat_time
        ON messages(chat_id, created_at);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_chat_members_user
        ON chat_members(user_id);
        "#,
    )
    .execute(pool)
    .await?;

    info!("Migrations completed successfully");
    Ok(())
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

pub async fn create_user(
    pool: &Pool<Sqlite>,
    username: &str,
    display_name: &str,
    email: Option<&str>,
    password_hash: &str,
) -> Result<PublicUser> {
    let user_id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO users (id, username, email, display_name, password_hash, status)
        VALUES (?1, ?2, ?3, ?4, ?5, 'offline')
        "#,
    )
    .bind(&user_id)
    .bind(username)
    .bind(email)
    .bind(display_name)
    .bind(password_hash)
    .execute(pool)
    .await?;

    Ok(PublicUser {
        id: user_id,
        username: username.to_string(),
        display_name: display_name.to_string(),
        avatar_url: None,
        status: "offline".to_string(),
    })
}

type UserTuple = (
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    String,
    String,
);

fn user_from_tuple(row: UserTuple) -> UserRow {
    let (id, username, email, display_name, avatar_url, password_hash, status) = row;
    UserRow {
        id,
        username,
        email,
        display_name,
        avatar_url,
        password_hash,
        status,
    }
}

const USER_COLUMNS: &str = "id, username, email, display_name, avatar_url, password_hash, status";

pub async fn get_user_by_username(pool: &Pool<Sqlite>, username: &str) -> Result<Option<UserRow>> {
    let row: Option<UserTuple> = sqlx::query_as(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE username = ?1 LIMIT 1"
    ))
    .bind(username)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(user_from_tuple))
}

pub async fn get_user_by_email(pool: &Pool<Sqlite>, email: &str) -> Result<Option<UserRow>> {
    let row: Option<UserTuple> = sqlx::query_as(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE email = ?1 LIMIT 1"
    ))
    .bind(email)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(user_from_tuple))
}

pub async fn get_user_by_id(pool: &Pool<Sqlite>, user_id: &str) -> Result<Option<UserRow>> {
    let row: Option<UserTuple> = sqlx::query_as(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id = ?1 LIMIT 1"
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(user_from_tuple))
}

pub async fn get_user_public_by_username(
    pool: &Pool<Sqlite>,
    username: &str,
) -> Result<Option<PublicUser>> {
    Ok(get_user_by_username(pool, username).await?.map(PublicUser::from))
}

pub async fn get_user_public_by_id(pool: &Pool<Sqlite>, user_id: &str) -> Result<Option<PublicUser>> {
    Ok(get_user_by_id(pool, user_id).await?.map(PublicUser::from))
}

pub async fn set_user_status(pool: &Pool<Sqlite>, user_id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE users SET status = ?1 WHERE id = ?2")
        .bind(status)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Chats and membership
// ---------------------------------------------------------------------------

pub async fn user_is_member(pool: &Pool<Sqlite>, chat_id: &str, user_id: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
    )
    .bind(chat_id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// All persisted member ids of a chat.
pub async fn list_user_ids_for_chat(pool: &Pool<Sqlite>, chat_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT user_id FROM chat_members WHERE chat_id = ?1")
            .bind(chat_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Everyone who shares at least one chat with the user, the user included.
/// This is the audience for presence updates.
pub async fn list_related_user_ids(pool: &Pool<Sqlite>, user_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT cm2.user_id
        FROM chat_members cm1
        JOIN chat_members cm2 ON cm2.chat_id = cm1.chat_id
        WHERE cm1.user_id = ?1
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn list_members_for_chat(pool: &Pool<Sqlite>, chat_id: &str) -> Result<Vec<PublicUser>> {
    let rows: Vec<(String, String, String, Option<String>, String)> = sqlx::query_as(
        r#"
        SELECT u.id, u.username, u.display_name, u.avatar_url, u.status
        FROM chat_members cm
        JOIN users u ON u.id = cm.user_id
        WHERE cm.chat_id = ?1
        "#,
    )
    .bind(chat_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, username, display_name, avatar_url, status)| PublicUser {
            id,
            username,
            display_name,
            avatar_url,
            status,
        })
        .collect())
}

pub async fn add_chat_member(
    pool: &Pool<Sqlite>,
    chat_id: &str,
    user_id: &str,
    role: &str,
) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO chat_members (chat_id, user_id, role) VALUES (?1, ?2, ?3)")
        .bind(chat_id)
        .bind(user_id)
        .bind(role)
        .execute(pool)
        .await?;
    Ok(())
}

async fn last_message_for_chat(pool: &Pool<Sqlite>, chat_id: &str) -> Result<Option<Message>> {
    let row: Option<(String, String, String, String, String, i64)> = sqlx::query_as(
        r#"
        SELECT id, chat_id, sender_id, kind, content, created_at
        FROM messages
        WHERE chat_id = ?1
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(chat_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id, chat_id, sender_id, kind, content, created_at)| Message {
        id,
        chat_id,
        sender_id,
        kind,
        content,
        created_at,
    }))
}

async fn hydrate_chat_for_user(
    pool: &Pool<Sqlite>,
    row: ChatRow,
    user_id: &str,
) -> Result<ChatView> {
    let (id, kind, mut title, description) = row;
    let members = list_members_for_chat(pool, &id).await?;

    // Direct chats take the other party's name as the title.
    if kind == "direct" {
        if let Some(other) = members.iter().find(|m| m.id != user_id) {
            title = if other.display_name.is_empty() {
                other.username.clone()
            } else {
                other.display_name.clone()
            };
        }
    }

    let last_message = last_message_for_chat(pool, &id).await?;

    Ok(ChatView {
        id,
        kind,
        title,
        description,
        members,
        last_message,
    })
}

/// All chats the user belongs to, hydrated, newest activity first.
pub async fn list_chats_for_user(pool: &Pool<Sqlite>, user_id: &str) -> Result<Vec<ChatView>> {
    let rows: Vec<ChatRow> = sqlx::query_as(
        r#"
        SELECT ch.id, ch.kind, ch.title, ch.description
        FROM chats ch
        JOIN chat_members cm ON cm.chat_id = ch.id
        WHERE cm.user_id = ?1
        ORDER BY ch.created_at DESC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let mut chats = Vec::with_capacity(rows.len());
    for row in rows {
        chats.push(hydrate_chat_for_user(pool, row, user_id).await?);
    }

    chats.sort_by_key(|chat| {
        std::cmp::Reverse(chat.last_message.as_ref().map(|m| m.created_at).unwrap_or(0))
    });
    Ok(chats)
}

/// A single chat hydrated for the user, or None if the user is not a member.
pub async fn get_chat_for_user(
    pool: &Pool<Sqlite>,
    chat_id: &str,
    user_id: &str,
) -> Result<Option<ChatView>> {
    let row: Option<ChatRow> = sqlx::query_as(
        r#"
        SELECT ch.id, ch.kind, ch.title, ch.description
        FROM chats ch
        JOIN chat_members cm ON cm.chat_id = ch.id
        WHERE ch.id = ?1 AND cm.user_id = ?2
        LIMIT 1
        "#,
    )
    .bind(chat_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(hydrate_chat_for_user(pool, row, user_id).await?)),
        None => Ok(None),
    }
}

/// Find an existing direct chat between two users, hydrated for the first.
pub async fn find_direct_chat_between(
    pool: &Pool<Sqlite>,
    a: &str,
    b: &str,
) -> Result<Option<ChatView>> {
    let row: Option<ChatRow> = sqlx::query_as(
        r#"
        SELECT ch.id, ch.kind, ch.title, ch.description
        FROM chats ch
        JOIN chat_members cm1 ON cm1.chat_id = ch.id AND cm1.user_id = ?1
        JOIN chat_members cm2 ON cm2.chat_id = ch.id AND cm2.user_id = ?2
        WHERE ch.kind = 'direct'
        LIMIT 1
        "#,
    )
    .bind(a)
    .bind(b)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(hydrate_chat_for_user(pool, row, a).await?)),
        None => Ok(None),
    }
}

pub async fn create_direct_chat(pool: &Pool<Sqlite>, a: &str, b: &str) -> Result<ChatView> {
    let chat_id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO chats (id, kind, title, description) VALUES (?1, 'direct', '', NULL)")
        .bind(&chat_id)
        .execute(pool)
        .await?;
    add_chat_member(pool, &chat_id, a, "member").await?;
    add_chat_member(pool, &chat_id, b, "member").await?;

    get_chat_for_user(pool, &chat_id, a)
        .await?
        .context("direct chat missing after insert")
}

pub async fn create_group_chat(
    pool: &Pool<Sqlite>,
    title: &str,
    description: Option<&str>,
    owner_id: &str,
) -> Result<ChatView> {
    let chat_id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO chats (id, kind, title, description) VALUES (?1, 'group', ?2, ?3)")
        .bind(&chat_id)
        .bind(title)
        .bind(description)
        .execute(pool)
        .await?;
    add_chat_member(pool, &chat_id, owner_id, "owner").await?;

    get_chat_for_user(pool, &chat_id, owner_id)
        .await?
        .context("group chat missing after insert")
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

pub async fn save_message(
    pool: &Pool<Sqlite>,
    chat_id: &str,
    sender_id: &str,
    kind: &str,
    content: &str,
) -> Result<Message> {
    let message = Message {
        id: Uuid::new_v4().to_string(),
        chat_id: chat_id.to_string(),
        sender_id: sender_id.to_string(),
        kind: kind.to_string(),
        content: content.to_string(),
        created_at: now_millis(),
    };

    sqlx::query(
        "INSERT INTO messages (id, chat_id, sender_id, kind, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(&message.id)
    .bind(&message.chat_id)
    .bind(&message.sender_id)
    .bind(&message.kind)
    .bind(&message.content)
    .bind(message.created_at)
    .execute(pool)
    .await?;

    Ok(message)
}

/// The most recent `limit` messages of a chat, ascending by timestamp.
pub async fn list_messages(pool: &Pool<Sqlite>, chat_id: &str, limit: i64) -> Result<Vec<Message>> {
    let rows: Vec<(String, String, String, String, String, i64)> = sqlx::query_as(
        r#"
        SELECT id, chat_id, sender_id, kind, content, created_at
        FROM messages
        WHERE chat_id = ?1
        ORDER BY created_at DESC
        LIMIT ?2
        "#,
    )
    .bind(chat_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut messages: Vec<Message> = rows
        .into_iter()
        .map(|(id, chat_id, sender_id, kind, content, created_at)| Message {
            id,
            chat_id,
            sender_id,
            kind,
            content,
            created_at,
        })
        .collect();
    messages.reverse();
    Ok(messages)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
