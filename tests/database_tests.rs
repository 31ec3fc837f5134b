//! Server integration tests
//!
//! These tests verify the persistence schema and the queries the fan-out
//! engine and handlers depend on: membership, related users, direct-chat
//! pairing, and message ordering.

use sqlx::SqlitePool;

// Helper function to create test database
async fn setup_test_db() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create test database");

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
    .execute(&pool)
    .await
    .unwrap();

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
    .execute(&pool)
    .await
    .unwrap();

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_members (
            chat_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'member',
            joined_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            PRIMARY KEY (chat_id, user_id)
        );
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_chat_time
        ON messages(chat_id, created_at);
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    pool
}

async fn insert_user(pool: &SqlitePool, id: &str, username: &str) {
    sqlx::query(
        "INSERT INTO users (id, username, display_name, password_hash) VALUES (?1, ?2, ?2, 'x')",
    )
    .bind(id)
    .bind(username)
    .execute(pool)
    .await
    .unwrap();
}

async fn insert_chat(pool: &SqlitePool, id: &str, kind: &str) {
    sqlx::query("INSERT INTO chats (id, kind, title) VALUES (?1, ?2, '')")
        .bind(id)
        .bind(kind)
        .execute(pool)
        .await
        .unwrap();
}

async fn insert_member(pool: &SqlitePool, chat_id: &str, user_id: &str) {
    sqlx::query("INSERT OR IGNORE INTO chat_members (chat_id, user_id) VALUES (?1, ?2)")
        .bind(chat_id)
        .bind(user_id)
        .execute(pool)
        .await
        .unwrap();
}

// ============================================================================
// Users
// ============================================================================

#[tokio::test]
async fn test_username_uniqueness() {
    let pool = setup_test_db().await;
    insert_user(&pool, "u1", "alice").await;

    let duplicate = sqlx::query(
        "INSERT INTO users (id, username, display_name, password_hash) VALUES ('u2', 'alice', 'Alice', 'x')",
    )
    .execute(&pool)
    .await;

    assert!(duplicate.is_err());
}

#[tokio::test]
async fn test_status_update() {
    let pool = setup_test_db().await;
    insert_user(&pool, "u1", "alice").await;

    sqlx::query("UPDATE users SET status = 'busy' WHERE id = 'u1'")
        .execute(&pool)
        .await
        .unwrap();

    let status: String = sqlx::query_scalar("SELECT status FROM users WHERE id = 'u1'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "busy");
}

// ============================================================================
// Membership
// ============================================================================

#[tokio::test]
async fn test_membership_and_idempotent_insert() {
    let pool = setup_test_db().await;
    insert_user(&pool, "u1", "alice").await;
    insert_chat(&pool, "c1", "group").await;
    insert_member(&pool, "c1", "u1").await;
    insert_member(&pool, "c1", "u1").await; // second insert is ignored

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chat_members WHERE chat_id = 'c1'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_related_users_includes_self_and_deduplicates() {
    let pool = setup_test_db().await;
    for (id, name) in [("u1", "alice"), ("u2", "bob"), ("u3", "carol")] {
        insert_user(&pool, id, name).await;
    }
    // alice shares c1 with bob, c2 with bob and carol
    insert_chat(&pool, "c1", "direct").await;
    insert_member(&pool, "c1", "u1").await;
    insert_member(&pool, "c1", "u2").await;
    insert_chat(&pool, "c2", "group").await;
    insert_member(&pool, "c2", "u1").await;
    insert_member(&pool, "c2", "u2").await;
    insert_member(&pool, "c2", "u3").await;

    let mut related: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT cm2.user_id
        FROM chat_members cm1
        JOIN chat_members cm2 ON cm2.chat_id = cm1.chat_id
        WHERE cm1.user_id = 'u1'
        "#,
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    related.sort();

    assert_eq!(related, vec!["u1", "u2", "u3"]);
}

#[tokio::test]
async fn test_direct_chat_pair_lookup() {
    let pool = setup_test_db().await;
    for (id, name) in [("u1", "alice"), ("u2", "bob"), ("u3", "carol")] {
        insert_user(&pool, id, name).await;
    }
    insert_chat(&pool, "c1", "direct").await;
    insert_member(&pool, "c1", "u1").await;
    insert_member(&pool, "c1", "u2").await;
    // A group both belong to must not match the direct-pair query.
    insert_chat(&pool, "c2", "group").await;
    insert_member(&pool, "c2", "u1").await;
    insert_member(&pool, "c2", "u2").await;

    let pair_query = r#"
        SELECT ch.id
        FROM chats ch
        JOIN chat_members cm1 ON cm1.chat_id = ch.id AND cm1.user_id = ?1
        JOIN chat_members cm2 ON cm2.chat_id = ch.id AND cm2.user_id = ?2
        WHERE ch.kind = 'direct'
        LIMIT 1
    "#;

    let found: Option<String> = sqlx::query_scalar(pair_query)
        .bind("u1")
        .bind("u2")
        .fetch_optional(&pool)
        .await
        .unwrap();
    assert_eq!(found.as_deref(), Some("c1"));

    // Reversed order finds the same chat
    let reversed: Option<String> = sqlx::query_scalar(pair_query)
        .bind("u2")
        .bind("u1")
        .fetch_optional(&pool)
        .await
        .unwrap();
    assert_eq!(reversed.as_deref(), Some("c1"));

    let missing: Option<String> = sqlx::query_scalar(pair_query)
        .bind("u1")
        .bind("u3")
        .fetch_optional(&pool)
        .await
        .unwrap();
    assert_eq!(missing, None);
}

// ============================================================================
// Messages
// ============================================================================

#[tokio::test]
async fn test_message_history_order_and_limit() {
    let pool = setup_test_db().await;
    insert_user(&pool, "u1", "alice").await;
    insert_chat(&pool, "c1", "group").await;
    insert_member(&pool, "c1", "u1").await;

    for i in 0..5 {
        sqlx::query(
            "INSERT INTO messages (id, chat_id, sender_id, kind, content, created_at) VALUES (?1, 'c1', 'u1', 'text', ?2, ?3)",
        )
        .bind(format!("m{i}"))
        .bind(format!("msg {i}"))
        .bind(1000 + i as i64)
        .execute(&pool)
        .await
        .unwrap();
    }

    // Most recent 3, which clients then display oldest-first
    let recent: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT content, created_at
        FROM messages
        WHERE chat_id = 'c1'
        ORDER BY created_at DESC
        LIMIT 3
        "#,
    )
    .fetch_all(&pool)
    .await
    .unwrap();

    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].0, "msg 4");
    assert_eq!(recent[2].0, "msg 2");
}

#[tokio::test]
async fn test_last_message_per_chat() {
    let pool = setup_test_db().await;
    insert_user(&pool, "u1", "alice").await;
    insert_chat(&pool, "c1", "group").await;
    insert_member(&pool, "c1", "u1").await;

    for (id, ts) in [("m1", 1000i64), ("m2", 3000), ("m3", 2000)] {
        sqlx::query(
            "INSERT INTO messages (id, chat_id, sender_id, kind, content, created_at) VALUES (?1, 'c1', 'u1', 'text', ?1, ?2)",
        )
        .bind(id)
        .bind(ts)
        .execute(&pool)
        .await
        .unwrap();
    }

    let last: (String, i64) = sqlx::query_as(
        "SELECT id, created_at FROM messages WHERE chat_id = 'c1' ORDER BY created_at DESC LIMIT 1",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(last.0, "m2");
    assert_eq!(last.1, 3000);
}
