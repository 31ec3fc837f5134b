//! In-memory session and live-room registries.

use std::collections::HashSet;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Opaque handle for one live client connection.
pub type ConnId = u64;

/// Bidirectional mapping between live connections and authenticated users.
///
/// A connection binds to at most one user; a user may hold any number of
/// connections (multi-device). A bound `user_of` is the one and only
/// definition of "authenticated" for the dispatch router.
#[derive(Default)]
pub struct SessionRegistry {
    user_by_conn: DashMap<ConnId, String>,
    conns_by_user: DashMap<String, HashSet<ConnId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to a user. The first binding wins; binding an
    /// already-bound connection is a no-op.
    pub fn bind(&self, conn: ConnId, user_id: &str) {
        match self.user_by_conn.entry(conn) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                slot.insert(user_id.to_string());
            }
        }
        self.conns_by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(conn);
    }

    /// Remove the binding for a closed connection, returning the user it
    /// belonged to. Empty per-user sets are dropped under the entry guard.
    pub fn unbind(&self, conn: ConnId) -> Option<String> {
        let (_, user_id) = self.user_by_conn.remove(&conn)?;
        if let Some(mut conns) = self.conns_by_user.get_mut(&user_id) {
            conns.remove(&conn);
            let emptied = conns.is_empty();
            drop(conns);
            if emptied {
                self.conns_by_user.remove_if(&user_id, |_, set| set.is_empty());
            }
        }
        Some(user_id)
    }

    /// Current live connections for a user; empty if none.
    pub fn connections_of(&self, user_id: &str) -> HashSet<ConnId> {
        self.conns_by_user
            .get(user_id)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    pub fn user_of(&self, conn: ConnId) -> Option<String> {
        self.user_by_conn.get(&conn).map(|user| user.clone())
    }

    /// Number of users with at least one bound connection.
    pub fn user_count(&self) -> usize {
        self.conns_by_user.len()
    }
}

/// Live per-chat membership: the connections that explicitly joined a
/// chat's room. Never persisted; rebuilt by clients after reconnect.
#[derive(Default)]
pub struct RoomTracker {
    rooms: DashMap<String, HashSet<ConnId>>,
}

impl RoomTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a chat's live set. The caller is responsible
    /// for checking persisted membership first.
    pub fn join(&self, chat_id: &str, conn: ConnId) {
        self.rooms
            .entry(chat_id.to_string())
            .or_default()
            .insert(conn);
    }

    /// Drop a connection from every room. Called once, on close.
    pub fn leave_all(&self, conn: ConnId) {
        let mut emptied = Vec::new();
        for mut entry in self.rooms.iter_mut() {
            if entry.value_mut().remove(&conn) && entry.value().is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for chat_id in emptied {
            self.rooms.remove_if(&chat_id, |_, set| set.is_empty());
        }
    }

    /// The live set for a chat. Empty is normal: it means no member is
    /// currently watching the room, not that the chat has no members.
    pub fn live_members_of(&self, chat_id: &str) -> HashSet<ConnId> {
        self.rooms
            .get(chat_id)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_lookup_multi_device() {
        let sessions = SessionRegistry::new();
        sessions.bind(1, "alice");
        sessions.bind(2, "alice");
        sessions.bind(3, "bob");

        assert_eq!(sessions.user_of(1).as_deref(), Some("alice"));
        assert_eq!(sessions.user_of(3).as_deref(), Some("bob"));
        assert_eq!(sessions.connections_of("alice"), HashSet::from([1, 2]));
        assert_eq!(sessions.user_count(), 2);
    }

    #[test]
    fn first_binding_wins() {
        let sessions = SessionRegistry::new();
        sessions.bind(1, "alice");
        sessions.bind(1, "bob");

        assert_eq!(sessions.user_of(1).as_deref(), Some("alice"));
        assert!(sessions.connections_of("bob").is_empty());
    }

    #[test]
    fn unbind_returns_user_and_clears_empty_sets() {
        let sessions = SessionRegistry::new();
        sessions.bind(1, "alice");
        sessions.bind(2, "alice");

        assert_eq!(sessions.unbind(1).as_deref(), Some("alice"));
        assert_eq!(sessions.connections_of("alice"), HashSet::from([2]));

        assert_eq!(sessions.unbind(2).as_deref(), Some("alice"));
        assert!(sessions.connections_of("alice").is_empty());
        assert_eq!(sessions.user_count(), 0);
    }

    #[test]
    fn unbind_unknown_connection_is_none() {
        let sessions = SessionRegistry::new();
        assert_eq!(sessions.unbind(42), None);
    }

    #[test]
    fn rooms_track_joins_until_leave_all() {
        let rooms = RoomTracker::new();
        rooms.join("chat-1", 1);
        rooms.join("chat-1", 2);
        rooms.join("chat-2", 1);

        assert_eq!(rooms.live_members_of("chat-1"), HashSet::from([1, 2]));
        assert!(rooms.live_members_of("chat-3").is_empty());

        rooms.leave_all(1);
        assert_eq!(rooms.live_members_of("chat-1"), HashSet::from([2]));
        assert!(rooms.live_members_of("chat-2").is_empty());
        assert_eq!(rooms.room_count(), 1);
    }
}
