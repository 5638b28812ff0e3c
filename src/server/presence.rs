//! Presence directory for the relay server
//!
//! Single source of truth for "who is online, on which connection". In
//! memory only: presence is rebuilt on every process start as clients
//! reconnect. The lifecycle manager is the only writer; the message and
//! typing relays are readers.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::{ConnectionId, UserId};

#[derive(Debug, Default)]
struct Entries {
    by_user: HashMap<UserId, ConnectionId>,
    by_connection: HashMap<ConnectionId, UserId>,
}

/// Process-wide mapping from durable user ids to live connection ids
///
/// Invariants: at most one connection per user (last connection wins on
/// multi-login), and a connection id maps back to exactly one user. Both
/// maps are mutated under a single lock so readers never observe them out
/// of sync.
#[derive(Debug, Default)]
pub struct PresenceDirectory {
    entries: RwLock<Entries>,
}

impl PresenceDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `user_id` as online on `connection_id`
    ///
    /// Unconditional upsert. Returns the superseded connection id when the
    /// user was already online somewhere else; that old connection is
    /// considered replaced, not closed.
    pub async fn register(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Option<ConnectionId> {
        let mut entries = self.entries.write().await;
        let previous = entries
            .by_user
            .insert(user_id.clone(), connection_id.clone());
        if let Some(old_connection) = &previous {
            entries.by_connection.remove(old_connection);
        }
        entries.by_connection.insert(connection_id.clone(), user_id);
        previous.filter(|old| old != &connection_id)
    }

    /// Remove the entry recorded for `connection_id`, if it is still current
    ///
    /// Returns the user that went offline. A connection id with no entry is
    /// a no-op returning None; this absorbs a stale disconnect arriving
    /// after the same user already re-registered under a new connection.
    pub async fn unregister(&self, connection_id: &str) -> Option<UserId> {
        let mut entries = self.entries.write().await;
        let user_id = entries.by_connection.remove(connection_id)?;
        if entries.by_user.get(&user_id).map(String::as_str) == Some(connection_id) {
            entries.by_user.remove(&user_id);
        }
        Some(user_id)
    }

    /// Look up the live connection for a user; None means offline
    pub async fn lookup(&self, user_id: &str) -> Option<ConnectionId> {
        let entries = self.entries.read().await;
        entries.by_user.get(user_id).cloned()
    }

    /// Check whether a user currently has a live connection
    pub async fn is_online(&self, user_id: &str) -> bool {
        let entries = self.entries.read().await;
        entries.by_user.contains_key(user_id)
    }

    /// Snapshot of every online user id, sorted for stable broadcasts
    pub async fn snapshot_user_ids(&self) -> Vec<UserId> {
        let entries = self.entries.read().await;
        let mut users: Vec<UserId> = entries.by_user.keys().cloned().collect();
        users.sort();
        users
    }

    /// Number of users currently online
    pub async fn online_count(&self) -> usize {
        let entries = self.entries.read().await;
        entries.by_user.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_lookup_roundtrip() {
        let directory = PresenceDirectory::new();

        directory.register("u1".to_string(), "c1".to_string()).await;

        assert_eq!(directory.lookup("u1").await.as_deref(), Some("c1"));
        assert!(directory.is_online("u1").await);
        assert_eq!(directory.online_count().await, 1);
    }

    #[tokio::test]
    async fn test_lookup_absent_means_offline() {
        let directory = PresenceDirectory::new();

        assert!(directory.lookup("u1").await.is_none());
        assert!(!directory.is_online("u1").await);
    }

    #[tokio::test]
    async fn test_last_connection_wins() {
        let directory = PresenceDirectory::new();

        directory.register("u1".to_string(), "c1".to_string()).await;
        let superseded = directory.register("u1".to_string(), "c2".to_string()).await;

        assert_eq!(superseded.as_deref(), Some("c1"));
        assert_eq!(directory.lookup("u1").await.as_deref(), Some("c2"));
        // Still exactly one entry for the user
        assert_eq!(directory.online_count().await, 1);
    }

    #[tokio::test]
    async fn test_reregister_same_connection() {
        let directory = PresenceDirectory::new();

        directory.register("u1".to_string(), "c1".to_string()).await;
        let superseded = directory.register("u1".to_string(), "c1".to_string()).await;

        assert!(superseded.is_none());
        assert_eq!(directory.lookup("u1").await.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_unregister_removes_user() {
        let directory = PresenceDirectory::new();

        directory.register("u1".to_string(), "c1".to_string()).await;
        let removed = directory.unregister("c1").await;

        assert_eq!(removed.as_deref(), Some("u1"));
        assert!(directory.lookup("u1").await.is_none());
        assert!(directory.snapshot_user_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_disconnect_is_noop() {
        // Scenario: u1 reconnects as c2, then the disconnect for the old c1
        // arrives late. The newer entry must survive.
        let directory = PresenceDirectory::new();

        directory.register("u1".to_string(), "c1".to_string()).await;
        directory.register("u1".to_string(), "c2".to_string()).await;

        let removed = directory.unregister("c1").await;

        assert!(removed.is_none());
        assert_eq!(directory.lookup("u1").await.as_deref(), Some("c2"));
        assert_eq!(directory.snapshot_user_ids().await, vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister_unknown_connection_is_noop() {
        let directory = PresenceDirectory::new();

        directory.register("u1".to_string(), "c1".to_string()).await;

        assert!(directory.unregister("c99").await.is_none());
        assert_eq!(directory.lookup("u1").await.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_snapshot_is_sorted() {
        let directory = PresenceDirectory::new();

        directory.register("zoe".to_string(), "c3".to_string()).await;
        directory
            .register("alice".to_string(), "c1".to_string())
            .await;
        directory.register("bob".to_string(), "c2".to_string()).await;

        assert_eq!(
            directory.snapshot_user_ids().await,
            vec!["alice".to_string(), "bob".to_string(), "zoe".to_string()]
        );
    }
}
