//! Storage seam for durable message persistence
//!
//! The relay never owns message durability; it hands each message to a
//! [`MessageStore`] and only forwards a copy after the store confirms the
//! write. In production this is backed by the application database; the
//! in-memory implementation here backs development and tests.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{RelayError, Result};
use crate::protocol::messages::Message;

/// Durable message persistence, provided by an external collaborator
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message; the relay forwards it only after this returns Ok
    async fn create_message(&self, message: &Message) -> Result<()>;

    /// Fetch the conversation between two users, oldest first
    async fn conversation(&self, user_a: &str, user_b: &str) -> Result<Vec<Message>>;

    /// Mark a message as read
    async fn mark_read(&self, message_id: &str) -> Result<()>;
}

/// In-memory message store
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    messages: RwLock<Vec<Message>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored messages
    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create_message(&self, message: &Message) -> Result<()> {
        let mut messages = self.messages.write().await;
        messages.push(message.clone());
        Ok(())
    }

    async fn conversation(&self, user_a: &str, user_b: &str) -> Result<Vec<Message>> {
        let messages = self.messages.read().await;
        let mut result: Vec<Message> = messages
            .iter()
            .filter(|m| {
                (m.sender_id == user_a && m.receiver_id == user_b)
                    || (m.sender_id == user_b && m.receiver_id == user_a)
            })
            .cloned()
            .collect();
        result.sort_by_key(|m| m.created_at);
        Ok(result)
    }

    async fn mark_read(&self, message_id: &str) -> Result<()> {
        let mut messages = self.messages.write().await;
        match messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                message.is_read = true;
                Ok(())
            }
            None => Err(RelayError::storage(format!(
                "Unknown message id: {}",
                message_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(sender: &str, receiver: &str, content: &str) -> Message {
        Message::new(
            sender.to_string(),
            receiver.to_string(),
            content.to_string(),
            None,
        )
    }

    #[tokio::test]
    async fn test_create_and_fetch_conversation() {
        let store = MemoryMessageStore::new();

        store.create_message(&message("u1", "u2", "hi")).await.unwrap();
        store
            .create_message(&message("u2", "u1", "hello back"))
            .await
            .unwrap();
        store
            .create_message(&message("u1", "u3", "unrelated"))
            .await
            .unwrap();

        let conv = store.conversation("u1", "u2").await.unwrap();
        assert_eq!(conv.len(), 2);
        assert_eq!(conv[0].content, "hi");
        assert_eq!(conv[1].content, "hello back");

        // Symmetric lookup
        let conv = store.conversation("u2", "u1").await.unwrap();
        assert_eq!(conv.len(), 2);
    }

    #[tokio::test]
    async fn test_mark_read() {
        let store = MemoryMessageStore::new();
        let msg = message("u1", "u2", "hi");

        store.create_message(&msg).await.unwrap();
        store.mark_read(&msg.id).await.unwrap();

        let conv = store.conversation("u1", "u2").await.unwrap();
        assert!(conv[0].is_read);
    }

    #[tokio::test]
    async fn test_mark_read_unknown_id() {
        let store = MemoryMessageStore::new();
        assert!(store.mark_read("missing").await.is_err());
    }
}
