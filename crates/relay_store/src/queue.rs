//! Per-recipient mailbox used while a recipient is offline.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use relay_proto::EncryptedMessage;
use tracing::debug;

use crate::{
    error::StoreError,
    models::{QueueScope, QueuedMessage, QueuedMessageState, TakeOptions},
};

#[async_trait]
pub trait MessageQueueStore: Send + Sync {
    /// Enqueue `payload` and return the new entry id.
    async fn add_message(
        &self,
        connection_id: &str,
        recipient_dids: &[String],
        payload: &EncryptedMessage,
    ) -> Result<String, StoreError>;

    /// Oldest-first, up to `limit`. Without `delete_messages` the entries
    /// stay queued (marked `Sending`) and are offered again until removed.
    async fn take_from_queue(&self, options: TakeOptions) -> Result<Vec<QueuedMessage>, StoreError>;

    /// Entries in scope that have not been removed, whatever their state.
    async fn get_available_message_count(&self, scope: &QueueScope) -> Result<usize, StoreError>;

    /// Delete exactly the listed ids within `scope`. Unknown ids are ignored.
    async fn remove_messages(&self, scope: &QueueScope, message_ids: &[String]) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryQueueStore {
    messages: Mutex<Vec<QueuedMessage>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageQueueStore for InMemoryQueueStore {
    async fn add_message(
        &self,
        connection_id: &str,
        recipient_dids: &[String],
        payload: &EncryptedMessage,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.messages.lock().push(QueuedMessage {
            id: id.clone(),
            connection_id: connection_id.to_string(),
            recipient_dids: recipient_dids.to_vec(),
            encrypted_message: payload.clone(),
            received_at: Utc::now(),
            state: QueuedMessageState::Pending,
        });
        debug!(connection_id, message_id = %id, "queued message");
        Ok(id)
    }

    async fn take_from_queue(&self, options: TakeOptions) -> Result<Vec<QueuedMessage>, StoreError> {
        options.scope.ensure_scoped()?;
        let limit = options.limit.unwrap_or(usize::MAX);
        let mut messages = self.messages.lock();

        let mut taken = Vec::new();
        for message in messages.iter_mut().filter(|m| options.scope.matches(m)).take(limit) {
            message.state = QueuedMessageState::Sending;
            taken.push(message.clone());
        }

        if options.delete_messages {
            messages.retain(|m| !taken.iter().any(|t| t.id == m.id));
        }
        Ok(taken)
    }

    async fn get_available_message_count(&self, scope: &QueueScope) -> Result<usize, StoreError> {
        scope.ensure_scoped()?;
        Ok(self.messages.lock().iter().filter(|m| scope.matches(m)).count())
    }

    async fn remove_messages(&self, scope: &QueueScope, message_ids: &[String]) -> Result<(), StoreError> {
        scope.ensure_scoped()?;
        self.messages
            .lock()
            .retain(|m| !(scope.matches(m) && message_ids.contains(&m.id)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(tag: &str) -> EncryptedMessage {
        EncryptedMessage {
            protected: "p".into(),
            iv: "i".into(),
            ciphertext: "c".into(),
            tag: tag.into(),
        }
    }

    #[tokio::test]
    async fn unacknowledged_messages_are_offered_again() {
        let store = InMemoryQueueStore::new();
        let scope = QueueScope::connection("conn-1");
        store.add_message("conn-1", &[], &envelope("a")).await.unwrap();
        store.add_message("conn-1", &[], &envelope("b")).await.unwrap();

        let take = || TakeOptions { scope: scope.clone(), limit: Some(1), delete_messages: false };
        let first = store.take_from_queue(take()).await.unwrap();
        let again = store.take_from_queue(take()).await.unwrap();
        assert_eq!(first[0].id, again[0].id);
        assert_eq!(again[0].state, QueuedMessageState::Sending);

        store.remove_messages(&scope, &[first[0].id.clone()]).await.unwrap();
        let next = store.take_from_queue(take()).await.unwrap();
        assert_eq!(next[0].encrypted_message.tag, "b");
    }

    #[tokio::test]
    async fn delete_on_take_empties_queue() {
        let store = InMemoryQueueStore::new();
        let scope = QueueScope::connection("conn-1");
        for tag in ["a", "b", "c"] {
            store.add_message("conn-1", &[], &envelope(tag)).await.unwrap();
        }
        let taken = store
            .take_from_queue(TakeOptions { scope: scope.clone(), limit: Some(2), delete_messages: true })
            .await
            .unwrap();
        assert_eq!(taken.len(), 2);
        assert_eq!(store.get_available_message_count(&scope).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unscoped_access_is_rejected() {
        let store = InMemoryQueueStore::new();
        assert!(store.get_available_message_count(&QueueScope::default()).await.is_err());
    }
}
