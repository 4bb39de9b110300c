//! The persistence collaborator the router depends on.
//!
//! The router only needs two things from storage: saving a chat message and
//! listing the members of a group. Everything else about the schema stays on
//! the other side of [`MessageStore`].

use crate::ws::envelope::MessageKind;
use crate::ws::types::{GroupId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors surfaced by a [`MessageStore`]. The router drops the event on any
/// of them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Where a message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    User(UserId),
    Group(GroupId),
}

/// A message the router asks the store to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub target: MessageTarget,
    pub content: String,
    pub kind: MessageKind,
    pub file_id: Option<u64>,
}

/// The store's acknowledgement. These values are authoritative and are
/// echoed to every recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedMessage {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Persists a message. Implementations reject private messages to
    /// unknown users with [`StoreError::NotFound`] and group messages from
    /// non-members with [`StoreError::Forbidden`].
    async fn save_message(&self, message: NewMessage) -> Result<SavedMessage, StoreError>;

    async fn group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, StoreError>;
}

/// A persisted row held by [`MemoryMessageStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: u64,
    pub message: NewMessage,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// In-process [`MessageStore`] used by tests and the demo server.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    users: Mutex<HashSet<UserId>>,
    groups: Mutex<HashMap<GroupId, Vec<UserId>>>,
    rows: Mutex<Vec<StoredMessage>>,
    next_id: AtomicU64,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, user_id: UserId) {
        self.users.lock().await.insert(user_id);
    }

    /// Creates or replaces a group. Members are registered as users too.
    pub async fn add_group(&self, group_id: GroupId, members: &[UserId]) {
        self.users.lock().await.extend(members.iter().copied());
        self.groups.lock().await.insert(group_id, members.to_vec());
    }

    /// Snapshot of all persisted rows, oldest first.
    pub async fn messages(&self) -> Vec<StoredMessage> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save_message(&self, message: NewMessage) -> Result<SavedMessage, StoreError> {
        match message.target {
            MessageTarget::User(receiver) => {
                if !self.users.lock().await.contains(&receiver) {
                    return Err(StoreError::NotFound(format!("receiver {receiver}")));
                }
            }
            MessageTarget::Group(group_id) => {
                let groups = self.groups.lock().await;
                let members = groups
                    .get(&group_id)
                    .ok_or_else(|| StoreError::NotFound(format!("group {group_id}")))?;
                if !members.contains(&message.sender_id) {
                    return Err(StoreError::Forbidden(
                        "you are not a member of this group".to_string(),
                    ));
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        self.rows.lock().await.push(StoredMessage {
            id,
            message,
            is_read: false,
            created_at: now,
        });
        Ok(SavedMessage {
            id,
            created_at: now,
            updated_at: now,
        })
    }

    async fn group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, StoreError> {
        self.groups
            .lock()
            .await
            .get(&group_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("group {group_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(sender_id: UserId, target: MessageTarget) -> NewMessage {
        NewMessage {
            sender_id,
            target,
            content: "hello".into(),
            kind: MessageKind::Text,
            file_id: None,
        }
    }

    #[tokio::test]
    async fn ids_increase_and_rows_are_kept() {
        let store = MemoryMessageStore::new();
        store.add_user(2).await;

        let first = store.save_message(text(1, MessageTarget::User(2))).await.unwrap();
        let second = store.save_message(text(1, MessageTarget::User(2))).await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);

        let rows = store.messages().await;
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].is_read);
        assert_eq!(rows[0].message.target, MessageTarget::User(2));
    }

    #[tokio::test]
    async fn unknown_receiver_and_non_member_are_rejected() {
        let store = MemoryMessageStore::new();
        store.add_group(9, &[2, 3]).await;

        let err = store.save_message(text(1, MessageTarget::User(42))).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let err = store.save_message(text(1, MessageTarget::Group(9))).await.unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));

        assert!(store.messages().await.is_empty());
        assert_eq!(store.group_members(9).await.unwrap(), vec![2, 3]);
    }
}
