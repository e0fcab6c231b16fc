//! SQLite-backed [`MessageStore`].
//!
//! `rusqlite` is synchronous, so every call takes the connection mutex inside
//! [`tokio::task::spawn_blocking`] and never blocks a runtime worker.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use courier_shared::{GroupId, MessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Group, LastMessage, Member, Message, MessageStatus};
use crate::store::MessageStore;

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Open the database in the platform data directory.
    pub fn open_default() -> Result<Self> {
        Database::new().map(Self::new)
    }

    pub fn open(path: &Path) -> Result<Self> {
        Database::open_at(path).map(Self::new)
    }

    pub fn in_memory() -> Result<Self> {
        Database::open_in_memory().map(Self::new)
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut guard = db
                .lock()
                .map_err(|_| StoreError::Unavailable("database lock poisoned".into()))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn create_group(&self, mut group: Group) -> Result<Group> {
        let now = Utc::now();
        group.created_at = now;
        group.updated_at = now;
        group.is_active = true;
        self.run(move |db| {
            db.insert_group(&group)?;
            Ok(group)
        })
        .await
    }

    async fn get_group(&self, group_id: GroupId) -> Result<Group> {
        self.run(move |db| db.get_group(group_id)).await
    }

    async fn user_groups(&self, user: &UserId) -> Result<Vec<Group>> {
        let user = user.clone();
        self.run(move |db| db.groups_for_user(&user)).await
    }

    async fn update_group(&self, group: &Group) -> Result<Group> {
        let group = group.clone();
        self.run(move |db| db.update_group(&group)).await
    }

    async fn delete_group(&self, group_id: GroupId) -> Result<()> {
        self.run(move |db| db.soft_delete_group(group_id)).await
    }

    async fn add_member(&self, group_id: GroupId, member: Member) -> Result<()> {
        self.run(move |db| db.upsert_member(group_id, &member)).await
    }

    async fn remove_member(&self, group_id: GroupId, user: &UserId) -> Result<()> {
        let user = user.clone();
        self.run(move |db| db.deactivate_member(group_id, &user))
            .await
    }

    async fn is_member(&self, group_id: GroupId, user: &UserId) -> Result<bool> {
        let user = user.clone();
        self.run(move |db| db.is_member(group_id, &user)).await
    }

    async fn group_members(&self, group_id: GroupId) -> Result<Vec<Member>> {
        self.run(move |db| db.group_members(group_id)).await
    }

    async fn is_group_admin(&self, group_id: GroupId, user: &UserId) -> Result<bool> {
        let user = user.clone();
        self.run(move |db| db.is_group_admin(group_id, &user)).await
    }

    async fn update_last_message(&self, group_id: GroupId, last: LastMessage) -> Result<()> {
        self.run(move |db| db.set_last_message(group_id, &last)).await
    }

    async fn create_message(&self, mut message: Message) -> Result<Message> {
        let now = Utc::now();
        message.created_at = now;
        message.updated_at = now;
        message.is_deleted = false;
        message.status = MessageStatus::new(now);
        self.run(move |db| {
            db.insert_message(&message)?;
            Ok(message)
        })
        .await
    }

    async fn get_message(&self, message_id: MessageId) -> Result<Message> {
        self.run(move |db| db.get_message(message_id)).await
    }

    async fn list_messages(
        &self,
        group_id: GroupId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        self.run(move |db| db.list_messages(group_id, limit, before))
            .await
    }

    async fn search_messages(
        &self,
        group_id: GroupId,
        query: &str,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Message>> {
        let query = query.to_string();
        self.run(move |db| db.search_messages(group_id, &query, limit, skip))
            .await
    }

    async fn update_message(&self, message: &Message) -> Result<Message> {
        let message = message.clone();
        self.run(move |db| db.update_message(&message)).await
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        self.run(move |db| db.soft_delete_message(message_id)).await
    }

    async fn mark_delivered(
        &self,
        group_id: GroupId,
        message_ids: &[MessageId],
        user: &UserId,
    ) -> Result<Vec<MessageId>> {
        let ids = message_ids.to_vec();
        let user = user.clone();
        self.run(move |db| db.mark_delivered(group_id, &ids, &user))
            .await
    }

    async fn mark_read(
        &self,
        group_id: GroupId,
        message_ids: &[MessageId],
        user: &UserId,
    ) -> Result<Vec<MessageId>> {
        let ids = message_ids.to_vec();
        let user = user.clone();
        self.run(move |db| db.mark_read(group_id, &ids, &user)).await
    }

    async fn unread_count(&self, group_id: GroupId, user: &UserId) -> Result<usize> {
        let user = user.clone();
        self.run(move |db| db.unread_count(group_id, &user)).await
    }

    async fn undelivered_messages(
        &self,
        user: &UserId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let user = user.clone();
        self.run(move |db| db.undelivered_messages(&user, limit, before))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GroupType, MemberRole};

    fn alice() -> UserId {
        UserId::from("alice@example.com")
    }

    fn bob() -> UserId {
        UserId::from("bob@example.com")
    }

    #[tokio::test]
    async fn test_store_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("courier.db")).unwrap();

        let group = store
            .create_group(Group::new("ops", GroupType::Group, alice()))
            .await
            .unwrap();
        store
            .add_member(group.id, Member::new(bob(), MemberRole::Member))
            .await
            .unwrap();

        let msg = store
            .create_message(Message::new(group.id, alice(), "Alice", "hi bob"))
            .await
            .unwrap();
        store
            .update_last_message(group.id, LastMessage::from_message(&msg))
            .await
            .unwrap();

        let pending = store.undelivered_messages(&bob(), 100, None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            store.mark_delivered(group.id, &[msg.id], &bob()).await.unwrap(),
            vec![msg.id]
        );
        assert!(store
            .undelivered_messages(&bob(), 100, None)
            .await
            .unwrap()
            .is_empty());

        let reloaded = store.get_group(group.id).await.unwrap();
        assert_eq!(reloaded.last_message.unwrap().message_id, msg.id);
        assert!(store.is_group_admin(group.id, &alice()).await.unwrap());
        assert!(!store.is_group_admin(group.id, &bob()).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_message_discards_input_receipts() {
        let store = SqliteStore::in_memory().unwrap();
        let group = store
            .create_group(Group::new("ops", GroupType::Group, alice()))
            .await
            .unwrap();

        let mut draft = Message::new(group.id, alice(), "Alice", "hi");
        draft.apply_read(&bob(), Utc::now());
        let stored = store.create_message(draft).await.unwrap();
        assert!(stored.status.read_by.is_empty());
        assert_eq!(store.unread_count(group.id, &bob()).await.unwrap(), 1);
    }
}
