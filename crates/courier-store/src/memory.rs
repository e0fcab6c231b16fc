//! In-memory [`MessageStore`] backend.
//!
//! Used by the engine's tests and by the server when no database path is
//! configured. Messages are kept in a single vector in insertion order, which
//! is the persistence order every cursor refers to.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use courier_shared::{GroupId, MessageId, UserId};

use crate::error::{Result, StoreError};
use crate::models::{Group, LastMessage, Member, Message, MessageStatus};
use crate::store::MessageStore;

#[derive(Default)]
struct Inner {
    groups: HashMap<GroupId, Group>,
    messages: Vec<Message>,
    /// message id -> position in `messages`
    positions: HashMap<MessageId, usize>,
}

impl Inner {
    fn active_group(&self, group_id: GroupId) -> Result<&Group> {
        self.groups
            .get(&group_id)
            .filter(|g| g.is_active)
            .ok_or(StoreError::NotFound)
    }

    fn active_group_mut(&mut self, group_id: GroupId) -> Result<&mut Group> {
        self.groups
            .get_mut(&group_id)
            .filter(|g| g.is_active)
            .ok_or(StoreError::NotFound)
    }

    /// Exclusive upper bound for a before-cursor.
    fn cursor(&self, before: Option<MessageId>) -> Result<usize> {
        match before {
            Some(id) => self.positions.get(&id).copied().ok_or(StoreError::NotFound),
            None => Ok(self.messages.len()),
        }
    }

    fn live_message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        let pos = *self.positions.get(&id)?;
        self.messages.get_mut(pos).filter(|m| !m.is_deleted)
    }
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_group(&self, mut group: Group) -> Result<Group> {
        let now = Utc::now();
        group.created_at = now;
        group.updated_at = now;
        group.is_active = true;

        let mut inner = self.inner.write().await;
        inner.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn get_group(&self, group_id: GroupId) -> Result<Group> {
        self.inner.read().await.active_group(group_id).cloned()
    }

    async fn user_groups(&self, user: &UserId) -> Result<Vec<Group>> {
        let inner = self.inner.read().await;
        let mut groups: Vec<Group> = inner
            .groups
            .values()
            .filter(|g| g.is_active_member(user))
            .cloned()
            .collect();
        groups.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(groups)
    }

    async fn update_group(&self, group: &Group) -> Result<Group> {
        let mut inner = self.inner.write().await;
        let stored = inner.active_group_mut(group.id)?;
        stored.name = group.name.clone();
        stored.description = group.description.clone();
        stored.group_type = group.group_type;
        stored.settings = group.settings.clone();
        stored.case_id = group.case_id.clone();
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn delete_group(&self, group_id: GroupId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let group = inner.active_group_mut(group_id)?;
        group.is_active = false;
        group.updated_at = Utc::now();
        Ok(())
    }

    async fn add_member(&self, group_id: GroupId, member: Member) -> Result<()> {
        let mut inner = self.inner.write().await;
        let group = inner.active_group_mut(group_id)?;
        if group.upsert_member(member) {
            group.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn remove_member(&self, group_id: GroupId, user: &UserId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let group = inner.active_group_mut(group_id)?;
        if !group.deactivate_member(user) {
            return Err(StoreError::NotFound);
        }
        group.updated_at = Utc::now();
        Ok(())
    }

    async fn is_member(&self, group_id: GroupId, user: &UserId) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner
            .groups
            .get(&group_id)
            .is_some_and(|g| g.is_active_member(user)))
    }

    async fn group_members(&self, group_id: GroupId) -> Result<Vec<Member>> {
        let inner = self.inner.read().await;
        let group = inner.active_group(group_id)?;
        Ok(group.active_members().cloned().collect())
    }

    async fn is_group_admin(&self, group_id: GroupId, user: &UserId) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner.groups.get(&group_id).is_some_and(|g| g.is_admin(user)))
    }

    async fn update_last_message(&self, group_id: GroupId, last: LastMessage) -> Result<()> {
        let mut inner = self.inner.write().await;
        let group = inner.active_group_mut(group_id)?;
        group.last_message = Some(last);
        group.updated_at = Utc::now();
        Ok(())
    }

    async fn create_message(&self, mut message: Message) -> Result<Message> {
        let now = Utc::now();
        message.created_at = now;
        message.updated_at = now;
        message.is_deleted = false;
        message.status = MessageStatus::new(now);

        let mut inner = self.inner.write().await;
        inner.active_group(message.group_id)?;
        let pos = inner.messages.len();
        inner.positions.insert(message.id, pos);
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn get_message(&self, message_id: MessageId) -> Result<Message> {
        let inner = self.inner.read().await;
        inner
            .positions
            .get(&message_id)
            .and_then(|&pos| inner.messages.get(pos))
            .filter(|m| !m.is_deleted)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_messages(
        &self,
        group_id: GroupId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let inner = self.inner.read().await;
        let end = inner.cursor(before)?;
        let mut page: Vec<Message> = inner.messages[..end]
            .iter()
            .rev()
            .filter(|m| m.group_id == group_id && !m.is_deleted)
            .take(limit)
            .cloned()
            .collect();
        page.reverse();
        Ok(page)
    }

    async fn search_messages(
        &self,
        group_id: GroupId,
        query: &str,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Message>> {
        let needle = query.to_lowercase();
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .iter()
            .rev()
            .filter(|m| m.group_id == group_id && !m.is_deleted)
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .skip(skip)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_message(&self, message: &Message) -> Result<Message> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .live_message_mut(message.id)
            .ok_or(StoreError::NotFound)?;
        let now = Utc::now();
        stored.content = message.content.clone();
        stored.message_type = message.message_type;
        stored.is_encrypted = message.is_encrypted;
        stored.envelope = message.envelope.clone();
        stored.attachments = message.attachments.clone();
        stored.mentions = message.mentions.clone();
        stored.status.edited = Some(now);
        stored.updated_at = now;
        Ok(stored.clone())
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .live_message_mut(message_id)
            .ok_or(StoreError::NotFound)?;
        stored.is_deleted = true;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_delivered(
        &self,
        group_id: GroupId,
        message_ids: &[MessageId],
        user: &UserId,
    ) -> Result<Vec<MessageId>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut changed = Vec::new();
        for id in message_ids {
            if let Some(msg) = inner.live_message_mut(*id) {
                if msg.group_id == group_id && msg.apply_delivery(user, now) {
                    msg.updated_at = now;
                    changed.push(*id);
                }
            }
        }
        Ok(changed)
    }

    async fn mark_read(
        &self,
        group_id: GroupId,
        message_ids: &[MessageId],
        user: &UserId,
    ) -> Result<Vec<MessageId>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut changed = Vec::new();
        for id in message_ids {
            if let Some(msg) = inner.live_message_mut(*id) {
                if msg.group_id == group_id && msg.apply_read(user, now) {
                    msg.updated_at = now;
                    changed.push(*id);
                }
            }
        }
        Ok(changed)
    }

    async fn unread_count(&self, group_id: GroupId, user: &UserId) -> Result<usize> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.group_id == group_id && m.is_unread_for(user))
            .count())
    }

    async fn undelivered_messages(
        &self,
        user: &UserId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let inner = self.inner.read().await;
        let end = inner.cursor(before)?;
        let mut page: Vec<Message> = inner.messages[..end]
            .iter()
            .rev()
            .filter(|m| {
                !m.is_deleted
                    && &m.sender_email != user
                    && !m.status.is_delivered_to(user)
                    && inner
                        .groups
                        .get(&m.group_id)
                        .is_some_and(|g| g.is_active_member(user))
            })
            .take(limit)
            .cloned()
            .collect();
        page.reverse();
        Ok(page)
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

    async fn group_with_bob(store: &MemoryStore) -> Group {
        let mut group = Group::new("case-42", GroupType::Group, alice());
        group.upsert_member(Member::new(bob(), MemberRole::Member));
        store.create_group(group).await.unwrap()
    }

    async fn send(store: &MemoryStore, group: &Group, from: UserId, text: &str) -> Message {
        store
            .create_message(Message::new(group.id, from, "sender", text))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_soft_deleted_group_is_invisible() {
        let store = MemoryStore::new();
        let group = group_with_bob(&store).await;
        store.delete_group(group.id).await.unwrap();

        assert!(matches!(
            store.get_group(group.id).await,
            Err(StoreError::NotFound)
        ));
        assert!(store.user_groups(&bob()).await.unwrap().is_empty());
        assert!(!store.is_member(group.id, &bob()).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_messages_paginates_backwards() {
        let store = MemoryStore::new();
        let group = group_with_bob(&store).await;
        let mut sent = Vec::new();
        for i in 0..5 {
            sent.push(send(&store, &group, alice(), &format!("m{i}")).await);
        }

        let newest = store.list_messages(group.id, 2, None).await.unwrap();
        assert_eq!(
            newest.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["m3", "m4"]
        );

        let older = store
            .list_messages(group.id, 10, Some(newest[0].id))
            .await
            .unwrap();
        assert_eq!(
            older.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["m0", "m1", "m2"]
        );
    }

    #[tokio::test]
    async fn test_deleted_messages_excluded_everywhere() {
        let store = MemoryStore::new();
        let group = group_with_bob(&store).await;
        let keep = send(&store, &group, alice(), "keep me").await;
        let gone = send(&store, &group, alice(), "delete me").await;
        store.delete_message(gone.id).await.unwrap();

        let listed = store.list_messages(group.id, 10, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, keep.id);
        assert!(store
            .search_messages(group.id, "delete", 10, 0)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.unread_count(group.id, &bob()).await.unwrap(), 1);
        assert_eq!(
            store.undelivered_messages(&bob(), 10, None).await.unwrap().len(),
            1
        );
        assert!(store.mark_read(group.id, &[gone.id], &bob()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let store = MemoryStore::new();
        let group = group_with_bob(&store).await;
        let msg = send(&store, &group, alice(), "hi").await;

        let first = store.mark_read(group.id, &[msg.id], &bob()).await.unwrap();
        assert_eq!(first, vec![msg.id]);
        let after_once = store.get_message(msg.id).await.unwrap().status;

        let second = store.mark_read(group.id, &[msg.id], &bob()).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(store.get_message(msg.id).await.unwrap().status, after_once);

        // The sender never reads their own message.
        assert!(store.mark_read(group.id, &[msg.id], &alice()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_delivered_scoped_to_group() {
        let store = MemoryStore::new();
        let group = group_with_bob(&store).await;
        let msg = send(&store, &group, alice(), "hi").await;

        let other = GroupId::new();
        assert!(store.mark_delivered(other, &[msg.id], &bob()).await.unwrap().is_empty());
        assert!(store.mark_delivered(group.id, &[], &bob()).await.unwrap().is_empty());
        assert_eq!(
            store.mark_delivered(group.id, &[msg.id], &bob()).await.unwrap(),
            vec![msg.id]
        );
        let status = store.get_message(msg.id).await.unwrap().status;
        assert!(status.delivered.unwrap() >= status.sent);
    }

    #[tokio::test]
    async fn test_unread_count_definition() {
        let store = MemoryStore::new();
        let group = group_with_bob(&store).await;
        let m1 = send(&store, &group, alice(), "one").await;
        send(&store, &group, alice(), "two").await;
        send(&store, &group, bob(), "mine").await;

        assert_eq!(store.unread_count(group.id, &bob()).await.unwrap(), 2);
        store.mark_read(group.id, &[m1.id], &bob()).await.unwrap();
        assert_eq!(store.unread_count(group.id, &bob()).await.unwrap(), 1);
        assert_eq!(store.unread_count(group.id, &alice()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_undelivered_only_for_active_memberships() {
        let store = MemoryStore::new();
        let group = group_with_bob(&store).await;
        let stranger_group = store
            .create_group(Group::new("private", GroupType::Direct, alice()))
            .await
            .unwrap();

        send(&store, &group, alice(), "for bob").await;
        send(&store, &stranger_group, alice(), "not for bob").await;

        let pending = store.undelivered_messages(&bob(), 10, None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].content, "for bob");

        store.remove_member(group.id, &bob()).await.unwrap();
        assert!(store.undelivered_messages(&bob(), 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_message_stamps_edited() {
        let store = MemoryStore::new();
        let group = group_with_bob(&store).await;
        let mut msg = send(&store, &group, alice(), "typo").await;
        assert!(msg.status.edited.is_none());

        msg.content = "fixed".into();
        let updated = store.update_message(&msg).await.unwrap();
        assert_eq!(updated.content, "fixed");
        assert!(updated.status.edited.is_some());
        assert_eq!(updated.status.sent, msg.status.sent);
    }
}
