//! The persistence contract consumed by the messaging engine.

use std::sync::Arc;

use async_trait::async_trait;

use courier_shared::{GroupId, MessageId, UserId};

use crate::error::Result;
use crate::models::{Group, LastMessage, Member, Message};

/// Shared handle to a store backend.
pub type SharedStore = Arc<dyn MessageStore>;

/// Durable groups and messages.
///
/// Every call is its own transactional boundary; the engine never spans a
/// transaction across a broadcast. Soft-deleted groups and messages are
/// invisible to every read, and the bulk delivery/read operations are
/// idempotent: they return only the ids whose state actually changed.
#[async_trait]
pub trait MessageStore: Send + Sync {
    // -- Groups --------------------------------------------------------

    /// Persist a new group, stamping `created_at`/`updated_at` and the active flag.
    async fn create_group(&self, group: Group) -> Result<Group>;

    /// Fetch an active group.
    async fn get_group(&self, group_id: GroupId) -> Result<Group>;

    /// Active groups where `user` is an active member, most recently updated first.
    async fn user_groups(&self, user: &UserId) -> Result<Vec<Group>>;

    /// Overwrite name, description, type, settings and case tag.
    async fn update_group(&self, group: &Group) -> Result<Group>;

    /// Soft delete: the active flag is cleared.
    async fn delete_group(&self, group_id: GroupId) -> Result<()>;

    /// Add or reactivate a member.
    async fn add_member(&self, group_id: GroupId, member: Member) -> Result<()>;

    /// Flag a member inactive.
    async fn remove_member(&self, group_id: GroupId, user: &UserId) -> Result<()>;

    async fn is_member(&self, group_id: GroupId, user: &UserId) -> Result<bool>;

    /// Active members of an active group.
    async fn group_members(&self, group_id: GroupId) -> Result<Vec<Member>>;

    async fn is_group_admin(&self, group_id: GroupId, user: &UserId) -> Result<bool>;

    async fn update_last_message(&self, group_id: GroupId, last: LastMessage) -> Result<()>;

    // -- Messages ------------------------------------------------------

    /// Persist a new message. `status.sent`, `created_at` and `updated_at`
    /// are stamped with the insertion time and any delivery/read state on
    /// the input is discarded.
    async fn create_message(&self, message: Message) -> Result<Message>;

    /// Fetch a live (non-deleted) message.
    async fn get_message(&self, message_id: MessageId) -> Result<Message>;

    /// Up to `limit` newest messages strictly older than `before` (in
    /// persistence order), returned oldest first.
    async fn list_messages(
        &self,
        group_id: GroupId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>>;

    /// Case-insensitive substring search over content, newest first.
    async fn search_messages(
        &self,
        group_id: GroupId,
        query: &str,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Message>>;

    /// Overwrite the editable fields (content, type, encryption, attachments,
    /// mentions) and stamp `status.edited`.
    async fn update_message(&self, message: &Message) -> Result<Message>;

    /// Soft delete.
    async fn delete_message(&self, message_id: MessageId) -> Result<()>;

    // -- Delivery / read bookkeeping ----------------------------------

    async fn mark_delivered(
        &self,
        group_id: GroupId,
        message_ids: &[MessageId],
        user: &UserId,
    ) -> Result<Vec<MessageId>>;

    /// Marking read also records delivery for `user` when missing.
    async fn mark_read(
        &self,
        group_id: GroupId,
        message_ids: &[MessageId],
        user: &UserId,
    ) -> Result<Vec<MessageId>>;

    async fn unread_count(&self, group_id: GroupId, user: &UserId) -> Result<usize>;

    /// Messages in groups where `user` is an active member that were not
    /// sent by and not yet delivered to `user`: up to `limit` of the newest
    /// strictly older than `before`, returned oldest first.
    async fn undelivered_messages(
        &self,
        user: &UserId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>>;
}
