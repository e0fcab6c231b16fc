//! Request-level chat operations used by the HTTP layer.
//!
//! Every operation authorises the caller against durable membership, then
//! persists, then pushes live events. Persistence never depends on anyone
//! being online.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use courier_shared::constants::{DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT};
use courier_shared::protocol::EventKind;
use courier_shared::{Envelope, GroupId, MessageId, UserId};
use courier_store::{
    Attachment, CryptoEnvelope, Group, GroupSettings, GroupType, LastMessage, Member, MemberRole,
    Message, MessageKind, SharedStore,
};

use crate::broadcast::BroadcastReport;
use crate::error::{EngineError, Result};
use crate::hub::ChatHub;
use crate::recovery::chat_envelope;

#[derive(Debug, Clone, Deserialize)]
pub struct NewGroup {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_group_type", rename = "type")]
    pub group_type: GroupType,
    #[serde(default)]
    pub members: Vec<UserId>,
    #[serde(default)]
    pub settings: Option<GroupSettings>,
    #[serde(default)]
    pub case_id: Option<String>,
}

fn default_group_type() -> GroupType {
    GroupType::Group
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub settings: Option<GroupSettings>,
    pub case_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default)]
    pub envelope: Option<CryptoEnvelope>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub mentions: Vec<UserId>,
    /// Display name; defaults to the sender's identity.
    #[serde(default)]
    pub sender_name: Option<String>,
}

impl NewMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageEdit {
    pub content: String,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default)]
    pub envelope: Option<CryptoEnvelope>,
}

/// A persisted message plus the result of pushing it live.
#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub message: Message,
    /// `None` when no member was online; the message is stored regardless.
    pub live: Option<BroadcastReport>,
}

#[derive(Clone)]
pub struct ChatService {
    hub: ChatHub,
}

impl ChatService {
    pub fn new(hub: ChatHub) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &ChatHub {
        &self.hub
    }

    fn store(&self) -> &SharedStore {
        self.hub.store()
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Create a group. The creator becomes its admin; listed members are
    /// added and, if online, subscribed.
    pub async fn create_group(&self, creator: &UserId, req: NewGroup) -> Result<Group> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(EngineError::ValidationFailed("group name is required".into()));
        }

        let mut group = Group::new(name, req.group_type, creator.clone());
        group.description = req.description;
        group.settings = req.settings;
        group.case_id = req.case_id;
        for member in req.members {
            if !member.is_well_formed() {
                return Err(EngineError::ValidationFailed(format!(
                    "invalid member identity {member:?}"
                )));
            }
            group.upsert_member(Member::new(member, MemberRole::Member));
        }

        let group = self.store().create_group(group).await?;
        info!(group = %group.id, creator = %creator, members = group.members.len(), "group created");

        for member in group.active_members() {
            self.subscribe_if_online(group.id, &member.user_email).await;
        }
        Ok(group)
    }

    pub async fn get_group(&self, user: &UserId, group_id: GroupId) -> Result<Group> {
        let group = self.store().get_group(group_id).await?;
        if !group.is_active_member(user) {
            return Err(forbidden(user, group_id));
        }
        Ok(group)
    }

    pub async fn list_groups(&self, user: &UserId) -> Result<Vec<Group>> {
        Ok(self.store().user_groups(user).await?)
    }

    /// Admin only.
    pub async fn update_group(
        &self,
        user: &UserId,
        group_id: GroupId,
        update: GroupUpdate,
    ) -> Result<Group> {
        let mut group = self.require_admin(user, group_id).await?;
        if let Some(name) = update.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(EngineError::ValidationFailed("group name is required".into()));
            }
            group.name = name.to_string();
        }
        if let Some(description) = update.description {
            group.description = description;
        }
        if let Some(settings) = update.settings {
            group.settings = Some(settings);
        }
        if let Some(case_id) = update.case_id {
            group.case_id = Some(case_id);
        }
        Ok(self.store().update_group(&group).await?)
    }

    /// Soft-delete a group (admin only) and tell its online members.
    pub async fn delete_group(&self, user: &UserId, group_id: GroupId) -> Result<()> {
        self.require_admin(user, group_id).await?;
        self.store().delete_group(group_id).await?;

        let env = Envelope::new(EventKind::GroupDeleted)
            .with_group(group_id)
            .with_user(user.clone());
        self.push(group_id, &env).await;
        let dropped = self.hub.drop_group(group_id).await;
        info!(group = %group_id, by = %user, unsubscribed = dropped.len(), "group deleted");
        Ok(())
    }

    /// Add `member` to a group. Admins may always add; other members only
    /// when the group allows invites.
    pub async fn add_member(
        &self,
        actor: &UserId,
        group_id: GroupId,
        member: UserId,
        role: MemberRole,
    ) -> Result<()> {
        let group = self.store().get_group(group_id).await?;
        let allowed = group.is_admin(actor)
            || (group.is_active_member(actor)
                && role == MemberRole::Member
                && group.settings.as_ref().is_some_and(|s| s.allow_invites));
        if !allowed {
            return Err(EngineError::Forbidden(format!(
                "{actor} may not add members to group {group_id}"
            )));
        }
        if !member.is_well_formed() {
            return Err(EngineError::ValidationFailed(format!(
                "invalid member identity {member:?}"
            )));
        }

        self.store()
            .add_member(group_id, Member::new(member.clone(), role))
            .await?;
        debug!(group = %group_id, member = %member, by = %actor, "member added");
        self.subscribe_if_online(group_id, &member).await;
        Ok(())
    }

    /// Remove `member` from a group. Admins may remove anyone; members may
    /// remove themselves.
    pub async fn remove_member(
        &self,
        actor: &UserId,
        group_id: GroupId,
        member: &UserId,
    ) -> Result<()> {
        if actor != member && !self.store().is_group_admin(group_id, actor).await? {
            return Err(EngineError::Forbidden(format!(
                "{actor} may not remove members from group {group_id}"
            )));
        }
        self.store().remove_member(group_id, member).await?;
        self.hub.leave_group(group_id, member).await;
        debug!(group = %group_id, member = %member, by = %actor, "member removed");
        Ok(())
    }

    /// Connected identities subscribed to a group.
    pub async fn active_members(&self, user: &UserId, group_id: GroupId) -> Result<Vec<UserId>> {
        self.hub.require_member(group_id, user).await?;
        Ok(self.hub.active_members(group_id).await)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Persist a message and push it to the group's online members.
    pub async fn send_message(
        &self,
        sender: &UserId,
        group_id: GroupId,
        draft: NewMessage,
    ) -> Result<SendOutcome> {
        let group = self.store().get_group(group_id).await?;
        if !group.is_active_member(sender) {
            return Err(forbidden(sender, group_id));
        }
        if draft.content.trim().is_empty() && draft.attachments.is_empty() && draft.envelope.is_none()
        {
            return Err(EngineError::ValidationFailed("message is empty".into()));
        }
        if let Some(settings) = &group.settings {
            for attachment in &draft.attachments {
                settings
                    .permits(attachment)
                    .map_err(EngineError::ValidationFailed)?;
            }
        }
        if let Some(parent) = draft.reply_to {
            let parent = self.store().get_message(parent).await.map_err(|_| {
                EngineError::ValidationFailed(format!("reply target {parent} not found"))
            })?;
            if parent.group_id != group_id {
                return Err(EngineError::ValidationFailed(
                    "reply target belongs to another group".into(),
                ));
            }
        }

        let sender_name = draft
            .sender_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| sender.to_string());
        let mut message = Message::new(group_id, sender.clone(), sender_name, draft.content);
        message.message_type = draft.message_type;
        message.is_encrypted = draft.is_encrypted;
        message.envelope = draft.envelope;
        message.attachments = draft.attachments;
        message.reply_to = draft.reply_to;
        message.mentions = draft.mentions;
        message.normalize_encryption();

        let message = self.store().create_message(message).await?;
        if let Err(e) = self
            .store()
            .update_last_message(group_id, LastMessage::from_message(&message))
            .await
        {
            warn!(group = %group_id, error = %e, "failed to update last message");
        }

        let env = chat_envelope(&message)
            .map_err(|e| EngineError::ValidationFailed(format!("unencodable message: {e}")))?;
        let live = match self.hub.broadcast_to_group(group_id, &env).await {
            Ok(report) => Some(report),
            Err(EngineError::NotFound(_)) => {
                debug!(group = %group_id, message = %message.id, "nobody online, stored only");
                None
            }
            Err(e) => {
                warn!(group = %group_id, error = %e, "live push failed");
                None
            }
        };
        Ok(SendOutcome { message, live })
    }

    /// Sender only.
    pub async fn edit_message(
        &self,
        user: &UserId,
        message_id: MessageId,
        edit: MessageEdit,
    ) -> Result<Message> {
        let mut message = self.store().get_message(message_id).await?;
        if &message.sender_email != user {
            return Err(EngineError::Forbidden("only the sender may edit a message".into()));
        }
        self.hub.require_member(message.group_id, user).await?;

        message.content = edit.content;
        message.is_encrypted = edit.is_encrypted;
        message.envelope = edit.envelope;
        message.normalize_encryption();
        let message = self.store().update_message(&message).await?;

        match Envelope::new(EventKind::MessageUpdate)
            .with_group(message.group_id)
            .with_user(user.clone())
            .with_payload(&message)
        {
            Ok(env) => self.push(message.group_id, &env).await,
            Err(e) => warn!(error = %e, "failed to encode message update"),
        }
        Ok(message)
    }

    /// Sender or group admin.
    pub async fn delete_message(&self, user: &UserId, message_id: MessageId) -> Result<()> {
        let message = self.store().get_message(message_id).await?;
        let group_id = message.group_id;
        if &message.sender_email != user && !self.store().is_group_admin(group_id, user).await? {
            return Err(EngineError::Forbidden(
                "only the sender or a group admin may delete a message".into(),
            ));
        }
        self.store().delete_message(message_id).await?;

        let env = Envelope::new(EventKind::MessageDelete)
            .with_group(group_id)
            .with_user(user.clone())
            .with_data(serde_json::json!({ "message_id": message_id }));
        self.push(group_id, &env).await;
        Ok(())
    }

    /// A page of history, oldest first.
    pub async fn history(
        &self,
        user: &UserId,
        group_id: GroupId,
        limit: Option<usize>,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        self.hub.require_member(group_id, user).await?;
        Ok(self
            .store()
            .list_messages(group_id, clamp_limit(limit), before)
            .await?)
    }

    pub async fn search(
        &self,
        user: &UserId,
        group_id: GroupId,
        query: &str,
        limit: Option<usize>,
        skip: usize,
    ) -> Result<Vec<Message>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(EngineError::ValidationFailed("search query is empty".into()));
        }
        self.hub.require_member(group_id, user).await?;
        Ok(self
            .store()
            .search_messages(group_id, query, clamp_limit(limit), skip)
            .await?)
    }

    pub async fn mark_read(
        &self,
        user: &UserId,
        group_id: GroupId,
        ids: &[MessageId],
    ) -> Result<Vec<MessageId>> {
        self.hub.mark_read(group_id, ids, user).await
    }

    pub async fn unread_count(&self, user: &UserId, group_id: GroupId) -> Result<usize> {
        self.hub.unread_count(group_id, user).await
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn require_admin(&self, user: &UserId, group_id: GroupId) -> Result<Group> {
        let group = self.store().get_group(group_id).await?;
        if !group.is_admin(user) {
            return Err(EngineError::Forbidden(format!(
                "{user} is not an admin of group {group_id}"
            )));
        }
        Ok(group)
    }

    async fn subscribe_if_online(&self, group_id: GroupId, user: &UserId) {
        match self.hub.join_group(group_id, user).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(e) => warn!(group = %group_id, user = %user, error = %e, "subscribe failed"),
        }
    }

    /// Best-effort live push; an empty audience is not an error here.
    async fn push(&self, group_id: GroupId, env: &Envelope) {
        if let Err(e) = self.hub.broadcast_to_group(group_id, env).await {
            debug!(group = %group_id, kind = %env.kind, error = %e, "event not pushed");
        }
    }
}

fn forbidden(user: &UserId, group_id: GroupId) -> EngineError {
    EngineError::Forbidden(format!("{user} is not a member of group {group_id}"))
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}
