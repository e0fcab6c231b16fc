//! Domain model structs persisted by every [`MessageStore`](crate::MessageStore)
//! backend.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to clients inside an envelope's `data` field. The delivery/read
//! bookkeeping rules live here, on the models, so all backends apply them
//! identically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::constants::LAST_MESSAGE_PREVIEW_CHARS;
use courier_shared::{GroupId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    Direct,
    Group,
    Channel,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Direct => "direct",
            GroupType::Group => "group",
            GroupType::Channel => "channel",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "direct" | "private" => GroupType::Direct,
            "channel" => GroupType::Channel,
            _ => GroupType::Group,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        if s == "admin" {
            MemberRole::Admin
        } else {
            MemberRole::Member
        }
    }
}

/// A durable group member. Inactive members are kept for history but never
/// receive broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub user_email: UserId,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

impl Member {
    pub fn new(user_email: UserId, role: MemberRole) -> Self {
        Self {
            user_email,
            role,
            joined_at: Utc::now(),
            is_active: true,
            permissions: Vec::new(),
        }
    }
}

/// Per-group policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GroupSettings {
    pub is_public: bool,
    pub allow_invites: bool,
    pub mute_notifications: bool,
    /// Allowed attachment mime types; empty means anything goes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_file_types: Vec<String>,
    /// Attachment size cap in bytes; `None` means uncapped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,
}

impl GroupSettings {
    /// Check an attachment against the group's policy.
    pub fn permits(&self, attachment: &Attachment) -> Result<(), String> {
        if !self.allowed_file_types.is_empty()
            && !self
                .allowed_file_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&attachment.file_type))
        {
            return Err(format!(
                "attachment type {} is not allowed in this group",
                attachment.file_type
            ));
        }
        if let Some(max) = self.max_file_size {
            if attachment.file_size > max {
                return Err(format!(
                    "attachment {} is {} bytes (max {})",
                    attachment.file_name, attachment.file_size, max
                ));
            }
        }
        Ok(())
    }
}

/// Denormalised summary of a group's newest message, for list views.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastMessage {
    pub message_id: MessageId,
    pub content: String,
    pub sender_email: UserId,
    pub sender_name: String,
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageKind,
}

impl LastMessage {
    pub fn from_message(message: &Message) -> Self {
        let content = if message.is_encrypted {
            String::new()
        } else {
            message
                .content
                .chars()
                .take(LAST_MESSAGE_PREVIEW_CHARS)
                .collect()
        };
        Self {
            message_id: message.id,
            content,
            sender_email: message.sender_email.clone(),
            sender_name: message.sender_name.clone(),
            timestamp: message.created_at,
            message_type: message.message_type,
        }
    }
}

/// A chat group (direct conversation, group or broadcast channel).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub group_type: GroupType,
    pub members: Vec<Member>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<GroupSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    /// Opaque tag linking the group to an external case record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
}

impl Group {
    /// Build a new active group whose creator is its first (admin) member.
    pub fn new(name: impl Into<String>, group_type: GroupType, created_by: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: GroupId::new(),
            name: name.into(),
            description: String::new(),
            group_type,
            members: vec![Member::new(created_by.clone(), MemberRole::Admin)],
            created_by,
            created_at: now,
            updated_at: now,
            is_active: true,
            settings: None,
            last_message: None,
            case_id: None,
        }
    }

    pub fn member(&self, user: &UserId) -> Option<&Member> {
        self.members.iter().find(|m| &m.user_email == user)
    }

    pub fn is_active_member(&self, user: &UserId) -> bool {
        self.is_active && self.member(user).is_some_and(|m| m.is_active)
    }

    /// The creator is always an admin; otherwise an active admin-role member.
    pub fn is_admin(&self, user: &UserId) -> bool {
        self.is_active_member(user)
            && (&self.created_by == user
                || self
                    .member(user)
                    .is_some_and(|m| m.role == MemberRole::Admin))
    }

    pub fn active_members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.is_active)
    }

    /// Insert or reactivate a member. Returns `false` if already active.
    pub fn upsert_member(&mut self, member: Member) -> bool {
        match self
            .members
            .iter_mut()
            .find(|m| m.user_email == member.user_email)
        {
            Some(existing) if existing.is_active => false,
            Some(existing) => {
                existing.is_active = true;
                existing.role = member.role;
                existing.joined_at = member.joined_at;
                existing.permissions = member.permissions;
                true
            }
            None => {
                self.members.push(member);
                true
            }
        }
    }

    /// Flag a member inactive. Returns `false` if not an active member.
    pub fn deactivate_member(&mut self, user: &UserId) -> bool {
        match self
            .members
            .iter_mut()
            .find(|m| &m.user_email == user && m.is_active)
        {
            Some(member) => {
                member.is_active = false;
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::System => "system",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "image" => MessageKind::Image,
            "file" => MessageKind::File,
            "system" => MessageKind::System,
            _ => MessageKind::Text,
        }
    }
}

/// Opaque end-to-end encryption envelope. The server stores and forwards it
/// but never interprets the fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CryptoEnvelope {
    pub v: u32,
    pub algo: String,
    #[serde(default)]
    pub ephemeral_pub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opk_id: Option<String>,
    pub nonce: String,
    pub ct: String,
}

/// A file attached to a message. The bytes live in external storage; only
/// the location reference is kept here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<CryptoEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadReceipt {
    pub user_email: UserId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub user_email: UserId,
    pub delivered_at: DateTime<Utc>,
}

/// Delivery and read bookkeeping embedded in every message.
///
/// `delivered` is the first delivery to any recipient; the per-recipient
/// state lives in `delivered_to` and `read_by`, both append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageStatus {
    pub sent: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delivered_to: Vec<DeliveryReceipt>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_by: Vec<ReadReceipt>,
}

impl MessageStatus {
    pub fn new(sent: DateTime<Utc>) -> Self {
        Self {
            sent,
            delivered: None,
            edited: None,
            delivered_to: Vec::new(),
            read_by: Vec::new(),
        }
    }

    pub fn is_delivered_to(&self, user: &UserId) -> bool {
        self.delivered_to.iter().any(|r| &r.user_email == user)
    }

    pub fn is_read_by(&self, user: &UserId) -> bool {
        self.read_by.iter().any(|r| &r.user_email == user)
    }
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub group_id: GroupId,
    pub sender_email: UserId,
    pub sender_name: String,
    #[serde(default)]
    pub content: String,
    pub message_type: MessageKind,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<CryptoEnvelope>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<UserId>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

impl Message {
    /// Build an unsaved text message. Stores re-stamp the timestamps on insert.
    pub fn new(
        group_id: GroupId,
        sender_email: UserId,
        sender_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            group_id,
            sender_email,
            sender_name: sender_name.into(),
            content: content.into(),
            message_type: MessageKind::Text,
            is_encrypted: false,
            envelope: None,
            attachments: Vec::new(),
            reply_to: None,
            mentions: Vec::new(),
            status: MessageStatus::new(now),
            created_at: now,
            updated_at: now,
            is_deleted: false,
        }
    }

    /// Enforce the encryption flags consistently: an envelope implies the
    /// encrypted flag, encrypted text carries no plaintext, and attachments
    /// inherit the message's flag.
    pub fn normalize_encryption(&mut self) {
        if self.envelope.is_some() {
            self.is_encrypted = true;
        }
        if self.is_encrypted {
            if self.message_type == MessageKind::Text {
                self.content.clear();
            }
            for attachment in &mut self.attachments {
                attachment.is_encrypted = true;
            }
        }
    }

    /// Record delivery to `user`. Returns `true` if state changed.
    ///
    /// No-op for the sender, for deleted messages and for identities already
    /// recorded, so repeated acknowledgements are harmless.
    pub fn apply_delivery(&mut self, user: &UserId, at: DateTime<Utc>) -> bool {
        if self.is_deleted || &self.sender_email == user || self.status.is_delivered_to(user) {
            return false;
        }
        let at = at.max(self.status.sent);
        self.status.delivered_to.push(DeliveryReceipt {
            user_email: user.clone(),
            delivered_at: at,
        });
        if self.status.delivered.is_none() {
            self.status.delivered = Some(at);
        }
        true
    }

    /// Record a read by `user`. Returns `true` if state changed.
    ///
    /// Reading implies delivery: a missing delivery record is backfilled with
    /// the same instant, so `sent <= delivered <= read` holds per recipient.
    pub fn apply_read(&mut self, user: &UserId, at: DateTime<Utc>) -> bool {
        if self.is_deleted || &self.sender_email == user || self.status.is_read_by(user) {
            return false;
        }
        let at = at.max(self.status.sent);
        self.apply_delivery(user, at);
        self.status.read_by.push(ReadReceipt {
            user_email: user.clone(),
            read_at: at,
        });
        true
    }

    /// Unread for `user`: live, not their own, not yet read.
    pub fn is_unread_for(&self, user: &UserId) -> bool {
        !self.is_deleted && &self.sender_email != user && !self.status.is_read_by(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserId {
        UserId::from("alice@example.com")
    }

    fn bob() -> UserId {
        UserId::from("bob@example.com")
    }

    #[test]
    fn test_group_creator_is_admin() {
        let group = Group::new("ops", GroupType::Group, alice());
        assert!(group.is_active_member(&alice()));
        assert!(group.is_admin(&alice()));
        assert!(!group.is_active_member(&bob()));
    }

    #[test]
    fn test_upsert_and_deactivate_member() {
        let mut group = Group::new("ops", GroupType::Group, alice());
        assert!(group.upsert_member(Member::new(bob(), MemberRole::Member)));
        assert!(!group.upsert_member(Member::new(bob(), MemberRole::Member)));
        assert_eq!(group.members.len(), 2);

        assert!(group.deactivate_member(&bob()));
        assert!(!group.is_active_member(&bob()));
        assert!(!group.deactivate_member(&bob()));

        // Reactivation reuses the existing entry.
        assert!(group.upsert_member(Member::new(bob(), MemberRole::Member)));
        assert_eq!(group.members.len(), 2);
        assert!(group.is_active_member(&bob()));
    }

    #[test]
    fn test_normalize_encryption_clears_text() {
        let mut msg = Message::new(GroupId::new(), alice(), "Alice", "secret");
        msg.envelope = Some(CryptoEnvelope {
            v: 1,
            algo: "aes-gcm".into(),
            ephemeral_pub: String::new(),
            opk_id: None,
            nonce: "bm9uY2U=".into(),
            ct: "Y3Q=".into(),
        });
        msg.normalize_encryption();
        assert!(msg.is_encrypted);
        assert!(msg.content.is_empty());
    }

    #[test]
    fn test_normalize_encryption_keeps_file_caption() {
        let mut msg = Message::new(GroupId::new(), alice(), "Alice", "caption");
        msg.message_type = MessageKind::File;
        msg.is_encrypted = true;
        msg.attachments.push(Attachment {
            id: "a1".into(),
            file_name: "report.pdf".into(),
            file_type: "application/pdf".into(),
            file_size: 10,
            url: "ipfs://hash".into(),
            hash: Some("hash".into()),
            is_encrypted: false,
            envelope: None,
        });
        msg.normalize_encryption();
        assert_eq!(msg.content, "caption");
        assert!(msg.attachments[0].is_encrypted);
    }

    #[test]
    fn test_delivery_is_idempotent_and_skips_sender() {
        let mut msg = Message::new(GroupId::new(), alice(), "Alice", "hi");
        assert!(!msg.apply_delivery(&alice(), Utc::now()));
        assert!(msg.apply_delivery(&bob(), Utc::now()));
        let once = msg.status.clone();
        assert!(!msg.apply_delivery(&bob(), Utc::now()));
        assert_eq!(msg.status, once);
        assert!(msg.status.delivered.unwrap() >= msg.status.sent);
    }

    #[test]
    fn test_read_backfills_delivery() {
        let mut msg = Message::new(GroupId::new(), alice(), "Alice", "hi");
        assert!(msg.apply_read(&bob(), Utc::now()));
        assert!(msg.status.is_delivered_to(&bob()));
        let delivered = msg.status.delivered_to[0].delivered_at;
        let read = msg.status.read_by[0].read_at;
        assert!(msg.status.sent <= delivered && delivered <= read);

        let once = msg.status.clone();
        assert!(!msg.apply_read(&bob(), Utc::now()));
        assert_eq!(msg.status, once);
        assert!(!msg.apply_read(&alice(), Utc::now()));
    }

    #[test]
    fn test_settings_permit_attachment() {
        let settings = GroupSettings {
            allowed_file_types: vec!["image/png".into()],
            max_file_size: Some(1024),
            ..Default::default()
        };
        let mut att = Attachment {
            id: "a".into(),
            file_name: "x.png".into(),
            file_type: "image/png".into(),
            file_size: 512,
            url: "u".into(),
            hash: None,
            is_encrypted: false,
            envelope: None,
        };
        assert!(settings.permits(&att).is_ok());
        att.file_size = 4096;
        assert!(settings.permits(&att).is_err());
        att.file_size = 10;
        att.file_type = "application/zip".into();
        assert!(settings.permits(&att).is_err());
    }
}
