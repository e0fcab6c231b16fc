//! Delivery and read acknowledgements.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, warn};

use courier_shared::protocol::EventKind;
use courier_shared::{Envelope, GroupId, MessageId, ReadReceiptPayload, UserId};
use courier_store::StoreError;

use crate::error::{EngineError, Result};
use crate::hub::ChatHub;

impl ChatHub {
    /// Record that `user` received `ids` in `group`. Returns the ids whose
    /// state changed; repeats are no-ops.
    pub async fn mark_delivered(
        &self,
        group: GroupId,
        ids: &[MessageId],
        user: &UserId,
    ) -> Result<Vec<MessageId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.require_member(group, user).await?;
        Ok(self.store().mark_delivered(group, ids, user).await?)
    }

    /// Record that `user` read `ids` in `group` and tell the group.
    pub async fn mark_read(
        &self,
        group: GroupId,
        ids: &[MessageId],
        user: &UserId,
    ) -> Result<Vec<MessageId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.require_member(group, user).await?;
        let changed = self.store().mark_read(group, ids, user).await?;

        if !changed.is_empty() {
            debug!(group = %group, user = %user, count = changed.len(), "messages read");
            let receipt = ReadReceiptPayload {
                message_ids: changed.clone(),
                user_email: user.clone(),
                read_at: Utc::now(),
            };
            match Envelope::new(EventKind::MessageRead)
                .with_group(group)
                .with_user(user.clone())
                .with_payload(&receipt)
            {
                Ok(env) => self.notify(group, env, None),
                Err(e) => warn!(error = %e, "failed to encode read receipt"),
            }
        }
        Ok(changed)
    }

    /// Delivery acks arrive without a group: resolve each message's group
    /// from the store and mark per group. Unknown ids are skipped.
    pub async fn ack_delivered(&self, user: &UserId, ids: &[MessageId]) -> Result<Vec<MessageId>> {
        let mut by_group: HashMap<GroupId, Vec<MessageId>> = HashMap::new();
        for id in ids {
            match self.store().get_message(*id).await {
                Ok(message) => by_group.entry(message.group_id).or_default().push(*id),
                Err(StoreError::NotFound) => debug!(message = %id, "ack for unknown message"),
                Err(e) => return Err(e.into()),
            }
        }

        let mut changed = Vec::new();
        for (group, ids) in by_group {
            match self.mark_delivered(group, &ids, user).await {
                Ok(ids) => changed.extend(ids),
                Err(EngineError::Forbidden(reason)) => debug!(%reason, "ack outside membership"),
                Err(e) => return Err(e),
            }
        }
        Ok(changed)
    }

    pub async fn unread_count(&self, group: GroupId, user: &UserId) -> Result<usize> {
        self.require_member(group, user).await?;
        Ok(self.store().unread_count(group, user).await?)
    }

    pub(crate) async fn require_member(&self, group: GroupId, user: &UserId) -> Result<()> {
        if self.store().is_member(group, user).await? {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!(
                "{user} is not a member of group {group}"
            )))
        }
    }
}
