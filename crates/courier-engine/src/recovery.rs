//! Replay of undelivered messages after a (re)connection.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use courier_shared::protocol::EventKind;
use courier_shared::{Envelope, GroupId, MessageId, UserId};
use courier_store::Message;

use crate::hub::ChatHub;

/// What one recovery run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `false` when another run for the same user was already in flight.
    pub ran: bool,
    pub pushed: usize,
    /// Messages whose delivery state changed as a result.
    pub marked: usize,
    /// A push failed and the drain stopped early.
    pub interrupted: bool,
}

impl ChatHub {
    /// Push every message `user` has not yet received, oldest first, and
    /// record delivery for the ones that were written. Store failures are
    /// logged, never returned.
    ///
    /// A call that arrives while a run for the same user is in flight queues
    /// one more pass on that run and returns immediately.
    pub async fn recover(&self, user: &UserId) -> RecoveryReport {
        if !self.claim_recovery(user).await {
            debug!(user = %user, "recovery already running, pass queued");
            return RecoveryReport::default();
        }

        let mut report = RecoveryReport {
            ran: true,
            ..Default::default()
        };
        loop {
            let pass = self.drain_undelivered(user).await;
            report.pushed += pass.pushed;
            report.marked += pass.marked;
            report.interrupted = pass.interrupted;
            if !self.rerun_requested(user).await {
                break;
            }
        }

        if report.pushed > 0 || report.interrupted {
            info!(
                user = %user,
                pushed = report.pushed,
                marked = report.marked,
                interrupted = report.interrupted,
                "recovery finished"
            );
        }
        report
    }

    /// Take the per-user recovery guard. If it is already held, flag the
    /// holder to run another pass and return `false`.
    async fn claim_recovery(&self, user: &UserId) -> bool {
        let mut state = self.state().write().await;
        match state.recovering.get_mut(user) {
            Some(rerun) => {
                *rerun = true;
                false
            }
            None => {
                state.recovering.insert(user.clone(), false);
                true
            }
        }
    }

    /// Consume a queued pass, or release the guard when none is queued.
    async fn rerun_requested(&self, user: &UserId) -> bool {
        let mut state = self.state().write().await;
        match state.recovering.get_mut(user) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                state.recovering.remove(user);
                false
            }
        }
    }

    async fn drain_undelivered(&self, user: &UserId) -> RecoveryReport {
        let mut report = RecoveryReport {
            ran: true,
            ..Default::default()
        };

        let pages = self.collect_undelivered(user).await;

        let mut pushed: HashMap<GroupId, Vec<MessageId>> = HashMap::new();
        for message in pages.into_iter().rev().flatten() {
            let env = match chat_envelope(&message) {
                Ok(env) => env,
                Err(e) => {
                    warn!(message = %message.id, error = %e, "failed to encode message");
                    continue;
                }
            };
            if let Err(e) = self.send_to_user(user, &env).await {
                debug!(user = %user, error = %e, "recovery push failed");
                report.interrupted = true;
                break;
            }
            report.pushed += 1;
            pushed.entry(message.group_id).or_default().push(message.id);
        }

        for (group, ids) in pushed {
            match self.store().mark_delivered(group, &ids, user).await {
                Ok(changed) => report.marked += changed.len(),
                Err(e) => warn!(user = %user, group = %group, error = %e, "mark delivered failed"),
            }
        }
        report
    }

    /// Pages of undelivered messages, newest page first, each page oldest
    /// first.
    async fn collect_undelivered(&self, user: &UserId) -> Vec<Vec<Message>> {
        let page_size = self.config().recovery_page_size;
        let mut pages = Vec::new();
        let mut before = None;

        for _ in 0..self.config().recovery_max_pages {
            let page = match self.store().undelivered_messages(user, page_size, before).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(user = %user, error = %e, "failed to load undelivered messages");
                    break;
                }
            };
            let Some(oldest) = page.first() else {
                break;
            };
            before = Some(oldest.id);
            let full = page.len() >= page_size;
            pages.push(page);
            if !full {
                break;
            }
        }
        pages
    }
}

pub(crate) fn chat_envelope(message: &Message) -> Result<Envelope, serde_json::Error> {
    Envelope::new(EventKind::Chat)
        .with_group(message.group_id)
        .with_user(message.sender_email.clone())
        .with_payload(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use courier_store::{Group, GroupType, Member, MemberRole, MemoryStore, MessageStore};

    use crate::config::HubConfig;
    use crate::directory::OpenDirectory;
    use crate::transport::pipe;

    fn alice() -> UserId {
        UserId::from("alice@example.com")
    }

    fn bob() -> UserId {
        UserId::from("bob@example.com")
    }

    async fn seeded() -> (ChatHub, Arc<MemoryStore>, Message) {
        let store = Arc::new(MemoryStore::new());
        let mut group = Group::new("pair", GroupType::Group, alice());
        group.upsert_member(Member::new(bob(), MemberRole::Member));
        let group = store.create_group(group).await.unwrap();
        let message = store
            .create_message(Message::new(group.id, alice(), "alice", "while you were out"))
            .await
            .unwrap();
        let hub = ChatHub::new(store.clone(), Arc::new(OpenDirectory), HubConfig::default());
        (hub, store, message)
    }

    #[tokio::test]
    async fn test_second_claim_queues_a_pass() {
        let (hub, _store, _) = seeded().await;
        assert!(hub.claim_recovery(&bob()).await);
        let report = hub.recover(&bob()).await;
        assert!(!report.ran);
        assert_eq!(hub.state().read().await.recovering.get(&bob()), Some(&true));

        assert!(hub.rerun_requested(&bob()).await);
        assert!(!hub.rerun_requested(&bob()).await);
        assert!(hub.state().read().await.recovering.is_empty());
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_during_recovery_gets_queued_pass() {
        let (hub, store, message) = seeded().await;

        // An in-flight run whose pass found nobody to push to.
        assert!(hub.claim_recovery(&bob()).await);
        let first = hub.drain_undelivered(&bob()).await;
        assert!(first.interrupted);
        assert_eq!(first.pushed, 0);

        // The reconnect's own recovery defers to the in-flight run.
        let (sink, stream, mut client) = pipe(16);
        hub.admit(bob(), sink, stream).await.unwrap();
        for _ in 0..100 {
            if hub.state().read().await.recovering.get(&bob()) == Some(&true) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(hub.rerun_requested(&bob()).await);

        let second = hub.drain_undelivered(&bob()).await;
        assert_eq!(second.pushed, 1);
        assert!(!hub.rerun_requested(&bob()).await);

        let env = client.recv_envelope().await.unwrap();
        assert_eq!(env.kind, EventKind::Chat);
        let stored = store.get_message(message.id).await.unwrap();
        assert!(stored.status.is_delivered_to(&bob()));
        hub.shutdown().await;
    }
}
