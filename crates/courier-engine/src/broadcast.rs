//! Group fan-out and direct sends.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use courier_shared::protocol::EventKind;
use courier_shared::{Envelope, GroupId, UserId};

use crate::error::{EngineError, Result};
use crate::hub::ChatHub;
use crate::registry::Connection;
use crate::transport::{Frame, TransportError};

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: Vec<UserId>,
    pub failed: Vec<UserId>,
}

impl ChatHub {
    /// Write `env` to every active member of `group`.
    pub async fn broadcast_to_group(&self, group: GroupId, env: &Envelope) -> Result<BroadcastReport> {
        self.fan_out(group, env, None).await
    }

    /// Write `env` to every active member of `group` except `excluded`.
    pub async fn broadcast_except(
        &self,
        group: GroupId,
        env: &Envelope,
        excluded: &UserId,
    ) -> Result<BroadcastReport> {
        self.fan_out(group, env, Some(excluded)).await
    }

    /// Write `env` to one connected user.
    pub async fn send_to_user(&self, user: &UserId, env: &Envelope) -> Result<()> {
        let payload = encode(env)?;
        let conn = self
            .state()
            .read()
            .await
            .connections
            .get(user)
            .ok_or_else(|| EngineError::NotFound(format!("no live connection for {user}")))?;

        match conn.send(Frame::Text(payload), self.config().write_timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The read loop owns teardown; cancelling hands it over.
                conn.cancel();
                Err(e.into())
            }
        }
    }

    async fn fan_out(
        &self,
        group: GroupId,
        env: &Envelope,
        excluded: Option<&UserId>,
    ) -> Result<BroadcastReport> {
        let payload = encode(env)?;

        let targets: Vec<Arc<Connection>> = {
            let state = self.state().read().await;
            let members = state.membership.members(group);
            members
                .iter()
                .filter(|user| Some(*user) != excluded)
                .filter_map(|user| state.connections.get(user))
                .collect()
        };
        if targets.is_empty() {
            return Err(EngineError::NotFound(format!(
                "no active recipients in group {group}"
            )));
        }

        let deadline = self.config().write_timeout;
        let outcomes = join_all(targets.iter().map(|conn| {
            let frame = Frame::Text(payload.clone());
            async move { conn.send(frame, deadline).await }
        }))
        .await;

        let mut report = BroadcastReport::default();
        let mut failures = Vec::new();
        for (conn, outcome) in targets.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.delivered.push(conn.user.clone()),
                Err(e) => {
                    warn!(group = %group, user = %conn.user, kind = %env.kind, error = %e, "broadcast write failed");
                    report.failed.push(conn.user.clone());
                    failures.push((conn, e));
                }
            }
        }

        if !failures.is_empty() {
            self.evict(group, &failures).await;
        }
        debug!(
            group = %group,
            kind = %env.kind,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "broadcast complete"
        );
        Ok(report)
    }

    /// Unsubscribe failed recipients from `group` in one pass and cancel
    /// their connections; any failed write, timeouts included, ends the
    /// connection.
    async fn evict(&self, group: GroupId, failures: &[(Arc<Connection>, TransportError)]) {
        let mut left: Vec<(UserId, bool)> = Vec::new();
        {
            let mut state = self.state().write().await;
            for (conn, _) in failures {
                if !state.connections.is_current(&conn.user, conn.serial) {
                    continue;
                }
                let was_typing = state.typing.stop(group, &conn.user);
                if state.membership.leave(group, &conn.user) {
                    left.push((conn.user.clone(), was_typing));
                }
            }
        }
        for (conn, e) in failures {
            debug!(user = %conn.user, serial = conn.serial, error = %e, "cancelling failed recipient");
            conn.cancel();
        }
        for (user, was_typing) in left {
            if was_typing {
                self.notify(group, Envelope::typing(group, &user, false), Some(user.clone()));
            }
            self.notify(
                group,
                Envelope::presence(EventKind::UserLeft, group, &user),
                Some(user),
            );
        }
    }
}

fn encode(env: &Envelope) -> Result<String> {
    env.to_json()
        .map_err(|e| EngineError::ValidationFailed(format!("unencodable envelope: {e}")))
}
