//! The connection hub: admits connections, owns the shared runtime state
//! and supervises every background task.
//!
//! Runtime state (connection table, membership index, typing indicators)
//! lives in one [`HubState`] behind a single lock. Each operation takes the
//! lock once, copies what it needs, and releases it before any frame is
//! written.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use courier_shared::protocol::EventKind;
use courier_shared::{Envelope, GroupId, UserId};
use courier_store::SharedStore;

use crate::config::HubConfig;
use crate::directory::IdentityDirectory;
use crate::error::{EngineError, Result};
use crate::membership::MembershipIndex;
use crate::registry::{Connection, ConnectionTable};
use crate::transport::{FrameSink, FrameStream, TransportError};
use crate::typing::TypingTracker;

/// Everything guarded by the hub's state lock.
#[derive(Debug, Default)]
pub(crate) struct HubState {
    pub(crate) connections: ConnectionTable,
    pub(crate) membership: MembershipIndex,
    pub(crate) typing: TypingTracker,
    /// Identities with a recovery run in flight, mapped to whether another
    /// pass was requested while it ran.
    pub(crate) recovering: HashMap<UserId, bool>,
}

struct HubInner {
    state: RwLock<HubState>,
    store: SharedStore,
    directory: Arc<dyn IdentityDirectory>,
    config: HubConfig,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    next_serial: AtomicU64,
}

/// Cheaply cloneable handle to the hub.
#[derive(Clone)]
pub struct ChatHub {
    inner: Arc<HubInner>,
}

impl ChatHub {
    /// Build a hub and start its typing sweep. Must be called inside a
    /// tokio runtime; call [`shutdown`](Self::shutdown) to stop it.
    pub fn new(
        store: SharedStore,
        directory: Arc<dyn IdentityDirectory>,
        config: HubConfig,
    ) -> Self {
        let hub = Self {
            inner: Arc::new(HubInner {
                state: RwLock::new(HubState::default()),
                store,
                directory,
                config,
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                next_serial: AtomicU64::new(1),
            }),
        };

        let sweeper = hub.clone();
        hub.inner.tasks.spawn(async move { sweeper.run_typing_sweep().await });
        hub
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub(crate) fn state(&self) -> &RwLock<HubState> {
        &self.inner.state
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Admit a connection for `user`, replacing any connection it already
    /// has. The user is subscribed to its durable groups before this
    /// returns; reconnect recovery then runs in the background.
    pub async fn admit<S, R>(&self, user: UserId, sink: S, stream: R) -> Result<()>
    where
        S: FrameSink + 'static,
        R: FrameStream + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::TransportFailed(TransportError::Closed));
        }
        self.check_identity(&user).await?;

        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(
            user.clone(),
            serial,
            Box::new(sink),
            self.inner.shutdown.child_token(),
        ));

        let replaced = self.inner.state.write().await.connections.insert(conn.clone());
        if let Some(old) = replaced {
            info!(user = %user, old_serial = old.serial, serial, "connection replaced");
            old.cancel();
        }

        self.subscribe_durable_groups(&conn).await;

        let reader = self.clone();
        let read_conn = conn.clone();
        let stream: Box<dyn FrameStream> = Box::new(stream);
        self.inner
            .tasks
            .spawn(async move { reader.read_loop(read_conn, stream).await });

        let pinger = self.clone();
        let ping_conn = conn.clone();
        self.inner
            .tasks
            .spawn(async move { pinger.keepalive_loop(ping_conn).await });

        let recoverer = self.clone();
        let recover_user = user.clone();
        self.inner.tasks.spawn(async move {
            recoverer.recover(&recover_user).await;
        });

        info!(user = %user, serial, "connection admitted");
        Ok(())
    }

    /// Fail with `NotFound` unless the directory knows `user`. Callers that
    /// must answer before a transport exists (an HTTP upgrade) use this
    /// directly; [`admit`](Self::admit) runs it again.
    pub async fn check_identity(&self, user: &UserId) -> Result<()> {
        if self.inner.directory.exists(user).await {
            Ok(())
        } else {
            warn!(user = %user, "rejecting connection for unknown identity");
            Err(EngineError::NotFound(format!("identity {user}")))
        }
    }

    async fn subscribe_durable_groups(&self, conn: &Arc<Connection>) {
        let groups = match self.inner.store.user_groups(&conn.user).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(user = %conn.user, error = %e, "could not load durable groups");
                return;
            }
        };

        let joined: Vec<GroupId> = {
            let mut state = self.inner.state.write().await;
            if !state.connections.is_current(&conn.user, conn.serial) {
                return;
            }
            groups
                .iter()
                .filter(|g| state.membership.join(g.id, &conn.user))
                .map(|g| g.id)
                .collect()
        };

        debug!(user = %conn.user, groups = joined.len(), "subscribed to durable groups");
        for group in joined {
            self.notify(
                group,
                Envelope::presence(EventKind::UserJoined, group, &conn.user),
                Some(conn.user.clone()),
            );
        }
    }

    /// Remove `user`'s connection and all of its runtime state. Returns
    /// `false` if the user was not connected.
    pub async fn disconnect(&self, user: &UserId) -> bool {
        let conn = self.inner.state.read().await.connections.get(user);
        match conn {
            Some(conn) => {
                conn.cancel();
                self.teardown(&conn).await;
                true
            }
            None => false,
        }
    }

    /// Drop `conn`'s registry entry and subscriptions, unless it has already
    /// been replaced or removed.
    pub(crate) async fn teardown(&self, conn: &Arc<Connection>) {
        let cleared = {
            let mut state = self.inner.state.write().await;
            if state
                .connections
                .remove_if(&conn.user, conn.serial)
                .is_some()
            {
                let groups = state.membership.leave_all(&conn.user);
                let typing = state.typing.clear_user(&conn.user);
                Some((groups, typing))
            } else {
                None
            }
        };

        let Some((groups, typing)) = cleared else {
            return;
        };
        info!(user = %conn.user, serial = conn.serial, groups = groups.len(), "connection removed");

        for group in typing {
            self.notify(group, Envelope::typing(group, &conn.user, false), None);
        }
        for group in groups {
            self.notify(
                group,
                Envelope::presence(EventKind::UserLeft, group, &conn.user),
                None,
            );
        }
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.inner.state.read().await.connections.contains(user)
    }

    pub async fn online_count(&self) -> usize {
        self.inner.state.read().await.connections.len()
    }

    // ------------------------------------------------------------------
    // Group membership
    // ------------------------------------------------------------------

    /// Snapshot of the connected identities subscribed to `group`, in join order.
    pub async fn active_members(&self, group: GroupId) -> Vec<UserId> {
        self.inner.state.read().await.membership.members(group)
    }

    /// Subscribe a connected user to a group it durably belongs to.
    pub async fn join_group(&self, group: GroupId, user: &UserId) -> Result<()> {
        let durable = self.inner.store.get_group(group).await?;
        if !durable.is_active_member(user) {
            return Err(EngineError::Forbidden(format!(
                "{user} is not a member of group {group}"
            )));
        }

        let joined = {
            let mut state = self.inner.state.write().await;
            if !state.connections.contains(user) {
                return Err(EngineError::NotFound(format!("no live connection for {user}")));
            }
            state.membership.join(group, user)
        };

        if joined {
            debug!(user = %user, group = %group, "joined group");
            self.notify(
                group,
                Envelope::presence(EventKind::UserJoined, group, user),
                Some(user.clone()),
            );
        }
        Ok(())
    }

    /// Unsubscribe `user` from `group`. Returns `false` if it was not subscribed.
    pub async fn leave_group(&self, group: GroupId, user: &UserId) -> bool {
        let (left, was_typing) = {
            let mut state = self.inner.state.write().await;
            let left = state.membership.leave(group, user);
            let was_typing = state.typing.stop(group, user);
            (left, was_typing)
        };

        if was_typing {
            self.notify(group, Envelope::typing(group, user, false), Some(user.clone()));
        }
        if left {
            debug!(user = %user, group = %group, "left group");
            self.notify(
                group,
                Envelope::presence(EventKind::UserLeft, group, user),
                Some(user.clone()),
            );
        }
        left
    }

    /// Forget a deleted group's runtime subscriptions and typing state.
    pub async fn drop_group(&self, group: GroupId) -> Vec<UserId> {
        let mut state = self.inner.state.write().await;
        state.typing.clear_group(group);
        state.membership.remove_group(group)
    }

    // ------------------------------------------------------------------
    // Typing
    // ------------------------------------------------------------------

    /// Start or stop `user`'s typing indicator in `group`. Other members are
    /// told only when the indicator appears or disappears.
    pub async fn set_typing(&self, group: GroupId, user: &UserId, is_typing: bool) -> Result<()> {
        let changed = {
            let mut state = self.inner.state.write().await;
            if !state.membership.contains(group, user) {
                return Err(EngineError::Forbidden(format!(
                    "{user} is not active in group {group}"
                )));
            }
            if is_typing {
                state.typing.start(group, user, Instant::now())
            } else {
                state.typing.stop(group, user)
            }
        };

        if changed {
            let env = Envelope::typing(group, user, is_typing);
            if let Err(e) = self.broadcast_except(group, &env, user).await {
                debug!(group = %group, user = %user, error = %e, "typing event not delivered");
            }
        }
        Ok(())
    }

    /// Expire stale typing indicators and tell each group once. Returns the
    /// number expired.
    pub async fn expire_typing(&self) -> usize {
        let expired = self
            .inner
            .state
            .write()
            .await
            .typing
            .expire(Instant::now(), self.inner.config.typing_stale);

        for (group, user) in &expired {
            debug!(group = %group, user = %user, "typing indicator expired");
            let env = Envelope::typing(*group, user, false);
            if let Err(e) = self.broadcast_except(*group, &env, user).await {
                debug!(group = %group, error = %e, "stop_typing not delivered");
            }
        }
        expired.len()
    }

    async fn run_typing_sweep(&self) {
        let mut ticker = tokio::time::interval(self.inner.config.typing_sweep);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.expire_typing().await;
                }
            }
        }
        debug!("typing sweep stopped");
    }

    // ------------------------------------------------------------------
    // Background work
    // ------------------------------------------------------------------

    /// Fire-and-forget group notification on the supervised task pool.
    pub(crate) fn notify(&self, group: GroupId, env: Envelope, excluded: Option<UserId>) {
        let hub = self.clone();
        self.inner.tasks.spawn(async move {
            let result = match &excluded {
                Some(user) => hub.broadcast_except(group, &env, user).await,
                None => hub.broadcast_to_group(group, &env).await,
            };
            if let Err(e) = result {
                debug!(group = %group, kind = %env.kind, error = %e, "notification not delivered");
            }
        });
    }

    /// Cancel every connection and background task and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("hub shutting down");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        *self.inner.state.write().await = HubState::default();
        info!("hub stopped");
    }
}
