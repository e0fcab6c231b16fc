//! Per-connection tasks: the read loop, the keepalive loop and inbound
//! frame dispatch.

use std::sync::Arc;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use courier_shared::protocol::EventKind;
use courier_shared::{ClientFrame, Envelope, UserId};

use crate::budget::FrameBudget;
use crate::error::{EngineError, Result};
use crate::hub::ChatHub;
use crate::registry::Connection;
use crate::transport::{Frame, FrameStream};

impl ChatHub {
    /// Read frames until the peer leaves, the idle deadline passes or the
    /// connection is cancelled, then tear the connection down. This is the
    /// only place a connection's teardown and close frame originate from.
    pub(crate) async fn read_loop(&self, conn: Arc<Connection>, mut stream: Box<dyn FrameStream>) {
        let idle = self.config().read_idle_timeout;
        let write_timeout = self.config().write_timeout;
        let mut budget = FrameBudget::new(self.config().frame_rate, self.config().frame_burst);

        loop {
            let next = tokio::select! {
                _ = conn.token().cancelled() => break,
                next = tokio::time::timeout(idle, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    info!(user = %conn.user, serial = conn.serial, "read deadline expired");
                    break;
                }
                Ok(None) | Ok(Some(Ok(Frame::Close))) => {
                    debug!(user = %conn.user, serial = conn.serial, "peer closed connection");
                    break;
                }
                Ok(Some(Err(e))) => {
                    debug!(user = %conn.user, serial = conn.serial, error = %e, "read failed");
                    break;
                }
                Ok(Some(Ok(Frame::Ping))) => {
                    if let Err(e) = conn.send(Frame::Pong, write_timeout).await {
                        debug!(user = %conn.user, error = %e, "pong not sent");
                    }
                }
                Ok(Some(Ok(Frame::Pong))) => {}
                Ok(Some(Ok(Frame::Text(text)))) => {
                    if !budget.try_consume() {
                        warn!(user = %conn.user, "frame budget exceeded, dropping frame");
                        continue;
                    }
                    self.dispatch(&conn, &text).await;
                }
            }
        }

        conn.cancel();
        self.teardown(&conn).await;
        conn.close(write_timeout).await;
    }

    /// Ping on a fixed interval. A failed ping cancels the connection.
    pub(crate) async fn keepalive_loop(&self, conn: Arc<Connection>) {
        let period = self.config().ping_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = conn.token().cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = conn.send(Frame::Ping, self.config().write_timeout).await {
                        info!(user = %conn.user, serial = conn.serial, error = %e, "keepalive failed");
                        conn.cancel();
                        break;
                    }
                }
            }
        }
    }

    /// Handle one inbound text frame. Rejected frames are answered with a
    /// best-effort `error` envelope; the connection stays open.
    async fn dispatch(&self, conn: &Connection, text: &str) {
        let result = match ClientFrame::parse(text) {
            Ok(frame) => self.handle_frame(conn, frame).await,
            Err(e) => Err(EngineError::from(e)),
        };

        if let Err(e) = result {
            warn!(user = %conn.user, error = %e, "client frame rejected");
            self.reply(conn, &Envelope::error(e.to_string())).await;
        }
    }

    async fn handle_frame(&self, conn: &Connection, frame: ClientFrame) -> Result<()> {
        let user: &UserId = &conn.user;
        match frame {
            ClientFrame::Typing { group_id } => self.set_typing(group_id, user, true).await,
            ClientFrame::StopTyping { group_id } => self.set_typing(group_id, user, false).await,
            ClientFrame::Delivered { message_ids } => {
                let changed = self.ack_delivered(user, &message_ids).await?;
                debug!(user = %user, acked = message_ids.len(), changed = changed.len(), "delivery ack");
                Ok(())
            }
            ClientFrame::Read {
                group_id,
                message_ids,
            } => {
                self.mark_read(group_id, &message_ids, user).await?;
                Ok(())
            }
            ClientFrame::Ping => {
                self.reply(conn, &Envelope::new(EventKind::Pong)).await;
                Ok(())
            }
            ClientFrame::Pong => Ok(()),
        }
    }

    async fn reply(&self, conn: &Connection, env: &Envelope) {
        let text = match env.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode reply");
                return;
            }
        };
        if let Err(e) = conn.send(Frame::Text(text), self.config().write_timeout).await {
            debug!(user = %conn.user, error = %e, "reply not sent");
        }
    }
}
