//! CRUD and receipt bookkeeping for [`Message`] records.
//!
//! Persistence order is the `seq` column; every cursor resolves to a `seq`
//! before paging.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use courier_shared::{GroupId, MessageId, UserId};

use crate::database::{decode_opt_ts, decode_ts, encode_ts, not_found, Database};
use crate::error::{Result, StoreError};
use crate::groups::ensure_active;
use crate::models::{DeliveryReceipt, Message, MessageKind, MessageStatus, ReadReceipt};

const MESSAGE_COLUMNS: &str = "m.id, m.group_id, m.sender, m.sender_name, m.content, \
     m.message_type, m.is_encrypted, m.envelope, m.attachments, m.reply_to, m.mentions, \
     m.sent_at, m.delivered_at, m.edited_at, m.created_at, m.updated_at, m.is_deleted";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a message into an active group. Receipts on the input are ignored.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        ensure_active(self.conn(), message.group_id)?;
        self.conn().execute(
            "INSERT INTO messages
                (id, group_id, sender, sender_name, content, message_type, is_encrypted,
                 envelope, attachments, reply_to, mentions, sent_at, delivered_at,
                 edited_at, created_at, updated_at, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, ?13, ?14, ?15, ?16)",
            params![
                message.id.to_string(),
                message.group_id.to_string(),
                message.sender_email.as_str(),
                message.sender_name,
                message.content,
                message.message_type.as_str(),
                message.is_encrypted,
                message.envelope.as_ref().map(serde_json::to_string).transpose()?,
                serde_json::to_string(&message.attachments)?,
                message.reply_to.map(|id| id.to_string()),
                serde_json::to_string(&message.mentions)?,
                encode_ts(&message.status.sent),
                message.status.edited.as_ref().map(encode_ts),
                encode_ts(&message.created_at),
                encode_ts(&message.updated_at),
                message.is_deleted,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a live message with its receipts.
    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        load_live(self.conn(), id)
    }

    /// Up to `limit` of the newest live messages older than `before`, oldest first.
    pub fn list_messages(
        &self,
        group_id: GroupId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let bound = cursor(self.conn(), before)?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m
             WHERE m.group_id = ?1 AND m.is_deleted = 0 AND m.seq < ?2
             ORDER BY m.seq DESC LIMIT ?3"
        );
        let mut page = query_messages(
            self.conn(),
            &sql,
            params![group_id.to_string(), bound, limit as i64],
        )?;
        page.reverse();
        Ok(page)
    }

    /// Case-insensitive substring search, newest first.
    pub fn search_messages(
        &self,
        group_id: GroupId,
        query: &str,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m
             WHERE m.group_id = ?1 AND m.is_deleted = 0
               AND instr(lower(m.content), lower(?2)) > 0
             ORDER BY m.seq DESC LIMIT ?3 OFFSET ?4"
        );
        query_messages(
            self.conn(),
            &sql,
            params![group_id.to_string(), query, limit as i64, skip as i64],
        )
    }

    /// Live messages in `group_id` not sent by and not yet read by `user`.
    pub fn unread_count(&self, group_id: GroupId, user: &UserId) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.group_id = ?1 AND m.is_deleted = 0 AND m.sender <> ?2
               AND NOT EXISTS (
                   SELECT 1 FROM message_reads r
                   WHERE r.message_id = m.id AND r.user_id = ?2)",
            params![group_id.to_string(), user.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Messages awaiting delivery to `user` across the groups they actively
    /// belong to. Newest `limit` older than `before`, oldest first.
    pub fn undelivered_messages(
        &self,
        user: &UserId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let bound = cursor(self.conn(), before)?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m
             JOIN groups g ON g.id = m.group_id
             JOIN group_members gm ON gm.group_id = m.group_id AND gm.user_id = ?1
             WHERE g.is_active = 1 AND gm.is_active = 1
               AND m.is_deleted = 0 AND m.sender <> ?1 AND m.seq < ?2
               AND NOT EXISTS (
                   SELECT 1 FROM message_deliveries d
                   WHERE d.message_id = m.id AND d.user_id = ?1)
             ORDER BY m.seq DESC LIMIT ?3"
        );
        let mut page = query_messages(
            self.conn(),
            &sql,
            params![user.as_str(), bound, limit as i64],
        )?;
        page.reverse();
        Ok(page)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Overwrite the editable fields and stamp `edited_at`.
    pub fn update_message(&self, message: &Message) -> Result<Message> {
        let now = encode_ts(&Utc::now());
        let affected = self.conn().execute(
            "UPDATE messages
             SET content = ?2, message_type = ?3, is_encrypted = ?4, envelope = ?5,
                 attachments = ?6, mentions = ?7, edited_at = ?8, updated_at = ?8
             WHERE id = ?1 AND is_deleted = 0",
            params![
                message.id.to_string(),
                message.content,
                message.message_type.as_str(),
                message.is_encrypted,
                message.envelope.as_ref().map(serde_json::to_string).transpose()?,
                serde_json::to_string(&message.attachments)?,
                serde_json::to_string(&message.mentions)?,
                now,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        load_live(self.conn(), message.id)
    }

    pub fn soft_delete_message(&self, id: MessageId) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages SET is_deleted = 1, updated_at = ?2
             WHERE id = ?1 AND is_deleted = 0",
            params![id.to_string(), encode_ts(&Utc::now())],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Record delivery of `ids` to `user`. Returns the ids that changed.
    pub fn mark_delivered(
        &mut self,
        group_id: GroupId,
        ids: &[MessageId],
        user: &UserId,
    ) -> Result<Vec<MessageId>> {
        self.apply_receipts(group_id, ids, user, |msg, at| msg.apply_delivery(user, at))
    }

    /// Record a read of `ids` by `user`, backfilling delivery. Returns the
    /// ids that changed.
    pub fn mark_read(
        &mut self,
        group_id: GroupId,
        ids: &[MessageId],
        user: &UserId,
    ) -> Result<Vec<MessageId>> {
        self.apply_receipts(group_id, ids, user, |msg, at| msg.apply_read(user, at))
    }

    fn apply_receipts<F>(
        &mut self,
        group_id: GroupId,
        ids: &[MessageId],
        user: &UserId,
        mut apply: F,
    ) -> Result<Vec<MessageId>>
    where
        F: FnMut(&mut Message, DateTime<Utc>) -> bool,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let tx = self.conn_mut().transaction()?;
        let mut changed = Vec::new();

        for id in ids {
            let mut msg = match load_live(&tx, *id) {
                Ok(msg) if msg.group_id == group_id => msg,
                Ok(_) | Err(StoreError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            if !apply(&mut msg, now) {
                continue;
            }
            write_receipts(&tx, &msg, user)?;
            changed.push(*id);
        }

        tx.commit()?;
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve a before-cursor to an exclusive `seq` bound. The cursor message
/// may itself be deleted; an unknown id is an error.
fn cursor(conn: &Connection, before: Option<MessageId>) -> Result<i64> {
    match before {
        None => Ok(i64::MAX),
        Some(id) => conn
            .query_row(
                "SELECT seq FROM messages WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(not_found),
    }
}

fn write_receipts(conn: &Connection, msg: &Message, user: &UserId) -> Result<()> {
    let id = msg.id.to_string();
    if let Some(receipt) = msg
        .status
        .delivered_to
        .iter()
        .find(|r| &r.user_email == user)
    {
        conn.execute(
            "INSERT OR IGNORE INTO message_deliveries (message_id, user_id, at)
             VALUES (?1, ?2, ?3)",
            params![id, user.as_str(), encode_ts(&receipt.delivered_at)],
        )?;
    }
    if let Some(receipt) = msg.status.read_by.iter().find(|r| &r.user_email == user) {
        conn.execute(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id, at)
             VALUES (?1, ?2, ?3)",
            params![id, user.as_str(), encode_ts(&receipt.read_at)],
        )?;
    }
    conn.execute(
        "UPDATE messages SET delivered_at = COALESCE(delivered_at, ?2), updated_at = ?3
         WHERE id = ?1",
        params![
            id,
            msg.status.delivered.as_ref().map(encode_ts),
            encode_ts(&Utc::now()),
        ],
    )?;
    Ok(())
}

fn load_live(conn: &Connection, id: MessageId) -> Result<Message> {
    let sql =
        format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1 AND m.is_deleted = 0");
    query_messages(conn, &sql, params![id.to_string()])?
        .pop()
        .ok_or(StoreError::NotFound)
}

struct MessageRow {
    id: String,
    group_id: String,
    sender: String,
    sender_name: String,
    content: String,
    message_type: String,
    is_encrypted: bool,
    envelope: Option<String>,
    attachments: String,
    reply_to: Option<String>,
    mentions: String,
    sent_at: String,
    delivered_at: Option<String>,
    edited_at: Option<String>,
    created_at: String,
    updated_at: String,
    is_deleted: bool,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        group_id: row.get(1)?,
        sender: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        message_type: row.get(5)?,
        is_encrypted: row.get(6)?,
        envelope: row.get(7)?,
        attachments: row.get(8)?,
        reply_to: row.get(9)?,
        mentions: row.get(10)?,
        sent_at: row.get(11)?,
        delivered_at: row.get(12)?,
        edited_at: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
        is_deleted: row.get(16)?,
    })
}

fn query_messages(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, read_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(|row| hydrate(conn, row)).collect()
}

fn hydrate(conn: &Connection, row: MessageRow) -> Result<Message> {
    let mut status = MessageStatus::new(decode_ts(&row.sent_at)?);
    status.delivered = decode_opt_ts(row.delivered_at)?;
    status.edited = decode_opt_ts(row.edited_at)?;
    status.delivered_to = load_receipts(conn, "message_deliveries", &row.id)?
        .into_iter()
        .map(|(user_email, delivered_at)| DeliveryReceipt {
            user_email,
            delivered_at,
        })
        .collect();
    status.read_by = load_receipts(conn, "message_reads", &row.id)?
        .into_iter()
        .map(|(user_email, read_at)| ReadReceipt { user_email, read_at })
        .collect();

    Ok(Message {
        id: MessageId::parse(&row.id)?,
        group_id: GroupId::parse(&row.group_id)?,
        sender_email: UserId::new(row.sender),
        sender_name: row.sender_name,
        content: row.content,
        message_type: MessageKind::from_str_lossy(&row.message_type),
        is_encrypted: row.is_encrypted,
        envelope: row
            .envelope
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        attachments: serde_json::from_str(&row.attachments)?,
        reply_to: row.reply_to.as_deref().map(MessageId::parse).transpose()?,
        mentions: serde_json::from_str(&row.mentions)?,
        status,
        created_at: decode_ts(&row.created_at)?,
        updated_at: decode_ts(&row.updated_at)?,
        is_deleted: row.is_deleted,
    })
}

/// `table` is one of the two receipt tables, never user input.
fn load_receipts(
    conn: &Connection,
    table: &str,
    message_id: &str,
) -> Result<Vec<(UserId, DateTime<Utc>)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT user_id, at FROM {table} WHERE message_id = ?1 ORDER BY at ASC, user_id ASC"
    ))?;
    let rows = stmt
        .query_map(params![message_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|(user, at)| Ok((UserId::new(user), decode_ts(&at)?)))
        .collect()
}
