//! v001 -- Initial schema creation.
//!
//! Creates `groups`, `group_members`, `messages` and the two receipt tables
//! `message_deliveries` and `message_reads`.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS groups (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    name         TEXT NOT NULL,
    description  TEXT NOT NULL DEFAULT '',
    group_type   TEXT NOT NULL,               -- direct | group | channel
    created_by   TEXT NOT NULL,
    created_at   TEXT NOT NULL,               -- RFC-3339, nanosecond precision
    updated_at   TEXT NOT NULL,
    is_active    INTEGER NOT NULL DEFAULT 1,
    settings     TEXT,                        -- JSON GroupSettings
    last_message TEXT,                        -- JSON LastMessage
    case_id      TEXT
);

CREATE INDEX IF NOT EXISTS idx_groups_updated ON groups(updated_at DESC);

-- ----------------------------------------------------------------
-- Members
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS group_members (
    group_id    TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    role        TEXT NOT NULL,                -- admin | member
    joined_at   TEXT NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1,
    permissions TEXT NOT NULL DEFAULT '[]',   -- JSON array
    position    INTEGER NOT NULL,

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id, is_active);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,  -- persistence order
    id           TEXT NOT NULL UNIQUE,               -- UUID v4
    group_id     TEXT NOT NULL,
    sender       TEXT NOT NULL,
    sender_name  TEXT NOT NULL,
    content      TEXT NOT NULL DEFAULT '',
    message_type TEXT NOT NULL,
    is_encrypted INTEGER NOT NULL DEFAULT 0,
    envelope     TEXT,                               -- JSON CryptoEnvelope
    attachments  TEXT NOT NULL DEFAULT '[]',         -- JSON array
    reply_to     TEXT,
    mentions     TEXT NOT NULL DEFAULT '[]',         -- JSON array
    sent_at      TEXT NOT NULL,
    delivered_at TEXT,                               -- first delivery
    edited_at    TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    is_deleted   INTEGER NOT NULL DEFAULT 0,

    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_group_seq ON messages(group_id, seq DESC);

-- ----------------------------------------------------------------
-- Receipts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_deliveries (
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    at         TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS message_reads (
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    at         TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_message_reads_user ON message_reads(user_id);
CREATE INDEX IF NOT EXISTS idx_message_deliveries_user ON message_deliveries(user_id);
"#;

/// Apply the initial schema.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
