//! v001 -- Initial schema creation.
//!
//! Creates the session, chat, message, media reference, sync cursor and
//! pending receipt tables. All timestamps are unix milliseconds.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Linked-device session (at most one row)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS session (
    id                INTEGER PRIMARY KEY CHECK (id = 1),
    jid               TEXT NOT NULL,
    device_id         INTEGER NOT NULL,
    credentials       TEXT NOT NULL,              -- JSON, opaque
    linked_at         INTEGER NOT NULL,
    last_connected_at INTEGER,
    invalidated       INTEGER NOT NULL DEFAULT 0  -- boolean 0/1
);

-- ----------------------------------------------------------------
-- Chats (never hard-deleted)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    jid                 TEXT PRIMARY KEY NOT NULL,
    name                TEXT,
    kind                TEXT NOT NULL,              -- 'direct' | 'group'
    last_message_time   INTEGER,
    participants        TEXT,                       -- JSON array of JIDs
    metadata_updated_at INTEGER NOT NULL DEFAULT 0  -- last-writer-wins clock
);

CREATE INDEX IF NOT EXISTS idx_chats_last_message
    ON chats(last_message_time DESC);

-- ----------------------------------------------------------------
-- Messages (body immutable once stored)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq               INTEGER PRIMARY KEY AUTOINCREMENT,  -- insertion order tie-break
    id                TEXT NOT NULL,
    chat_jid          TEXT NOT NULL,
    sender            TEXT NOT NULL,
    is_from_me        INTEGER NOT NULL DEFAULT 0,
    timestamp         INTEGER NOT NULL,
    kind              TEXT NOT NULL,
    content           TEXT NOT NULL DEFAULT '',
    status            INTEGER NOT NULL DEFAULT 0,         -- ReceiptStatus rank
    status_updated_at INTEGER,

    UNIQUE (chat_jid, id),
    FOREIGN KEY (chat_jid) REFERENCES chats(jid)
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_ts
    ON messages(chat_jid, timestamp, seq);

CREATE INDEX IF NOT EXISTS idx_messages_sender
    ON messages(sender);

CREATE INDEX IF NOT EXISTS idx_messages_id
    ON messages(id);

-- ----------------------------------------------------------------
-- Media references
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS media_refs (
    chat_jid        TEXT NOT NULL,
    message_id      TEXT NOT NULL,
    url             TEXT,
    direct_path     TEXT,
    media_key       TEXT,
    file_sha256     TEXT,
    file_enc_sha256 TEXT,
    file_length     INTEGER,
    mime_type       TEXT,
    file_name       TEXT,
    local_path      TEXT,      -- set once the blob is cached
    content_hash    TEXT,      -- BLAKE3 of the cached blob
    fetched_at      INTEGER,

    PRIMARY KEY (chat_jid, message_id),
    FOREIGN KEY (chat_jid, message_id) REFERENCES messages(chat_jid, id)
);

-- ----------------------------------------------------------------
-- Sync cursors ('*' is the global scope)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_cursors (
    scope          TEXT PRIMARY KEY NOT NULL,
    position       INTEGER NOT NULL,
    last_timestamp INTEGER,
    updated_at     INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Receipts that arrived before their message
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS pending_receipts (
    chat_jid   TEXT NOT NULL,
    message_id TEXT NOT NULL,
    status     INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,

    PRIMARY KEY (chat_jid, message_id)
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
