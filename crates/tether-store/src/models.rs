//! Domain records persisted in the local database.
//!
//! Every read model derives `Serialize` so it can be handed straight to the
//! HTTP layer.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tether_shared::protocol::{Credentials, MediaLocator};
use tether_shared::{ChatJid, ChatKind, ContentKind, MessageId, ReceiptStatus};

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A direct or group conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub jid: ChatJid,
    /// Group subject, or the contact's name for direct chats.
    pub name: Option<String>,
    pub kind: ChatKind,
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<ChatJid>,
}

/// A chat together with its most recent message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatSummary {
    #[serde(flatten)]
    pub chat: Chat,
    pub last_message: Option<Message>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatSort {
    #[default]
    LastActive,
    Name,
}

#[derive(Debug, Clone)]
pub struct ChatFilter {
    /// Matched against chat name and JID.
    pub query: Option<String>,
    pub limit: u32,
    pub page: u32,
    pub include_last_message: bool,
    pub sort_by: ChatSort,
}

impl Default for ChatFilter {
    fn default() -> Self {
        Self {
            query: None,
            limit: 20,
            page: 0,
            include_last_message: true,
            sort_by: ChatSort::LastActive,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub chat_jid: ChatJid,
    pub chat_name: Option<String>,
    pub sender: ChatJid,
    pub is_from_me: bool,
    pub timestamp: DateTime<Utc>,
    pub kind: ContentKind,
    /// Text body or media caption.
    pub content: String,
    pub status: ReceiptStatus,
    /// Insertion sequence; breaks timestamp ties.
    pub seq: i64,
}

/// Canonical message record produced by ingestion (or by a local send).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub id: MessageId,
    pub chat_jid: ChatJid,
    pub sender: ChatJid,
    pub is_from_me: bool,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub kind: ContentKind,
    pub content: String,
    pub status: ReceiptStatus,
    pub media: Option<MediaLocator>,
}

/// What an idempotent message upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    StatusAdvanced,
    Unchanged,
}

/// What applying a receipt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Advanced,
    Unchanged,
    /// The message is not stored yet; the status waits for it.
    Parked,
}

#[derive(Debug, Clone)]
pub struct MessageFilter {
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    /// Phone number or JID of the sender.
    pub sender: Option<String>,
    pub chat_jid: Option<ChatJid>,
    /// Case-insensitive substring of the body.
    pub query: Option<String>,
    pub kind: Option<ContentKind>,
    pub limit: u32,
    /// Page 0 holds the newest messages.
    pub page: u32,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            after: None,
            before: None,
            sender: None,
            chat_jid: None,
            query: None,
            kind: None,
            limit: 20,
            page: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageContext {
    pub message: Message,
    pub before: Vec<Message>,
    pub after: Vec<Message>,
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRef {
    pub chat_jid: ChatJid,
    pub message_id: MessageId,
    pub locator: MediaLocator,
    pub local_path: Option<PathBuf>,
    /// BLAKE3 hex of the cached blob.
    pub content_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Sync cursor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncCursor {
    /// Chat JID, or `*` for global progress.
    pub scope: String,
    pub position: u64,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub credentials: Credentials,
    pub linked_at: DateTime<Utc>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Contacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub jid: ChatJid,
    pub phone_number: String,
    pub name: Option<String>,
}
