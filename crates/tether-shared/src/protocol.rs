//! Event and command shapes exchanged with the remote protocol client.
//!
//! Inbound events carry raw strings exactly as the client produced them; the
//! ingestion pipeline validates and normalizes them, so a malformed event can
//! be logged and skipped without touching the rest of its batch.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{ChatJid, ContentKind, MessageId, ReceiptStatus};

/// Everything the protocol client can emit on an established link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    /// A fresh pairing token (the previous one rotated out).
    PairingCode { token: String },
    Connected,
    Disconnected { reason: Option<String> },
    /// The primary device unlinked us; credentials are no longer valid.
    LoggedOut { reason: Option<String> },
    Message(MessageEvent),
    Receipt(ReceiptEvent),
    HistorySync(HistoryBatch),
    ChatMetadata(ChatMetadataEvent),
    Contact(ContactEvent),
}

/// A single message, live or replayed from history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub id: String,
    pub chat: String,
    pub sender: String,
    #[serde(default)]
    pub is_from_me: bool,
    /// Unix milliseconds as reported by the sender.
    pub timestamp: i64,
    #[serde(default)]
    pub push_name: Option<String>,
    pub content: MessageContent,
    #[serde(default)]
    pub status: Option<ReceiptStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Media {
        media_kind: ContentKind,
        #[serde(default)]
        caption: Option<String>,
        locator: MediaLocator,
    },
    System {
        body: String,
    },
    /// A message type the client could not decode.
    Unsupported {
        #[serde(default)]
        detail: Option<String>,
    },
}

/// Where and how to fetch a remote media object. The fields are opaque to
/// Tether except for `file_sha256` (base64 SHA-256 of the plaintext) and
/// `file_length`, which are used to verify downloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaLocator {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub direct_path: Option<String>,
    #[serde(default)]
    pub media_key: Option<String>,
    #[serde(default)]
    pub file_sha256: Option<String>,
    #[serde(default)]
    pub file_enc_sha256: Option<String>,
    #[serde(default)]
    pub file_length: Option<u64>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl MediaLocator {
    /// A locator without a url or direct path can never be fetched.
    pub fn is_fetchable(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.is_empty())
            || self.direct_path.as_deref().is_some_and(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptEvent {
    pub chat: String,
    pub message_ids: Vec<String>,
    pub status: ReceiptStatus,
    pub timestamp: i64,
}

/// One chunk of history backfill. `chunk_index` increases monotonically over
/// a backfill run and is what the per-chat sync cursor records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryBatch {
    pub chunk_index: u64,
    pub conversations: Vec<HistoryConversation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConversation {
    pub chat: String,
    #[serde(default)]
    pub name: Option<String>,
    pub messages: Vec<MessageEvent>,
}

/// Group subject / participant changes and display name updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMetadataEvent {
    pub chat: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub participants: Option<Vec<String>>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactEvent {
    pub jid: String,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    pub timestamp: i64,
}

/// Opaque credential material produced by pairing and replayed on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub jid: ChatJid,
    pub device_id: u32,
    pub secret: serde_json::Value,
}

/// An action forwarded to the remote side.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub chat: ChatJid,
    pub content: OutboundContent,
}

#[derive(Debug, Clone)]
pub enum OutboundContent {
    Text {
        body: String,
    },
    Media {
        kind: ContentKind,
        file_name: String,
        mime_type: String,
        data: Bytes,
    },
    /// Opus in an Ogg container, sent as a push-to-talk note.
    Voice {
        data: Bytes,
    },
}

impl OutboundContent {
    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Text { .. } => ContentKind::Text,
            Self::Media { kind, .. } => *kind,
            Self::Voice { .. } => ContentKind::Audio,
        }
    }
}

/// What the remote side returns for an accepted send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: MessageId,
    /// Server timestamp, unix milliseconds.
    pub timestamp: i64,
    /// Upload locator for media sends.
    pub media: Option<MediaLocator>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_event_from_json() {
        let raw = r#"{
            "type": "message",
            "id": "ABC",
            "chat": "31612345678@s.whatsapp.net",
            "sender": "31612345678@s.whatsapp.net",
            "timestamp": 1700000000000,
            "content": { "kind": "text", "body": "hi" }
        }"#;
        let event: ProtocolEvent = serde_json::from_str(raw).unwrap();
        match event {
            ProtocolEvent::Message(m) => {
                assert_eq!(m.id, "ABC");
                assert!(!m.is_from_me);
                assert!(m.status.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn locator_without_path_is_not_fetchable() {
        assert!(!MediaLocator::default().is_fetchable());
        let loc = MediaLocator {
            direct_path: Some("/v/t62/abc".into()),
            ..Default::default()
        };
        assert!(loc.is_fetchable());
    }
}
