use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{GROUP_SERVER, MAX_PHONE_DIGITS, MIN_PHONE_DIGITS, USER_SERVER};
use crate::error::ParseError;

// Chat / user identifier in `user@server` form
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct ChatJid(String);

impl ChatJid {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        match s.split_once('@') {
            Some((user, server))
                if !user.is_empty()
                    && !server.is_empty()
                    && !server.contains('@')
                    && !s.contains(char::is_whitespace) =>
            {
                Ok(Self(s.to_string()))
            }
            _ => Err(ParseError::InvalidJid(s.to_string())),
        }
    }

    /// Build a direct-chat JID from a phone number with country code.
    /// A leading `+` is tolerated, any other non-digit is not.
    pub fn from_phone(phone: &str) -> Result<Self, ParseError> {
        let digits = phone.trim().trim_start_matches('+');
        let valid = (MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len())
            && digits.bytes().all(|b| b.is_ascii_digit());
        if !valid {
            return Err(ParseError::InvalidPhone(phone.to_string()));
        }
        Ok(Self(format!("{digits}@{USER_SERVER}")))
    }

    /// Accept either a full JID or a bare phone number.
    pub fn parse_recipient(recipient: &str) -> Result<Self, ParseError> {
        if recipient.contains('@') {
            Self::parse(recipient)
        } else {
            Self::from_phone(recipient)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// User part without the device suffix (`1234:5@server` -> `1234`).
    pub fn user(&self) -> &str {
        let user = self.0.split('@').next().unwrap_or_default();
        user.split(':').next().unwrap_or(user)
    }

    pub fn server(&self) -> &str {
        self.0.rsplit('@').next().unwrap_or_default()
    }

    /// The same account with any device suffix removed.
    pub fn to_non_device(&self) -> Self {
        Self(format!("{}@{}", self.user(), self.server()))
    }

    pub fn is_group(&self) -> bool {
        self.server() == GROUP_SERVER
    }

    pub fn kind(&self) -> ChatKind {
        if self.is_group() {
            ChatKind::Group
        } else {
            ChatKind::Direct
        }
    }
}

impl fmt::Display for ChatJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChatJid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ChatJid {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ChatJid> for String {
    fn from(jid: ChatJid) -> Self {
        jid.0
    }
}

// Message identifier, unique within one chat
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Result<Self, ParseError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ParseError::EmptyMessageId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MessageId {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

impl FromStr for ChatKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            other => Err(ParseError::UnknownChatKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
    Video,
    Document,
    Audio,
    System,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::System => "system",
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(self, Self::Image | Self::Video | Self::Document | Self::Audio)
    }

    /// Guess the media kind of a file from its extension. Unknown extensions
    /// are sent as documents.
    pub fn infer_from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" => Self::Image,
            "mp4" | "avi" | "mov" | "mkv" | "3gp" => Self::Video,
            "ogg" | "opus" | "mp3" | "m4a" | "aac" | "wav" => Self::Audio,
            _ => Self::Document,
        }
    }
}

impl FromStr for ContentKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "document" => Ok(Self::Document),
            "audio" => Ok(Self::Audio),
            "system" => Ok(Self::System),
            other => Err(ParseError::UnknownContentKind(other.to_string())),
        }
    }
}

/// Delivery progress of a message. Variants are declared in rank order and a
/// stored status only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Played,
}

impl ReceiptStatus {
    pub fn rank(&self) -> i64 {
        *self as i64
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Self::Pending),
            1 => Some(Self::Sent),
            2 => Some(Self::Delivered),
            3 => Some(Self::Read),
            4 => Some(Self::Played),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Played => "played",
        }
    }
}

impl FromStr for ReceiptStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "played" => Ok(Self::Played),
            other => Err(ParseError::UnknownReceiptStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_number_becomes_direct_jid() {
        let jid = ChatJid::parse_recipient("+31612345678").unwrap();
        assert_eq!(jid.as_str(), "31612345678@s.whatsapp.net");
        assert_eq!(jid.kind(), ChatKind::Direct);
    }

    #[test]
    fn group_jid_is_group() {
        let jid = ChatJid::parse_recipient("120363040000000000@g.us").unwrap();
        assert!(jid.is_group());
    }

    #[test]
    fn rejects_garbage_recipients() {
        assert!(ChatJid::parse_recipient("").is_err());
        assert!(ChatJid::parse_recipient("12ab34").is_err());
        assert!(ChatJid::parse_recipient("@g.us").is_err());
        assert!(ChatJid::parse_recipient("a@b@c").is_err());
    }

    #[test]
    fn device_suffix_is_stripped() {
        let jid = ChatJid::parse("31612345678:12@s.whatsapp.net").unwrap();
        assert_eq!(jid.user(), "31612345678");
        assert_eq!(jid.to_non_device().as_str(), "31612345678@s.whatsapp.net");
    }

    #[test]
    fn receipt_status_only_ranks_forward() {
        assert!(ReceiptStatus::Read > ReceiptStatus::Delivered);
        assert_eq!(ReceiptStatus::from_rank(ReceiptStatus::Played.rank()), Some(ReceiptStatus::Played));
        assert_eq!(ReceiptStatus::from_rank(9), None);
    }

    #[test]
    fn infers_kind_from_extension() {
        assert_eq!(ContentKind::infer_from_path(Path::new("/tmp/a.JPG")), ContentKind::Image);
        assert_eq!(ContentKind::infer_from_path(Path::new("clip.mov")), ContentKind::Video);
        assert_eq!(ContentKind::infer_from_path(Path::new("notes.pdf")), ContentKind::Document);
        assert_eq!(ContentKind::infer_from_path(Path::new("noext")), ContentKind::Document);
    }
}
