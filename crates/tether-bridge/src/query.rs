//! Query Interface: read-only views over the store.
//!
//! Every call reads committed state only and may run concurrently with
//! ingestion and with other queries.

use serde::Serialize;

use tether_shared::constants::MAX_PAGE_SIZE;
use tether_shared::{ChatJid, MessageId};
use tether_store::{
    Chat, ChatFilter, ChatSort, ChatSummary, Contact, Database, Message, MessageContext,
    MessageFilter,
};

use crate::error::BridgeError;

/// A matching message, optionally with its neighbours in the chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageHit {
    #[serde(flatten)]
    pub message: Message,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub context_before: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub context_after: Vec<Message>,
}

/// How many neighbours to attach to each hit; `None` for bare hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindow {
    pub before: u32,
    pub after: u32,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self { before: 1, after: 1 }
    }
}

#[derive(Clone)]
pub struct QueryService {
    db: Database,
}

impl QueryService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Contacts whose name or phone number contains `query`.
    pub fn search_contacts(&self, query: &str) -> Result<Vec<Contact>, BridgeError> {
        if query.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("query must not be empty".into()));
        }
        Ok(self.db.search_contacts(query)?)
    }

    pub fn list_messages(
        &self,
        filter: &MessageFilter,
        context: Option<ContextWindow>,
    ) -> Result<Vec<MessageHit>, BridgeError> {
        let messages = self.db.list_messages(filter)?;
        let mut hits = Vec::with_capacity(messages.len());
        for message in messages {
            let (context_before, context_after) = match context {
                Some(window) => {
                    let ctx = self.db.message_context(
                        &message.chat_jid,
                        &message.id,
                        window.before,
                        window.after,
                    )?;
                    (ctx.before, ctx.after)
                }
                None => (Vec::new(), Vec::new()),
            };
            hits.push(MessageHit {
                message,
                context_before,
                context_after,
            });
        }
        Ok(hits)
    }

    /// Messages whose text contains `keyword`, newest page first.
    pub fn search_messages(&self, keyword: &str, limit: u32, page: u32) -> Result<Vec<Message>, BridgeError> {
        if keyword.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("keyword must not be empty".into()));
        }
        Ok(self.db.list_messages(&MessageFilter {
            query: Some(keyword.to_string()),
            limit,
            page,
            ..Default::default()
        })?)
    }

    pub fn list_chats(&self, filter: &ChatFilter) -> Result<Vec<ChatSummary>, BridgeError> {
        Ok(self.db.list_chats(filter)?)
    }

    /// The most recent message of each chat, most recently active chat first.
    pub fn recent_messages_per_chat(&self, limit: u32) -> Result<Vec<ChatSummary>, BridgeError> {
        let chats = self.db.list_chats(&ChatFilter {
            limit: limit.min(MAX_PAGE_SIZE),
            include_last_message: true,
            sort_by: ChatSort::LastActive,
            ..Default::default()
        })?;
        Ok(chats.into_iter().filter(|c| c.last_message.is_some()).collect())
    }

    pub fn get_chat(&self, chat_jid: &str, include_last_message: bool) -> Result<ChatSummary, BridgeError> {
        let jid = ChatJid::parse(chat_jid)?;
        Ok(self.db.get_chat(&jid, include_last_message)?)
    }

    pub fn get_direct_chat_by_contact(&self, phone: &str) -> Result<ChatSummary, BridgeError> {
        let digits = phone.trim().trim_start_matches('+');
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BridgeError::InvalidArgument(format!("invalid phone number {phone:?}")));
        }
        Ok(self.db.direct_chat_by_contact(digits)?)
    }

    /// Chats involving a contact: its direct chat and groups it wrote in.
    pub fn get_contact_chats(&self, jid: &str, limit: u32, page: u32) -> Result<Vec<Chat>, BridgeError> {
        let jid = ChatJid::parse_recipient(jid)?.to_non_device();
        Ok(self.db.contact_chats(&jid, limit, page)?)
    }

    pub fn get_last_interaction(&self, jid: &str) -> Result<Option<Message>, BridgeError> {
        let jid = ChatJid::parse_recipient(jid)?.to_non_device();
        Ok(self.db.last_interaction(&jid)?)
    }

    /// A message with up to `before` / `after` neighbours. Without a chat
    /// the newest message carrying that id is used.
    pub fn get_message_context(
        &self,
        message_id: &str,
        chat_jid: Option<&str>,
        before: u32,
        after: u32,
    ) -> Result<MessageContext, BridgeError> {
        let id = MessageId::new(message_id)?;
        let chat = chat_jid.map(ChatJid::parse).transpose()?;
        let message = self.db.find_message(&id, chat.as_ref())?;
        Ok(self
            .db
            .message_context(&message.chat_jid, &message.id, before, after)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_shared::{ContentKind, ReceiptStatus};
    use tether_store::{NewMessage, StoreError};

    const ALICE: &str = "31600000001@s.whatsapp.net";
    const BOB: &str = "31600000002@s.whatsapp.net";
    const GROUP: &str = "120363000000000001@g.us";

    fn seed() -> QueryService {
        let db = Database::in_memory().unwrap();
        let rows = [
            (ALICE, ALICE, "a1", 1_000, "lunch tomorrow?"),
            (ALICE, ALICE, "a2", 2_000, "or dinner"),
            (GROUP, BOB, "g1", 3_000, "Dinner is at 8"),
            (ALICE, ALICE, "a3", 4_000, "ok"),
            (BOB, BOB, "b1", 5_000, "hey"),
        ];
        db.write_batch(|b| {
            b.apply_chat_metadata(&ChatJid::parse(GROUP).unwrap(), Some("Family"), None, 1)?;
            b.upsert_contact(&ChatJid::parse(ALICE).unwrap(), None, Some("Alice Smith"), 1)?;
            for (chat, sender, id, ts, body) in rows {
                b.upsert_message(&NewMessage {
                    id: MessageId::new(id).unwrap(),
                    chat_jid: ChatJid::parse(chat).unwrap(),
                    sender: ChatJid::parse(sender).unwrap(),
                    is_from_me: false,
                    timestamp: ts,
                    kind: ContentKind::Text,
                    content: body.into(),
                    status: ReceiptStatus::Delivered,
                    media: None,
                })?;
            }
            Ok(())
        })
        .unwrap();
        QueryService::new(db)
    }

    fn ids(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.id.to_string()).collect()
    }

    #[test]
    fn hits_carry_context() {
        let query = seed();
        let hits = query
            .list_messages(
                &MessageFilter {
                    query: Some("dinner".into()),
                    ..Default::default()
                },
                Some(ContextWindow::default()),
            )
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].message.id.as_str(), "a2");
        assert_eq!(ids(&hits[0].context_before), ["a1"]);
        assert_eq!(ids(&hits[0].context_after), ["a3"]);
        // Context never crosses chats.
        assert_eq!(hits[1].message.id.as_str(), "g1");
        assert!(hits[1].context_before.is_empty());
        assert_eq!(hits[1].message.chat_name.as_deref(), Some("Family"));
    }

    #[test]
    fn search_and_recent_per_chat() {
        let query = seed();
        assert_eq!(ids(&query.search_messages("DINNER", 20, 0).unwrap()), ["a2", "g1"]);
        assert!(query.search_messages("  ", 20, 0).is_err());

        let recent = query.recent_messages_per_chat(10).unwrap();
        let last: Vec<_> = recent
            .iter()
            .map(|c| c.last_message.as_ref().unwrap().id.to_string())
            .collect();
        assert_eq!(last, ["b1", "a3", "g1"]);
    }

    #[test]
    fn contact_views() {
        let query = seed();

        let contacts = query.search_contacts("smith").unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].jid.as_str(), ALICE);

        let direct = query.get_direct_chat_by_contact("+31600000001").unwrap();
        assert_eq!(direct.chat.name.as_deref(), Some("Alice Smith"));
        assert_eq!(direct.last_message.unwrap().id.as_str(), "a3");
        assert!(matches!(
            query.get_direct_chat_by_contact("abc"),
            Err(BridgeError::InvalidArgument(_))
        ));

        let bob_chats = query.get_contact_chats("31600000002", 20, 0).unwrap();
        let jids: Vec<_> = bob_chats.iter().map(|c| c.jid.as_str()).collect();
        assert_eq!(jids, [BOB, GROUP]);

        let last = query.get_last_interaction(BOB).unwrap().unwrap();
        assert_eq!(last.id.as_str(), "b1");
    }

    #[test]
    fn message_context_by_id() {
        let query = seed();
        let ctx = query.get_message_context("a2", None, 5, 5).unwrap();
        assert_eq!(ids(&ctx.before), ["a1"]);
        assert_eq!(ids(&ctx.after), ["a3"]);

        let err = query.get_message_context("zzz", Some(ALICE), 1, 1).unwrap_err();
        assert!(matches!(err, BridgeError::Storage(StoreError::NotFound)));
        assert!(matches!(
            query.get_chat("not-a-jid", false),
            Err(BridgeError::InvalidArgument(_))
        ));
    }
}
