//! Identifiers, protocol event shapes and constants shared by every Tether
//! crate.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ParseError, TransportError};
pub use types::{ChatJid, ChatKind, ContentKind, MessageId, ReceiptStatus};
