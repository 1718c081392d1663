//! # tether-store
//!
//! Durable SQLite store for the mirrored account: chats, messages, media
//! references, sync cursors, contacts and the linked-device session.
//!
//! Reads go through [`Database`] directly. Every write happens inside a
//! [`Batch`], which wraps one SQLite transaction, so a batch of ingested
//! events either commits as a whole or not at all.

pub mod chats;
pub mod contacts;
pub mod cursors;
pub mod database;
pub mod media;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod session;

mod error;
mod rows;

pub use database::{Batch, Database};
pub use error::{Result, StoreError};
pub use models::*;
