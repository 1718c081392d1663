/// Application name
pub const APP_NAME: &str = "Tether";

/// JID server for individual accounts
pub const USER_SERVER: &str = "s.whatsapp.net";

/// JID server for group conversations
pub const GROUP_SERVER: &str = "g.us";

/// SQLite file name inside the store directory
pub const DB_FILE_NAME: &str = "messages.db";

/// Media cache directory inside the store directory
pub const MEDIA_DIR_NAME: &str = "media";

/// Sync cursor scope used for progress that is not tied to a single chat
pub const GLOBAL_CURSOR_SCOPE: &str = "*";

/// How long a pairing token stays valid before the attempt is abandoned
pub const DEFAULT_PAIRING_TIMEOUT_SECS: u64 = 120;

/// Reconnect backoff defaults
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 60_000;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Capacity of each per-chat ingestion queue
pub const DEFAULT_INGEST_QUEUE: usize = 64;

/// Attempts made to commit one ingestion work item before giving up
pub const DEFAULT_STORAGE_RETRIES: u32 = 3;

/// Seconds a chat's ingestion worker may sit idle before it is stopped
pub const DEFAULT_INGEST_IDLE_SECS: u64 = 300;

/// Parked receipts older than this many days are pruned at startup
pub const PENDING_RECEIPT_TTL_DAYS: i64 = 7;

/// Largest media file accepted for sending or caching (64 MiB)
pub const DEFAULT_MAX_MEDIA_SIZE: usize = 64 * 1024 * 1024;

/// Default local HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8741;

/// Upper bound for any paged query
pub const MAX_PAGE_SIZE: u32 = 500;

/// Phone numbers outside this length range are not valid recipients
pub const MIN_PHONE_DIGITS: usize = 5;
pub const MAX_PHONE_DIGITS: usize = 20;
