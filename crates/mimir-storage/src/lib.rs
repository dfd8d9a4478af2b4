//! Durable state: the file-backed feed list/snapshots, and the relational
//! presence and news stores shared by a single `sqlx::SqlitePool`.

pub mod error;
pub mod feed_storage;
pub mod news;
pub mod presence;

pub use error::{Result, StorageError};
pub use feed_storage::{apply_fetch_result, minimal_feed, FeedStorage};
pub use news::{DigestGroup, InsertedNewsItem, NewsItemInput, NewsStore, NotifySubscriber};
pub use presence::{IncomingPresence, PresenceChange, PresenceStore};
