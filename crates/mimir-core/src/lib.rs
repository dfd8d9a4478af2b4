//! Shared types for Mimir's aggregator and monitor daemons: the feed/entry
//! data model, handle validation, and the error kinds that don't belong to
//! a single downstream crate.

pub mod error;
pub mod feed;

pub use error::{CoreError, InvalidHandle, Result};
pub use feed::{
    validate_handle, Category, Entry, Feed, FeedMeta, FeedResult, FetchOutcome, HeaderMap, Link,
    Person, TextContent, DEFAULT_INTERVAL_SECS,
};
