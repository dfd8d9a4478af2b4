use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::InvalidHandle;

fn handle_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-a-z0-9_]+$").expect("handle regex is valid"))
}

/// The default poll interval, carried over from one snapshot to the next
/// when no prior value is known.
pub const DEFAULT_INTERVAL_SECS: u64 = 1800;

/// Validate a feed handle against `^[-a-z0-9_]+$`.
pub fn validate_handle(handle: &str) -> Result<(), InvalidHandle> {
    if handle_regex().is_match(handle) {
        Ok(())
    } else {
        Err(InvalidHandle(handle.to_string()))
    }
}

/// A person reference (author/contributor), as carried by Atom/RSS entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Person {
    pub name: Option<String>,
    pub uri: Option<String>,
    pub email: Option<String>,
}

/// MIME-typed text content (title, summary, content).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContent {
    pub value: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub language: Option<String>,
    pub base: Option<String>,
}

impl TextContent {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            mime_type: "text/plain".to_string(),
            language: None,
            base: None,
        }
    }
}

/// A link associated with an entry or a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    pub rel: Option<String>,
    #[serde(rename = "type")]
    pub mime_type: Option<String>,
    pub hreflang: Option<String>,
    pub title: Option<String>,
    pub length: Option<String>,
}

/// A category/tag attached to an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub term: Option<String>,
    pub scheme: Option<String>,
    pub label: Option<String>,
}

/// One item inside a feed, as emitted by the feed parser.
///
/// Equality is value-equality over this whole structure; `mimir-aggregator`
/// compares entries by round-tripping through their canonical JSON form
/// (see [`Entry::canonical_json`]) rather than relying on field-by-field
/// `PartialEq` directly, so that two `Entry` values constructed from the
/// same wire bytes at different times always compare equal even if one of
/// them accumulated additional `#[serde(skip_serializing_if)]`-absent
/// fields along the way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub title: Option<TextContent>,
    pub link: Option<String>,
    pub links: Vec<Link>,
    pub summary: Option<TextContent>,
    pub content: Vec<TextContent>,
    pub author: Option<Person>,
    pub contributors: Vec<Person>,
    pub categories: Vec<Category>,
    pub updated: Option<DateTime<Utc>>,
    pub published: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    /// Origin URL when a feedburner-style `origLink` element is present;
    /// this takes priority over `link` when building outbound Atom (see
    /// `mimir-aggregator`'s writer and `mimir-monitor`'s notifier).
    pub feedburner_origlink: Option<String>,
}

impl Entry {
    /// Canonical JSON form used for entry-equality comparisons.
    pub fn canonical_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    /// `true` if this entry's canonical JSON matches `other`'s.
    pub fn canonical_eq(&self, other: &Entry) -> bool {
        match (self.canonical_json(), other.canonical_json()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// The link to prefer when publishing or notifying: the feedburner
    /// original link if present, else the plain `link`.
    pub fn effective_link(&self) -> Option<&str> {
        self.feedburner_origlink
            .as_deref()
            .or(self.link.as_deref())
    }
}

/// Parser-level attributes of the feed itself (title, etc.), kept separate
/// from the per-handle bookkeeping in [`Feed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FeedMeta {
    pub title: Option<String>,
    pub subtitle: Option<TextContent>,
    pub links: Vec<Link>,
}

/// The outcome of a single `GetFeed` call: either a freshly parsed feed, or
/// a signal that the server said nothing changed.
#[derive(Debug)]
pub enum FetchOutcome {
    Fresh(FeedResult),
    NotModified,
}

/// Case-insensitive HTTP header map, keyed by lower-cased header name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HeaderMap(pub HashMap<String, String>);

impl HeaderMap {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }
}

/// The parsed result of one feed fetch: the source-independent projection
/// of whatever the "Universal Feed Parser" contract returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedResult {
    /// Original redirected-from status, surfaced as e.g. `"301"` so
    /// permanent relocations can update the stored URL. `None` for a plain
    /// `200`.
    pub status: Option<String>,
    /// Post-redirect URL.
    pub url: String,
    pub headers: HeaderMap,
    pub feed: FeedMeta,
    pub entries: Vec<Entry>,
    pub bozo: bool,
    pub bozo_exception: Option<String>,
}

/// The durable record of one configured feed: the feeds-list entry plus
/// its last-persisted snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub handle: String,
    pub url: String,
    pub etag: Option<String>,
    /// `Last-Modified` (or failing that, `updated`) of the last successful
    /// fetch, used to build the next poll's conditional headers.
    pub last_modified: Option<DateTime<Utc>>,
    pub interval_secs: u64,
    /// The last-seen parsed feed result, if any.
    pub result: Option<FeedResult>,
    /// `id -> position in result.entries`, maintained as a bijection onto
    /// `0..entries.len()` whenever `result` is `Some` and non-empty.
    pub indexes: HashMap<String, usize>,
}

impl Feed {
    /// The minimal feed record returned by `SetFeedURL`/a fresh handle with
    /// no snapshot yet: `{handle, href: url}` in source terms.
    pub fn minimal(handle: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            url: url.into(),
            etag: None,
            last_modified: None,
            interval_secs: DEFAULT_INTERVAL_SECS,
            result: None,
            indexes: HashMap::new(),
        }
    }

    /// Pub-sub node name this feed's items are published to / subscribed
    /// from: `mimir/news/<handle>`.
    pub fn node_name(&self) -> String {
        format!("mimir/news/{}", self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_lowercase_alnum_dash_underscore() {
        assert!(validate_handle("my-feed_1").is_ok());
    }

    #[test]
    fn rejects_uppercase_and_punctuation() {
        assert!(validate_handle("My Feed!").is_err());
        assert!(validate_handle("").is_err());
    }

    #[test]
    fn node_name_is_namespaced_by_handle() {
        let feed = Feed::minimal("planet", "http://example.org/feed");
        assert_eq!(feed.node_name(), "mimir/news/planet");
    }

    #[test]
    fn canonical_eq_ignores_construction_order() {
        let a = Entry {
            id: "a".into(),
            title: Some(TextContent::plain("Title")),
            link: Some("http://example.org/a".into()),
            links: vec![],
            summary: None,
            content: vec![],
            author: None,
            contributors: vec![],
            categories: vec![],
            updated: None,
            published: None,
            created: None,
            feedburner_origlink: None,
        };
        let b = a.clone();
        assert!(a.canonical_eq(&b));
    }

    #[test]
    fn effective_link_prefers_feedburner_origlink() {
        let mut entry = Entry {
            id: "a".into(),
            title: None,
            link: Some("http://feeds.example.org/a".into()),
            links: vec![],
            summary: None,
            content: vec![],
            author: None,
            contributors: vec![],
            categories: vec![],
            updated: None,
            published: None,
            created: None,
            feedburner_origlink: None,
        };
        assert_eq!(entry.effective_link(), Some("http://feeds.example.org/a"));
        entry.feedburner_origlink = Some("http://example.org/a".into());
        assert_eq!(entry.effective_link(), Some("http://example.org/a"));
    }
}
