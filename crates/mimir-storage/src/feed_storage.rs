use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use mimir_core::{Feed, FeedResult, DEFAULT_INTERVAL_SECS};
use tracing::{debug, instrument};

use crate::error::Result;

/// Durable feed list (`feeds`) plus per-handle snapshot files
/// (`<handle>.feed.json`), cached in memory after first read.
///
/// Writes use atomic write-then-rename, matching rss-bot's
/// `save_state_atomic`: write to a `.tmp` sibling, then `fs::rename` over
/// the target so a crash mid-write never leaves a half-written file in
/// place.
pub struct FeedStorage {
    dir: PathBuf,
    feeds_path: PathBuf,
    cache: RwLock<HashMap<String, Feed>>,
}

impl FeedStorage {
    /// Open the feed list at `feeds_path`, loading any existing entries
    /// and their snapshots into the in-memory cache.
    #[instrument(skip_all, fields(path = %feeds_path.as_ref().display()))]
    pub fn open(feeds_path: impl AsRef<Path>) -> Result<Self> {
        let feeds_path = feeds_path.as_ref().to_path_buf();
        let dir = feeds_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut cache = HashMap::new();
        if let Ok(text) = std::fs::read_to_string(&feeds_path) {
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Some((handle, url)) = line.split_once(' ') else {
                    continue;
                };
                let handle = handle.to_string();
                let snapshot = load_snapshot(&dir, &handle)?;
                let feed = match snapshot {
                    Some(feed) => feed,
                    None => Feed::minimal(handle.clone(), url.to_string()),
                };
                cache.insert(handle, feed);
            }
        }

        Ok(Self {
            dir,
            feeds_path,
            cache: RwLock::new(cache),
        })
    }

    /// `GetFeedList` — the handle→Feed map as currently cached.
    pub fn feed_list(&self) -> HashMap<String, Feed> {
        self.cache.read().unwrap().clone()
    }

    /// `GetFeed` — the cached record for `handle`, if any.
    pub fn get_feed(&self, handle: &str) -> Option<Feed> {
        self.cache.read().unwrap().get(handle).cloned()
    }

    /// `SetFeedURL` — upsert the feeds-list entry and persist an empty
    /// snapshot, returning the minimal feed record.
    #[instrument(skip(self))]
    pub fn set_feed_url(&self, handle: &str, url: &str) -> Result<Feed> {
        let feed = Feed::minimal(handle, url);
        {
            let mut cache = self.cache.write().unwrap();
            cache.insert(handle.to_string(), feed.clone());
        }
        self.write_feeds_list()?;
        self.write_snapshot(&feed)?;
        Ok(feed)
    }

    /// `StoreFeed` — atomically replace the per-handle snapshot, rotating
    /// any previous snapshot to `<handle>.feed.json.1` first.
    #[instrument(skip(self, feed), fields(handle = %feed.handle))]
    pub fn store_feed(&self, feed: &Feed) -> Result<()> {
        {
            let mut cache = self.cache.write().unwrap();
            cache.insert(feed.handle.clone(), feed.clone());
        }
        self.write_snapshot(feed)
    }

    fn write_feeds_list(&self) -> Result<()> {
        let mut lines: Vec<String> = self
            .cache
            .read()
            .unwrap()
            .values()
            .map(|feed| format!("{} {}", feed.handle, feed.url))
            .collect();
        lines.sort();
        let mut text = lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        write_atomic(&self.feeds_path, text.as_bytes())
    }

    fn write_snapshot(&self, feed: &Feed) -> Result<()> {
        let path = snapshot_path(&self.dir, &feed.handle);
        if path.exists() {
            let rotated = rotated_path(&self.dir, &feed.handle);
            std::fs::rename(&path, rotated)?;
        }
        let json = serde_json::to_vec_pretty(feed)?;
        write_atomic(&path, &json)?;
        debug!(handle = %feed.handle, "stored feed snapshot");
        Ok(())
    }
}

fn snapshot_path(dir: &Path, handle: &str) -> PathBuf {
    dir.join(format!("{handle}.feed.json"))
}

fn rotated_path(dir: &Path, handle: &str) -> PathBuf {
    dir.join(format!("{handle}.feed.json.1"))
}

fn load_snapshot(dir: &Path, handle: &str) -> Result<Option<Feed>> {
    let path = snapshot_path(dir, handle);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// The minimal `{handle, href}` projection `SetFeedURL` hands back, before
/// any snapshot exists for the handle.
pub fn minimal_feed(handle: &str, url: &str) -> Feed {
    let mut feed = Feed::minimal(handle, url);
    feed.interval_secs = DEFAULT_INTERVAL_SECS;
    feed
}

/// Carry `result` into `feed`, keeping the prior `interval_secs` (step 7 of
/// the poll pipeline: the interval is copied forward, not reset).
pub fn apply_fetch_result(feed: &mut Feed, result: FeedResult, indexes: HashMap<String, usize>) {
    feed.etag = result.headers.get("etag").map(str::to_string);
    feed.last_modified = result
        .headers
        .get("last-modified")
        .or_else(|| result.headers.get("date"))
        .and_then(parse_http_date);
    feed.indexes = indexes;
    feed.result = Some(result);
}

/// Parse an HTTP `Last-Modified`/`Date` header value (RFC 2822 format) into
/// a `DateTime<Utc>`, for the snapshot's conditional-header rebuild on the
/// next poll.
fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_core::{FeedMeta, HeaderMap};
    use tempfile::TempDir;

    fn sample_result() -> FeedResult {
        FeedResult {
            status: None,
            url: "https://example.org/feed".to_string(),
            headers: HeaderMap::default(),
            feed: FeedMeta::default(),
            entries: vec![],
            bozo: false,
            bozo_exception: None,
        }
    }

    #[test]
    fn set_feed_url_persists_list_and_empty_snapshot() {
        let dir = TempDir::new().unwrap();
        let feeds_path = dir.path().join("feeds");
        let storage = FeedStorage::open(&feeds_path).unwrap();

        let feed = storage.set_feed_url("planet", "https://example.org/feed").unwrap();
        assert_eq!(feed.handle, "planet");
        assert_eq!(feed.url, "https://example.org/feed");

        let reopened = FeedStorage::open(&feeds_path).unwrap();
        let listed = reopened.get_feed("planet").unwrap();
        assert_eq!(listed.url, "https://example.org/feed");
    }

    #[test]
    fn feeds_list_is_sorted_on_write() {
        let dir = TempDir::new().unwrap();
        let feeds_path = dir.path().join("feeds");
        let storage = FeedStorage::open(&feeds_path).unwrap();
        storage.set_feed_url("zeta", "https://example.org/z").unwrap();
        storage.set_feed_url("alpha", "https://example.org/a").unwrap();

        let text = std::fs::read_to_string(&feeds_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["alpha https://example.org/a", "zeta https://example.org/z"]);
    }

    #[test]
    fn store_feed_rotates_the_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let feeds_path = dir.path().join("feeds");
        let storage = FeedStorage::open(&feeds_path).unwrap();
        let mut feed = storage.set_feed_url("planet", "https://example.org/feed").unwrap();

        feed.result = Some(sample_result());
        storage.store_feed(&feed).unwrap();
        assert!(dir.path().join("planet.feed.json.1").exists());

        let reopened = FeedStorage::open(&feeds_path).unwrap();
        let reloaded = reopened.get_feed("planet").unwrap();
        assert!(reloaded.result.is_some());
    }

    #[test]
    fn missing_feeds_file_opens_empty() {
        let dir = TempDir::new().unwrap();
        let storage = FeedStorage::open(dir.path().join("feeds")).unwrap();
        assert!(storage.feed_list().is_empty());
    }

    #[test]
    fn apply_fetch_result_records_last_modified_from_headers() {
        use chrono::Datelike;

        let mut feed = Feed::minimal("planet", "https://example.org/feed");
        let mut result = sample_result();
        result.headers.insert("last-modified", "Tue, 01 Jan 2030 00:00:00 GMT");

        apply_fetch_result(&mut feed, result, HashMap::new());

        let last_modified = feed.last_modified.expect("last_modified should be set");
        assert_eq!(last_modified.year(), 2030);
        assert_eq!(last_modified.month(), 1);
        assert_eq!(last_modified.day(), 1);
    }

    #[test]
    fn apply_fetch_result_falls_back_to_the_date_header() {
        let mut feed = Feed::minimal("planet", "https://example.org/feed");
        let mut result = sample_result();
        result.headers.insert("date", "Wed, 02 Jan 2030 00:00:00 GMT");

        apply_fetch_result(&mut feed, result, HashMap::new());

        assert!(feed.last_modified.is_some());
    }
}
