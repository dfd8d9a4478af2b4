use std::collections::HashMap;
use std::sync::Mutex;

/// What the fetcher remembers about a URL between polls, to build
/// conditional-GET headers on the next request.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Process-wide response cache keyed by the *original* request URL.
///
/// A plain `HashMap` rather than an LRU: the key space is the operator's
/// own feed list, which is small and operator-controlled, not an open
/// surface that needs eviction (contrast `waddle-xmpp-xep-github`'s
/// `LruCache`, which bounds an attacker-reachable cache).
#[derive(Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<CacheEntry> {
        self.entries.lock().unwrap().get(url).cloned()
    }

    pub fn store(&self, url: String, entry: CacheEntry) {
        self.entries.lock().unwrap().insert(url, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_url_misses() {
        let cache = ResponseCache::new();
        assert!(cache.get("https://example.com/feed").is_none());
    }

    #[test]
    fn stores_and_retrieves_by_url() {
        let cache = ResponseCache::new();
        cache.store(
            "https://example.com/feed".to_string(),
            CacheEntry {
                etag: Some("\"abc\"".to_string()),
                last_modified: None,
            },
        );
        let entry = cache.get("https://example.com/feed").unwrap();
        assert_eq!(entry.etag.as_deref(), Some("\"abc\""));
        assert!(entry.last_modified.is_none());
    }

    #[test]
    fn overwrites_existing_entry() {
        let cache = ResponseCache::new();
        let url = "https://example.com/feed".to_string();
        cache.store(
            url.clone(),
            CacheEntry {
                etag: Some("\"old\"".to_string()),
                last_modified: None,
            },
        );
        cache.store(
            url.clone(),
            CacheEntry {
                etag: Some("\"new\"".to_string()),
                last_modified: Some("Tue, 01 Jan 2030 00:00:00 GMT".to_string()),
            },
        );
        let entry = cache.get(&url).unwrap();
        assert_eq!(entry.etag.as_deref(), Some("\"new\""));
    }
}
