use std::time::Duration;

use mimir_core::{FetchOutcome, HeaderMap};
use reqwest::{redirect::Policy, Client, StatusCode, Url};
use tracing::{debug, instrument, warn};

use crate::cache::{CacheEntry, ResponseCache};
use crate::convert;
use crate::error::{FetchError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 10;

/// HTTP client + response cache shared by every poll cycle.
///
/// Built once, like `waddle-xmpp-xep-github`'s `GitHubClient` wraps a single
/// `reqwest::Client`; there is no circuit breaker here because an
/// unreachable feed is just one `FetchError` that reschedules normally, not
/// a dependency whose unavailability should suppress unrelated requests.
///
/// Redirects are followed by hand (`Policy::none()`) rather than left to
/// `reqwest`'s default policy, because `301` needs to be distinguished from
/// `302`/`303`/`307` before the caller decides whether to rewrite the
/// stored feed URL — `reqwest`'s auto-follow collapses that distinction.
pub struct Fetcher {
    http: Client,
    cache: ResponseCache,
}

impl Fetcher {
    pub fn new(user_agent: impl Into<String>) -> reqwest::Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(user_agent.into())
            .redirect(Policy::none())
            .build()?;
        Ok(Self {
            http,
            cache: ResponseCache::new(),
        })
    }

    /// Seed the response cache for `url` from a previously persisted
    /// snapshot, so the first poll after a restart still sends conditional
    /// headers instead of re-fetching the whole feed cold.
    pub fn seed_cache(&self, url: &str, etag: Option<String>, last_modified: Option<String>) {
        if etag.is_some() || last_modified.is_some() {
            self.cache.store(url.to_string(), CacheEntry { etag, last_modified });
        }
    }

    /// Fetch and parse `url`, honouring conditional-GET against this
    /// fetcher's response cache when `use_cache` is true.
    ///
    /// Redirects are followed one hop at a time: `301` is remembered as the
    /// original status (so the caller can rewrite the stored feed URL to
    /// wherever the chain ends up) while `302`/`303`/`307` are followed
    /// transparently. The response cache stays keyed by `url` — the
    /// originally requested address — through every hop, so a redirect
    /// never rewrites the conditional-GET cache key.
    #[instrument(skip(self), fields(url = %url, use_cache))]
    pub async fn get_feed(&self, url: &str, use_cache: bool) -> Result<FetchOutcome> {
        let mut current_url = url.to_string();
        let mut saw_permanent_redirect = false;

        for _ in 0..MAX_REDIRECTS {
            let mut request = self
                .http
                .get(&current_url)
                .header("Accept-Encoding", "gzip, deflate")
                .header(
                    "Accept",
                    "application/atom+xml, application/rss+xml, application/xml;q=0.9, */*;q=0.8",
                );

            if use_cache {
                if let Some(cached) = self.cache.get(url) {
                    if let Some(etag) = &cached.etag {
                        request = request.header("If-None-Match", etag);
                    }
                    if let Some(last_modified) = &cached.last_modified {
                        request = request.header("If-Modified-Since", last_modified);
                    }
                }
            }

            let response = request.send().await?;

            match response.status() {
                StatusCode::MOVED_PERMANENTLY => {
                    saw_permanent_redirect = true;
                    current_url = redirect_location(&response, &current_url)?;
                    continue;
                }
                StatusCode::FOUND | StatusCode::SEE_OTHER | StatusCode::TEMPORARY_REDIRECT => {
                    current_url = redirect_location(&response, &current_url)?;
                    continue;
                }
                StatusCode::NOT_MODIFIED => {
                    debug!("feed not modified");
                    return Ok(FetchOutcome::NotModified);
                }
                status if status.is_success() => {
                    return self.finish(url, saw_permanent_redirect, response).await;
                }
                status => {
                    return Err(FetchError::Http {
                        status: status.as_u16(),
                        message: status.canonical_reason().unwrap_or("").to_string(),
                    });
                }
            }
        }

        Err(FetchError::TooManyRedirects)
    }

    async fn finish(
        &self,
        cache_key: &str,
        saw_permanent_redirect: bool,
        response: reqwest::Response,
    ) -> Result<FetchOutcome> {
        let final_url = response.url().to_string();
        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let last_modified = response
            .headers()
            .get("last-modified")
            .or_else(|| response.headers().get("date"))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut headers = HeaderMap::default();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str(), value);
            }
        }

        self.cache.store(
            cache_key.to_string(),
            CacheEntry {
                etag,
                last_modified,
            },
        );

        let bytes = response.bytes().await?;
        let (feed, entries, bozo, bozo_exception) = convert::parse_bytes(&bytes[..]);
        if bozo {
            warn!(
                error = bozo_exception.as_deref().unwrap_or(""),
                "feed body failed to parse, carrying bozo flag instead of aborting"
            );
        }

        Ok(FetchOutcome::Fresh(mimir_core::FeedResult {
            status: saw_permanent_redirect.then(|| "301".to_string()),
            url: final_url,
            headers,
            feed,
            entries,
            bozo,
            bozo_exception,
        }))
    }
}

/// Resolve a redirect response's `Location` header against `base`, the URL
/// that was just requested.
fn redirect_location(response: &reqwest::Response, base: &str) -> Result<String> {
    let status = response.status().as_u16();
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| FetchError::Http {
            status,
            message: "redirect response carried no Location header".to_string(),
        })?;
    let base = Url::parse(base).map_err(|_| FetchError::Http {
        status,
        message: "redirect base url is not a valid url".to_string(),
    })?;
    let resolved = base.join(location).map_err(|_| FetchError::Http {
        status,
        message: "redirect Location header is not resolvable".to_string(),
    })?;
    Ok(resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ATOM_FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example Feed</title>
  <entry>
    <id>urn:uuid:1</id>
    <title>First post</title>
    <link href="https://example.com/1"/>
    <updated>2026-01-01T00:00:00Z</updated>
  </entry>
</feed>"#;

    #[tokio::test]
    async fn parses_a_fresh_feed_and_records_etag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.atom"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"v1\"")
                    .set_body_string(ATOM_FEED),
            )
            .mount(&server)
            .await;

        let fetcher = Fetcher::new("mimir-aggregator/test").unwrap();
        let outcome = fetcher
            .get_feed(&format!("{}/feed.atom", server.uri()), true)
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Fresh(result) => {
                assert_eq!(result.feed.title.as_deref(), Some("Example Feed"));
                assert_eq!(result.entries.len(), 1);
                assert_eq!(result.entries[0].id, "urn:uuid:1");
                assert!(!result.bozo);
            }
            FetchOutcome::NotModified => panic!("expected a fresh result"),
        }

        let cached = fetcher.cache.get(&format!("{}/feed.atom", server.uri())).unwrap();
        assert_eq!(cached.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn sends_conditional_headers_from_the_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.atom"))
            .and(header("If-None-Match", "\"cached\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new("mimir-aggregator/test").unwrap();
        let url = format!("{}/feed.atom", server.uri());
        fetcher.cache.store(
            url.clone(),
            CacheEntry {
                etag: Some("\"cached\"".to_string()),
                last_modified: None,
            },
        );

        let outcome = fetcher.get_feed(&url, true).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::NotModified));
    }

    #[tokio::test]
    async fn maps_non_success_status_to_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.atom"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new("mimir-aggregator/test").unwrap();
        let error = fetcher
            .get_feed(&format!("{}/missing.atom", server.uri()), false)
            .await
            .unwrap_err();

        assert!(matches!(error, FetchError::Http { status: 404, .. }));
    }

    #[tokio::test]
    async fn permanent_redirect_is_followed_and_surfaces_301() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old.atom"))
            .respond_with(
                ResponseTemplate::new(301)
                    .insert_header("location", format!("{}/new.atom", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new.atom"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ATOM_FEED))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new("mimir-aggregator/test").unwrap();
        let outcome = fetcher
            .get_feed(&format!("{}/old.atom", server.uri()), false)
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Fresh(result) => {
                assert_eq!(result.status.as_deref(), Some("301"));
                assert_eq!(result.url, format!("{}/new.atom", server.uri()));
            }
            FetchOutcome::NotModified => panic!("expected a fresh result"),
        }
    }

    #[tokio::test]
    async fn temporary_redirect_is_followed_without_a_301_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/moved.atom"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", format!("{}/target.atom", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/target.atom"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ATOM_FEED))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new("mimir-aggregator/test").unwrap();
        let outcome = fetcher
            .get_feed(&format!("{}/moved.atom", server.uri()), false)
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Fresh(result) => assert!(result.status.is_none()),
            FetchOutcome::NotModified => panic!("expected a fresh result"),
        }
    }

    #[tokio::test]
    async fn redirect_chain_keeps_the_cache_keyed_by_the_original_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.atom"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", format!("{}/target.atom", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/target.atom"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"v2\"")
                    .set_body_string(ATOM_FEED),
            )
            .mount(&server)
            .await;

        let fetcher = Fetcher::new("mimir-aggregator/test").unwrap();
        let original_url = format!("{}/feed.atom", server.uri());
        fetcher.get_feed(&original_url, false).await.unwrap();

        let cached = fetcher.cache.get(&original_url).unwrap();
        assert_eq!(cached.etag.as_deref(), Some("\"v2\""));
        assert!(fetcher.cache.get(&format!("{}/target.atom", server.uri())).is_none());
    }

    #[tokio::test]
    async fn malformed_body_sets_bozo_instead_of_failing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken.atom"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not xml at all"))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new("mimir-aggregator/test").unwrap();
        let outcome = fetcher
            .get_feed(&format!("{}/broken.atom", server.uri()), false)
            .await
            .unwrap();

        match outcome {
            FetchOutcome::Fresh(result) => {
                assert!(result.bozo);
                assert!(result.bozo_exception.is_some());
                assert!(result.entries.is_empty());
            }
            FetchOutcome::NotModified => panic!("expected a fresh (bozo) result"),
        }
    }
}
