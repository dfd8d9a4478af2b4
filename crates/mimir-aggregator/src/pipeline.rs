use std::collections::HashMap;

use mimir_core::{Entry, FeedResult, FetchOutcome, DEFAULT_INTERVAL_SECS};
use mimir_fetcher::Fetcher;
use mimir_session::SessionHandle;
use mimir_storage::FeedStorage;
use tracing::{debug, error, info, instrument, warn};

use crate::publisher::Publisher;

/// Everything one poll cycle needs, owned by the scheduler and shared
/// across every per-feed task.
pub struct PipelineContext {
    pub storage: FeedStorage,
    pub fetcher: Fetcher,
    pub publisher: Publisher,
    pub session: SessionHandle,
}

/// What the scheduler needs back from a finished poll: the interval to
/// wait before the next one.
pub struct PollOutcome {
    pub interval_secs: u64,
}

impl PipelineContext {
    /// Run one full poll cycle for `handle`. Every branch — fetch error,
    /// `NotModified`, or a successful fetch — returns an interval, so the
    /// caller can unconditionally reschedule (step 9 of the pipeline never
    /// fails to run).
    #[instrument(skip(self), fields(handle = %handle, use_cache))]
    pub async fn poll_once(&self, handle: &str, use_cache: bool) -> PollOutcome {
        let Some(mut feed) = self.storage.get_feed(handle) else {
            error!(handle, "poll fired for a handle with no storage entry");
            return PollOutcome {
                interval_secs: DEFAULT_INTERVAL_SECS,
            };
        };

        self.fetcher.seed_cache(
            &feed.url,
            feed.etag.clone(),
            feed.last_modified.map(|t| t.to_rfc2822()),
        );

        let outcome = match self.fetcher.get_feed(&feed.url, use_cache).await {
            Ok(outcome) => outcome,
            Err(error) => {
                info!(handle, %error, "no feed this cycle");
                return PollOutcome {
                    interval_secs: feed.interval_secs,
                };
            }
        };

        let result = match outcome {
            FetchOutcome::NotModified => {
                debug!(handle, "feed not modified");
                return PollOutcome {
                    interval_secs: feed.interval_secs,
                };
            }
            FetchOutcome::Fresh(result) => result,
        };

        if result.status.as_deref() == Some("301") {
            if let Err(error) = self.storage.set_feed_url(handle, &result.url) {
                warn!(handle, %error, "failed to persist redirected feed url");
            }
        }
        if let Some(title) = &result.feed.title {
            info!(handle, title, "fetched feed");
        }

        let indexes: HashMap<String, usize> = result
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.id.is_empty())
            .map(|(index, entry)| (entry.id.clone(), index))
            .collect();

        let fresh = classify_fresh_entries(feed.result.as_ref(), &feed.indexes, &result);

        if !fresh.is_empty() {
            if let Err(error) = self.publisher.publish_entries(&self.session, &feed, &fresh).await {
                warn!(handle, %error, "failed to publish fresh entries");
            }
        }

        let interval_secs = feed.interval_secs;
        mimir_storage::apply_fetch_result(&mut feed, result, indexes);
        feed.interval_secs = interval_secs;
        if let Err(error) = self.storage.store_feed(&feed) {
            warn!(handle, %error, "failed to persist feed snapshot");
        }

        PollOutcome { interval_secs }
    }
}

/// §4.5 step 5: walk `result`'s entries oldest-first (reverse source
/// order), classifying each against the previous snapshot's `indexes`.
fn classify_fresh_entries(
    previous: Option<&FeedResult>,
    previous_indexes: &HashMap<String, usize>,
    result: &FeedResult,
) -> Vec<Entry> {
    let mut fresh = Vec::new();
    for entry in result.entries.iter().rev() {
        if entry.id.is_empty() {
            continue;
        }
        match previous_indexes.get(&entry.id) {
            None => fresh.push(entry.clone()),
            Some(&index) => {
                let unchanged = previous
                    .and_then(|p| p.entries.get(index))
                    .map(|old| old.canonical_eq(entry))
                    .unwrap_or(false);
                if !unchanged {
                    fresh.push(entry.clone());
                }
            }
        }
    }
    fresh
}
