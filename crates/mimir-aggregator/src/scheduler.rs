use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{info, instrument};

use crate::pipeline::PipelineContext;

/// Owns one cancellable timer per feed handle: a `HashMap<String,
/// AbortHandle>` generalizing the teacher's background-task bookkeeping
/// style from connection lifecycle to per-feed poll lifecycle.
pub struct Scheduler {
    ctx: Arc<PipelineContext>,
    timers: Mutex<HashMap<String, AbortHandle>>,
}

impl Scheduler {
    pub fn new(ctx: Arc<PipelineContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// Start the initial poll wave: every known handle fires its first
    /// poll at a delay of `5*i` seconds (`i = 1..=n`) to avoid a
    /// thundering herd.
    pub async fn start(self: &Arc<Self>) {
        let feeds = self.ctx.storage.feed_list();
        for (i, handle) in feeds.into_keys().enumerate() {
            let delay = Duration::from_secs(5 * (i as u64 + 1));
            self.schedule(handle, delay, true).await;
        }
    }

    /// `SetFeed`'s immediate-reschedule path: poll `handle` right away
    /// with `use_cache = false`, cancelling whatever timer it already had.
    pub async fn poll_now(self: &Arc<Self>, handle: String) {
        self.schedule(handle, Duration::ZERO, false).await;
    }

    /// Cancel `handle`'s outstanding timer, if any, and arm a new one.
    /// Cancellation is idempotent: cancelling an absent or already-fired
    /// timer is a no-op.
    #[instrument(skip(self))]
    async fn schedule(self: &Arc<Self>, handle: String, delay: Duration, use_cache: bool) {
        self.cancel(&handle).await;
        let scheduler = self.clone();
        let handle_for_task = handle.clone();
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            scheduler.fire(handle_for_task, use_cache).await;
        });
        self.timers.lock().await.insert(handle, task.abort_handle());
    }

    async fn cancel(&self, handle: &str) {
        if let Some(abort) = self.timers.lock().await.remove(handle) {
            abort.abort();
        }
    }

    /// Fires one poll cycle. Per §4.5, the timer first removes itself
    /// from the schedule map so a concurrent `SetFeed` reschedule never
    /// double-cancels a timer that already fired.
    async fn fire(self: Arc<Self>, handle: String, use_cache: bool) {
        self.timers.lock().await.remove(&handle);
        let outcome = self.ctx.poll_once(&handle, use_cache).await;
        info!(handle = %handle, interval_secs = outcome.interval_secs, "poll complete, rescheduling");
        self.schedule(handle, Duration::from_secs(outcome.interval_secs), true).await;
    }
}
