//! Plain `tracing` console output. No OTLP export: the aggregator is a
//! long-lived component process, not a request-serving frontend, so a
//! local `fmt` layer driven by `RUST_LOG` is all it needs.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Call once, before anything else logs.
pub fn init(verbose: bool) {
    let default_filter = if verbose {
        "debug,mimir_aggregator=trace"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
