use thiserror::Error;

/// Errors raised by [`crate::fetcher::get_feed`].
#[derive(Error, Debug)]
pub enum FetchError {
    /// The server answered `304 Not Modified`; the caller should keep using
    /// its existing snapshot.
    #[error("feed not modified")]
    NotModified,

    /// A non-success, non-304 final status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The HTTP client failed outright (DNS, TLS, timeout, connection reset).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The body wasn't valid Atom/RSS/JSON Feed. Held distinct from a
    /// hard fetch failure so callers can decide whether to surface this as
    /// a `bozo` flag instead of aborting the poll.
    #[error("feed parse error: {0}")]
    Parse(#[from] feed_rs::parser::ParseFeedError),

    /// The redirect chain exceeded [`crate::fetcher`]'s hop limit without
    /// reaching a final response.
    #[error("too many redirects")]
    TooManyRedirects,
}

pub type Result<T> = std::result::Result<T, FetchError>;
