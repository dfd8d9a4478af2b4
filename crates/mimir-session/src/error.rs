use thiserror::Error;

/// Errors raised by [`crate::session::Session`].
#[derive(Error, Debug)]
pub enum SessionError {
    /// `SendIQ` did not receive a matching result/error within its timeout.
    #[error("IQ timed out waiting for a response")]
    Timeout,

    /// The stream ended (or `Stop()` was called) before a pending IQ
    /// resolved.
    #[error("connection lost before a response arrived")]
    ConnectionLost,

    /// The underlying XMPP transport failed.
    #[error("XMPP transport error: {0}")]
    Transport(#[from] tokio_xmpp::Error),

    /// A component-mode connection attempt failed outright (bad JID,
    /// authentication failure, DNS failure, ...).
    #[error("failed to connect: {0}")]
    Connect(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
