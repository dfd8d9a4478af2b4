//! A reconnecting, queue-buffered XMPP component session shared by the
//! aggregator and monitor daemons.

pub mod error;
pub mod fallback;
pub mod handler;
pub mod session;

pub use error::{Result, SessionError};
pub use fallback::FallbackHandler;
pub use handler::Handler;
pub use session::{Session, SessionConfig, SessionHandle, DEFAULT_IQ_TIMEOUT};
