use tokio_xmpp::Stanza;

use crate::session::SessionHandle;

/// A pluggable piece of protocol logic attached to a [`crate::session::Session`].
///
/// Handlers receive stream lifecycle callbacks and a chance to claim
/// inbound stanzas. They never hold a back-reference to the session that
/// owns them (per the design notes on recursive/back-reference pointers);
/// instead every callback is handed a cheaply-cloneable [`SessionHandle`]
/// they can use to send stanzas of their own.
pub trait Handler: Send + Sync {
    /// The raw stream came up, but authentication/binding hasn't completed
    /// yet. Most handlers have nothing to do here.
    fn connection_made(&self, _session: &SessionHandle) {}

    /// The stream authenticated and the packet queue has been drained.
    /// Handlers that need to announce presence or subscribe to something
    /// do it here.
    fn connection_initialized(&self, _session: &SessionHandle) {}

    /// The stream ended. Any state a handler kept about "am I live" should
    /// be reset here.
    fn connection_lost(&self) {}

    /// Offer an inbound stanza to this handler.
    ///
    /// Returns `true` if the handler claimed the stanza, which stops it
    /// from being offered to handlers registered after this one. Handlers
    /// are offered stanzas in registration order, so lowest-priority
    /// handlers (the fallback handler, see [`crate::fallback::FallbackHandler`])
    /// should register last.
    fn handle_stanza(&self, session: &SessionHandle, stanza: &Stanza) -> bool;
}
