use std::collections::BTreeMap;

use tokio_xmpp::Stanza;
use tracing::debug;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use crate::handler::Handler;
use crate::session::SessionHandle;

/// Registers as the lowest-priority handler on a [`crate::session::Session`]
/// (it must be added last) and answers any `iq[@type='get'|'set']` nobody
/// else claimed with `service-unavailable`, per RFC 6120 §8.3.3's
/// unrecognized-IQ rule.
#[derive(Default)]
pub struct FallbackHandler;

impl Handler for FallbackHandler {
    fn handle_stanza(&self, session: &SessionHandle, stanza: &Stanza) -> bool {
        let Stanza::Iq(iq) = stanza else {
            return false;
        };
        if !matches!(iq.payload, IqType::Get(_) | IqType::Set(_)) {
            return false;
        }
        debug!(id = %iq.id, "no handler claimed iq, replying service-unavailable");
        let error = StanzaError {
            type_: ErrorType::Cancel,
            by: None,
            defined_condition: DefinedCondition::ServiceUnavailable,
            texts: BTreeMap::new(),
            other: None,
        };
        let reply = Iq {
            from: iq.to.clone(),
            to: iq.from.clone(),
            id: iq.id.clone(),
            payload: IqType::Error(error),
        };
        session.send(reply);
        true
    }
}
