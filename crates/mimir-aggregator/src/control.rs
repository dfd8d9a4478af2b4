use std::collections::BTreeMap;
use std::sync::Arc;

use mimir_core::validate_handle;
use mimir_session::{Handler, SessionHandle};
use tokio_xmpp::Stanza;
use tracing::warn;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use crate::pipeline::PipelineContext;
use crate::scheduler::Scheduler;

pub const NS_AGGREGATOR: &str = "http://mimir.ik.nu/protocol/aggregator";

/// Answers `<iq type='set'><aggregator xmlns='...'><feed>` control
/// requests that add or update a feed. Registers ahead of the fallback
/// handler so it claims matching IQs first.
pub struct ControlHandler {
    ctx: Arc<PipelineContext>,
    scheduler: Arc<Scheduler>,
}

impl ControlHandler {
    pub fn new(ctx: Arc<PipelineContext>, scheduler: Arc<Scheduler>) -> Self {
        Self { ctx, scheduler }
    }
}

impl Handler for ControlHandler {
    fn handle_stanza(&self, session: &SessionHandle, stanza: &Stanza) -> bool {
        let Stanza::Iq(iq) = stanza else {
            return false;
        };
        let IqType::Set(payload) = &iq.payload else {
            return false;
        };
        if !payload.is("aggregator", NS_AGGREGATOR) {
            return false;
        }
        let Some(feed_elem) = payload.get_child("feed", NS_AGGREGATOR) else {
            return false;
        };

        let handle = feed_elem.get_child("handle", NS_AGGREGATOR).map(|e| e.text());
        let url = feed_elem.get_child("url", NS_AGGREGATOR).map(|e| e.text());

        let reply = match (handle, url) {
            (Some(handle), Some(url)) if !handle.is_empty() && !url.is_empty() => {
                self.set_feed(iq, &handle, &url)
            }
            _ => error_iq(iq, DefinedCondition::BadRequest, None),
        };

        session.send(reply);
        true
    }
}

impl ControlHandler {
    fn set_feed(&self, request: &Iq, handle: &str, url: &str) -> Iq {
        if let Err(error) = validate_handle(handle) {
            warn!(%error, "rejected invalid feed handle");
            return error_iq(request, DefinedCondition::BadRequest, Some("Invalid handle"));
        }

        match self.ctx.storage.set_feed_url(handle, url) {
            Ok(_) => {
                let scheduler = self.scheduler.clone();
                let handle = handle.to_string();
                tokio::spawn(async move { scheduler.poll_now(handle).await });
                result_iq(request)
            }
            Err(error) => {
                warn!(%error, "failed to persist feed");
                error_iq(request, DefinedCondition::InternalServerError, None)
            }
        }
    }
}

fn result_iq(request: &Iq) -> Iq {
    Iq {
        from: request.to.clone(),
        to: request.from.clone(),
        id: request.id.clone(),
        payload: IqType::Result(None),
    }
}

fn error_iq(request: &Iq, condition: DefinedCondition, text: Option<&str>) -> Iq {
    let mut texts = BTreeMap::new();
    if let Some(text) = text {
        texts.insert(String::new(), text.to_string());
    }
    let error = StanzaError {
        type_: ErrorType::Modify,
        by: None,
        defined_condition: condition,
        texts,
        other: None,
    };
    Iq {
        from: request.to.clone(),
        to: request.from.clone(),
        id: request.id.clone(),
        payload: IqType::Error(error),
    }
}
