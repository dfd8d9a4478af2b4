use mimir_core::{Entry, Feed};
use mimir_session::{SessionHandle, DEFAULT_IQ_TIMEOUT};
use minidom::Element;
use thiserror::Error;
use tracing::{instrument, warn};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::jid::Jid;
use xmpp_parsers::stanza_error::DefinedCondition;

use crate::writer::EntryWriter;

const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("session error: {0}")]
    Session(#[from] mimir_session::SessionError),

    #[error("pub-sub service returned an error response")]
    ServiceError,
}

/// Serialises fresh entries to pub-sub items and publishes them to the
/// configured service. Generalizes `AggregatorService`'s pub-sub client
/// role (`original_source/mimir/aggregator/tap.py`'s `pubsub.PubSubClient`
/// wiring) into a plain struct holding the writer and the service JID.
pub struct Publisher {
    writer: Box<dyn EntryWriter + Send + Sync>,
    service: Jid,
}

impl Publisher {
    pub fn new(writer: impl EntryWriter + Send + Sync + 'static, service: Jid) -> Self {
        Self {
            writer: Box::new(writer),
            service,
        }
    }

    /// `EntriesDiscovered`: publish every entry as a pub-sub item on
    /// `mimir/news/<handle>`. Entries whose serialisation fails are skipped
    /// with an error log rather than aborting the whole batch.
    #[instrument(skip(self, session, entries), fields(handle = %feed.handle, count = entries.len()))]
    pub async fn publish_entries(
        &self,
        session: &SessionHandle,
        feed: &Feed,
        entries: &[Entry],
    ) -> Result<(), PublishError> {
        if entries.is_empty() {
            return Ok(());
        }

        let node = feed.node_name();
        let mut publish = Element::builder("publish", NS_PUBSUB).attr("node", node.as_str()).build();

        for entry in entries {
            match self.writer.write(entry) {
                Ok(payload) => {
                    let item = Element::builder("item", NS_PUBSUB)
                        .attr("id", entry.id.as_str())
                        .append(payload)
                        .build();
                    publish.append_child(item);
                }
                Err(error) => {
                    warn!(%error, entry_id = %entry.id, "skipping entry that failed to serialise");
                }
            }
        }

        let pubsub = Element::builder("pubsub", NS_PUBSUB).append(publish).build();
        let iq = Iq {
            from: None,
            to: Some(self.service.clone()),
            id: String::new(),
            payload: IqType::Set(pubsub),
        };

        let response = session.send_iq(iq, DEFAULT_IQ_TIMEOUT).await?;
        reject_if_error(response)
    }

    /// `CheckNode`: attempt to create the node, treating a `conflict` error
    /// (the node already exists) as success.
    #[instrument(skip(self, session))]
    pub async fn check_node(&self, session: &SessionHandle, handle: &str) -> Result<(), PublishError> {
        let node = format!("mimir/news/{handle}");
        let create = Element::builder("create", NS_PUBSUB).attr("node", node.as_str()).build();
        let pubsub = Element::builder("pubsub", NS_PUBSUB).append(create).build();
        let iq = Iq {
            from: None,
            to: Some(self.service.clone()),
            id: String::new(),
            payload: IqType::Set(pubsub),
        };

        match session.send_iq(iq, DEFAULT_IQ_TIMEOUT).await {
            Ok(stanza) => reject_if_error(stanza),
            Err(error) => Err(error.into()),
        }
    }
}

fn reject_if_error(stanza: tokio_xmpp::Stanza) -> Result<(), PublishError> {
    let tokio_xmpp::Stanza::Iq(iq) = stanza else {
        return Ok(());
    };
    if let IqType::Error(error) = iq.payload {
        if error.defined_condition == DefinedCondition::Conflict {
            return Ok(());
        }
        return Err(PublishError::ServiceError);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::AtomWriter;
    use mimir_core::TextContent;

    fn entry() -> Entry {
        Entry {
            id: "urn:uuid:1".to_string(),
            title: Some(TextContent::plain("Hello")),
            link: Some("https://example.org/1".to_string()),
            links: vec![],
            summary: None,
            content: vec![],
            author: None,
            contributors: vec![],
            categories: vec![],
            updated: None,
            published: None,
            created: None,
            feedburner_origlink: None,
        }
    }

    #[test]
    fn reject_if_error_treats_conflict_as_success() {
        let error = xmpp_parsers::stanza_error::StanzaError {
            type_: xmpp_parsers::stanza_error::ErrorType::Cancel,
            by: None,
            defined_condition: DefinedCondition::Conflict,
            texts: Default::default(),
            other: None,
        };
        let iq = Iq {
            from: None,
            to: None,
            id: "1".to_string(),
            payload: IqType::Error(error),
        };
        assert!(reject_if_error(tokio_xmpp::Stanza::Iq(iq)).is_ok());
    }

    #[test]
    fn writer_skips_nothing_for_a_well_formed_entry() {
        let publisher = Publisher::new(AtomWriter, "pubsub.example.org".parse().unwrap());
        assert!(publisher.writer.write(&entry()).is_ok());
    }
}
