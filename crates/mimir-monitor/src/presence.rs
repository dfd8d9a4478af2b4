use std::sync::Arc;

use chrono::Utc;
use jid::Jid;
use mimir_session::{Handler, SessionHandle};
use mimir_storage::{IncomingPresence, NewsStore, PresenceStore};
use tokio_xmpp::Stanza;
use tracing::{debug, warn};
use xmpp_parsers::presence::{Presence, Priority, Show, Type as PresenceType};

use crate::news::schedule_page_notify;

/// Feeds every inbound `<presence>` into the top-resource election and
/// runs the roster subscribe/unsubscribe protocol. A "changed" election
/// result schedules the 5-second deferred digest notification.
pub struct PresenceHandler {
    store: Arc<PresenceStore>,
    news: Arc<NewsStore>,
    news_base_url: Option<Arc<str>>,
}

impl PresenceHandler {
    pub fn new(store: Arc<PresenceStore>, news: Arc<NewsStore>, news_base_url: Option<Arc<str>>) -> Self {
        Self { store, news, news_base_url }
    }
}

impl Handler for PresenceHandler {
    fn handle_stanza(&self, session: &SessionHandle, stanza: &Stanza) -> bool {
        let Stanza::Presence(presence) = stanza else {
            return false;
        };
        let Some(from) = presence.from.clone() else {
            return false;
        };

        match presence.type_ {
            PresenceType::None | PresenceType::Unavailable => {
                let store = self.store.clone();
                let news = self.news.clone();
                let news_base_url = self.news_base_url.clone();
                let session = session.clone();
                let presence = presence.clone();
                tokio::spawn(async move {
                    record(store, news, news_base_url, session, from, presence).await;
                });
                true
            }
            PresenceType::Subscribe => {
                session.send(Presence::subscribed().with_to(from.clone()).with_from(from.clone()));
                session.send(Presence::subscribe().with_to(from));
                true
            }
            PresenceType::Unsubscribe => {
                session.send(Presence::unsubscribed().with_to(from.clone()).with_from(from.clone()));
                session.send(Presence::unsubscribe().with_to(from));
                true
            }
            PresenceType::Unsubscribed => {
                let store = self.store.clone();
                let bare = from.to_bare().to_string();
                tokio::spawn(async move {
                    if let Err(error) = store.remove_jid(&bare).await {
                        warn!(%error, jid = %bare, "failed to remove jid on unsubscribed");
                    }
                });
                true
            }
            _ => false,
        }
    }
}

async fn record(
    store: Arc<PresenceStore>,
    news: Arc<NewsStore>,
    news_base_url: Option<Arc<str>>,
    session: SessionHandle,
    from: Jid,
    presence: Presence,
) {
    let bare = from.to_bare().to_string();
    let resource = from.resource().map(|r| r.to_string()).unwrap_or_default();

    let available = presence.type_ != PresenceType::Unavailable;
    let show = presence.show.as_ref().map(|s| normalize_show(s).to_string());
    let status = presence.statuses.get("").cloned();
    let priority = extract_priority(&presence.priority) as i64;

    let incoming = IncomingPresence { available, show, status, priority };

    match store.record_presence(&bare, &resource, incoming, Utc::now()).await {
        Ok(change) if change.changed => {
            debug!(jid = %bare, available = change.available, show = %change.show, "top resource changed");
            schedule_page_notify(session, news, news_base_url, bare, change.show);
        }
        Ok(_) => {}
        Err(error) => warn!(%error, jid = %bare, "failed to record presence"),
    }
}

fn normalize_show(show: &Show) -> &'static str {
    match show {
        Show::Away => "away",
        Show::Chat => "chat",
        Show::Dnd => "dnd",
        Show::Xa => "xa",
    }
}

fn extract_priority(priority: &Priority) -> i8 {
    let element: minidom::Element = priority.into();
    element.text().parse::<i8>().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn handler() -> PresenceHandler {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await.unwrap();
        PresenceStore::migrate(&pool).await.unwrap();
        NewsStore::migrate(&pool).await.unwrap();
        let store = Arc::new(PresenceStore::new(pool.clone()));
        let news = Arc::new(NewsStore::new(pool));
        PresenceHandler::new(store, news, None)
    }

    fn with_from(mut presence: Presence, from: &str) -> Presence {
        presence.from = Some(from.parse().unwrap());
        presence
    }

    #[tokio::test]
    async fn available_presence_is_recorded_and_claimed() {
        let handler = handler().await;
        let (session, _out) = mimir_session::session::test_handle();
        let presence = with_from(Presence::available(), "alice@example.org/phone");
        assert!(handler.handle_stanza(&session, &Stanza::Presence(presence)));
    }

    #[tokio::test]
    async fn subscribe_request_is_auto_accepted() {
        let handler = handler().await;
        let (session, mut out) = mimir_session::session::test_handle();
        let presence = with_from(Presence::subscribe(), "alice@example.org");
        assert!(handler.handle_stanza(&session, &Stanza::Presence(presence)));

        let reply = out.recv().await.expect("a subscribed reply was sent");
        match reply {
            Stanza::Presence(reply) => assert_eq!(reply.type_, PresenceType::Subscribed),
            _ => panic!("expected a presence reply"),
        }
    }

    #[tokio::test]
    async fn subscribe_request_also_returns_the_favour() {
        let handler = handler().await;
        let (session, mut out) = mimir_session::session::test_handle();
        let presence = with_from(Presence::subscribe(), "alice@example.org");
        assert!(handler.handle_stanza(&session, &Stanza::Presence(presence)));

        out.recv().await.expect("the subscribed reply was sent first");
        let reciprocal = out.recv().await.expect("a reciprocal subscribe was sent");
        match reciprocal {
            Stanza::Presence(reply) => assert_eq!(reply.type_, PresenceType::Subscribe),
            _ => panic!("expected a presence reply"),
        }
    }

    #[tokio::test]
    async fn unrelated_stanzas_are_ignored() {
        let handler = handler().await;
        let (session, _out) = mimir_session::session::test_handle();
        let ping = Stanza::Iq(xmpp_parsers::iq::Iq {
            from: None,
            to: None,
            id: "1".to_string(),
            payload: xmpp_parsers::iq::IqType::Get(minidom::Element::builder("ping", "urn:xmpp:ping").build()),
        });
        assert!(!handler.handle_stanza(&session, &ping));
    }
}
