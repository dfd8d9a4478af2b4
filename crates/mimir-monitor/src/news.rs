//! `mimir/news/<channel>` pub-sub item handler and the deferred digest
//! ("page") notification fired by [`crate::presence`] on every top-resource
//! change. Generalizes `original_source/mimir/monitor/news.py`'s
//! `NewsService`: the Python version re-wraps each batch of incoming
//! `domish.Element` entries into a synthetic Atom document and reparses it
//! with `feedparser` rather than hand-decoding the pub-sub item payload;
//! this does the same thing through [`mimir_fetcher::convert`].

use std::sync::Arc;
use std::time::Duration;

use mimir_session::{Handler, SessionHandle};
use mimir_storage::{InsertedNewsItem, NewsItemInput, NewsStore};
use minidom::Element;
use regex::{Captures, Regex};
use tokio_xmpp::Stanza;
use tracing::{debug, instrument, warn};
use xmpp_parsers::jid::Jid;
use xmpp_parsers::message::{Body, Message, Subject};

const NS_PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";
const NS_ATOM: &str = "http://www.w3.org/2005/Atom";
const NS_OOB: &str = "jabber:x:oob";
const DIGEST_DELAY: Duration = Duration::from_secs(5);

/// Watches inbound `<message>` stanzas for pub-sub item notifications on a
/// `mimir/news/<channel>` node and runs the upsert/notify pipeline for each.
pub struct NewsHandler {
    news: Arc<NewsStore>,
}

impl NewsHandler {
    pub fn new(news: Arc<NewsStore>) -> Self {
        Self { news }
    }
}

impl Handler for NewsHandler {
    fn handle_stanza(&self, session: &SessionHandle, stanza: &Stanza) -> bool {
        let Stanza::Message(message) = stanza else {
            return false;
        };
        let Some((channel, entries)) = extract_pubsub_items(message) else {
            return false;
        };
        if entries.is_empty() {
            return true;
        }

        let news = self.news.clone();
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(error) = process_channel(&news, &session, &channel, entries).await {
                warn!(%error, %channel, "failed to process news items");
            }
        });
        true
    }
}

/// Pulls the channel name and the raw Atom `<entry>` payloads out of a
/// pub-sub `event`/`items` notification, or `None` if this stanza isn't one.
fn extract_pubsub_items(message: &Message) -> Option<(String, Vec<Element>)> {
    let event = message.payloads.iter().find(|el| el.name() == "event" && el.ns() == NS_PUBSUB_EVENT)?;
    let items = event.children().find(|el| el.name() == "items")?;
    let node = items.attr("node")?;
    let channel = node.strip_prefix("mimir/news/").filter(|rest| !rest.is_empty())?.to_string();

    let entries = items
        .children()
        .filter(|item| item.name() == "item")
        .flat_map(Element::children)
        .filter(|child| child.name() == "entry" && child.ns() == NS_ATOM)
        .cloned()
        .collect();

    Some((channel, entries))
}

#[instrument(skip(news, session, entries), fields(%channel, count = entries.len()))]
async fn process_channel(
    news: &NewsStore,
    session: &SessionHandle,
    channel: &str,
    entries: Vec<Element>,
) -> anyhow::Result<()> {
    let title = channel.to_string();
    debug!(%title, "processing channel news items");

    let mut feed = Element::builder("feed", NS_ATOM).build();
    for entry in entries {
        feed.append_child(entry);
    }
    let mut bytes = Vec::new();
    feed.write_to(&mut bytes)?;
    let (_meta, parsed) = mimir_fetcher::convert::parse_bytes_strict(&bytes)?;

    let notify = news.notify_subscribers(channel).await?;
    let store_offline = news.store_offline_subscribers(channel).await?;

    let items: Vec<NewsItemInput> = parsed
        .iter()
        .map(|entry| NewsItemInput {
            title: entry.title.as_ref().map(|t| t.value.clone()),
            link: entry.effective_link().unwrap_or_default().to_string(),
            description: entry.summary.as_ref().map(|t| t.value.clone()),
            date: entry.updated.or(entry.published),
            parsed: serde_json::to_value(entry).unwrap_or(serde_json::Value::Null),
        })
        .collect();

    let inserted = news.upsert_entries(channel, &items).await?;
    if inserted.is_empty() {
        return Ok(());
    }

    for item in &inserted {
        if !store_offline.is_empty() {
            news.flag_unread(item.news_id, &store_offline).await?;
        }
        notify_item(session, &title, item, &notify);
    }

    Ok(())
}

fn notify_item(session: &SessionHandle, channel_title: &str, item: &InsertedNewsItem, notify: &[mimir_storage::NotifySubscriber]) {
    let title = format!("{}: {}", channel_title, item.title.as_deref().unwrap_or("-- no title --"));
    let link = item.link.clone();
    let description = item.description.as_deref().and_then(clean_description);

    for subscriber in notify {
        let Ok(to): Result<Jid, _> = subscriber.user_id.parse() else {
            warn!(jid = %subscriber.user_id, "skipping notification to an unparsable jid");
            continue;
        };
        let message = build_notification(
            to,
            &subscriber.message_type,
            &title,
            &link,
            description.as_deref(),
            subscriber.description_in_notify,
        );
        session.send(message);
    }
}

/// Strips SGML tags, unescapes XML entities, and trims trailing whitespace.
/// `None` if nothing is left afterward.
fn clean_description(raw: &str) -> Option<String> {
    let tag = Regex::new("<[^>]*?>").expect("static pattern");
    let stripped = tag.replace_all(raw, "");
    let unescaped = unescape_xml_entities(&stripped);
    let trimmed = unescaped.trim_end();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn unescape_xml_entities(text: &str) -> String {
    let entity = Regex::new(r"&(#x[0-9a-fA-F]+|#[0-9]+|amp|lt|gt|quot|apos);").expect("static pattern");
    entity
        .replace_all(text, |caps: &Captures| match &caps[1] {
            "amp" => "&".to_string(),
            "lt" => "<".to_string(),
            "gt" => ">".to_string(),
            "quot" => "\"".to_string(),
            "apos" => "'".to_string(),
            rest if rest.starts_with("#x") => u32::from_str_radix(&rest[2..], 16)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_default(),
            rest => rest[1..]
                .parse::<u32>()
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_default(),
        })
        .into_owned()
}

/// `message_type` is either `chat` (body only) or `headline` (subject, body
/// and an out-of-band `<x xmlns='jabber:x:oob'>` link). `description_in_notify`
/// gates whether a `chat` body includes the description at all; `headline`
/// messages always include it when present.
fn build_notification(
    to: Jid,
    message_type: &str,
    title: &str,
    link: &str,
    description: Option<&str>,
    description_in_notify: bool,
) -> Message {
    let is_headline = message_type == "headline";
    let mut message = if is_headline { Message::headline(to) } else { Message::chat(to) };

    if is_headline {
        message.subjects.insert(String::new(), Subject(title.to_string()));
        if let Some(description) = description {
            message.bodies.insert(String::new(), Body(description.to_string()));
        }
        let oob = Element::builder("x", NS_OOB)
            .append(Element::builder("url", NS_OOB).append(link).build())
            .append(Element::builder("desc", NS_OOB).append(title).build())
            .build();
        message.payloads.push(oob);
    } else {
        let mut body = format!("{}\n{}", title, link);
        if description_in_notify {
            if let Some(description) = description {
                body.push_str(&format!("\n\n{}\n\n", description));
            }
        }
        message.bodies.insert(String::new(), Body(body));
    }

    message
}

/// `pageNotify`: called 5 seconds after a presence change is recorded as
/// "changed", this re-checks unread counts per `(message_type, ssl)`
/// preference group and sends at most one digest message per group.
pub fn schedule_page_notify(session: SessionHandle, news: Arc<NewsStore>, news_base_url: Option<Arc<str>>, jid: String, show: String) {
    tokio::spawn(async move {
        tokio::time::sleep(DIGEST_DELAY).await;
        if let Err(error) = page_notify(&session, &news, news_base_url.as_deref(), &jid, &show).await {
            warn!(%error, %jid, "failed to send page notify digest");
        }
    });
}

async fn page_notify(
    session: &SessionHandle,
    news: &NewsStore,
    news_base_url: Option<&str>,
    jid: &str,
    show: &str,
) -> anyhow::Result<()> {
    let groups = news.digest_groups(jid, show).await?;
    if groups.is_empty() {
        return Ok(());
    }

    let Ok(to): Result<Jid, _> = jid.parse() else {
        warn!(%jid, "top resource jid is not a valid jid, skipping digest");
        return Ok(());
    };

    for group in &groups {
        let title = "New news on Mim\u{ed}r!".to_string();
        let link = news_base_url.map(|base| {
            let scheme = if group.ssl { "https" } else { "http" };
            format!("{}{}", scheme_prefix(base, scheme), base)
        });

        let mut description = if group.unread_count == 1 {
            "There is 1 new item".to_string()
        } else {
            format!("There are {} new items", group.unread_count)
        };
        description.push_str(" on your news page");

        let message = build_notification(
            to.clone(),
            &group.message_type,
            &title,
            link.as_deref().unwrap_or(""),
            Some(&description),
            true,
        );
        session.send(message);
    }

    news.mark_notified(jid).await?;
    Ok(())
}

/// `news_base_url` is stored without a scheme (it's a host/path, e.g.
/// `mimir.example.org/news`); this picks `http://` or `https://` per the
/// subscriber's `ssl` preference unless the configured value already
/// carries its own scheme.
fn scheme_prefix(base: &str, scheme: &str) -> String {
    if base.contains("://") {
        String::new()
    } else {
        format!("{scheme}://")
    }
}
