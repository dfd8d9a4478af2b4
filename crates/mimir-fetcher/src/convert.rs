//! Conversion from `feed_rs`'s parsed model into the crate-wide
//! [`mimir_core`] record types, and the one entry point ([`parse_bytes`])
//! both the HTTP fetcher and anything else that sees raw Atom/RSS bytes
//! (the Monitor re-wraps pub-sub items into an Atom document and parses
//! them the same way) should go through.

use feed_rs::model as feed_model;
use mimir_core::{Category, Entry, FeedMeta, Link, Person, TextContent};

use crate::error::Result;

/// `(feed metadata, entries, bozo, bozo_exception)`, matching the source's
/// `feedparser` bozo-flag convention: a parse failure doesn't abort the
/// caller, it degrades to an empty feed with the flag set.
pub fn parse_bytes(bytes: &[u8]) -> (FeedMeta, Vec<Entry>, bool, Option<String>) {
    match feed_rs::parser::parse(bytes) {
        Ok(parsed) => {
            let feed = convert_feed_meta(&parsed);
            let entries = parsed.entries.iter().map(convert_entry).collect();
            (feed, entries, false, None)
        }
        Err(error) => (FeedMeta::default(), Vec::new(), true, Some(error.to_string())),
    }
}

/// Like [`parse_bytes`], but surfaces the parse error instead of degrading
/// to a bozo result. The Monitor uses this: a pub-sub item it can't
/// re-parse as Atom is a logged-and-skipped defect, not a feed-wide bozo
/// flag (there is no feed-wide snapshot to flag).
pub fn parse_bytes_strict(bytes: &[u8]) -> Result<(FeedMeta, Vec<Entry>)> {
    let parsed = feed_rs::parser::parse(bytes)?;
    let feed = convert_feed_meta(&parsed);
    let entries = parsed.entries.iter().map(convert_entry).collect();
    Ok((feed, entries))
}

fn convert_feed_meta(feed: &feed_model::Feed) -> FeedMeta {
    FeedMeta {
        title: feed.title.as_ref().map(|t| t.content.clone()),
        subtitle: feed.description.as_ref().map(|t| TextContent {
            value: t.content.clone(),
            mime_type: "text/plain".to_string(),
            language: None,
            base: None,
        }),
        links: feed.links.iter().map(convert_link).collect(),
    }
}

fn convert_entry(entry: &feed_model::Entry) -> Entry {
    let id = if entry.id.is_empty() {
        entry.links.first().map(|l| l.href.clone()).unwrap_or_default()
    } else {
        entry.id.clone()
    };

    Entry {
        id,
        title: entry.title.as_ref().map(convert_text),
        link: entry.links.first().map(|l| l.href.clone()),
        links: entry.links.iter().map(convert_link).collect(),
        summary: entry.summary.as_ref().map(convert_text),
        content: entry
            .content
            .as_ref()
            .and_then(|c| c.body.as_ref().map(|body| (body.clone(), c.content_type.to_string())))
            .map(|(value, mime_type)| {
                vec![TextContent {
                    value,
                    mime_type,
                    language: None,
                    base: None,
                }]
            })
            .unwrap_or_default(),
        author: entry.authors.first().map(convert_person),
        contributors: entry.contributors.iter().map(convert_person).collect(),
        categories: entry.categories.iter().map(convert_category).collect(),
        updated: entry.updated,
        published: entry.published,
        created: None,
        feedburner_origlink: None,
    }
}

fn convert_text(text: &feed_model::Text) -> TextContent {
    TextContent {
        value: text.content.clone(),
        mime_type: text.content_type.to_string(),
        language: None,
        base: None,
    }
}

fn convert_link(link: &feed_model::Link) -> Link {
    Link {
        href: link.href.clone(),
        rel: link.rel.clone(),
        mime_type: link.media_type.clone(),
        hreflang: link.href_lang.clone(),
        title: link.title.clone(),
        length: link.length.map(|l| l.to_string()),
    }
}

fn convert_person(person: &feed_model::Person) -> Person {
    Person {
        name: Some(person.name.clone()),
        uri: person.uri.clone(),
        email: person.email.clone(),
    }
}

fn convert_category(category: &feed_model::Category) -> Category {
    Category {
        term: Some(category.term.clone()),
        scheme: category.scheme.clone(),
        label: category.label.clone(),
    }
}
