use mimir_core::{Entry, TextContent};
use minidom::Element;
use thiserror::Error;

const NS_ATOM: &str = "http://www.w3.org/2005/Atom";
const NS_FEEDBURNER: &str = "http://rssnamespace.org/feedburner/ext/1.0";

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("entry has no id")]
    MissingId,
}

/// Serialises an [`Entry`] to an outbound pub-sub item payload.
///
/// Generalizes `writer.py`'s `AtomWriter.generate`/`_generate_*` dispatch:
/// the source iterates over whatever keys happen to be present on the
/// feedparser dict and dynamically looks up a `_generate_<key>` method per
/// key. Rust has no dynamic per-field dispatch, so this does the same
/// field-by-field translation directly against `Entry`'s fixed shape.
pub trait EntryWriter {
    fn write(&self, entry: &Entry) -> Result<Element, WriteError>;
}

/// The only writer shipped: a hand-rolled, field-by-field Atom `<entry>`
/// builder. The source's second writer (`ReconstituteWriter`, which shells
/// out to a separate Python package) has no available Rust equivalent and
/// is out of scope.
pub struct AtomWriter;

impl EntryWriter for AtomWriter {
    fn write(&self, entry: &Entry) -> Result<Element, WriteError> {
        if entry.id.is_empty() {
            return Err(WriteError::MissingId);
        }

        let mut element = Element::builder("entry", NS_ATOM).build();

        element.append_child(text_element("id", &entry.id));

        if let Some(title) = &entry.title {
            element.append_child(generate_text("title", title));
        }

        if let Some(link) = entry.effective_link() {
            if entry.feedburner_origlink.is_some() {
                element.append_child(
                    Element::builder("origLink", NS_FEEDBURNER).append(link).build(),
                );
            }
        }

        for link in &entry.links {
            element.append_child(generate_link(link));
        }

        if let Some(summary) = &entry.summary {
            element.append_child(generate_text("summary", summary));
        }

        for content in &entry.content {
            element.append_child(generate_text("content", content));
        }

        if let Some(author) = &entry.author {
            element.append_child(generate_person("author", author));
        }

        for contributor in &entry.contributors {
            element.append_child(generate_person("contributor", contributor));
        }

        for category in &entry.categories {
            element.append_child(generate_category(category));
        }

        if let Some(updated) = entry.updated {
            element.append_child(text_element("updated", &updated.to_rfc3339()));
        }

        if let Some(published) = entry.published {
            element.append_child(text_element("published", &published.to_rfc3339()));
        }

        Ok(element)
    }
}

fn text_element(name: &str, value: &str) -> Element {
    Element::builder(name, NS_ATOM).append(value).build()
}

fn generate_text(name: &str, text: &TextContent) -> Element {
    if text.value.is_empty() {
        return Element::builder(name, NS_ATOM).build();
    }

    let kind = if text.mime_type == "text/plain" { "text" } else { "html" };
    let mut builder = Element::builder(name, NS_ATOM).attr("type", kind);
    if let Some(language) = &text.language {
        builder = builder.attr("xml:lang", language);
    }
    if let Some(base) = &text.base {
        builder = builder.attr("xml:base", base);
    }
    builder.append(text.value.as_str()).build()
}

fn generate_link(link: &mimir_core::Link) -> Element {
    let mut builder = Element::builder("link", NS_ATOM).attr("href", &link.href);
    if let Some(rel) = &link.rel {
        builder = builder.attr("rel", rel.as_str());
    }
    if let Some(mime_type) = &link.mime_type {
        builder = builder.attr("type", mime_type.as_str());
    }
    if let Some(hreflang) = &link.hreflang {
        builder = builder.attr("hreflang", hreflang.as_str());
    }
    if let Some(title) = &link.title {
        builder = builder.attr("title", title.as_str());
    }
    if let Some(length) = &link.length {
        builder = builder.attr("length", length.as_str());
    }
    builder.build()
}

fn generate_person(name: &str, person: &mimir_core::Person) -> Element {
    let mut element = Element::builder(name, NS_ATOM).build();
    if let Some(name) = &person.name {
        element.append_child(text_element("name", name));
    }
    if let Some(uri) = &person.uri {
        element.append_child(text_element("uri", uri));
    }
    if let Some(email) = &person.email {
        element.append_child(text_element("email", email));
    }
    element
}

fn generate_category(category: &mimir_core::Category) -> Element {
    let mut builder = Element::builder("category", NS_ATOM);
    if let Some(term) = &category.term {
        builder = builder.attr("term", term.as_str());
    }
    if let Some(scheme) = &category.scheme {
        builder = builder.attr("scheme", scheme.as_str());
    }
    if let Some(label) = &category.label {
        builder = builder.attr("label", label.as_str());
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn writes_id_and_title() {
        let element = AtomWriter.write(&entry()).unwrap();
        assert_eq!(element.name(), "entry");
        assert_eq!(element.get_child("id", NS_ATOM).unwrap().text(), "urn:uuid:1");
        assert_eq!(element.get_child("title", NS_ATOM).unwrap().text(), "Hello");
    }

    #[test]
    fn rejects_entry_without_id() {
        let mut e = entry();
        e.id = String::new();
        assert!(matches!(AtomWriter.write(&e), Err(WriteError::MissingId)));
    }
}
