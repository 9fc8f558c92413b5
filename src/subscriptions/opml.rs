//! OPML import and export of the feed list.

use std::io::Cursor;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use super::FeedConfig;
use crate::util::validate_url;

/// Maximum allowed nesting depth for OPML outline elements.
const MAX_OPML_DEPTH: usize = 50;

#[derive(Debug, Error)]
pub enum OpmlError {
    /// Outline nesting exceeds the safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Failed to write OPML: {0}")]
    XmlWrite(String),

    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// A feed outline found in an OPML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlFeed {
    /// `title` attribute, falling back to `text`, then to the URL.
    pub title: String,
    pub xml_url: String,
}

/// Reads an OPML file and returns every outline carrying an `xmlUrl`.
///
/// # Errors
///
/// Returns [`OpmlError`] if the file cannot be read or is not well-formed.
pub async fn import(path: &Path) -> Result<Vec<OpmlFeed>, OpmlError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_opml(&content)
}

/// Extracts feeds from OPML text, descending into folder outlines.
///
/// Outlines whose `xmlUrl` is not an http(s) URL are skipped with a warning.
/// quick-xml never expands `<!ENTITY>` declarations, so custom entities are
/// rejected rather than resolved.
pub fn parse_opml(content: &str) -> Result<Vec<OpmlFeed>, OpmlError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut feeds = Vec::new();
    let mut buf = Vec::new();
    let mut depth: usize = 0;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                if let Some(feed) = outline_feed(&e, &reader)? {
                    feeds.push(feed);
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                if let Some(feed) = outline_feed(&e, &reader)? {
                    feeds.push(feed);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(feeds)
}

fn outline_feed(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Option<OpmlFeed>, OpmlError> {
    let mut xml_url = None;
    let mut title = None;
    let mut text = None;

    for attr in e.attributes() {
        let attr = match attr {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = || {
            attr.decode_and_unescape_value(reader.decoder())
                .map(|v| v.into_owned())
                .map_err(|e| OpmlError::XmlParse(e.to_string()))
        };
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(value()?),
            b"title" => title = Some(value()?),
            b"text" => text = Some(value()?),
            _ => {}
        }
    }

    let Some(url) = xml_url else {
        return Ok(None);
    };

    match validate_url(&url) {
        Ok(_) => Ok(Some(OpmlFeed {
            title: title.or(text).unwrap_or_else(|| url.clone()),
            xml_url: url.trim().to_owned(),
        })),
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Skipping invalid feed URL");
            Ok(None)
        }
    }
}

/// Renders the feed list as an OPML 2.0 document.
pub fn export_opml(feeds: &[FeedConfig]) -> Result<String, OpmlError> {
    fn write(writer: &mut Writer<Cursor<Vec<u8>>>, event: Event<'_>) -> Result<(), OpmlError> {
        writer
            .write_event(event)
            .map_err(|e| OpmlError::XmlWrite(e.to_string()))
    }

    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    write(&mut writer, Event::Start(opml))?;

    write(&mut writer, Event::Start(BytesStart::new("head")))?;
    write(&mut writer, Event::Start(BytesStart::new("title")))?;
    write(&mut writer, Event::Text(BytesText::new("feedmail subscriptions")))?;
    write(&mut writer, Event::End(BytesEnd::new("title")))?;
    write(&mut writer, Event::End(BytesEnd::new("head")))?;

    write(&mut writer, Event::Start(BytesStart::new("body")))?;
    for feed in feeds {
        let mut outline = BytesStart::new("outline");
        outline.push_attribute(("type", "rss"));
        outline.push_attribute(("text", feed.url.as_str()));
        outline.push_attribute(("xmlUrl", feed.url.as_str()));
        write(&mut writer, Event::Empty(outline))?;
    }
    write(&mut writer, Event::End(BytesEnd::new("body")))?;
    write(&mut writer, Event::End(BytesEnd::new("opml")))?;

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| OpmlError::XmlWrite(e.to_string()))
}
