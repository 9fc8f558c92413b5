//! Message templates.
//!
//! A template is the complete raw message: headers, a blank line, then the
//! body, with `{{field}}` placeholders and optional `| filter` chains. The
//! built-in template sends a multipart/alternative message with a text and
//! an HTML part; `email.tmpl` in the config directory replaces it, and a
//! feed's `template` option replaces it for that feed alone.

use std::borrow::Cow;
use std::path::Path;

use chrono::Utc;
use lettre::message::header::ContentTransferEncoding;
use lettre::message::Body;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{DeliveryError, FeedContext, Notification};
use crate::feed::NormalizedItem;

/// Subject used when the config does not supply one.
pub const DEFAULT_SUBJECT: &str = "[rss2email] {{tag}}{{title}}";

/// The built-in message template.
pub const DEFAULT_TEMPLATE: &str = include_str!("email.tmpl");

/// File name of the template override in the config directory.
pub const TEMPLATE_FILE: &str = "email.tmpl";

const TEXT_WIDTH: usize = 80;

// Encoded-word payload, leaving room for "=?utf-8?q?" and "?=" in 75 chars
const MAX_ENCODED_WORD: usize = 63;

// ============================================================================
// Subject
// ============================================================================

/// Expands subject placeholders.
///
/// | placeholder      | value                               |
/// |------------------|-------------------------------------|
/// | `{{title}}`      | item title                          |
/// | `{{link}}`       | item link                           |
/// | `{{tag}}`        | `[tag] ` when tagged, else nothing  |
/// | `{{feed}}`       | feed URL                            |
/// | `{{feed_title}}` | feed title                          |
pub fn render_subject(template: &str, feed: &FeedContext, item: &NormalizedItem) -> String {
    let subject = template
        .replace("{{feed_title}}", &feed.title)
        .replace("{{feed}}", &feed.url)
        .replace("{{title}}", &item.title)
        .replace("{{link}}", &item.link)
        .replace("{{tag}}", &tag_prefix(item));

    one_line(&subject)
}

fn tag_prefix(item: &NormalizedItem) -> String {
    item.tag
        .as_deref()
        .filter(|t| !t.is_empty())
        .map(|t| format!("[{t}] "))
        .unwrap_or_default()
}

fn one_line(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Plain-text rendering of an HTML body, wrapped at 80 columns.
pub fn text_body(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), TEXT_WIDTH) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to render text body, using HTML as-is");
            html.to_owned()
        }
    }
}

// ============================================================================
// Template
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("line {line}: placeholder is never closed")]
    Unclosed { line: usize },

    #[error("line {line}: unknown field '{name}'")]
    UnknownField { line: usize, name: String },

    #[error("line {line}: unknown filter '{name}'")]
    UnknownFilter { line: usize, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    From,
    To,
    Subject,
    Title,
    Link,
    Guid,
    Tag,
    Date,
    Feed,
    FeedTitle,
    FeedLink,
    Text,
    Html,
    Boundary,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "from" => Field::From,
            "to" => Field::To,
            "subject" => Field::Subject,
            "title" => Field::Title,
            "link" => Field::Link,
            "guid" => Field::Guid,
            "tag" => Field::Tag,
            "date" => Field::Date,
            "feed" => Field::Feed,
            "feed_title" => Field::FeedTitle,
            "feed_link" => Field::FeedLink,
            "text" => Field::Text,
            "html" => Field::Html,
            "boundary" => Field::Boundary,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Filter {
    QuotedPrintable,
    Header,
    Html,
}

impl Filter {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "qp" => Some(Filter::QuotedPrintable),
            "header" => Some(Filter::Header),
            "html" => Some(Filter::Html),
            _ => None,
        }
    }

    fn apply(self, value: &str) -> String {
        match self {
            Filter::QuotedPrintable => quoted_printable(value),
            Filter::Header => encode_header(value),
            Filter::Html => escape_html(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Field(Field),
    Env(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Value { source: Source, filters: Vec<Filter> },
}

/// A parsed message template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    segments: Vec<Segment>,
}

impl Default for MessageTemplate {
    fn default() -> Self {
        // The built-in template always parses
        Self::parse(DEFAULT_TEMPLATE).unwrap_or_else(|_| Self {
            segments: vec![Segment::Literal(DEFAULT_TEMPLATE.to_owned())],
        })
    }
}

impl MessageTemplate {
    /// Parses template text.
    ///
    /// `{{! ...}}` is a comment; a newline right after one is dropped too.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] for an unclosed placeholder or an unknown
    /// field or filter.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut line = 1;

        while let Some(start) = rest.find("{{") {
            let literal = &rest[..start];
            if !literal.is_empty() {
                segments.push(Segment::Literal(literal.to_owned()));
            }
            line += literal.matches('\n').count();

            let tail = &rest[start + 2..];
            let end = tail.find("}}").ok_or(TemplateError::Unclosed { line })?;
            let tag = &tail[..end];
            rest = &tail[end + 2..];

            if tag.starts_with('!') {
                line += tag.matches('\n').count();
                if let Some(after) = rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n')) {
                    rest = after;
                    line += 1;
                }
                continue;
            }

            segments.push(parse_placeholder(tag, line)?);
            line += tag.matches('\n').count();
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_owned()));
        }
        Ok(Self { segments })
    }

    /// Reads and parses a template file.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::TemplateRead`] if the file cannot be read and
    /// [`DeliveryError::TemplateSyntax`] if it does not parse.
    pub async fn load(path: &Path) -> Result<Self, DeliveryError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| DeliveryError::TemplateRead {
                path: path.to_owned(),
                source,
            })?;
        Self::parse(&content).map_err(|source| DeliveryError::TemplateSyntax {
            path: path.to_owned(),
            source,
        })
    }

    /// The template every feed uses unless it names its own: `email.tmpl`
    /// in `dir` when present, the built-in one otherwise.
    ///
    /// # Errors
    ///
    /// As [`MessageTemplate::load`], except that a missing file is not one.
    pub async fn from_dir(dir: &Path) -> Result<Self, DeliveryError> {
        let path = dir.join(TEMPLATE_FILE);
        match tokio::fs::metadata(&path).await {
            Ok(_) => {
                tracing::debug!(path = %path.display(), "Using message template override");
                Self::load(&path).await
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(DeliveryError::TemplateRead { path, source }),
        }
    }

    /// Renders the raw message for one recipient, with CRLF line endings.
    pub fn render(&self, notification: &Notification, from: &str, to: &str) -> String {
        let values = Values {
            notification,
            from,
            to,
            date: Utc::now().to_rfc2822(),
            boundary: boundary(&notification.item),
        };

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Value { source, filters } => {
                    let value = filters
                        .iter()
                        .fold(values.get(source), |value, filter| Cow::Owned(filter.apply(&value)));
                    out.push_str(&value);
                }
            }
        }
        crlf(&out)
    }
}

fn parse_placeholder(tag: &str, line: usize) -> Result<Segment, TemplateError> {
    let mut parts = tag.split('|').map(str::trim);
    let head = parts.next().unwrap_or_default();

    let source = match head.strip_prefix("env:") {
        Some(name) => Source::Env(name.trim().to_owned()),
        None => Source::Field(Field::parse(head).ok_or_else(|| TemplateError::UnknownField {
            line,
            name: head.to_owned(),
        })?),
    };

    let filters = parts
        .map(|name| {
            Filter::parse(name).ok_or_else(|| TemplateError::UnknownFilter {
                line,
                name: name.to_owned(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Segment::Value { source, filters })
}

struct Values<'a> {
    notification: &'a Notification,
    from: &'a str,
    to: &'a str,
    date: String,
    boundary: String,
}

impl Values<'_> {
    fn get(&self, source: &Source) -> Cow<'_, str> {
        let n = self.notification;
        match source {
            Source::Env(name) => Cow::Owned(std::env::var(name).unwrap_or_default()),
            Source::Field(field) => match field {
                Field::From => Cow::Borrowed(self.from),
                Field::To => Cow::Borrowed(self.to),
                Field::Subject => Cow::Borrowed(&n.subject),
                Field::Title => Cow::Borrowed(&n.item.title),
                Field::Link => Cow::Borrowed(&n.item.link),
                Field::Guid => Cow::Borrowed(&n.item.guid),
                Field::Tag => Cow::Owned(tag_prefix(&n.item)),
                Field::Date => Cow::Borrowed(&self.date),
                Field::Feed => Cow::Borrowed(&n.feed.url),
                Field::FeedTitle => Cow::Borrowed(&n.feed.title),
                Field::FeedLink => Cow::Borrowed(n.feed.link.as_deref().unwrap_or_default()),
                Field::Text => Cow::Borrowed(&n.text),
                Field::Html => Cow::Borrowed(&n.html),
                Field::Boundary => Cow::Borrowed(&self.boundary),
            },
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn crlf(value: &str) -> String {
    value.replace("\r\n", "\n").replace('\n', "\r\n")
}

fn boundary(item: &NormalizedItem) -> String {
    let hash = Sha256::digest(format!("{}|{}", item.guid, item.link).as_bytes());
    let hex = format!("{:x}", hash);
    format!("feedmail-{}", &hex[..32])
}

/// Quoted-printable encoding with CRLF hard line breaks.
fn quoted_printable(value: &str) -> String {
    match Body::new_with_encoding(crlf(value), ContentTransferEncoding::QuotedPrintable) {
        Ok(body) => String::from_utf8_lossy(body.as_ref()).into_owned(),
        Err(_) => value.to_owned(),
    }
}

/// RFC 2047 Q encoding of a single-line header value, only when needed.
fn encode_header(value: &str) -> String {
    let line = one_line(value);
    if line.is_ascii() {
        return line;
    }

    let mut words = Vec::new();
    let mut word = String::new();
    for c in line.chars() {
        let mut buf = [0u8; 4];
        let encoded: String = c
            .encode_utf8(&mut buf)
            .bytes()
            .map(|b| match b {
                b' ' => "_".to_owned(),
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'!' | b'*' | b'+' | b'-' | b'/' => {
                    char::from(b).to_string()
                }
                _ => format!("={b:02X}"),
            })
            .collect();

        if word.len() + encoded.len() > MAX_ENCODED_WORD {
            words.push(std::mem::take(&mut word));
        }
        word.push_str(&encoded);
    }
    if !word.is_empty() {
        words.push(word);
    }

    words
        .iter()
        .map(|w| format!("=?utf-8?q?{w}?="))
        .collect::<Vec<_>>()
        .join("\n ")
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
