use feed_rs::parser;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The feed body could not be read as Atom, RSS or JSON Feed.
#[derive(Debug, Error)]
#[error("Feed parse error: {0}")]
pub struct ParseError(#[from] parser::ParseFeedError);

/// One entry as it came out of the feed, before normalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntry {
    pub link: String,
    pub guid: String,
    pub title: String,
    /// Raw HTML content (or summary when no content is present).
    pub content: String,
    /// RFC 2822 publication (or last update) date.
    pub published: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: String,
    pub link: Option<String>,
    pub entries: Vec<ParsedEntry>,
}

/// Parses a feed body into its entries, preserving document order.
///
/// # Errors
///
/// Returns [`ParseError`] if the bytes are not a recognisable feed document.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let feed = parser::parse(bytes)?;

    let entries = feed
        .entries
        .into_iter()
        .map(|entry| {
            let url = entry.links.first().map(|l| l.href.trim().to_string());
            let published = entry.published.or(entry.updated);
            let title = entry.title.map(|t| t.content).unwrap_or_default();
            let content = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content))
                .unwrap_or_default();

            let guid = generate_guid(
                Some(entry.id.as_str()),
                url.as_deref(),
                &title,
                published.map(|dt| dt.timestamp()),
            );

            ParsedEntry {
                link: url.filter(|u| !u.is_empty()).unwrap_or_else(|| guid.clone()),
                guid,
                title,
                content,
                published: published.map(|dt| dt.to_rfc2822()),
            }
        })
        .collect();

    Ok(ParsedFeed {
        title: feed.title.map(|t| t.content).unwrap_or_default(),
        link: feed.links.first().map(|l| l.href.clone()),
        entries,
    })
}

/// Uses the feed's own id when present, otherwise a stable hash of the
/// entry's link, title and date.
fn generate_guid(
    existing: Option<&str>,
    url: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Example News</title>
    <link>https://example.com/</link>
    <item>
        <guid>item-1</guid>
        <title>First</title>
        <link>https://example.com/1</link>
        <description>&lt;p&gt;Hello&lt;/p&gt;</description>
        <pubDate>Sat, 15 Jun 2024 10:00:00 +0000</pubDate>
    </item>
    <item>
        <title>No guid</title>
        <link>https://example.com/2</link>
    </item>
</channel></rss>"#;

    #[test]
    fn test_parse_rss() {
        let feed = parse_feed(RSS.as_bytes()).unwrap();
        assert_eq!(feed.title, "Example News");
        assert_eq!(feed.entries.len(), 2);

        let first = &feed.entries[0];
        assert_eq!(first.guid, "item-1");
        assert_eq!(first.title, "First");
        assert_eq!(first.link, "https://example.com/1");
        assert_eq!(first.content, "<p>Hello</p>");
        assert!(first.published.as_deref().unwrap().contains("15 Jun 2024"));
    }

    #[test]
    fn test_entry_without_id_gets_stable_guid() {
        let a = parse_feed(RSS.as_bytes()).unwrap();
        let b = parse_feed(RSS.as_bytes()).unwrap();
        assert!(!a.entries[1].guid.is_empty());
        assert_eq!(a.entries[1].guid, b.entries[1].guid);
    }

    #[test]
    fn test_parse_atom_prefers_content() {
        let atom = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Example</title>
  <id>urn:feed</id>
  <updated>2024-06-15T10:00:00Z</updated>
  <entry>
    <id>urn:entry:1</id>
    <title>Entry</title>
    <link href="https://example.com/atom/1"/>
    <updated>2024-06-15T10:00:00Z</updated>
    <summary>short</summary>
    <content type="html">&lt;b&gt;long&lt;/b&gt;</content>
  </entry>
</feed>"#;
        let feed = parse_feed(atom.as_bytes()).unwrap();
        assert_eq!(feed.entries.len(), 1);
        assert_eq!(feed.entries[0].guid, "urn:entry:1");
        assert_eq!(feed.entries[0].content, "<b>long</b>");
        assert!(feed.entries[0].published.is_some());
    }

    #[test]
    fn test_invalid_document() {
        assert!(parse_feed(b"<not valid xml").is_err());
        assert!(parse_feed(b"").is_err());
    }

    #[test]
    fn test_generate_guid_trims_existing() {
        assert_eq!(generate_guid(Some("  abc "), None, "t", None), "abc");
        assert_ne!(
            generate_guid(Some(" "), Some("https://a"), "t", None),
            generate_guid(Some(" "), Some("https://b"), "t", None)
        );
    }
}
