//! Canonical item form: unique state keys and sanitised HTML.

use std::collections::HashSet;
use std::sync::OnceLock;

use ammonia::{Builder, UrlRelative};
use regex::Regex;
use url::Url;

use super::parser::ParsedEntry;

/// An entry ready for filtering, state tracking and delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedItem {
    /// State key. Unique within the feed whenever the GUIDs are.
    pub link: String,
    pub guid: String,
    pub title: String,
    /// Content exactly as the feed delivered it.
    pub raw_content: String,
    /// Sanitised content with absolute URLs; filters match against this.
    pub content: String,
    /// RFC 2822 publication date.
    pub published_at: Option<String>,
    pub tag: Option<String>,
}

/// Normalises one feed's entries.
///
/// If any two entries share a link, every link in the feed is rewritten to
/// `link#guid` so that distinct entries never collapse into one state key.
/// The rewrite is all-or-nothing for the whole feed, which keeps keys stable
/// between runs as long as the feed keeps containing a duplicate.
pub fn normalize(feed_url: &str, entries: Vec<ParsedEntry>, tag: Option<&str>) -> Vec<NormalizedItem> {
    let mut links = HashSet::with_capacity(entries.len());
    let has_duplicates = !entries.iter().all(|e| links.insert(e.link.as_str()));

    if has_duplicates {
        tracing::info!(feed = %feed_url, "Feed contains duplicate links, keying items by link#guid");
    }

    entries
        .into_iter()
        .map(|entry| {
            let content = sanitize_html(&entry.content, &entry.link);
            let link = if has_duplicates {
                format!("{}#{}", entry.link, entry.guid)
            } else {
                entry.link
            };

            NormalizedItem {
                link,
                guid: entry.guid,
                title: entry.title,
                raw_content: entry.content,
                content,
                published_at: entry.published,
                tag: tag.map(str::to_owned),
            }
        })
        .collect()
}

// ============================================================================
// HTML sanitising
// ============================================================================

const PRESENTATION_ATTRIBUTES: &[&str] = &["class", "style", "id", "align", "width", "height"];

static IFRAME_OPEN: OnceLock<Option<Regex>> = OnceLock::new();
static IFRAME_CLOSE: OnceLock<Option<Regex>> = OnceLock::new();

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "Failed to compile sanitiser regex");
            None
        }
    })
    .as_ref()
}

/// Replaces every `<iframe src=...>` with a plain link to its source.
fn collapse_iframes(html: &str) -> String {
    let Some(open) = compiled(
        &IFRAME_OPEN,
        r#"(?is)<iframe\b[^>]*?\bsrc\s*=\s*["']([^"']*)["'][^>]*>"#,
    ) else {
        return html.to_owned();
    };

    let linked = open.replace_all(html, r#"<a href="$1">$1</a>"#);

    match compiled(&IFRAME_CLOSE, r"(?i)</iframe\s*>") {
        Some(close) => close.replace_all(&linked, "").into_owned(),
        None => linked.into_owned(),
    }
}

/// Cleans item HTML for display and filtering.
///
/// Scripts (and their bodies) are removed, iframes become links, and relative
/// `href`/`src` attributes are resolved against `base`, the item's own link.
/// Presentation markup survives (`<style>` elements and `class`, `style` or
/// `id` attributes) and no `rel` is added to links; `exclude` patterns match
/// against this output.
pub fn sanitize_html(html: &str, base: &str) -> String {
    if html.is_empty() {
        return String::new();
    }

    let html = collapse_iframes(html);

    let mut builder = Builder::default();
    builder
        .add_generic_attributes(PRESENTATION_ATTRIBUTES)
        .rm_clean_content_tags(&["style"])
        .add_tags(&["style"])
        .link_rel(None);
    match Url::parse(base) {
        Ok(base) => {
            builder.url_relative(UrlRelative::RewriteWithBase(base));
        }
        Err(_) => {
            builder.url_relative(UrlRelative::PassThrough);
        }
    }
    builder.clean(&html).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::filter::{FilterRules, Pattern, Suppression};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn entry(link: &str, guid: &str) -> ParsedEntry {
        ParsedEntry {
            link: link.to_string(),
            guid: guid.to_string(),
            title: format!("title {guid}"),
            content: String::new(),
            published: None,
        }
    }

    #[test]
    fn test_unique_links_are_untouched() {
        let items = normalize(
            "https://example.com/feed",
            vec![entry("https://example.com/a", "1"), entry("https://example.com/b", "2")],
            None,
        );
        let links: Vec<_> = items.iter().map(|i| i.link.as_str()).collect();
        assert_eq!(links, vec!["https://example.com/a", "https://example.com/b"]);
    }

    #[test]
    fn test_duplicate_links_rewrite_every_item() {
        let items = normalize(
            "https://example.com/feed",
            vec![
                entry("https://example.com/L", "g1"),
                entry("https://example.com/L", "g2"),
                entry("https://example.com/other", "g3"),
            ],
            Some("news"),
        );
        let links: Vec<_> = items.iter().map(|i| i.link.as_str()).collect();
        assert_eq!(
            links,
            vec![
                "https://example.com/L#g1",
                "https://example.com/L#g2",
                "https://example.com/other#g3",
            ]
        );
        assert!(items.iter().all(|i| i.tag.as_deref() == Some("news")));
    }

    #[test]
    fn test_sanitize_removes_script() {
        let out = sanitize_html(
            "<p>hi</p><script>alert('x')</script>",
            "https://example.com/post",
        );
        assert!(out.contains("<p>hi</p>"));
        assert!(!out.contains("script"));
        assert!(!out.contains("alert"));
    }

    #[test]
    fn test_sanitize_resolves_relative_urls() {
        let out = sanitize_html(
            r#"<a href="/about">about</a><img src="img/a.png">"#,
            "https://example.com/blog/post",
        );
        assert!(out.contains(r#"href="https://example.com/about""#));
        assert!(out.contains(r#"src="https://example.com/blog/img/a.png""#));
    }

    #[test]
    fn test_sanitize_collapses_iframe() {
        let out = sanitize_html(
            r#"<p>watch</p><iframe width="560" src="https://video.example.com/embed/1"></iframe>"#,
            "https://example.com/post",
        );
        assert!(!out.contains("iframe"));
        assert!(out.contains(r#"href="https://video.example.com/embed/1""#));
    }

    #[test]
    fn test_sanitize_keeps_presentation() {
        let out = sanitize_html(
            r#"<style>.ad{display:none}</style><div class="sponsored" style="color:red"><p>x</p></div><a href="/p">p</a><script>track()</script>"#,
            "https://example.com/post",
        );
        assert!(out.contains("<style>.ad{display:none}</style>"), "{out}");
        assert!(out.contains(r#"<div class="sponsored" style="color:red">"#), "{out}");
        assert!(out.contains(r#"<a href="https://example.com/p">p</a>"#), "{out}");
        assert!(!out.contains("rel="), "{out}");
        assert!(!out.contains("track()"), "{out}");
    }

    #[test]
    fn test_exclude_on_class_name_sees_sanitised_content() {
        let content = sanitize_html(
            r#"<div class="sponsored"><p>Buy now</p></div>"#,
            "https://example.com/post",
        );
        let rules = FilterRules {
            exclude: vec![Pattern::new(r#"class="sponsored""#)],
            ..FilterRules::default()
        };
        assert_eq!(
            rules.suppression("Title", &content, None, Utc::now()),
            Some(Suppression::Exclude)
        );
    }

    #[test]
    fn test_raw_content_is_preserved() {
        let mut e = entry("https://example.com/a", "1");
        e.content = "<script>x</script><b>bold</b>".to_string();
        let items = normalize("https://example.com/feed", vec![e], None);
        assert_eq!(items[0].raw_content, "<script>x</script><b>bold</b>");
        assert_eq!(items[0].content, "<b>bold</b>");
    }

    proptest! {
        #[test]
        fn prop_keys_unique_when_guids_unique(links in proptest::collection::vec(0u8..4, 1..20)) {
            let entries: Vec<_> = links
                .iter()
                .enumerate()
                .map(|(i, l)| entry(&format!("https://example.com/{l}"), &i.to_string()))
                .collect();
            let count = entries.len();
            let items = normalize("https://example.com/feed", entries, None);
            let keys: HashSet<_> = items.iter().map(|i| i.link.clone()).collect();
            prop_assert_eq!(keys.len(), count);
        }
    }
}
