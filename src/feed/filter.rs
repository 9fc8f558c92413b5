//! Per-feed include/exclude rules.
//!
//! The filter decides whether a *new* item is notified. It never affects
//! state: suppressed items are still marked seen by the processor.

use chrono::{DateTime, Utc};
use regex::Regex;

/// A compiled regular expression remembering its source text.
///
/// An expression that fails to compile is kept as a pattern that never
/// matches, so a typo in an `include` option suppresses rather than floods.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Option<Regex>,
}

impl Pattern {
    pub fn new(source: &str) -> Self {
        let regex = match Regex::new(source) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern = %source, error = %e, "Invalid filter pattern, it will never match");
                None
            }
        };
        Self {
            source: source.to_owned(),
            regex,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.regex.as_ref().is_some_and(|re| re.is_match(haystack))
    }
}

/// Why an item was held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    ExcludeTitle,
    Exclude,
    NoIncludeMatch,
    TooOld,
}

/// The filter options of a single feed.
#[derive(Debug, Clone, Default)]
pub struct FilterRules {
    pub exclude_title: Vec<Pattern>,
    pub exclude: Vec<Pattern>,
    pub include_title: Vec<Pattern>,
    pub include: Vec<Pattern>,
    /// Maximum item age in days.
    pub exclude_older_days: Option<f64>,
}

impl FilterRules {
    /// True when no rule is configured and every item passes.
    pub fn is_empty(&self) -> bool {
        self.exclude_title.is_empty()
            && self.exclude.is_empty()
            && self.include_title.is_empty()
            && self.include.is_empty()
            && self.exclude_older_days.is_none()
    }

    /// Returns the first rule that suppresses the item, if any.
    ///
    /// Rules are checked in a fixed order: `exclude-title`, `exclude`, the
    /// include family (`include-title` against the title, `include` against
    /// the content, any match admits), then `exclude-older`.
    ///
    /// `published_at` is an RFC 2822 date. A missing or unparseable date never
    /// suppresses an item.
    pub fn suppression(
        &self,
        title: &str,
        content: &str,
        published_at: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<Suppression> {
        if self.exclude_title.iter().any(|p| p.is_match(title)) {
            return Some(Suppression::ExcludeTitle);
        }

        if self.exclude.iter().any(|p| p.is_match(content)) {
            return Some(Suppression::Exclude);
        }

        if !self.include_title.is_empty() || !self.include.is_empty() {
            let admitted = self.include_title.iter().any(|p| p.is_match(title))
                || self.include.iter().any(|p| p.is_match(content));
            if !admitted {
                return Some(Suppression::NoIncludeMatch);
            }
        }

        if let Some(days) = self.exclude_older_days {
            if is_older_than(published_at, days, now) {
                return Some(Suppression::TooOld);
            }
        }

        None
    }

    /// Convenience wrapper over [`FilterRules::suppression`].
    pub fn should_suppress(
        &self,
        title: &str,
        content: &str,
        published_at: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        self.suppression(title, content, published_at, now).is_some()
    }
}

fn is_older_than(published_at: Option<&str>, days: f64, now: DateTime<Utc>) -> bool {
    let Some(raw) = published_at else {
        tracing::debug!("Item has no publication date, age filter skipped");
        return false;
    };

    let published = match DateTime::parse_from_rfc2822(raw) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(e) => {
            tracing::warn!(published = %raw, error = %e, "Failed to parse publication date, age filter skipped");
            return false;
        }
    };

    let age_ms = (now - published).num_milliseconds() as f64;
    age_ms > days * 86_400_000.0
}
