//! The feed list: which feeds to poll and how.
//!
//! A subscription is a feed URL plus an ordered list of `name:value`
//! options. Names may repeat (several `exclude-title` patterns, say), so the
//! raw options are kept as a list rather than a map and are only turned into
//! typed [`FeedOptions`] once per run.
//!
//! - [`file`] - the `feeds.txt` text format
//! - [`options`] - typed per-feed options
//! - [`opml`] - OPML import/export

pub mod file;
pub mod opml;
pub mod options;

pub use file::SubscriptionError;
pub use opml::{OpmlError, OpmlFeed};
pub use options::{parse_notify, FeedOptions, OptionDefaults, DEFAULT_USER_AGENT};

/// A single `name:value` option attached to a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedOption {
    pub name: String,
    pub value: String,
}

/// A configured feed: its URL and the options written beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    pub url: String,
    pub options: Vec<FeedOption>,
}

impl FeedConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: Vec::new(),
        }
    }

    /// Builder-style helper used by tests and the `add` command.
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push(FeedOption {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// All values for `name`, in file order. Names compare case-insensitively.
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.options
            .iter()
            .filter(move |opt| opt.name.eq_ignore_ascii_case(name))
            .map(|opt| opt.value.as_str())
    }
}
