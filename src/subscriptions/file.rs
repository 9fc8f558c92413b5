//! The `feeds.txt` subscription file.
//!
//! ```text
//! # comments start with a hash
//! https://example.com/feed.xml
//!  - tag:example
//!  - exclude-title:(?i)sponsored
//!
//! https://example.org/rss
//! ```
//!
//! Every non-option line is a feed URL. Lines starting with `-` are
//! `name:value` options for the URL above them, split on the first colon.

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::{FeedConfig, FeedOption};

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: option outside a feed: {text}")]
    OptionOutsideFeed { line: usize, text: String },

    #[error("line {line}: options should be of the form 'key:value', found '{text}' beneath feed {feed}")]
    MalformedOption {
        line: usize,
        text: String,
        feed: String,
    },
}

/// Parses the text of a subscription file.
///
/// # Errors
///
/// Fails on an option that precedes every URL or lacks a `key:value` shape.
pub fn parse(content: &str) -> Result<Vec<FeedConfig>, SubscriptionError> {
    let mut feeds: Vec<FeedConfig> = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        let line_no = idx + 1;

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(option) = line.strip_prefix('-') {
            let Some(feed) = feeds.last_mut() else {
                return Err(SubscriptionError::OptionOutsideFeed {
                    line: line_no,
                    text: raw.to_owned(),
                });
            };

            match option.split_once(':') {
                Some((name, value)) if !name.trim().is_empty() => {
                    feed.options.push(FeedOption {
                        name: name.trim().to_owned(),
                        value: value.trim().to_owned(),
                    });
                }
                _ => {
                    return Err(SubscriptionError::MalformedOption {
                        line: line_no,
                        text: option.trim().to_owned(),
                        feed: feed.url.clone(),
                    });
                }
            }
        } else {
            feeds.push(FeedConfig::new(line));
        }
    }

    Ok(feeds)
}

/// Reads and parses the subscription file at `path`.
///
/// A missing file is an error: treating it as empty would let the next run
/// prune every bucket in the state store.
pub fn load(path: &Path) -> Result<Vec<FeedConfig>, SubscriptionError> {
    let content = std::fs::read_to_string(path).map_err(|source| SubscriptionError::Io {
        path: path.to_owned(),
        source,
    })?;
    parse(&content)
}

/// Serialises feeds in the format [`parse`] reads.
pub fn render(feeds: &[FeedConfig]) -> String {
    let mut out = String::new();
    for feed in feeds {
        out.push_str(&feed.url);
        out.push('\n');
        for opt in &feed.options {
            out.push_str(&format!(" - {}:{}\n", opt.name, opt.value));
        }
    }
    out
}

/// Writes the feed list atomically (temp file, fsync, rename).
pub fn save(path: &Path, feeds: &[FeedConfig]) -> Result<(), SubscriptionError> {
    let io_err = |source| SubscriptionError::Io {
        path: path.to_owned(),
        source,
    };

    let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));

    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(render(feeds).as_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp_path, path)
    };

    write().map_err(|e| {
        let _ = std::fs::remove_file(&temp_path);
        io_err(e)
    })
}

/// Appends `url` unless it is already subscribed. Returns whether it was added.
pub fn add(feeds: &mut Vec<FeedConfig>, url: &str) -> bool {
    if feeds.iter().any(|f| f.url == url) {
        return false;
    }
    feeds.push(FeedConfig::new(url));
    true
}

/// Removes every entry for `url`. Returns whether anything was removed.
pub fn remove(feeds: &mut Vec<FeedConfig>, url: &str) -> bool {
    let before = feeds.len();
    feeds.retain(|f| f.url != url);
    feeds.len() != before
}
