//! Feed pipeline: fetch, parse, normalise, filter.
//!
//! Each stage is usable on its own:
//!
//! - [`fetcher`] - conditional HTTP GET with retry and a per-URL [`Cache`]
//! - [`parser`] - feed bytes to entries using the `feed-rs` crate
//! - [`normalizer`] - unique state keys and sanitised HTML
//! - [`filter`] - include/exclude and age rules
//!
//! # Example
//!
//! ```ignore
//! use feedmail::feed::{normalize, parse_feed, FetchOutcome, Fetcher};
//!
//! let mut fetcher = Fetcher::new()?;
//! if let FetchOutcome::Fetched(bytes) = fetcher.fetch(url, &opts).await? {
//!     let feed = parse_feed(&bytes)?;
//!     let items = normalize(url, feed.entries, opts.tag.as_deref());
//! }
//! ```

pub mod fetcher;
pub mod filter;
pub mod normalizer;
pub mod parser;

pub use fetcher::{Cache, CacheEntry, FetchError, FetchOutcome, Fetcher};
pub use filter::{FilterRules, Pattern, Suppression};
pub use normalizer::{normalize, sanitize_html, NormalizedItem};
pub use parser::{parse_feed, ParseError, ParsedEntry, ParsedFeed};
