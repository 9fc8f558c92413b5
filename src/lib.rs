//! Feed-to-mail synchronisation engine.
//!
//! `feedmail` polls a list of Atom/RSS feeds, works out which entries are new
//! since the last successful poll, and hands those entries to a mail
//! transport. Seen/unseen state lives in a small bucketed key-value store,
//! one bucket per feed URL.
//!
//! # Architecture
//!
//! - [`subscriptions`] - the feed list (`feeds.txt`), typed per-feed options, OPML
//! - [`feed`] - conditional fetching, parsing, normalisation and filtering
//! - [`storage`] - the [`storage::StateStore`] trait and its SQLite/in-memory backends
//! - [`mail`] - message composition and the sendmail/SMTP transports
//! - [`processor`] - the per-run orchestration loop
//!
//! # Example
//!
//! ```ignore
//! use feedmail::{processor::Processor, storage::Database};
//!
//! let store = Database::open("state.db").await?;
//! let mut processor = Processor::new(store, transport, fetcher, settings);
//! let report = processor.run(&feeds, &["me@example.com".to_string()]).await?;
//! ```

pub mod config;
pub mod feed;
pub mod mail;
pub mod processor;
pub mod storage;
pub mod subscriptions;
pub mod util;
