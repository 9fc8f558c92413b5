//! The per-run loop.
//!
//! Feeds are handled strictly one after another, in configuration order:
//! pace, fetch, parse, normalise, then for every item decide seen/new,
//! filter, deliver and record. Keys that vanished from the feed are pruned
//! once the feed is done, and buckets of unsubscribed feeds once the run is.
//!
//! Fetch, parse and delivery failures are feed-level: they are collected in
//! the [`RunReport`] and the next feed proceeds. A state store failure ends
//! the run immediately with a [`RunError`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;

use crate::feed::{normalize, parse_feed, FetchError, FetchOutcome, Fetcher, ParseError};
use crate::mail::{
    render_subject, text_body, DeliveryError, FeedContext, MessageTemplate, Notification,
    Transport, DEFAULT_SUBJECT,
};
use crate::storage::{StateError, StateStore};
use crate::subscriptions::{FeedConfig, FeedOptions, OptionDefaults};
use crate::util::host_of;

/// Pause between consecutive feeds on the same host.
pub const DEFAULT_HOST_DELAY: Duration = Duration::from_secs(5);

// ============================================================================
// Errors and report
// ============================================================================

/// Why a single feed could not be processed.
#[derive(Debug, Error)]
pub enum FeedErrorKind {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// A feed-level error; the run carried on past it.
#[derive(Debug, Error)]
#[error("{feed}: {kind}")]
pub struct FeedError {
    pub feed: String,
    #[source]
    pub kind: FeedErrorKind,
}

/// A failure that ends the run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    State(#[from] StateError),
}

/// Counters and collected errors of one run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Feeds started (a shutdown can stop the run early).
    pub feeds: usize,
    /// Feeds skipped as unchanged.
    pub unchanged: usize,
    /// Items already seen on an earlier run.
    pub seen: usize,
    /// New items held back by a filter.
    pub suppressed: usize,
    /// New items that passed the filters.
    pub new_items: usize,
    /// New items actually handed to the transport.
    pub delivered: usize,
    /// Stale keys and buckets removed.
    pub pruned: usize,
    pub errors: Vec<FeedError>,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

enum ProcessError {
    Feed(FeedErrorKind),
    State(StateError),
}

impl From<StateError> for ProcessError {
    fn from(e: StateError) -> Self {
        ProcessError::State(e)
    }
}

impl From<FetchError> for ProcessError {
    fn from(e: FetchError) -> Self {
        ProcessError::Feed(e.into())
    }
}

impl From<ParseError> for ProcessError {
    fn from(e: ParseError) -> Self {
        ProcessError::Feed(e.into())
    }
}

impl From<DeliveryError> for ProcessError {
    fn from(e: DeliveryError) -> Self {
        ProcessError::Feed(e.into())
    }
}

// ============================================================================
// Processor
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// When false nothing is delivered, but state is still recorded.
    pub send: bool,
    pub host_delay: Duration,
    pub defaults: OptionDefaults,
    /// Subject line template, rendered into the message's `{{subject}}`.
    pub subject: String,
    /// Message template for feeds without their own `template`.
    pub template: Arc<MessageTemplate>,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            send: true,
            host_delay: DEFAULT_HOST_DELAY,
            defaults: OptionDefaults::default(),
            subject: DEFAULT_SUBJECT.to_string(),
            template: Arc::new(MessageTemplate::default()),
        }
    }
}

pub struct Processor<S, T> {
    store: S,
    transport: T,
    fetcher: Fetcher,
    settings: ProcessorSettings,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<S: StateStore, T: Transport> Processor<S, T> {
    pub fn new(store: S, transport: T, fetcher: Fetcher, settings: ProcessorSettings) -> Self {
        Self {
            store,
            transport,
            fetcher,
            settings,
            shutdown: None,
        }
    }

    /// Stops the run before the next feed once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Processes every feed, then reaps buckets of feeds no longer listed.
    ///
    /// `recipients` is the default address list; a feed's `notify` option
    /// replaces it for that feed.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::State`] on the first state store failure. Every
    /// other failure is recorded in the report.
    pub async fn run(
        &mut self,
        feeds: &[FeedConfig],
        recipients: &[String],
    ) -> Result<RunReport, RunError> {
        let mut report = RunReport::default();
        let mut previous_host: Option<String> = None;

        for feed in feeds {
            if self.stopping() {
                tracing::info!("Shutdown requested, not starting further feeds");
                break;
            }

            let opts = FeedOptions::from_config(feed, &self.settings.defaults);
            let host = host_of(&feed.url);

            if let Some(delay) = pacing_delay(
                previous_host.as_deref(),
                host.as_deref(),
                &opts,
                self.settings.host_delay,
            ) {
                tracing::debug!(feed = %feed.url, delay_ms = delay.as_millis() as u64, "Pacing before fetch");
                self.pause(delay).await;
                if self.stopping() {
                    break;
                }
            }
            previous_host = host;
            report.feeds += 1;

            match self.process_feed(feed, &opts, recipients, &mut report).await {
                Ok(()) => {}
                Err(ProcessError::Feed(kind)) => {
                    tracing::warn!(feed = %feed.url, error = %kind, "Feed failed");
                    report.errors.push(FeedError {
                        feed: feed.url.clone(),
                        kind,
                    });
                }
                Err(ProcessError::State(e)) => return Err(RunError::State(e)),
            }
        }

        // The full list, so an early stop never reaps unvisited feeds
        let urls: Vec<String> = feeds.iter().map(|f| f.url.clone()).collect();
        report.pruned += self.store.prune_buckets(&urls).await?;

        tracing::info!(
            feeds = report.feeds,
            delivered = report.delivered,
            suppressed = report.suppressed,
            unchanged = report.unchanged,
            errors = report.errors.len(),
            "Run complete"
        );
        Ok(report)
    }

    async fn process_feed(
        &mut self,
        feed: &FeedConfig,
        opts: &FeedOptions,
        recipients: &[String],
        report: &mut RunReport,
    ) -> Result<(), ProcessError> {
        let url = feed.url.as_str();
        self.store.ensure_bucket(url).await?;

        let bytes = match self.fetcher.fetch(url, opts).await? {
            FetchOutcome::Unchanged => {
                report.unchanged += 1;
                return Ok(());
            }
            FetchOutcome::Fetched(bytes) => bytes,
        };

        let parsed = parse_feed(&bytes)?;
        let context = FeedContext {
            url: url.to_owned(),
            title: parsed.title,
            link: parsed.link,
        };
        let items = normalize(url, parsed.entries, opts.tag.as_deref());
        let recipients = opts.notify.as_deref().unwrap_or(recipients);
        let now = Utc::now();
        let mut feed_template: Option<Arc<MessageTemplate>> = None;

        for item in &items {
            if self.store.seen(url, &item.link).await? {
                report.seen += 1;
                continue;
            }

            if let Some(reason) = opts.filters.suppression(
                &item.title,
                &item.content,
                item.published_at.as_deref(),
                now,
            ) {
                tracing::debug!(feed = %url, link = %item.link, reason = ?reason, "Item suppressed");
                report.suppressed += 1;
            } else {
                report.new_items += 1;

                if self.settings.send {
                    let template = match feed_template.take() {
                        Some(t) => t,
                        None => match &opts.template {
                            Some(path) => Arc::new(MessageTemplate::load(path).await?),
                            None => Arc::clone(&self.settings.template),
                        },
                    };

                    let notification = Notification {
                        subject: render_subject(&self.settings.subject, &context, item),
                        text: text_body(&item.content),
                        html: item.content.clone(),
                        feed: context.clone(),
                        item: item.clone(),
                        template: Arc::clone(&template),
                    };
                    feed_template = Some(template);

                    // An error here leaves this and later items unseen
                    self.transport.deliver(recipients, &notification).await?;
                    report.delivered += 1;
                } else {
                    tracing::info!(feed = %url, link = %item.link, title = %item.title, "Dry run, not delivering");
                }
            }

            self.store.mark_seen(url, &item.link).await?;
        }

        let current: Vec<String> = items.iter().map(|i| i.link.clone()).collect();
        report.pruned += self.store.prune_feed(url, &current).await?;
        Ok(())
    }

    fn stopping(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleeps for `delay`, returning early if shutdown is requested.
    async fn pause(&self, delay: Duration) {
        match &self.shutdown {
            Some(rx) => {
                let mut rx = rx.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = rx.wait_for(|stop| *stop) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }
}

/// Delay to insert before fetching a feed.
///
/// An explicit `sleep` option always applies. Otherwise a feed on the same
/// host as the previous one waits `host_delay`. A zero delay means none.
pub fn pacing_delay(
    previous_host: Option<&str>,
    host: Option<&str>,
    opts: &FeedOptions,
    host_delay: Duration,
) -> Option<Duration> {
    let same_host = host.is_some() && previous_host == host;
    opts.sleep
        .or(same_host.then_some(host_delay))
        .filter(|d| !d.is_zero())
}
