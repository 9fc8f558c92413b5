//! Typed per-feed options.
//!
//! The raw `name:value` pairs from the feed list are scanned exactly once
//! into a [`FeedOptions`] value, which the fetcher, filter and processor then
//! read as plain fields. Malformed values never fail the run: they are logged
//! and the default is kept.

use std::path::PathBuf;
use std::time::Duration;

use super::FeedConfig;
use crate::feed::filter::{FilterRules, Pattern};

/// Maximum number of fetch attempts per feed.
pub const DEFAULT_RETRY: u32 = 3;

/// Pause between failed fetch attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Minimum interval between two fetches of the same feed.
pub const DEFAULT_FREQUENCY: Duration = Duration::from_secs(15 * 60);

/// Pacing used when a `sleep` option is present but unparseable.
const FALLBACK_SLEEP: Duration = Duration::from_secs(10);

pub const DEFAULT_USER_AGENT: &str = concat!(
    "feedmail/",
    env!("CARGO_PKG_VERSION"),
    " (+https://github.com/dhofheinz/feedmail)"
);

/// Values that apply to every feed unless its own options override them.
#[derive(Debug, Clone)]
pub struct OptionDefaults {
    pub user_agent: String,
    pub frequency: Duration,
    /// Directory that relative `template` paths are resolved against.
    pub template_dir: PathBuf,
}

impl Default for OptionDefaults {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            frequency: DEFAULT_FREQUENCY,
            template_dir: PathBuf::from("."),
        }
    }
}

/// Per-feed settings, resolved from the raw option list.
#[derive(Debug, Clone)]
pub struct FeedOptions {
    /// Maximum fetch attempts (always at least 1).
    pub retry: u32,
    /// Pause between fetch attempts. The `delay` option is in seconds.
    pub delay: Duration,
    /// Skip TLS certificate validation.
    pub insecure: bool,
    pub user_agent: String,
    /// Minimum re-poll interval. The `frequency` option is in minutes.
    pub frequency: Duration,
    /// Recipients replacing the run's global list for this feed only.
    pub notify: Option<Vec<String>>,
    /// Explicit pacing before this feed is fetched. The `sleep` option is in seconds.
    pub sleep: Option<Duration>,
    pub tag: Option<String>,
    /// Message template file for this feed.
    pub template: Option<PathBuf>,
    pub filters: FilterRules,
}

impl FeedOptions {
    /// Default options with no per-feed overrides.
    pub fn new(defaults: &OptionDefaults) -> Self {
        Self {
            retry: DEFAULT_RETRY,
            delay: DEFAULT_RETRY_DELAY,
            insecure: false,
            user_agent: defaults.user_agent.clone(),
            frequency: defaults.frequency,
            notify: None,
            sleep: None,
            tag: None,
            template: None,
            filters: FilterRules::default(),
        }
    }

    /// Resolves the options written beneath `feed`.
    ///
    /// Later occurrences of single-valued options win; pattern options
    /// accumulate in file order.
    pub fn from_config(feed: &FeedConfig, defaults: &OptionDefaults) -> Self {
        let mut opts = Self::new(defaults);

        for opt in &feed.options {
            let name = opt.name.trim().to_ascii_lowercase();
            let value = opt.value.trim();

            match name.as_str() {
                "retry" => match value.parse::<u32>() {
                    Ok(0) => {
                        tracing::warn!(feed = %feed.url, "retry must be at least 1, keeping default");
                    }
                    Ok(n) => opts.retry = n,
                    Err(e) => {
                        tracing::warn!(feed = %feed.url, retry = %value, error = %e, "Failed to parse retry value");
                    }
                },
                "delay" => match parse_seconds(value) {
                    Some(delay) => opts.delay = delay,
                    None => {
                        tracing::warn!(feed = %feed.url, delay = %value, "Failed to parse delay value as seconds");
                    }
                },
                "insecure" => {
                    opts.insecure = matches!(value.to_ascii_lowercase().as_str(), "yes" | "true");
                }
                "user-agent" => opts.user_agent = value.to_owned(),
                "frequency" => match value.parse::<u64>().map(|m| m.checked_mul(60)) {
                    Ok(Some(secs)) => opts.frequency = Duration::from_secs(secs),
                    Ok(None) => {
                        tracing::warn!(feed = %feed.url, frequency = %value, "frequency out of range, keeping default");
                    }
                    Err(e) => {
                        tracing::warn!(feed = %feed.url, frequency = %value, error = %e, "Failed to parse frequency as minutes");
                    }
                },
                "notify" => {
                    opts.notify = parse_notify(value);
                    if opts.notify.is_none() {
                        tracing::warn!(feed = %feed.url, "notify lists no addresses, using the run's recipients");
                    }
                }
                "sleep" => match parse_seconds(value) {
                    Some(sleep) => opts.sleep = Some(sleep),
                    None => {
                        tracing::warn!(feed = %feed.url, sleep = %value, "Failed to parse sleep value, being conservative");
                        opts.sleep = Some(FALLBACK_SLEEP);
                    }
                },
                "tag" => opts.tag = Some(value.to_owned()),
                "template" => opts.template = Some(defaults.template_dir.join(value)),
                "exclude" => opts.filters.exclude.push(Pattern::new(value)),
                "exclude-title" => opts.filters.exclude_title.push(Pattern::new(value)),
                "include" => opts.filters.include.push(Pattern::new(value)),
                "include-title" => opts.filters.include_title.push(Pattern::new(value)),
                "exclude-older" => match value.parse::<f64>() {
                    Ok(days) if days.is_finite() => opts.filters.exclude_older_days = Some(days),
                    _ => {
                        tracing::warn!(feed = %feed.url, exclude_older = %value, "Failed to parse exclude-older as days");
                    }
                },
                _ => {
                    tracing::debug!(feed = %feed.url, option = %opt.name, "Ignoring unknown feed option");
                }
            }
        }

        opts
    }
}

/// Splits a `notify` value into addresses. `None` when it names none.
pub fn parse_notify(value: &str) -> Option<Vec<String>> {
    let addresses: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_owned)
        .collect();
    (!addresses.is_empty()).then_some(addresses)
}

/// Parses a non-negative number of seconds; fractions are allowed. Values
/// too large for a [`Duration`] are rejected.
fn parse_seconds(value: &str) -> Option<Duration> {
    let secs = value.parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(feed: FeedConfig) -> FeedOptions {
        FeedOptions::from_config(&feed, &OptionDefaults::default())
    }

    #[test]
    fn test_defaults() {
        let opts = resolve(FeedConfig::new("https://example.com/feed"));
        assert_eq!(opts.retry, 3);
        assert_eq!(opts.delay, Duration::from_secs(1));
        assert!(!opts.insecure);
        assert_eq!(opts.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(opts.frequency, Duration::from_secs(900));
        assert!(opts.notify.is_none());
        assert!(opts.sleep.is_none());
        assert!(opts.filters.is_empty());
    }

    #[test]
    fn test_fetch_overrides() {
        let opts = resolve(
            FeedConfig::new("https://example.com/feed")
                .with_option("retry", "5")
                .with_option("delay", "0.5")
                .with_option("insecure", "Yes")
                .with_option("user-agent", "curl/8.0")
                .with_option("frequency", "60"),
        );
        assert_eq!(opts.retry, 5);
        assert_eq!(opts.delay, Duration::from_millis(500));
        assert!(opts.insecure);
        assert_eq!(opts.user_agent, "curl/8.0");
        assert_eq!(opts.frequency, Duration::from_secs(3600));
    }

    #[test]
    fn test_malformed_values_keep_defaults() {
        let opts = resolve(
            FeedConfig::new("https://example.com/feed")
                .with_option("retry", "many")
                .with_option("retry", "0")
                .with_option("delay", "-3")
                .with_option("frequency", "hourly")
                .with_option("exclude-older", "a week"),
        );
        assert_eq!(opts.retry, DEFAULT_RETRY);
        assert_eq!(opts.delay, DEFAULT_RETRY_DELAY);
        assert_eq!(opts.frequency, DEFAULT_FREQUENCY);
        assert!(opts.filters.exclude_older_days.is_none());
    }

    #[test]
    fn test_out_of_range_values_keep_defaults() {
        let opts = resolve(
            FeedConfig::new("https://example.com/feed")
                .with_option("delay", "1e30")
                .with_option("delay", "inf")
                .with_option("frequency", "999999999999999999")
                .with_option("sleep", "1e30"),
        );
        assert_eq!(opts.delay, DEFAULT_RETRY_DELAY);
        assert_eq!(opts.frequency, DEFAULT_FREQUENCY);
        assert_eq!(opts.sleep, Some(Duration::from_secs(10)));

        // The largest minute count that still fits
        let max = (u64::MAX / 60).to_string();
        let opts = resolve(FeedConfig::new("https://example.com/feed").with_option("frequency", &max));
        assert_eq!(opts.frequency, Duration::from_secs(u64::MAX / 60 * 60));
    }

    #[test]
    fn test_bad_sleep_is_conservative() {
        let opts = resolve(FeedConfig::new("https://example.com/feed").with_option("sleep", "soon"));
        assert_eq!(opts.sleep, Some(Duration::from_secs(10)));

        let opts = resolve(FeedConfig::new("https://example.com/feed").with_option("sleep", "2"));
        assert_eq!(opts.sleep, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_notify_is_split_and_trimmed() {
        let opts = resolve(
            FeedConfig::new("https://example.com/feed")
                .with_option("notify", " a@example.com, b@example.com ,,"),
        );
        assert_eq!(
            opts.notify,
            Some(vec!["a@example.com".to_string(), "b@example.com".to_string()])
        );
    }

    #[test]
    fn test_empty_notify_falls_back_to_run_recipients() {
        for value in ["", " , ,"] {
            assert_eq!(parse_notify(value), None);
            let opts = resolve(FeedConfig::new("https://example.com/feed").with_option("notify", value));
            assert!(opts.notify.is_none(), "notify {value:?}");
        }

        // Later entries win, so an empty one resets an earlier list
        let opts = resolve(
            FeedConfig::new("https://example.com/feed")
                .with_option("notify", "a@example.com")
                .with_option("notify", ""),
        );
        assert!(opts.notify.is_none());
    }

    #[test]
    fn test_pattern_options_accumulate() {
        let opts = resolve(
            FeedConfig::new("https://example.com/feed")
                .with_option("exclude-title", "foo")
                .with_option("exclude-title", "bar")
                .with_option("include", "rust")
                .with_option("INCLUDE-TITLE", "(?i)cake")
                .with_option("exclude-older", "1.5"),
        );
        assert_eq!(opts.filters.exclude_title.len(), 2);
        assert_eq!(opts.filters.include.len(), 1);
        assert_eq!(opts.filters.include_title.len(), 1);
        assert_eq!(opts.filters.exclude_older_days, Some(1.5));
    }

    #[test]
    fn test_tag_and_template() {
        let defaults = OptionDefaults {
            template_dir: PathBuf::from("/home/user/.config/feedmail"),
            ..OptionDefaults::default()
        };
        let feed = FeedConfig::new("https://example.com/feed")
            .with_option("tag", "news")
            .with_option("template", "news.tmpl");
        let opts = FeedOptions::from_config(&feed, &defaults);
        assert_eq!(opts.tag.as_deref(), Some("news"));
        assert_eq!(
            opts.template,
            Some(PathBuf::from("/home/user/.config/feedmail/news.tmpl"))
        );
    }
}
