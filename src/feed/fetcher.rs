use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{HeaderMap, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, USER_AGENT};
use thiserror::Error;

use crate::subscriptions::FeedOptions;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while fetching a feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with a non-2xx, non-3xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// The HTTP client itself could not be built
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    ///
    /// Client errors (4xx other than 429) and oversized bodies are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(e) => !e.is_builder(),
            FetchError::Timeout | FetchError::IncompleteResponse { .. } => true,
            FetchError::HttpStatus(status) => *status >= 500 || *status == 429,
            FetchError::ResponseTooLarge | FetchError::Client(_) => false,
        }
    }
}

/// Validators and timestamp of the last fetch of one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Per-URL fetch cache, owned by a [`Fetcher`].
///
/// Lives as long as the fetcher does: one run for `cron`, the whole process
/// for `daemon`. Nothing is written to disk.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(url)
    }

    pub fn insert(&mut self, url: impl Into<String>, entry: CacheEntry) {
        self.entries.insert(url.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stores a fresh entry, keeping earlier validators the response omitted.
    fn record(&mut self, url: &str, etag: Option<String>, last_modified: Option<String>) {
        let previous = self.entries.remove(url);
        let (old_etag, old_modified) = previous
            .map(|p| (p.etag, p.last_modified))
            .unwrap_or_default();

        self.entries.insert(
            url.to_owned(),
            CacheEntry {
                etag: etag.or(old_etag),
                last_modified: last_modified.or(old_modified),
                fetched_at: Utc::now(),
            },
        );
    }
}

/// Result of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Nothing new: inside the frequency window, 304, or another 3xx.
    Unchanged,
    /// The full response body.
    Fetched(Vec<u8>),
}

/// Conditional-GET HTTP fetcher.
///
/// Redirects are followed by the HTTP client (up to its default limit); a
/// 3xx that still reaches the fetcher, 304 included, is treated as
/// "unchanged".
pub struct Fetcher {
    client: reqwest::Client,
    insecure_client: Option<reqwest::Client>,
    cache: Cache,
    timeout: Duration,
    max_size: usize,
}

impl Fetcher {
    /// Creates a fetcher with an empty cache.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Client`] if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_cache(Cache::new())
    }

    /// Creates a fetcher seeded with an existing cache.
    pub fn with_cache(cache: Cache) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            client,
            insecure_client: None,
            cache,
            timeout: REQUEST_TIMEOUT,
            max_size: MAX_FEED_SIZE,
        })
    }

    /// Overrides the per-request timeout (30 seconds by default).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the response body limit (10MB by default).
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Fetches `url` unless the cache says it is too soon or unchanged.
    ///
    /// Retryable failures are attempted up to `opts.retry` times in total,
    /// sleeping `opts.delay` between attempts.
    ///
    /// # Errors
    ///
    /// Returns the last [`FetchError`] once attempts are exhausted, or the
    /// first non-retryable one.
    pub async fn fetch(&mut self, url: &str, opts: &FeedOptions) -> Result<FetchOutcome, FetchError> {
        if self.within_frequency(url, opts.frequency, Utc::now()) {
            tracing::debug!(feed = %url, "Fetched recently, skipping");
            return Ok(FetchOutcome::Unchanged);
        }

        let client = self.client_for(opts.insecure)?;
        let attempts = opts.retry.max(1);
        let mut attempt = 1;

        loop {
            match self.fetch_once(&client, url, opts).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        feed = %url,
                        attempt = attempt,
                        attempts = attempts,
                        error = %e,
                        "Fetch failed, retrying after delay"
                    );
                    tokio::time::sleep(opts.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn within_frequency(&self, url: &str, frequency: Duration, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.cache.get(url) else {
            return false;
        };
        let age = now - entry.fetched_at;
        match chrono::Duration::from_std(frequency) {
            Ok(window) => age < window,
            Err(_) => true,
        }
    }

    fn client_for(&mut self, insecure: bool) -> Result<reqwest::Client, FetchError> {
        if !insecure {
            return Ok(self.client.clone());
        }

        if let Some(client) = &self.insecure_client {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(FetchError::Client)?;
        self.insecure_client = Some(client.clone());
        Ok(client)
    }

    async fn fetch_once(
        &mut self,
        client: &reqwest::Client,
        url: &str,
        opts: &FeedOptions,
    ) -> Result<FetchOutcome, FetchError> {
        let mut request = client.get(url).header(USER_AGENT, opts.user_agent.as_str());

        if let Some(entry) = self.cache.get(url) {
            if let Some(etag) = &entry.etag {
                request = request.header(IF_NONE_MATCH, etag.as_str());
            }
            if let Some(modified) = &entry.last_modified {
                request = request.header(IF_MODIFIED_SINCE, modified.as_str());
            }
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        let status = response.status();
        let etag = header_string(response.headers(), ETAG);
        let last_modified = header_string(response.headers(), LAST_MODIFIED);

        if status.is_redirection() {
            tracing::debug!(feed = %url, status = %status, "Feed unchanged");
            self.cache.record(url, etag, last_modified);
            return Ok(FetchOutcome::Unchanged);
        }

        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let bytes = tokio::time::timeout(self.timeout, read_limited_bytes(response, self.max_size))
            .await
            .map_err(|_| FetchError::Timeout)??;

        self.cache.record(url, etag, last_modified);
        Ok(FetchOutcome::Fetched(bytes))
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::{FeedConfig, OptionDefaults};
    use wiremock::matchers::{any, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><guid>1</guid><title>Test</title></item>
</channel></rss>"#;

    /// Options with no frequency window and no retry delay.
    fn opts(extra: &[(&str, &str)]) -> FeedOptions {
        let mut feed = FeedConfig::new("https://example.com/feed")
            .with_option("frequency", "0")
            .with_option("delay", "0");
        for (name, value) in extra {
            feed = feed.with_option(*name, *value);
        }
        FeedOptions::from_config(&feed, &OptionDefaults::default())
    }

    #[tokio::test]
    async fn test_fetch_success_records_validators() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("ETag", "\"v1\"")
                    .insert_header("Last-Modified", "Sat, 15 Jun 2024 10:00:00 GMT"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let mut fetcher = Fetcher::new().unwrap();

        let outcome = fetcher.fetch(&url, &opts(&[])).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Fetched(VALID_RSS.as_bytes().to_vec()));

        let entry = fetcher.cache().get(&url).unwrap();
        assert_eq!(entry.etag.as_deref(), Some("\"v1\""));
        assert_eq!(
            entry.last_modified.as_deref(),
            Some("Sat, 15 Jun 2024 10:00:00 GMT")
        );
    }

    #[tokio::test]
    async fn test_sends_conditional_headers_and_handles_304() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"v1\""))
            .and(header_exists("If-Modified-Since"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let mut cache = Cache::new();
        cache.insert(
            url.clone(),
            CacheEntry {
                etag: Some("\"v1\"".into()),
                last_modified: Some("Sat, 15 Jun 2024 10:00:00 GMT".into()),
                fetched_at: Utc::now() - chrono::Duration::hours(1),
            },
        );
        let mut fetcher = Fetcher::with_cache(cache).unwrap();

        let outcome = fetcher.fetch(&url, &opts(&[])).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Unchanged);

        // 304 carried no validators, the old ones survive with a new timestamp
        let entry = fetcher.cache().get(&url).unwrap();
        assert_eq!(entry.etag.as_deref(), Some("\"v1\""));
        assert!(Utc::now() - entry.fetched_at < chrono::Duration::minutes(1));
    }

    #[tokio::test]
    async fn test_within_frequency_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(0)
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let mut cache = Cache::new();
        cache.insert(
            url.clone(),
            CacheEntry {
                etag: Some("\"v1\"".into()),
                last_modified: None,
                fetched_at: Utc::now(),
            },
        );
        let mut fetcher = Fetcher::with_cache(cache).unwrap();

        let outcome = fetcher
            .fetch(&url, &opts(&[("frequency", "15")]))
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_second_fetch_in_window_is_unchanged() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("ETag", "\"v1\""),
            )
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let windowed = opts(&[("frequency", "15")]);
        let mut fetcher = Fetcher::new().unwrap();

        assert!(matches!(
            fetcher.fetch(&url, &windowed).await.unwrap(),
            FetchOutcome::Fetched(_)
        ));
        assert_eq!(
            fetcher.fetch(&url, &windowed).await.unwrap(),
            FetchOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn test_user_agent_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("User-Agent", "custom-agent/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let mut fetcher = Fetcher::new().unwrap();
        let outcome = fetcher
            .fetch(&url, &opts(&[("user-agent", "custom-agent/1.0")]))
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Fetched(_)));
    }

    #[tokio::test]
    async fn test_500_retries_then_fails() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let mut fetcher = Fetcher::new().unwrap();
        let result = fetcher.fetch(&url, &opts(&[("retry", "3")])).await;
        match result {
            Err(FetchError::HttpStatus(500)) => {}
            other => panic!("Expected HttpStatus(500), got {:?}", other),
        }
        assert!(fetcher.cache().is_empty());
    }

    #[tokio::test]
    async fn test_503_retry_then_success() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let mut fetcher = Fetcher::new().unwrap();
        let outcome = fetcher.fetch(&url, &opts(&[("retry", "3")])).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Fetched(_)));
    }

    #[tokio::test]
    async fn test_404_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let mut fetcher = Fetcher::new().unwrap();
        let result = fetcher.fetch(&url, &opts(&[("retry", "5")])).await;
        assert!(matches!(result, Err(FetchError::HttpStatus(404))));
    }

    #[tokio::test]
    async fn test_connection_refused_exhausts_attempts() {
        // Nothing listens on port 1
        let url = "http://127.0.0.1:1/feed";

        let mut fetcher = Fetcher::new().unwrap();
        let result = fetcher.fetch(url, &opts(&[("retry", "2")])).await;
        assert!(matches!(result, Err(FetchError::Network(_))));
    }

    #[tokio::test]
    async fn test_response_too_large() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(2048)))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/feed", server.uri());
        let mut fetcher = Fetcher::new().unwrap().with_max_size(1024);
        let result = fetcher.fetch(&url, &opts(&[("retry", "3")])).await;
        assert!(matches!(result, Err(FetchError::ResponseTooLarge)));
    }

    #[test]
    fn test_is_retryable() {
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::HttpStatus(503).is_retryable());
        assert!(FetchError::HttpStatus(429).is_retryable());
        assert!(!FetchError::HttpStatus(404).is_retryable());
        assert!(!FetchError::ResponseTooLarge.is_retryable());
    }

    #[test]
    fn test_future_timestamp_counts_as_recent() {
        let mut cache = Cache::new();
        cache.insert(
            "https://example.com/feed",
            CacheEntry {
                etag: None,
                last_modified: None,
                fetched_at: Utc::now() + chrono::Duration::hours(1),
            },
        );
        let fetcher = Fetcher::with_cache(cache).unwrap();
        assert!(fetcher.within_frequency(
            "https://example.com/feed",
            Duration::from_secs(60),
            Utc::now()
        ));
        assert!(!fetcher.within_frequency(
            "https://example.com/other",
            Duration::from_secs(60),
            Utc::now()
        ));
    }
}
