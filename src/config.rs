//! Application settings from `config.toml` in the config directory.
//!
//! The file is optional: a missing or empty file yields
//! `AppConfig::default()`. Unknown keys are accepted but logged, since they
//! are usually typos. SMTP settings may additionally come from `SMTP_*`
//! environment variables, which win over the file.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::mail::{SmtpSettings, DEFAULT_SUBJECT};
use crate::subscriptions::{OptionDefaults, DEFAULT_USER_AGENT};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("SMTP transport selected but smtp.{0} is not set (config.toml or SMTP_{1})")]
    MissingSmtp(&'static str, &'static str),

    #[error("Invalid SMTP port '{0}'")]
    InvalidPort(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// How mail leaves the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Sendmail,
    Smtp,
}

/// The `[smtp]` table. Password is masked in Debug output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 587,
            username: None,
            password: None,
        }
    }
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Top-level application configuration.
///
/// Every key is optional; missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Sender address. When unset each message is sent from its recipient.
    pub from: Option<String>,

    /// Subject line template, available to message templates as `{{subject}}`.
    pub subject: String,

    pub user_agent: String,

    /// Default minimum interval between fetches of one feed, in minutes.
    pub frequency_minutes: u64,

    /// Pause between consecutive feeds on the same host, in seconds.
    pub host_delay_secs: u64,

    /// Pause between daemon runs, in minutes.
    pub daemon_sleep_minutes: u64,

    /// Explicit transport. Unset means SMTP when fully configured, else sendmail.
    pub transport: Option<TransportKind>,

    pub sendmail_path: PathBuf,

    pub smtp: SmtpConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            from: None,
            subject: DEFAULT_SUBJECT.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            frequency_minutes: 15,
            host_delay_secs: 5,
            daemon_sleep_minutes: 5,
            transport: None,
            sendmail_path: PathBuf::from("/usr/sbin/sendmail"),
            smtp: SmtpConfig::default(),
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "from",
    "subject",
    "user_agent",
    "frequency_minutes",
    "host_delay_secs",
    "daemon_sleep_minutes",
    "transport",
    "sendmail_path",
    "smtp",
];

const KNOWN_SMTP_KEYS: &[&str] = &["host", "port", "username", "password"];

impl AppConfig {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(AppConfig::default())`
    /// - Empty file → `Ok(AppConfig::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content)
    }

    /// Parses TOML text, applying the same rules as [`AppConfig::load`].
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: AppConfig = toml::from_str(content)?;
        tracing::debug!(config = ?config, "Loaded configuration");
        Ok(config)
    }

    /// Applies `SMTP_HOST`, `SMTP_PORT`, `SMTP_USERNAME` and `SMTP_PASSWORD`
    /// over the `[smtp]` table. `lookup` is `std::env::var(..).ok()` outside
    /// tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(host) = lookup("SMTP_HOST") {
            self.smtp.host = Some(host);
        }
        if let Some(port) = lookup("SMTP_PORT") {
            self.smtp.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port.clone()))?;
        }
        if let Some(username) = lookup("SMTP_USERNAME") {
            self.smtp.username = Some(username);
        }
        if let Some(password) = lookup("SMTP_PASSWORD") {
            self.smtp.password = Some(password);
        }
        Ok(())
    }

    /// The transport to use: the explicit choice, else SMTP when host,
    /// username and password are all set, else sendmail.
    pub fn transport_kind(&self) -> TransportKind {
        match self.transport {
            Some(kind) => kind,
            None if self.smtp.host.is_some()
                && self.smtp.username.is_some()
                && self.smtp.password.is_some() =>
            {
                TransportKind::Smtp
            }
            None => TransportKind::Sendmail,
        }
    }

    pub fn smtp_settings(&self) -> Result<SmtpSettings, ConfigError> {
        let host = self
            .smtp
            .host
            .clone()
            .ok_or(ConfigError::MissingSmtp("host", "HOST"))?;
        let username = self
            .smtp
            .username
            .clone()
            .ok_or(ConfigError::MissingSmtp("username", "USERNAME"))?;
        let password = self
            .smtp
            .password
            .clone()
            .ok_or(ConfigError::MissingSmtp("password", "PASSWORD"))?;

        Ok(SmtpSettings {
            host,
            port: self.smtp.port,
            username,
            password: password.into(),
        })
    }

    /// Per-feed option defaults. Relative `template` paths resolve against
    /// `config_dir`.
    pub fn option_defaults(&self, config_dir: &Path) -> OptionDefaults {
        OptionDefaults {
            user_agent: self.user_agent.clone(),
            frequency: Duration::from_secs(self.frequency_minutes.saturating_mul(60)),
            template_dir: config_dir.to_owned(),
        }
    }

    pub fn host_delay(&self) -> Duration {
        Duration::from_secs(self.host_delay_secs)
    }

    pub fn daemon_sleep(&self) -> Duration {
        Duration::from_secs(self.daemon_sleep_minutes.saturating_mul(60))
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for key in raw.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
        }
    }
    if let Some(toml::Value::Table(smtp)) = raw.get("smtp") {
        for key in smtp.keys() {
            if !KNOWN_SMTP_KEYS.contains(&key.as_str()) {
                tracing::warn!(key = %format!("smtp.{key}"), "Unknown key in config file, ignoring");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.subject, DEFAULT_SUBJECT);
        assert_eq!(config.frequency_minutes, 15);
        assert_eq!(config.host_delay(), Duration::from_secs(5));
        assert_eq!(config.daemon_sleep(), Duration::from_secs(300));
        assert_eq!(config.smtp.port, 587);
        assert_eq!(config.transport_kind(), TransportKind::Sendmail);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.subject, DEFAULT_SUBJECT);
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "   \n  \n").unwrap();
        assert_eq!(AppConfig::load(&path).unwrap().frequency_minutes, 15);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
from = "feeds@example.com"
subject = "{{feed_title}}: {{title}}"
frequency_minutes = 60
host_delay_secs = 1
transport = "smtp"

[smtp]
host = "mail.example.com"
port = 465
username = "feeds"
password = "hunter2"
"#;
        let config = AppConfig::parse(content).unwrap();
        assert_eq!(config.from.as_deref(), Some("feeds@example.com"));
        assert_eq!(config.subject, "{{feed_title}}: {{title}}");
        assert_eq!(config.frequency_minutes, 60);
        assert_eq!(config.daemon_sleep_minutes, 5);
        assert_eq!(config.transport_kind(), TransportKind::Smtp);

        let smtp = config.smtp_settings().unwrap();
        assert_eq!(smtp.host, "mail.example.com");
        assert_eq!(smtp.port, 465);
        assert_eq!(smtp.password.expose_secret(), "hunter2");

        let defaults = config.option_defaults(Path::new("/cfg"));
        assert_eq!(defaults.frequency, Duration::from_secs(3600));
        assert_eq!(defaults.template_dir, PathBuf::from("/cfg"));
    }

    #[test]
    fn test_huge_minute_values_saturate() {
        let max = i64::MAX;
        let config = AppConfig::parse(&format!(
            "frequency_minutes = {max}\ndaemon_sleep_minutes = {max}\n"
        ))
        .unwrap();
        let expected = Duration::from_secs((max as u64).saturating_mul(60));
        assert_eq!(config.option_defaults(Path::new("/cfg")).frequency, expected);
        assert_eq!(config.daemon_sleep(), expected);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = AppConfig::parse("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_transport_is_error() {
        assert!(matches!(
            AppConfig::parse("transport = \"pigeon\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let config = AppConfig::parse("host_delay_secs = 2\ntotally_fake_key = 1\n[smtp]\nhots = \"x\"\n").unwrap();
        assert_eq!(config.host_delay_secs, 2);
    }

    #[test]
    fn test_too_large_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "a".repeat(1_048_577)).unwrap();

        let err = AppConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
    }

    #[test]
    fn test_env_overrides_and_selects_smtp() {
        let mut config = AppConfig::parse("[smtp]\nhost = \"file.example.com\"\n").unwrap();
        assert_eq!(config.transport_kind(), TransportKind::Sendmail);

        config
            .apply_env(env(&[
                ("SMTP_HOST", "env.example.com"),
                ("SMTP_PORT", "2525"),
                ("SMTP_USERNAME", "user"),
                ("SMTP_PASSWORD", "secret"),
            ]))
            .unwrap();

        assert_eq!(config.smtp.host.as_deref(), Some("env.example.com"));
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.transport_kind(), TransportKind::Smtp);
    }

    #[test]
    fn test_explicit_sendmail_wins() {
        let mut config = AppConfig::parse("transport = \"sendmail\"\n").unwrap();
        config
            .apply_env(env(&[
                ("SMTP_HOST", "h"),
                ("SMTP_USERNAME", "u"),
                ("SMTP_PASSWORD", "p"),
            ]))
            .unwrap();
        assert_eq!(config.transport_kind(), TransportKind::Sendmail);
    }

    #[test]
    fn test_invalid_env_port() {
        let mut config = AppConfig::default();
        let err = config.apply_env(env(&[("SMTP_PORT", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort(p) if p == "lots"));
    }

    #[test]
    fn test_smtp_settings_missing_field() {
        let config = AppConfig::parse("[smtp]\nhost = \"h\"\nusername = \"u\"\n").unwrap();
        assert!(matches!(
            config.smtp_settings(),
            Err(ConfigError::MissingSmtp("password", _))
        ));
    }

    #[test]
    fn test_debug_masks_password() {
        let config = AppConfig::parse("[smtp]\npassword = \"super-secret-12345\"\n").unwrap();
        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("super-secret-12345"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
