// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process configuration.
//!
//! Values are layered, lowest precedence first:
//! 1. built-in defaults,
//! 2. `TELEGRAM_BOT_TOKEN`, `TELEGRAM_CHAT_ID` and `WEBHOOK_SECRET_TOKEN`,
//! 3. the YAML file (optional),
//! 4. `RELAY__<SECTION>__<KEY>` environment variables.
//!
//! The result is validated once and then shared read-only for the lifetime of the process.

use std::env;
use std::fs::File as FsFile;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::delivery::DeliveryPolicy;
use crate::errors::ConfigError;
use crate::filter::RuleFamily;
use crate::flusher::FlushPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const ENV_PREFIX: &str = "RELAY";

const ENV_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
const ENV_CHAT_ID: &str = "TELEGRAM_CHAT_ID";
const ENV_SECRET_TOKEN: &str = "WEBHOOK_SECRET_TOKEN";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    /// Base URL of the Bot API, overridden in tests.
    pub api_url: String,
    pub timeout_secs: u64,
    pub https_proxy: Option<String>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            api_url: "https://api.telegram.org".to_string(),
            timeout_secs: 10,
            https_proxy: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub secret_token: String,
    /// Defaults to `/webhook/<secret_token>`.
    pub url_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_request_content_length: usize,
    /// PEM private key for the webhook listener.
    pub tls_keyfile: PathBuf,
    /// PEM certificate chain for the webhook listener.
    pub tls_certfile: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_request_content_length: 1024 * 1024,
            tls_keyfile: PathBuf::from("key.pem"),
            tls_certfile: PathBuf::from("cert.pem"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Log file written next to stderr. Empty disables it.
    pub file: String,
    /// Size in bytes at which the log file is rotated.
    pub rotation_bytes: u64,
    /// Rotated files kept besides the active one.
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: "bot.log".to_string(),
            rotation_bytes: 10 * 1024 * 1024,
            max_files: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Priorities worth notifying about.
    pub priority_filter: Vec<u8>,
    /// Longest time, in seconds, a batch may stay buffered.
    pub max_buffer_time: u64,
    /// Number of distinct buckets that forces a flush.
    pub grouping_max_count: usize,
    pub ignore_sids: Vec<u64>,
    /// Case-insensitive substrings of rule messages to drop.
    pub ignore_msg: Vec<String>,
    /// IANA name of the zone timestamps are displayed in.
    pub timezone: String,
    pub rules_filter: Vec<RuleFamily>,
    /// Link single-event buckets to their own flow instead of an alert query.
    pub force_session_link: bool,
    /// Append the source host to each bucket's link line.
    pub show_nad_source: bool,
    #[serde(skip_deserializing)]
    pub display_timezone: Tz,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            priority_filter: vec![1],
            max_buffer_time: 300,
            grouping_max_count: 10,
            ignore_sids: Vec::new(),
            ignore_msg: Vec::new(),
            timezone: "UTC".to_string(),
            rules_filter: vec![RuleFamily::Pt],
            force_session_link: false,
            show_nad_source: false,
            display_timezone: chrono_tz::UTC,
        }
    }
}

impl AlertConfig {
    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            max_buckets: self.grouping_max_count,
            max_window: Duration::from_secs(self.max_buffer_time),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Minimum gap, in seconds, between two outbound messages.
    pub send_interval_secs: u64,
    pub max_retries: u32,
    /// Backoff before retry `n` (zero based) is `base * 2^n`.
    pub retry_backoff_base_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_interval_secs: 5,
            max_retries: 3,
            retry_backoff_base_secs: 1,
        }
    }
}

impl DeliveryConfig {
    pub fn policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            min_interval: Duration::from_secs(self.send_interval_secs),
            max_retries: self.max_retries,
            backoff_base: Duration::from_secs(self.retry_backoff_base_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub telegram: TelegramConfig,
    pub webhook: WebhookConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub alert: AlertConfig,
    pub delivery: DeliveryConfig,
    pub flush_check_interval_secs: u64,
    pub stats_interval_secs: u64,
    pub supported_message_types: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            webhook: WebhookConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            alert: AlertConfig::default(),
            delivery: DeliveryConfig::default(),
            flush_check_interval_secs: 1,
            stats_interval_secs: 60,
            supported_message_types: vec!["alert".to_string()],
        }
    }
}

impl AppConfig {
    /// Loads and validates the configuration. `path` defaults to [`DEFAULT_CONFIG_PATH`]; a
    /// missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let settings = Config::builder()
            .set_default("telegram.bot_token", env::var(ENV_BOT_TOKEN).unwrap_or_default())?
            .set_default("telegram.chat_id", env::var(ENV_CHAT_ID).unwrap_or_default())?
            .set_default(
                "webhook.secret_token",
                env::var(ENV_SECRET_TOKEN).unwrap_or_default(),
            )?
            .add_source(File::from(path).format(FileFormat::Yaml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: AppConfig = settings.try_deserialize()?;
        config.finalize()?;
        Ok(config)
    }

    /// Fills derived values and rejects settings the pipeline cannot run with.
    pub fn finalize(&mut self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.telegram.bot_token.is_empty() {
            missing.push(ENV_BOT_TOKEN.to_string());
        }
        if self.telegram.chat_id.is_empty() {
            missing.push(ENV_CHAT_ID.to_string());
        }
        if self.webhook.secret_token.is_empty() {
            missing.push(ENV_SECRET_TOKEN.to_string());
        }
        if !is_readable_file(&self.server.tls_keyfile) {
            missing.push(format!(
                "TLS key file (path: {})",
                self.server.tls_keyfile.display()
            ));
        }
        if !is_readable_file(&self.server.tls_certfile) {
            missing.push(format!(
                "TLS certificate file (path: {})",
                self.server.tls_certfile.display()
            ));
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        if self.webhook.url_path.is_empty() {
            self.webhook.url_path = format!("/webhook/{}", self.webhook.secret_token);
        }
        if !self.webhook.url_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "webhook.url_path must start with '/', got '{}'",
                self.webhook.url_path
            )));
        }

        self.alert.display_timezone = self
            .alert
            .timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(self.alert.timezone.clone()))?;

        if self.alert.grouping_max_count == 0 {
            return Err(ConfigError::Invalid(
                "alert.grouping_max_count must be greater than 0".to_string(),
            ));
        }
        if self.delivery.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "delivery.max_retries must be greater than 0".to_string(),
            ));
        }
        if !self.logging.file.is_empty()
            && (self.logging.rotation_bytes == 0 || self.logging.max_files == 0)
        {
            return Err(ConfigError::Invalid(
                "logging.rotation_bytes and logging.max_files must be greater than 0".to_string(),
            ));
        }
        if self.flush_check_interval_secs == 0 || self.stats_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "flush_check_interval_secs and stats_interval_secs must be greater than 0"
                    .to_string(),
            ));
        }

        self.logging.level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            )));
        }

        Ok(())
    }

    pub fn flush_check_interval(&self) -> Duration {
        Duration::from_secs(self.flush_check_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

fn is_readable_file(path: &Path) -> bool {
    path.is_file() && FsFile::open(path).is_ok()
}
