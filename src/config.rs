//! Client configuration.
//!
//! [`ClientConfig`] can be read from a JSON document, from `SNOWFLAKE_*`
//! environment variables, or built programmatically. Call
//! [`ClientConfig::validate`] (done by
//! [`StreamingClient::from_config`](crate::StreamingClient::from_config)) before
//! use.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::BatchLimits;
use crate::constants::{
    DEFAULT_ASSERTION_LIFETIME_SECS, DEFAULT_CHANNEL_TEMPLATE, DEFAULT_MAX_BATCH_RECORDS,
    DEFAULT_MAX_REQUEST_BYTES, DEFAULT_REFRESH_MARGIN_SECS, MAX_ASSERTION_LIFETIME_SECS,
};
use crate::transport::RetryPolicy;

/// Errors returned while loading or validating configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required value is empty or absent.
    #[error("missing required configuration value: {0}")]
    Missing(&'static str),

    /// A value is present but unusable.
    #[error("invalid configuration value for {field}: {reason}")]
    Invalid {
        /// Offending field or variable.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The JSON document could not be parsed.
    #[error("cannot parse configuration document")]
    Parse(#[from] serde_json::Error),
}

/// Fully qualified pipe, `DATABASE.SCHEMA.PIPE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PipeRef {
    database: String,
    schema: String,
    pipe: String,
}

impl PipeRef {
    /// Creates a pipe reference from its three parts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any part is empty or contains `/`.
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        pipe: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let parts = [database.into(), schema.into(), pipe.into()];
        for part in &parts {
            if part.trim().is_empty() || part.contains('/') {
                return Err(ConfigError::Invalid {
                    field: "pipe",
                    reason: format!("invalid identifier '{part}'"),
                });
            }
        }
        let [database, schema, pipe] = parts;
        Ok(Self {
            database: database.trim().to_owned(),
            schema: schema.trim().to_owned(),
            pipe: pipe.trim().to_owned(),
        })
    }

    /// Returns the database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns the schema name.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Returns the pipe name.
    pub fn pipe(&self) -> &str {
        &self.pipe
    }
}

impl FromStr for PipeRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(db), Some(schema), Some(pipe), None) => Self::new(db, schema, pipe),
            _ => Err(ConfigError::Invalid {
                field: "pipe",
                reason: format!("expected DATABASE.SCHEMA.PIPE, got '{s}'"),
            }),
        }
    }
}

impl TryFrom<String> for PipeRef {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PipeRef> for String {
    fn from(value: PipeRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PipeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.schema, self.pipe)
    }
}

/// Channel name pattern.
///
/// Placeholders: `{pipe}` (pipe name, lower-cased), `{index}` (caller-supplied
/// ordinal) and `{suffix}` (8 random lowercase hex characters, fresh per render).
/// A template without placeholders is used verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelNameTemplate(String);

impl ChannelNameTemplate {
    /// Wraps `template`.
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Returns the raw template.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Renders a channel name for `pipe` and ordinal `index`.
    pub fn render(&self, pipe: &PipeRef, index: usize) -> String {
        let mut name = self
            .0
            .replace("{pipe}", &pipe.pipe().to_lowercase())
            .replace("{index}", &index.to_string());
        while name.contains("{suffix}") {
            name = name.replacen("{suffix}", &random_suffix(), 1);
        }
        name
    }
}

impl Default for ChannelNameTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_TEMPLATE)
    }
}

fn random_suffix() -> String {
    format!("{:08x}", fastrand::u32(..))
}

fn default_lifetime_secs() -> u64 {
    DEFAULT_ASSERTION_LIFETIME_SECS
}

fn default_refresh_margin_secs() -> u64 {
    DEFAULT_REFRESH_MARGIN_SECS
}

fn default_max_records() -> usize {
    DEFAULT_MAX_BATCH_RECORDS
}

fn default_max_request_bytes() -> usize {
    DEFAULT_MAX_REQUEST_BYTES
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

/// Everything the client needs to authenticate and stream into one pipe.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Account identifier or account host (`myorg-acct` or
    /// `myorg-acct.snowflakecomputing.com`).
    #[serde(alias = "account")]
    pub account_host: String,

    /// Principal the key is registered for.
    #[serde(alias = "username")]
    pub user: String,

    /// Path of the PEM or DER private key.
    pub private_key_path: PathBuf,

    /// Passphrase of an encrypted key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_passphrase: Option<String>,

    /// Target pipe.
    #[serde(alias = "pipe_name")]
    pub pipe: PipeRef,

    /// Overrides the account URL derived from `account_host`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_url: Option<String>,

    /// Channel name pattern.
    #[serde(default, alias = "channel_name")]
    pub channel_template: ChannelNameTemplate,

    /// Maximum records per insert.
    #[serde(default = "default_max_records", alias = "batch_size")]
    pub max_batch_records: usize,

    /// Maximum insert request body size.
    #[serde(default = "default_max_request_bytes")]
    pub max_batch_bytes: usize,

    /// Attempt budget per operation, first attempt included.
    #[serde(default = "default_max_attempts")]
    pub retry_max_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Ceiling for any single retry delay.
    #[serde(default = "default_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Backoff growth factor.
    #[serde(default = "default_multiplier")]
    pub retry_multiplier: f64,

    /// Jitter fraction in `0.0..=1.0`.
    #[serde(default = "default_jitter")]
    pub retry_jitter: f64,

    /// Per-attempt network timeout.
    #[serde(default = "default_attempt_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Assertion lifetime, strictly under 3600.
    #[serde(default = "default_lifetime_secs")]
    pub token_lifetime_secs: u64,

    /// Window before expiry in which a cached assertion is replaced.
    #[serde(default = "default_refresh_margin_secs")]
    pub token_refresh_margin_secs: u64,
}

impl ClientConfig {
    /// Creates a configuration with defaults for everything but identity, key and pipe.
    pub fn new(
        account_host: impl Into<String>,
        user: impl Into<String>,
        private_key_path: impl Into<PathBuf>,
        pipe: PipeRef,
    ) -> Self {
        Self {
            account_host: account_host.into(),
            user: user.into(),
            private_key_path: private_key_path.into(),
            private_key_passphrase: None,
            pipe,
            account_url: None,
            channel_template: ChannelNameTemplate::default(),
            max_batch_records: DEFAULT_MAX_BATCH_RECORDS,
            max_batch_bytes: DEFAULT_MAX_REQUEST_BYTES,
            retry_max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_multiplier: default_multiplier(),
            retry_jitter: default_jitter(),
            request_timeout_ms: default_attempt_timeout_ms(),
            token_lifetime_secs: DEFAULT_ASSERTION_LIFETIME_SECS,
            token_refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
        }
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed JSON or a missing required field.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Reads the configuration from the process environment.
    ///
    /// Required: `SNOWFLAKE_ACCOUNT`, `SNOWFLAKE_USER`,
    /// `SNOWFLAKE_PRIVATE_KEY_PATH`, `SNOWFLAKE_DATABASE`, `SNOWFLAKE_SCHEMA`,
    /// `SNOWFLAKE_PIPE`. Optional: `SNOWFLAKE_PRIVATE_KEY_PASSPHRASE`,
    /// `SNOWFLAKE_ACCOUNT_URL`, `CHANNEL_NAME`, `BATCH_SIZE`, `MAX_BATCH_BYTES`,
    /// `RETRY_MAX_ATTEMPTS`, `RETRY_BASE_DELAY_MS`, `RETRY_JITTER`,
    /// `REQUEST_TIMEOUT_MS`, `TOKEN_LIFETIME_SECS`, `TOKEN_REFRESH_MARGIN_SECS`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] for an absent required variable and
    /// [`ConfigError::Invalid`] for an unparsable number.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let pipe = PipeRef::new(
            require("SNOWFLAKE_DATABASE")?,
            require("SNOWFLAKE_SCHEMA")?,
            require("SNOWFLAKE_PIPE")?,
        )?;
        let mut config = Self::new(
            require("SNOWFLAKE_ACCOUNT")?,
            require("SNOWFLAKE_USER")?,
            require("SNOWFLAKE_PRIVATE_KEY_PATH")?,
            pipe,
        );

        config.private_key_passphrase = get("SNOWFLAKE_PRIVATE_KEY_PASSPHRASE");
        config.account_url = get("SNOWFLAKE_ACCOUNT_URL");
        if let Some(template) = get("CHANNEL_NAME") {
            config.channel_template = ChannelNameTemplate::new(template);
        }
        if let Some(v) = get("BATCH_SIZE") {
            config.max_batch_records = parse_var("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("MAX_BATCH_BYTES") {
            config.max_batch_bytes = parse_var("MAX_BATCH_BYTES", &v)?;
        }
        if let Some(v) = get("RETRY_MAX_ATTEMPTS") {
            config.retry_max_attempts = parse_var("RETRY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("RETRY_BASE_DELAY_MS") {
            config.retry_base_delay_ms = parse_var("RETRY_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = get("RETRY_JITTER") {
            config.retry_jitter = parse_var("RETRY_JITTER", &v)?;
        }
        if let Some(v) = get("REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = parse_var("REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("TOKEN_LIFETIME_SECS") {
            config.token_lifetime_secs = parse_var("TOKEN_LIFETIME_SECS", &v)?;
        }
        if let Some(v) = get("TOKEN_REFRESH_MARGIN_SECS") {
            config.token_refresh_margin_secs = parse_var("TOKEN_REFRESH_MARGIN_SECS", &v)?;
        }

        Ok(config)
    }

    /// Sets the key passphrase.
    #[must_use]
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.private_key_passphrase = Some(passphrase.into());
        self
    }

    /// Overrides the account URL.
    #[must_use]
    pub fn with_account_url(mut self, url: impl Into<String>) -> Self {
        self.account_url = Some(url.into());
        self
    }

    /// Sets the channel name template.
    #[must_use]
    pub fn with_channel_template(mut self, template: ChannelNameTemplate) -> Self {
        self.channel_template = template;
        self
    }

    /// Sets the batch limits.
    #[must_use]
    pub const fn with_batch_limits(mut self, max_records: usize, max_request_bytes: usize) -> Self {
        self.max_batch_records = max_records;
        self.max_batch_bytes = max_request_bytes;
        self
    }

    /// Sets the attempt budget and first retry delay.
    #[must_use]
    pub const fn with_retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.retry_max_attempts = max_attempts;
        self.retry_base_delay_ms = base_delay.as_millis() as u64;
        self
    }

    /// Sets the assertion lifetime and refresh margin.
    #[must_use]
    pub const fn with_token_timing(mut self, lifetime: Duration, refresh_margin: Duration) -> Self {
        self.token_lifetime_secs = lifetime.as_secs();
        self.token_refresh_margin_secs = refresh_margin.as_secs();
        self
    }

    /// Checks the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.account_host.trim().is_empty() {
            return Err(ConfigError::Missing("account_host"));
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::Missing("user"));
        }
        if self.private_key_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("private_key_path"));
        }
        if self.token_lifetime_secs == 0 || self.token_lifetime_secs >= MAX_ASSERTION_LIFETIME_SECS {
            return Err(ConfigError::Invalid {
                field: "token_lifetime_secs",
                reason: format!(
                    "{} is outside 1..{MAX_ASSERTION_LIFETIME_SECS}",
                    self.token_lifetime_secs
                ),
            });
        }
        if self.token_refresh_margin_secs >= self.token_lifetime_secs {
            return Err(ConfigError::Invalid {
                field: "token_refresh_margin_secs",
                reason: format!(
                    "{} must be shorter than the lifetime {}",
                    self.token_refresh_margin_secs, self.token_lifetime_secs
                ),
            });
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry_max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::Invalid {
                field: "retry_jitter",
                reason: format!("{} is outside 0.0..=1.0", self.retry_jitter),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "request_timeout_ms",
                reason: "must be positive".into(),
            });
        }
        self.batch_limits()?;
        Ok(())
    }

    /// Returns the batch limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the limits leave no room for rows.
    pub fn batch_limits(&self) -> Result<BatchLimits, ConfigError> {
        BatchLimits::new(self.max_batch_records, self.max_batch_bytes)
    }

    /// Returns the retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.retry_max_attempts)
            .with_base_delay(Duration::from_millis(self.retry_base_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .with_multiplier(self.retry_multiplier)
            .with_jitter(self.retry_jitter)
            .with_attempt_timeout(Duration::from_millis(self.request_timeout_ms))
    }

    /// Returns the assertion lifetime.
    pub const fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs)
    }

    /// Returns the refresh margin.
    pub const fn token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }
}

fn parse_var<T: FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        field,
        reason: e.to_string(),
    })
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("account_host", &self.account_host)
            .field("user", &self.user)
            .field("private_key_path", &self.private_key_path)
            .field(
                "private_key_passphrase",
                &self.private_key_passphrase.as_ref().map(|_| "<redacted>"),
            )
            .field("pipe", &self.pipe)
            .field("account_url", &self.account_url)
            .field("channel_template", &self.channel_template)
            .field("max_batch_records", &self.max_batch_records)
            .field("max_batch_bytes", &self.max_batch_bytes)
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("retry_max_delay_ms", &self.retry_max_delay_ms)
            .field("retry_multiplier", &self.retry_multiplier)
            .field("retry_jitter", &self.retry_jitter)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("token_lifetime_secs", &self.token_lifetime_secs)
            .field("token_refresh_margin_secs", &self.token_refresh_margin_secs)
            .finish()
    }
}
