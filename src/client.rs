//! Entry point that wires configuration, credentials and transport together.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::auth::{Identity, KeyError, KeySource, SigningKey, TokenCache, TokenError, TokenIssuer};
use crate::batch::{BatchLimits, BatchWriter, WriteMode};
use crate::channel::{ChannelRegistry, ChannelSession};
use crate::config::{ClientConfig, ConfigError, PipeRef};
use crate::metrics::MetricsRecorder;
use crate::prelude::info;
use crate::transport::{HttpClient, HttpTransport, ReqwestHttpClient, RetryPolicy};

/// Errors returned while building a [`StreamingClient`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The configuration is incomplete or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The private key could not be loaded.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The assertion settings are unusable.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// The default HTTP client could not be created.
    #[error("cannot create HTTP client")]
    Http(#[from] reqwest::Error),

    /// The account URL does not parse.
    #[error("invalid account URL {url}")]
    InvalidAccountUrl {
        /// Offending value.
        url: String,
        /// Parser error.
        #[source]
        source: url::ParseError,
    },
}

/// Shared, cheap-to-clone handle for one identity and one pipe.
///
/// Holds the single [`TokenCache`] of the identity, so every
/// [`ChannelSession`] created from the same client reuses one assertion until
/// it needs refreshing.
///
/// # Example
///
/// ```no_run
/// use snowpipe_stream::{ClientConfig, StreamingClient, WriteMode};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::from_env()?;
/// let client = StreamingClient::from_config(&config)?;
///
/// let mut session = client.session(0);
/// session.open().await?;
///
/// let rows = vec![serde_json::json!({"id": 1, "name": "a"})];
/// let summary = client
///     .batch_writer(WriteMode::FailFast)
///     .write(rows, &mut session)
///     .await?;
/// println!("accepted {}", summary.records_accepted);
///
/// session.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StreamingClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    account_url: Url,
    limits: BatchLimits,
    policy: RetryPolicy,
    tokens: Arc<TokenCache>,
    transport: HttpTransport,
    channels: Arc<ChannelRegistry>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl fmt::Debug for StreamingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingClient")
            .field("identity", self.inner.tokens.identity())
            .field("account_url", &self.inner.account_url.as_str())
            .field("pipe", &self.inner.config.pipe)
            .field("limits", &self.inner.limits)
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

impl StreamingClient {
    /// Builds a client from `config` with the default HTTP stack.
    ///
    /// # Errors
    ///
    /// See [`StreamingClientBuilder::build`].
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        StreamingClientBuilder::new(config.clone()).build()
    }

    /// Returns a builder for custom HTTP clients, keys or metrics.
    pub fn builder(config: ClientConfig) -> StreamingClientBuilder {
        StreamingClientBuilder::new(config)
    }

    /// Returns the account URL all account-level calls go to.
    pub fn account_url(&self) -> &Url {
        &self.inner.account_url
    }

    /// Returns the target pipe.
    pub fn pipe(&self) -> &PipeRef {
        &self.inner.config.pipe
    }

    /// Returns the shared assertion cache.
    pub fn tokens(&self) -> &Arc<TokenCache> {
        &self.inner.tokens
    }

    /// Returns the validated batch limits.
    pub fn limits(&self) -> BatchLimits {
        self.inner.limits
    }

    /// Returns an unopened session whose name is rendered from the configured
    /// channel template with ordinal `index`.
    pub fn session(&self, index: usize) -> ChannelSession {
        let name = self
            .inner
            .config
            .channel_template
            .render(&self.inner.config.pipe, index);
        self.channel(name)
    }

    /// Returns an unopened session for an explicit channel name.
    ///
    /// Only one session per name can be open at a time; opening a second one
    /// fails with [`SessionError::ChannelInUse`](crate::SessionError::ChannelInUse)
    /// until the first is closed or dropped.
    pub fn channel(&self, name: impl Into<String>) -> ChannelSession {
        let session = ChannelSession::new(
            name,
            self.inner.config.pipe.clone(),
            self.inner.account_url.clone(),
            Arc::clone(&self.inner.tokens),
            self.inner.transport.clone(),
            self.inner.policy.clone(),
        )
        .with_max_request_bytes(self.inner.limits.max_request_bytes())
        .with_registry(Arc::clone(&self.inner.channels));
        match &self.inner.metrics {
            Some(metrics) => session.with_metrics(Arc::clone(metrics)),
            None => session,
        }
    }

    /// Returns `true` if a session of this client currently holds `name` open.
    pub fn is_channel_open(&self, name: &str) -> bool {
        self.inner.channels.is_live(name)
    }

    /// Returns a writer with the configured limits.
    pub fn batch_writer(&self, mode: WriteMode) -> BatchWriter {
        let writer = BatchWriter::new(self.inner.limits, mode);
        match &self.inner.metrics {
            Some(metrics) => writer.with_metrics(Arc::clone(metrics)),
            None => writer,
        }
    }
}

/// Builder for [`StreamingClient`].
pub struct StreamingClientBuilder {
    config: ClientConfig,
    key: Option<SigningKey>,
    http: Option<Arc<dyn HttpClient>>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl fmt::Debug for StreamingClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingClientBuilder")
            .field("config", &self.config)
            .field("key", &self.key)
            .field("http", &self.http.as_ref().map(|_| "<HttpClient>"))
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .finish()
    }
}

impl StreamingClientBuilder {
    /// Starts from `config`.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            key: None,
            http: None,
            metrics: None,
        }
    }

    /// Uses an already loaded key instead of reading `private_key_path`.
    #[must_use]
    pub fn signing_key(mut self, key: SigningKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Uses a custom HTTP client instead of the default `reqwest` one.
    #[must_use]
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http = Some(client);
        self
    }

    /// Sets a metrics recorder shared by the cache, transport, sessions and writers.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validates the configuration, loads the key and assembles the client.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Config`] if validation fails,
    /// - [`ClientError::Key`] if the key cannot be read or decoded,
    /// - [`ClientError::Token`] if the assertion timing is unusable,
    /// - [`ClientError::InvalidAccountUrl`] if the account URL does not parse,
    /// - [`ClientError::Http`] if the default HTTP client cannot be built.
    pub fn build(self) -> Result<StreamingClient, ClientError> {
        let config = self.config;
        config.validate()?;

        let key = match self.key {
            Some(key) => key,
            None => KeySource::load_file(
                &config.private_key_path,
                config.private_key_passphrase.as_deref(),
            )?,
        };
        let identity = Identity::new(&config.account_host, &config.user);
        let account_url = resolve_account_url(&config, &identity)?;

        let issuer = TokenIssuer::new(config.token_lifetime())?;
        let mut tokens = TokenCache::new(
            identity,
            Arc::new(key),
            issuer,
            config.token_refresh_margin(),
        )?;
        let http: Arc<dyn HttpClient> = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestHttpClient::new()?),
        };
        let mut transport = HttpTransport::new(http);
        if let Some(metrics) = &self.metrics {
            tokens = tokens.with_metrics(Arc::clone(metrics));
            transport = transport.with_metrics(Arc::clone(metrics));
        }

        info!(
            "Created streaming client: identity={}, account_url={}, pipe={}",
            tokens.identity(),
            account_url,
            config.pipe
        );

        Ok(StreamingClient {
            inner: Arc::new(Inner {
                limits: config.batch_limits()?,
                policy: config.retry_policy(),
                config,
                account_url,
                tokens: Arc::new(tokens),
                transport,
                channels: Arc::default(),
                metrics: self.metrics,
            }),
        })
    }
}

// Explicit URL, then a host-looking account, then the identity-derived default.
fn resolve_account_url(config: &ClientConfig, identity: &Identity) -> Result<Url, ClientError> {
    let raw = match config.account_url.as_deref() {
        Some(url) => url.trim().to_owned(),
        None if config.account_host.contains('.') => {
            let host = config.account_host.trim();
            if host.starts_with("https://") || host.starts_with("http://") {
                host.to_owned()
            } else {
                format!("https://{host}")
            }
        }
        None => identity.default_account_url(),
    };
    Url::parse(&raw).map_err(|source| ClientError::InvalidAccountUrl { url: raw, source })
}
