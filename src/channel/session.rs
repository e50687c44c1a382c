use std::fmt;
use std::sync::Arc;

use url::Url;

use super::errors::SessionError;
use super::registry::{ChannelLease, ChannelRegistry};
use super::state::{ChannelHandle, ChannelState};
use super::wire::{
    parse_host, ChannelStatus, ChannelStatusRequest, ChannelStatusResponse, InsertRowsRequest,
    InsertRowsResponse, OpenChannelRequest, OpenChannelResponse,
};
use crate::auth::{TokenCache, TokenError};
use crate::batch::Batch;
use crate::config::PipeRef;
use crate::constants::{
    CONTINUATION_TOKEN_HEADER, CONTROL_PATH_PREFIX, HOSTNAME_PATH, INGEST_PATH_PREFIX,
    KEYPAIR_JWT_TOKEN_TYPE, PLATFORM_MAX_REQUEST_BYTES, TOKEN_TYPE_HEADER,
};
use crate::metrics::{MetricsErrorKind, MetricsRecorder};
use crate::observability::token_prefix;
use crate::prelude::{debug, error, info, warn};
use crate::transport::{Exchange, HttpRequest, HttpTransport, Method, RetryPolicy, TransportError};

/// Outcome of an accepted insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertReceipt {
    /// Rows in the batch.
    pub rows: usize,
    /// Serialized row bytes in the batch.
    pub bytes: usize,
    /// HTTP attempts spent, across a transparent reopen if one happened.
    pub attempts: u32,
    /// Offset token sent with the batch.
    pub offset_token: String,
    /// Status string returned by the platform, if any.
    pub status: Option<String>,
}

enum CallError {
    Token(TokenError),
    Transport(TransportError),
}

impl From<TokenError> for CallError {
    fn from(e: TokenError) -> Self {
        Self::Token(e)
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// One logical streaming channel: open, chained inserts, status, close.
///
/// A session is single-owner: every mutating operation takes `&mut self`, so
/// inserts on one channel are strictly sequential and each insert presents
/// the continuation token returned by the previous one.
///
/// Account-level calls (discovery, open, status, close) authenticate with an
/// assertion from the shared [`TokenCache`]; inserts authenticate with the
/// channel's scoped token. A rejected assertion is invalidated and retried
/// once; a rejected scoped token triggers one transparent reopen.
///
/// Sessions handed out by the same client hold their channel name
/// exclusively from `open` until `close` or drop, so one channel never has
/// two continuation chains.
///
/// Dropping an `insert` future mid-flight leaves the session in
/// [`ChannelState::Inserting`]; call [`ChannelSession::status`] to reconcile
/// (the next insert then reopens the channel first) and
/// [`ChannelSession::close`] on shutdown.
pub struct ChannelSession {
    channel_name: String,
    pipe: PipeRef,
    account_url: Url,
    tokens: Arc<TokenCache>,
    transport: HttpTransport,
    policy: RetryPolicy,
    max_request_bytes: usize,
    registry: Option<Arc<ChannelRegistry>>,
    lease: Option<ChannelLease>,

    state: ChannelState,
    handle: Option<ChannelHandle>,
    control_host: Option<Url>,
    // Set when the server-side continuation state is unknown.
    needs_reopen: bool,
    rows_accepted: u64,

    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl ChannelSession {
    /// Creates an unopened session for `channel_name` on `pipe`.
    pub fn new(
        channel_name: impl Into<String>,
        pipe: PipeRef,
        account_url: Url,
        tokens: Arc<TokenCache>,
        transport: HttpTransport,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            pipe,
            account_url,
            tokens,
            transport,
            policy,
            max_request_bytes: PLATFORM_MAX_REQUEST_BYTES,
            registry: None,
            lease: None,
            state: ChannelState::Unopened,
            handle: None,
            control_host: None,
            needs_reopen: false,
            rows_accepted: 0,
            metrics: None,
        }
    }

    /// Attaches a metrics recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Caps the encoded size of insert bodies. Defaults to the platform ceiling.
    #[must_use]
    pub fn with_max_request_bytes(mut self, max_request_bytes: usize) -> Self {
        self.max_request_bytes = max_request_bytes;
        self
    }

    pub(crate) fn with_registry(mut self, registry: Arc<ChannelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Returns the logical channel name.
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Returns the current state.
    pub const fn state(&self) -> ChannelState {
        self.state
    }

    /// Returns the live channel handle, if open.
    pub const fn handle(&self) -> Option<&ChannelHandle> {
        self.handle.as_ref()
    }

    /// Returns the rows accepted through this session.
    pub const fn rows_accepted(&self) -> u64 {
        self.rows_accepted
    }

    /// Discovers the control host and opens the channel.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidState`] unless the session is `Unopened`,
    /// - [`SessionError::ChannelInUse`] if another session of the same client
    ///   holds the channel (the session stays `Unopened`),
    /// - [`SessionError::ChannelOpen`] if discovery or open fail after retries
    ///   (the session becomes `Errored`),
    /// - [`SessionError::Auth`] if the refreshed assertion is rejected too,
    /// - [`SessionError::Token`] if no assertion can be minted.
    pub async fn open(&mut self) -> Result<(), SessionError> {
        if self.state != ChannelState::Unopened {
            return Err(SessionError::InvalidState {
                operation: "open",
                state: self.state,
            });
        }
        if let Some(registry) = &self.registry {
            let lease = ChannelLease::acquire(registry, &self.channel_name).ok_or_else(|| {
                SessionError::ChannelInUse {
                    channel: self.channel_name.clone(),
                }
            })?;
            self.lease = Some(lease);
        }
        self.establish().await
    }

    /// Opens the channel again under the same name, replacing the handle.
    ///
    /// Recovers an `Errored` session and reconciles one whose continuation
    /// state is unknown.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] if the session was never opened or is
    /// closed; otherwise as [`ChannelSession::open`].
    pub async fn reopen(&mut self) -> Result<(), SessionError> {
        match self.state {
            ChannelState::Open
            | ChannelState::Errored
            | ChannelState::Inserting
            | ChannelState::Opening => {}
            state => {
                return Err(SessionError::InvalidState {
                    operation: "reopen",
                    state,
                })
            }
        }
        info!("Reopening channel: channel={}", self.channel_name);
        self.establish().await
    }

    /// Inserts `batch`, chaining on the handle's current continuation token.
    ///
    /// Every attempt, retries included, reads the continuation token from the
    /// handle immediately before building the request. On success the token
    /// is replaced by the one returned. An empty batch is a no-op.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidState`] unless the session is `Open`,
    /// - [`SessionError::Insert`] with the batch's byte range once retries are
    ///   exhausted or the platform rejects the batch (session becomes `Errored`),
    /// - [`SessionError::Auth`] if the scoped token is rejected after a reopen,
    /// - any error of [`ChannelSession::reopen`] if a transparent reopen fails.
    pub async fn insert(&mut self, batch: &Batch) -> Result<InsertReceipt, SessionError> {
        if self.state != ChannelState::Open {
            return Err(SessionError::InvalidState {
                operation: "insert",
                state: self.state,
            });
        }
        if self.needs_reopen {
            info!(
                "Reopening channel before insert, continuation state unknown: channel={}",
                self.channel_name
            );
            self.establish().await?;
        }
        if batch.is_empty() {
            return Ok(InsertReceipt {
                rows: 0,
                bytes: 0,
                attempts: 0,
                offset_token: self.rows_accepted.to_string(),
                status: None,
            });
        }

        self.state = ChannelState::Inserting;
        let offset_token = (self.rows_accepted + batch.len() as u64).to_string();
        let mut spent: u32 = 0;
        let mut reopened = false;

        loop {
            let result = self
                .transport
                .execute("insert_rows", &self.policy, || {
                    self.insert_request(batch, &offset_token)
                })
                .await;

            match result {
                Ok(exchange) => return self.commit_insert(batch, exchange, offset_token, spent),
                Err(TransportError::Reauthenticate { attempts, .. }) if !reopened => {
                    spent += attempts;
                    reopened = true;
                    info!(
                        "Scoped token rejected, reopening channel: channel={}",
                        self.channel_name
                    );
                    self.establish().await?;
                    self.state = ChannelState::Inserting;
                }
                Err(TransportError::Reauthenticate { body, .. }) => {
                    self.state = ChannelState::Errored;
                    self.record_error(MetricsErrorKind::AuthFailed);
                    error!(
                        "Scoped token rejected after reopen: channel={}",
                        self.channel_name
                    );
                    return Err(SessionError::Auth {
                        channel: self.channel_name.clone(),
                        source: TransportError::Auth { body },
                    });
                }
                Err(source) => return Err(self.fail_insert(batch, source)),
            }
        }
    }

    /// Reads the server-side status of this channel.
    ///
    /// Does not touch the channel handle. If a previous insert was abandoned,
    /// the session returns to `Open` and the next insert reopens the channel
    /// before sending.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidState`] if the channel was never opened or is closed,
    /// - [`SessionError::Status`] if the request fails,
    /// - [`SessionError::Protocol`] if the response omits this channel.
    pub async fn status(&mut self) -> Result<ChannelStatus, SessionError> {
        let state = self.state;
        let allowed = match state {
            ChannelState::Open | ChannelState::Inserting => true,
            ChannelState::Opening => self.handle.is_some(),
            _ => false,
        };
        let control = match (&self.control_host, allowed) {
            (Some(control), true) => control.clone(),
            _ => {
                return Err(SessionError::InvalidState {
                    operation: "status",
                    state,
                })
            }
        };

        let url = pipe_endpoint(
            &control,
            CONTROL_PATH_PREFIX,
            &self.pipe,
            &[&format!("{}:bulk-channel-status", self.pipe.pipe())],
        )
        .map_err(|e| self.status_error(e.into()))?;
        let body = serde_json::to_vec(&ChannelStatusRequest {
            channel_names: [self.channel_name.as_str()],
        })
        .map_err(|e| invalid_request(&e))
        .map_err(|e| self.status_error(e.into()))?;

        let exchange = self
            .account_call("channel_status", |bearer| {
                Ok(account_request(Method::Post, url.clone(), bearer).json_body(body.clone()))
            })
            .await
            .map_err(|e| self.status_error(e))?;

        let response: ChannelStatusResponse = exchange
            .response
            .json()
            .map_err(|e| self.status_error(e.into()))?;
        let status = response
            .channel_statuses
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&self.channel_name))
            .map(|(_, status)| status)
            .ok_or_else(|| SessionError::Protocol {
                operation: "channel_status",
                message: format!("channel {} missing from status response", self.channel_name),
            })?;

        if state != ChannelState::Open {
            info!(
                "Reconciled channel after interrupted operation: channel={}, rows_inserted={}",
                self.channel_name, status.rows_inserted
            );
            self.state = ChannelState::Open;
            self.needs_reopen = true;
        }

        debug!(
            "Channel status: channel={}, rows_inserted={}, error_count={}",
            self.channel_name, status.rows_inserted, status.error_count
        );
        Ok(status)
    }

    /// Closes the channel, best-effort.
    ///
    /// Valid in every state; a no-op once closed or if never opened. Failures
    /// are logged and not returned: the platform reclaims idle channels.
    pub async fn close(&mut self) {
        if matches!(self.state, ChannelState::Closed | ChannelState::Unopened) {
            self.state = ChannelState::Closed;
            return;
        }

        let handle = self.handle.take();
        if let (Some(_), Some(control)) = (handle, self.control_host.clone()) {
            self.state = ChannelState::Closing;
            match self.delete_channel(&control).await {
                Ok(()) => info!("Closed channel: channel={}", self.channel_name),
                Err(CallError::Transport(TransportError::Request { status: 404, .. })) => {
                    debug!("Channel already gone on close: channel={}", self.channel_name);
                }
                Err(e) => {
                    warn!(
                        "Failed to close channel, leaving it to expire: channel={}, error={}",
                        self.channel_name,
                        call_error_message(&e)
                    );
                    self.record_error(MetricsErrorKind::ChannelClose);
                }
            }
        }

        self.state = ChannelState::Closed;
        self.lease = None;
    }

    async fn delete_channel(&self, control: &Url) -> Result<(), CallError> {
        let url = pipe_endpoint(
            control,
            CONTROL_PATH_PREFIX,
            &self.pipe,
            &[self.pipe.pipe(), "channels", &self.channel_name],
        )?;
        self.account_call("close_channel", |bearer| {
            Ok(account_request(Method::Delete, url.clone(), bearer))
        })
        .await?;
        Ok(())
    }

    // Opening -> Open, or Errored on failure.
    async fn establish(&mut self) -> Result<(), SessionError> {
        self.state = ChannelState::Opening;
        self.handle = None;

        match self.open_channel().await {
            Ok(handle) => {
                info!(
                    "Opened channel: channel={}, ingest_host={}",
                    self.channel_name,
                    handle.ingest_host()
                );
                self.handle = Some(handle);
                self.state = ChannelState::Open;
                self.needs_reopen = false;
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to open channel: channel={}, error={}",
                    self.channel_name, e
                );
                self.state = ChannelState::Errored;
                self.record_error(MetricsErrorKind::ChannelOpen);
                Err(e)
            }
        }
    }

    async fn open_channel(&mut self) -> Result<ChannelHandle, SessionError> {
        let control = self.discover_control_host().await?;
        self.control_host = Some(control.clone());

        let url = pipe_endpoint(
            &control,
            CONTROL_PATH_PREFIX,
            &self.pipe,
            &[&format!("{}:open-channel", self.pipe.pipe())],
        )
        .map_err(|e| self.open_error(e.into()))?;
        let body = serde_json::to_vec(&OpenChannelRequest {
            channel_name: &self.channel_name,
        })
        .map_err(|e| self.open_error(invalid_request(&e).into()))?;

        let exchange = self
            .account_call("open_channel", |bearer| {
                Ok(account_request(Method::Post, url.clone(), bearer).json_body(body.clone()))
            })
            .await
            .map_err(|e| self.open_error(e))?;

        let response: OpenChannelResponse = exchange
            .response
            .json()
            .map_err(|e| self.open_error(e.into()))?;
        let ingest_host = match response.ingest_host.as_deref() {
            Some(raw) => parse_host(raw).map_err(|message| SessionError::Protocol {
                operation: "open_channel",
                message,
            })?,
            None => control,
        };

        debug!(
            "Channel open response: channel={}, continuation_token={}",
            self.channel_name,
            token_prefix(&response.continuation_token)
        );
        Ok(ChannelHandle::new(
            self.channel_name.clone(),
            ingest_host,
            response.scoped_token,
            response.continuation_token,
        ))
    }

    async fn discover_control_host(&self) -> Result<Url, SessionError> {
        let mut url = self.account_url.clone();
        url.set_path(HOSTNAME_PATH);

        let exchange = self
            .account_call("discover_host", |bearer| {
                Ok(account_request(Method::Get, url.clone(), bearer))
            })
            .await
            .map_err(|e| self.open_error(e))?;

        let control = parse_host(&exchange.response.text()).map_err(|message| {
            SessionError::Protocol {
                operation: "discover_host",
                message,
            }
        })?;
        debug!(
            "Resolved control host: channel={}, control_host={}",
            self.channel_name, control
        );
        Ok(control)
    }

    // Runs an account-level call, refreshing the assertion once on 401.
    async fn account_call<F>(&self, operation: &'static str, mut build: F) -> Result<Exchange, CallError>
    where
        F: FnMut(&str) -> Result<HttpRequest, TransportError>,
    {
        let assertion = self.tokens.get_current()?;
        match self
            .transport
            .execute(operation, &self.policy, || build(assertion.bearer()))
            .await
        {
            Err(TransportError::Reauthenticate { .. }) => {}
            other => return other.map_err(CallError::from),
        }

        info!(
            "Assertion rejected, minting a new one: operation={}, identity={}",
            operation,
            self.tokens.identity()
        );
        // Claims have one-second granularity: a re-mint within the same
        // second reproduces the rejected bearer.
        self.tokens.invalidate(&assertion);
        let refreshed = self.tokens.get_current()?;

        match self
            .transport
            .execute(operation, &self.policy, || build(refreshed.bearer()))
            .await
        {
            Err(TransportError::Reauthenticate { body, .. }) => {
                error!(
                    "Refreshed assertion rejected: operation={}, identity={}",
                    operation,
                    self.tokens.identity()
                );
                self.record_error(MetricsErrorKind::AuthFailed);
                Err(CallError::Transport(TransportError::Auth { body }))
            }
            other => other.map_err(CallError::from),
        }
    }

    fn insert_request(&self, batch: &Batch, offset_token: &str) -> Result<HttpRequest, TransportError> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| TransportError::InvalidRequest("channel has no live handle".into()))?;

        let channel_segment = format!("{}:insert-rows", self.channel_name);
        let url = pipe_endpoint(
            handle.ingest_host(),
            INGEST_PATH_PREFIX,
            &self.pipe,
            &[self.pipe.pipe(), "channels", &channel_segment],
        )?;
        let body = serde_json::to_vec(&InsertRowsRequest {
            rows: batch.rows(),
            continuation_token: handle.continuation_token(),
            offset_token,
        })
        .map_err(|e| invalid_request(&e))?;
        if body.len() > self.max_request_bytes {
            return Err(TransportError::BodyTooLarge {
                bytes: body.len(),
                limit: self.max_request_bytes,
            });
        }

        Ok(HttpRequest::new(Method::Post, url)
            .bearer(handle.scoped_token())
            .header(CONTINUATION_TOKEN_HEADER, handle.continuation_token())
            .header("Accept", "application/json")
            .json_body(body))
    }

    fn commit_insert(
        &mut self,
        batch: &Batch,
        exchange: Exchange,
        offset_token: String,
        spent: u32,
    ) -> Result<InsertReceipt, SessionError> {
        let response: InsertRowsResponse = match exchange.response.json() {
            Ok(response) => response,
            Err(source) => return Err(self.fail_insert(batch, source)),
        };
        let Some(handle) = self.handle.as_mut() else {
            return Err(self.fail_insert(
                batch,
                TransportError::InvalidRequest("channel handle lost during insert".into()),
            ));
        };

        debug!(
            "Inserted rows: channel={}, rows={}, bytes={}, attempts={}, continuation_token={}",
            self.channel_name,
            batch.len(),
            batch.payload_bytes(),
            exchange.attempts,
            token_prefix(&response.continuation_token)
        );
        handle.advance(response.continuation_token);
        self.rows_accepted += batch.len() as u64;
        self.state = ChannelState::Open;
        if let Some(m) = self.metrics.as_deref() {
            m.record_insert(batch.len(), batch.payload_bytes());
        }

        Ok(InsertReceipt {
            rows: batch.len(),
            bytes: batch.payload_bytes(),
            attempts: spent + exchange.attempts,
            offset_token: response.offset_token.unwrap_or(offset_token),
            status: response.status,
        })
    }

    fn fail_insert(&mut self, batch: &Batch, source: TransportError) -> SessionError {
        self.state = ChannelState::Errored;
        self.record_error(MetricsErrorKind::Insert);
        error!(
            "Insert failed: channel={}, records={:?}, error={}",
            self.channel_name,
            batch.record_range(),
            source
        );
        SessionError::Insert {
            channel: self.channel_name.clone(),
            byte_range: batch.byte_range(),
            source,
        }
    }

    fn open_error(&self, e: CallError) -> SessionError {
        self.call_error(e, |channel, source| SessionError::ChannelOpen { channel, source })
    }

    fn status_error(&self, e: CallError) -> SessionError {
        self.call_error(e, |channel, source| SessionError::Status { channel, source })
    }

    fn call_error(
        &self,
        e: CallError,
        wrap: fn(String, TransportError) -> SessionError,
    ) -> SessionError {
        match e {
            CallError::Token(e) => SessionError::Token(e),
            CallError::Transport(source @ TransportError::Auth { .. }) => SessionError::Auth {
                channel: self.channel_name.clone(),
                source,
            },
            CallError::Transport(source) => wrap(self.channel_name.clone(), source),
        }
    }

    fn record_error(&self, kind: MetricsErrorKind) {
        if let Some(m) = self.metrics.as_deref() {
            m.record_error(kind);
        }
    }
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("channel_name", &self.channel_name)
            .field("pipe", &self.pipe)
            .field("account_url", &self.account_url.as_str())
            .field("state", &self.state)
            .field("handle", &self.handle)
            .field("control_host", &self.control_host.as_ref().map(Url::as_str))
            .field("needs_reopen", &self.needs_reopen)
            .field("rows_accepted", &self.rows_accepted)
            .field("max_request_bytes", &self.max_request_bytes)
            .finish_non_exhaustive()
    }
}

fn account_request(method: Method, url: Url, bearer: &str) -> HttpRequest {
    HttpRequest::new(method, url)
        .bearer(bearer)
        .header(TOKEN_TYPE_HEADER, KEYPAIR_JWT_TOKEN_TYPE)
        .header("Accept", "application/json")
}

// `{host}/{prefix}/databases/{db}/schemas/{schema}/pipes/{tail...}`
fn pipe_endpoint(
    host: &Url,
    prefix: &str,
    pipe: &PipeRef,
    tail: &[&str],
) -> Result<Url, TransportError> {
    let mut url = host.clone();
    url.set_query(None);
    url.path_segments_mut()
        .map_err(|()| TransportError::InvalidRequest(format!("{host} cannot carry a path")))?
        .clear()
        .extend(prefix.split('/').filter(|s| !s.is_empty()))
        .extend(["databases", pipe.database(), "schemas", pipe.schema(), "pipes"])
        .extend(tail);
    Ok(url)
}

fn invalid_request(e: &serde_json::Error) -> TransportError {
    TransportError::InvalidRequest(format!("cannot encode request body: {e}"))
}

fn call_error_message(e: &CallError) -> String {
    match e {
        CallError::Token(e) => e.to_string(),
        CallError::Transport(e) => e.to_string(),
    }
}
