//! Metrics seam for the streaming client.

use std::fmt;

/// Error kinds for structured metrics reporting.
///
/// Use these stable, low-cardinality labels when recording metrics.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum MetricsErrorKind {
    /// Minting an assertion failed.
    TokenMint,
    /// A request exhausted its retry budget on 429/5xx/timeouts.
    TransientExhausted,
    /// A request was rejected without retry (4xx other than 401).
    RequestRejected,
    /// Authentication failed after a refresh.
    AuthFailed,
    /// Opening a channel failed.
    ChannelOpen,
    /// An insert call failed after retries.
    Insert,
    /// Closing a channel failed (logged only).
    ChannelClose,
    /// A record was rejected locally before any network call.
    RecordRejected,
}

impl MetricsErrorKind {
    /// Returns a stable string representation of the error kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TokenMint => "token_mint",
            Self::TransientExhausted => "transient_exhausted",
            Self::RequestRejected => "request_rejected",
            Self::AuthFailed => "auth_failed",
            Self::ChannelOpen => "channel_open",
            Self::Insert => "insert",
            Self::ChannelClose => "channel_close",
            Self::RecordRejected => "record_rejected",
        }
    }
}

impl fmt::Display for MetricsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for recording client metrics.
///
/// Implement this trait to integrate with your metrics system (e.g., Prometheus, `StatsD`).
/// Every method has an empty default so implementors only pick what they need.
///
/// # Example
///
/// ```no_run
/// use snowpipe_stream::{MetricsErrorKind, MetricsRecorder};
///
/// struct MyMetrics;
///
/// impl MetricsRecorder for MyMetrics {
///     fn record_error(&self, kind: MetricsErrorKind) {
///         println!("error: {}", kind.as_str());
///     }
/// }
/// ```
pub trait MetricsRecorder: Send + Sync {
    /// Records that a new assertion was minted.
    fn record_token_minted(&self) {}

    /// Records that a request is about to be retried after a backoff sleep.
    ///
    /// `operation` is a stable label such as `"insert_rows"`.
    fn record_retry(&self, _operation: &'static str) {}

    /// Records a successful insert.
    fn record_insert(&self, _rows: usize, _bytes: usize) {}

    /// Records an error with a structured error kind.
    fn record_error(&self, _kind: MetricsErrorKind) {}
}
