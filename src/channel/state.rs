use std::fmt;

use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::observability::token_prefix;

/// Lifecycle of a [`ChannelSession`](super::ChannelSession).
///
/// ```text
/// Unopened -> Opening -> Open <-> Inserting
///                         |
///                         v
///                      Closing -> Closed
/// ```
/// `Errored` is reachable from any non-terminal state. `Inserting` persists if
/// an insert is abandoned mid-flight, until `status()` reconciles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Created, never opened.
    Unopened,
    /// Host discovery or channel open in flight.
    Opening,
    /// Ready for inserts.
    Open,
    /// An insert is in flight (or was abandoned).
    Inserting,
    /// Close in flight.
    Closing,
    /// Closed; no further calls.
    Closed,
    /// Unrecoverable failure; only `reopen()` and `close()` are accepted.
    Errored,
}

impl ChannelState {
    /// Returns `true` for `Closed` and `Errored`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }

    /// Returns a stable lowercase label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unopened => "unopened",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Inserting => "inserting",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct ScopedToken(String);

/// Server-issued state of an open channel.
///
/// Owned exclusively by its session. The continuation token is replaced after
/// every accepted insert; the scoped token is only replaced by reopening.
#[derive(Clone)]
pub struct ChannelHandle {
    channel_name: String,
    ingest_host: Url,
    scoped_token: ScopedToken,
    continuation_token: String,
}

impl ChannelHandle {
    pub(crate) fn new(
        channel_name: String,
        ingest_host: Url,
        scoped_token: String,
        continuation_token: String,
    ) -> Self {
        Self {
            channel_name,
            ingest_host,
            scoped_token: ScopedToken(scoped_token),
            continuation_token,
        }
    }

    /// Returns the channel name.
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Returns the host that accepts inserts for this channel.
    pub const fn ingest_host(&self) -> &Url {
        &self.ingest_host
    }

    /// Returns the token the next insert must present.
    pub fn continuation_token(&self) -> &str {
        &self.continuation_token
    }

    pub(crate) fn scoped_token(&self) -> &str {
        &self.scoped_token.0
    }

    pub(crate) fn advance(&mut self, continuation_token: String) {
        self.continuation_token = continuation_token;
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("channel_name", &self.channel_name)
            .field("ingest_host", &self.ingest_host.as_str())
            .field("scoped_token", &"<redacted>")
            .field(
                "continuation_token",
                &format_args!("{}...", token_prefix(&self.continuation_token)),
            )
            .finish()
    }
}
