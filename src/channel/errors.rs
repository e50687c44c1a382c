use std::ops::Range;

use thiserror::Error;

use super::state::ChannelState;
use crate::auth::TokenError;
use crate::transport::TransportError;

/// Errors returned by [`ChannelSession`](super::ChannelSession) operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// Host discovery or channel open failed; the session is `Errored`.
    #[error("cannot open channel {channel}")]
    ChannelOpen {
        /// Logical channel name.
        channel: String,
        /// Cause.
        #[source]
        source: TransportError,
    },

    /// An insert exhausted its retry budget or was rejected; the session is `Errored`.
    ///
    /// `byte_range` locates the failed rows within the writer's serialized
    /// input stream, for replay decisions.
    #[error("insert into channel {channel} failed for bytes {byte_range:?}")]
    Insert {
        /// Logical channel name.
        channel: String,
        /// Byte range of the failed batch.
        byte_range: Range<u64>,
        /// Cause.
        #[source]
        source: TransportError,
    },

    /// A credential was rejected again after one refresh.
    #[error("authentication failed for channel {channel}")]
    Auth {
        /// Logical channel name.
        channel: String,
        /// Cause.
        #[source]
        source: TransportError,
    },

    /// A status request failed.
    #[error("cannot read status of channel {channel}")]
    Status {
        /// Logical channel name.
        channel: String,
        /// Cause.
        #[source]
        source: TransportError,
    },

    /// The operation is not valid in the session's current state.
    #[error("{operation} is not allowed while the channel is {state}")]
    InvalidState {
        /// Rejected operation.
        operation: &'static str,
        /// State at the time of the call.
        state: ChannelState,
    },

    /// Another session of the same client already holds this channel open.
    #[error("channel {channel} is already open in another session")]
    ChannelInUse {
        /// Logical channel name.
        channel: String,
    },

    /// No assertion could be minted.
    #[error("cannot obtain account assertion")]
    Token(#[from] TokenError),

    /// A success response did not carry what the protocol requires.
    #[error("protocol violation during {operation}: {message}")]
    Protocol {
        /// Operation label.
        operation: &'static str,
        /// Description.
        message: String,
    },
}

impl SessionError {
    /// Returns `true` for errors that should abort a whole write run.
    ///
    /// Authentication, key and channel-open failures are fatal; a failed
    /// insert or status read is scoped to one batch.
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::ChannelOpen { .. }
            | Self::Auth { .. }
            | Self::InvalidState { .. }
            | Self::ChannelInUse { .. }
            | Self::Token(_) => true,
            Self::Insert { source, .. } | Self::Status { source, .. } => source.is_fatal(),
            Self::Protocol { .. } => false,
        }
    }
}
