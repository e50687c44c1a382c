use thiserror::Error;

/// Errors surfaced by [`HttpTransport::execute`](super::HttpTransport::execute).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// 429, 5xx, timeouts and connection failures persisted past the retry budget.
    #[error("{}", transient_message(.last_status, .attempts, .body))]
    Transient {
        /// Status of the last attempt, `None` if it never got a response.
        last_status: Option<u16>,
        /// Body of the last response, or the client error message.
        body: String,
        /// Attempts made, including the first.
        attempts: u32,
    },

    /// The platform rejected the request outright (4xx other than 401).
    ///
    /// `body` is the platform's error payload, unmodified.
    #[error("request rejected with status {status}: {body}")]
    Request {
        /// HTTP status.
        status: u16,
        /// Response body, unmodified.
        body: String,
    },

    /// The credential was rejected again after a refresh.
    #[error("authentication failed after credential refresh: {body}")]
    Auth {
        /// Response body of the second rejection.
        body: String,
    },

    /// The credential was rejected; the caller must refresh it and retry once.
    #[error("credential rejected (401), re-authentication required")]
    Reauthenticate {
        /// Response body of the rejection.
        body: String,
        /// Attempts made, the rejected one included.
        attempts: u32,
    },

    /// The request could not be built (malformed host, bad identifier).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The encoded body is larger than the configured request limit; nothing was sent.
    #[error("request body of {bytes} bytes exceeds the {limit}-byte limit")]
    BodyTooLarge {
        /// Encoded body size.
        bytes: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A success response carried a body that does not match the protocol.
    #[error("cannot decode response body (status {status})")]
    Decode {
        /// HTTP status of the undecodable response.
        status: u16,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
}

impl TransportError {
    /// Returns the HTTP status associated with the error, if any.
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Transient { last_status, .. } => *last_status,
            Self::Request { status, .. } | Self::Decode { status, .. } => Some(*status),
            Self::Auth { .. } | Self::Reauthenticate { .. } => Some(401),
            Self::InvalidRequest(_) | Self::BodyTooLarge { .. } => None,
        }
    }

    /// Returns `true` for errors that no retry or batch skip can heal.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::InvalidRequest(_))
    }

    /// Returns the number of attempts made, when known.
    pub const fn attempts(&self) -> Option<u32> {
        match self {
            Self::Transient { attempts, .. } | Self::Reauthenticate { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }
}

fn transient_message(last_status: &Option<u16>, attempts: &u32, body: &str) -> String {
    match last_status {
        Some(status) => {
            format!("transient failure after {attempts} attempts: status {status}: {body}")
        }
        None => format!("transient failure after {attempts} attempts: {body}"),
    }
}
