//! Endpoint paths, header names and protocol limits used by the streaming client.

/// Path of the host discovery endpoint, relative to the account URL.
pub const HOSTNAME_PATH: &str = "/v2/streaming/hostname";

/// Prefix of control-plane paths (channel open, status, close).
pub const CONTROL_PATH_PREFIX: &str = "/v2/streaming";

/// Prefix of ingest-plane paths (row insertion).
pub const INGEST_PATH_PREFIX: &str = "/v2/streaming/data";

/// Header telling the platform which kind of bearer credential is presented.
pub const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";

/// Value of [`TOKEN_TYPE_HEADER`] for key-pair assertions.
pub const KEYPAIR_JWT_TOKEN_TYPE: &str = "KEYPAIR_JWT";

/// Header carrying the channel's current continuation token on inserts.
pub const CONTINUATION_TOKEN_HEADER: &str = "X-Snowflake-Continuation-Token";

/// `User-Agent` sent on every request.
pub const USER_AGENT: &str = concat!("snowpipe-stream/", env!("CARGO_PKG_VERSION"));

/// Longest assertion lifetime the platform accepts.
pub const MAX_ASSERTION_LIFETIME_SECS: u64 = 60 * 60;

/// Default assertion lifetime: one minute under the platform ceiling.
pub const DEFAULT_ASSERTION_LIFETIME_SECS: u64 = 59 * 60;

/// Default window before expiry in which a cached assertion is replaced.
pub const DEFAULT_REFRESH_MARGIN_SECS: u64 = 5 * 60;

/// Hard per-request body ceiling enforced by the platform.
pub const PLATFORM_MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// Bytes reserved in every insert body for the JSON envelope around the rows
/// (`{"rows":[`, `],"continuation_token":"…","offset_token":"…"}`).
pub const FRAMING_OVERHEAD_BYTES: usize = 4 * 1024;

/// Default maximum number of records per insert call.
pub const DEFAULT_MAX_BATCH_RECORDS: usize = 100;

/// Default maximum request body size used by the batcher.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;

/// Default suffix-bearing channel name template.
pub const DEFAULT_CHANNEL_TEMPLATE: &str = "{pipe}_channel_{suffix}";
