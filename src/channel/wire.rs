//! Request and response bodies of the streaming endpoints.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use url::Url;

#[derive(Debug, Serialize)]
pub(crate) struct OpenChannelRequest<'a> {
    pub(crate) channel_name: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenChannelResponse {
    #[serde(default)]
    pub(crate) ingest_host: Option<String>,
    pub(crate) scoped_token: String,
    #[serde(alias = "next_continuation_token")]
    pub(crate) continuation_token: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct InsertRowsRequest<'a> {
    pub(crate) rows: &'a [Box<RawValue>],
    pub(crate) continuation_token: &'a str,
    pub(crate) offset_token: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct InsertRowsResponse {
    #[serde(default)]
    pub(crate) status: Option<String>,
    #[serde(alias = "next_continuation_token")]
    pub(crate) continuation_token: String,
    #[serde(default)]
    pub(crate) offset_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChannelStatusRequest<'a> {
    pub(crate) channel_names: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelStatusResponse {
    #[serde(default)]
    pub(crate) channel_statuses: HashMap<String, ChannelStatus>,
}

#[derive(Debug, Deserialize)]
struct HostnameBody {
    hostname: String,
}

/// Server-side view of a channel, as returned by the bulk status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ChannelStatus {
    /// Platform status code.
    #[serde(default, alias = "channel_status_code")]
    pub status: Option<String>,
    /// Time of the last committed insert, as reported.
    #[serde(default)]
    pub last_insert_time: Option<String>,
    /// Rows committed on this channel.
    #[serde(default, alias = "rows_inserted_count")]
    pub rows_inserted: u64,
    /// Bytes committed on this channel.
    #[serde(default)]
    pub bytes_inserted: u64,
    /// Rows the platform rejected.
    #[serde(default, alias = "rows_error_count")]
    pub error_count: u64,
    /// Message of the last row error.
    #[serde(default)]
    pub last_error_message: Option<String>,
    /// Last committed offset token.
    #[serde(default, alias = "last_committed_offset_token")]
    pub offset_token: Option<String>,
}

/// Parses a host as returned by discovery or channel open.
///
/// Accepts a bare hostname or `{"hostname": "..."}`, replaces `_` with `-`,
/// lower-cases, and prefixes `https://` unless a scheme is present.
pub(crate) fn parse_host(raw: &str) -> Result<Url, String> {
    let trimmed = raw.trim();
    let host = if trimmed.starts_with('{') {
        serde_json::from_str::<HostnameBody>(trimmed)
            .map_err(|e| format!("malformed hostname document: {e}"))?
            .hostname
    } else {
        trimmed.trim_matches('"').to_owned()
    };

    let host = host.trim();
    if host.is_empty() {
        return Err("empty hostname".to_owned());
    }

    let (scheme, rest) = host.split_once("://").unwrap_or(("https", host));
    let normalized = rest.replace('_', "-").to_lowercase();
    Url::parse(&format!("{scheme}://{normalized}")).map_err(|e| format!("invalid host '{host}': {e}"))
}
