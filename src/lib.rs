#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! This crate is a client for the Snowpipe Streaming REST API.
//!
//! It authenticates with an RSA key pair, opens named channels on a pipe,
//! and streams JSON rows through them in order, with bounded retries and a
//! single shared assertion per identity.
//!
//! The primary entry point is [`StreamingClient`], built from a
//! [`ClientConfig`]. It hands out [`ChannelSession`]s (one per channel) and
//! [`BatchWriter`]s that slice any sequence of `Serialize` records into
//! size-bounded insert requests.
//!
//! ```no_run
//! use snowpipe_stream::{ClientConfig, Record, StreamingClient, WriteMode};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::from_env()?;
//! let client = StreamingClient::from_config(&config)?;
//!
//! let mut session = client.session(0);
//! session.open().await?;
//!
//! let mut row = Record::new();
//! row.set_i64("id", 1).set_str("event", "signup");
//!
//! let summary = client
//!     .batch_writer(WriteMode::BestEffort)
//!     .write([row], &mut session)
//!     .await?;
//!
//! let status = session.status().await?;
//! println!("{summary}; server has {} rows", status.rows_inserted);
//!
//! session.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **`logging`** (default): internal events through the `log` facade
//! - **`tracing`**: internal events through `tracing` instead

pub mod auth;
pub mod batch;
pub mod channel;
pub mod client;
pub mod config;
pub mod constants;
pub mod metrics;
pub mod transport;

mod observability;
mod prelude;

// -----------------------
// Re-exports
// -----------------------

pub use crate::{
    auth::{Assertion, Identity, KeyError, KeySource, SigningKey, TokenCache, TokenError, TokenIssuer},
    batch::{
        BatchFailure, BatchLimits, BatchWriter, FailedBatch, Record, RecordError, WriteError,
        WriteMode, WriteSummary,
    },
    channel::{ChannelSession, ChannelState, ChannelStatus, InsertReceipt, SessionError},
    client::{ClientError, StreamingClient, StreamingClientBuilder},
    config::{ChannelNameTemplate, ClientConfig, ConfigError, PipeRef},
    metrics::{MetricsErrorKind, MetricsRecorder},
    transport::{HttpClient, HttpTransport, RetryPolicy, TransportError},
};
