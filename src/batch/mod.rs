//! Batching and ordered delivery of records.
//!
//! [`BatchWriter`] consumes any sequence of `Serialize` records, cuts it into
//! [`Batch`]es bounded by [`BatchLimits`], and inserts them in input order
//! through a [`ChannelSession`](crate::channel::ChannelSession).

mod buffer;
mod errors;
mod record;
mod writer;

pub use buffer::{Batch, BatchLimits};
pub use errors::{BatchFailure, RecordError, WriteError};
pub use record::{format_timestamp, Record};
pub use writer::{BatchWriter, FailedBatch, WriteMode, WriteSummary};

