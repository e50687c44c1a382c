use std::ops::Range;

use thiserror::Error;

use super::writer::WriteSummary;
use crate::channel::SessionError;

/// A single record rejected locally, before any network call.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecordError {
    /// The record serialized to something other than a JSON object.
    #[error("record {index} does not serialize to a JSON object")]
    NotAnObject {
        /// Position of the record in the input sequence.
        index: u64,
    },

    /// The serialized record alone exceeds the row budget of a request.
    #[error("record {index} is {bytes} bytes, over the {budget}-byte row budget")]
    TooLarge {
        /// Position of the record in the input sequence.
        index: u64,
        /// Serialized size.
        bytes: usize,
        /// Row budget per request.
        budget: usize,
    },

    /// More records than a single request may carry.
    #[error("{count} records exceed the per-request limit of {max_records}")]
    TooManyRecords {
        /// Records supplied.
        count: usize,
        /// Record limit per request.
        max_records: usize,
    },

    /// The record could not be serialized.
    #[error("record {index} cannot be serialized")]
    Serialize {
        /// Position of the record in the input sequence.
        index: u64,
        /// Serializer error.
        #[source]
        source: serde_json::Error,
    },
}

/// Why a batch (or a single locally rejected record) was not accepted.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BatchFailure {
    /// Rejected by the local size/shape check.
    #[error(transparent)]
    Record(#[from] RecordError),

    /// The insert call failed after retries.
    #[error(transparent)]
    Insert(#[from] SessionError),
}

/// Errors that end a [`BatchWriter::write`](super::BatchWriter::write) run early.
///
/// Both variants carry the summary of the work done before the abort.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WriteError {
    /// Fail-fast mode stopped at the first failed batch or rejected record.
    #[error("write aborted at records {records:?}")]
    Aborted {
        /// Record range of the failed batch.
        records: Range<u64>,
        /// Progress before the abort.
        summary: Box<WriteSummary>,
        /// Cause.
        #[source]
        source: BatchFailure,
    },

    /// An authentication, key or channel-open failure aborted the run in either mode.
    #[error("write aborted by fatal error")]
    Fatal {
        /// Progress before the abort.
        summary: Box<WriteSummary>,
        /// Cause.
        #[source]
        source: SessionError,
    },
}

impl WriteError {
    /// Returns the progress made before the run was aborted.
    pub fn summary(&self) -> &WriteSummary {
        match self {
            Self::Aborted { summary, .. } | Self::Fatal { summary, .. } => summary,
        }
    }
}
