use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::buffer::{encode_row, Batch, BatchLimits};
use super::errors::{BatchFailure, WriteError};
use crate::channel::{ChannelSession, SessionError};
use crate::metrics::{MetricsErrorKind, MetricsRecorder};
use crate::prelude::{debug, info, warn};

/// What the writer does when a batch cannot be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Stop at the first failed batch and return [`WriteError::Aborted`].
    FailFast,
    /// Record the failed batch in the summary, reopen the channel, continue.
    BestEffort,
}

/// A batch (or single rejected record) that was not accepted.
#[derive(Debug)]
pub struct FailedBatch {
    /// Input indices of the records.
    pub records: Range<u64>,
    /// Byte range of the records within the delivered row stream (the
    /// concatenated payloads of every batch). Empty for a record rejected
    /// locally, positioned where it would have been.
    pub bytes: Range<u64>,
    /// Cause.
    pub error: BatchFailure,
}

/// Outcome of a [`BatchWriter::write`] run.
#[derive(Debug, Default)]
pub struct WriteSummary {
    /// Records handed to an insert call or rejected locally.
    pub records_attempted: u64,
    /// Records in accepted batches.
    pub records_accepted: u64,
    /// Accepted insert calls.
    pub batches_accepted: u64,
    /// Failed batches and locally rejected records.
    pub batches_failed: u64,
    /// Details of each failure, in input order.
    pub failed_batches: Vec<FailedBatch>,
    /// HTTP attempts beyond the first, summed over all batches.
    pub retries: u64,
    /// Wall time of the run.
    pub elapsed: Duration,
    /// `true` if the run stopped because of cancellation.
    pub cancelled: bool,
    /// Input indices of the batch whose insert was interrupted by
    /// cancellation. Whether the platform committed it is unknown until
    /// [`ChannelSession::status`] is read.
    pub in_flight: Option<Range<u64>>,
}

impl fmt::Display for WriteSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted={} accepted={} batches_accepted={} batches_failed={} retries={} elapsed_ms={} cancelled={}",
            self.records_attempted,
            self.records_accepted,
            self.batches_accepted,
            self.batches_failed,
            self.retries,
            self.elapsed.as_millis(),
            self.cancelled
        )
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Slices a record stream into bounded batches and inserts them in order.
///
/// Records are consumed lazily, one batch at a time. A batch is closed as
/// soon as the next record would exceed the record limit or the row byte
/// budget; a record that alone exceeds the budget is rejected locally without
/// a network call.
pub struct BatchWriter {
    limits: BatchLimits,
    mode: WriteMode,
    cancel: Option<CancellationToken>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl fmt::Debug for BatchWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchWriter")
            .field("limits", &self.limits)
            .field("mode", &self.mode)
            .field("cancel", &self.cancel)
            .field(
                "metrics",
                &self.metrics.as_ref().map(|_| "<MetricsRecorder>"),
            )
            .finish()
    }
}

impl BatchWriter {
    /// Creates a writer. The failure mode has no default.
    pub const fn new(limits: BatchLimits, mode: WriteMode) -> Self {
        Self {
            limits,
            mode,
            cancel: None,
            metrics: None,
        }
    }

    /// Stops the run when `token` is cancelled, between or during batches.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Attaches a metrics recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the limits.
    pub const fn limits(&self) -> BatchLimits {
        self.limits
    }

    /// Returns the failure mode.
    pub const fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Writes every record of `records` through `session`.
    ///
    /// In fail-fast mode, records still buffered when a failure occurs are
    /// neither sent nor counted as attempted. In best-effort mode, rows
    /// buffered ahead of a locally rejected record are flushed first, so every
    /// batch covers a contiguous run of input indices. If cancelled during an
    /// insert, the session is left `Inserting` and the batch is reported in
    /// [`WriteSummary::in_flight`]; call [`ChannelSession::status`] and
    /// [`ChannelSession::close`] afterwards.
    ///
    /// # Errors
    ///
    /// - [`WriteError::Fatal`] on an authentication, key or channel-open
    ///   failure, in either mode,
    /// - [`WriteError::Aborted`] in fail-fast mode on the first failed batch or
    ///   rejected record.
    pub async fn write<I, T>(
        &self,
        records: I,
        session: &mut ChannelSession,
    ) -> Result<WriteSummary, WriteError>
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
    {
        let started = Instant::now();
        let mut summary = WriteSummary::default();
        let mut batch = Batch::starting_at(0, 0);
        let mut byte_cursor: u64 = 0;
        let budget = self.limits.row_budget();

        info!(
            "Starting write: channel={}, mode={:?}, max_records={}, row_budget={}",
            session.channel_name(),
            self.mode,
            self.limits.max_records(),
            budget
        );

        for (index, record) in (0u64..).zip(records) {
            if self.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let row = match encode_row(index, &record, budget) {
                Ok(row) => row,
                Err(e) => {
                    if self.mode == WriteMode::BestEffort && !batch.is_empty() {
                        // Batches never span a rejected record.
                        let pending =
                            std::mem::replace(&mut batch, Batch::starting_at(index, byte_cursor));
                        if let Flow::Stop = self.flush(pending, session, &mut summary, started).await? {
                            break;
                        }
                    }

                    summary.records_attempted += 1;
                    if let Some(m) = self.metrics.as_deref() {
                        m.record_error(MetricsErrorKind::RecordRejected);
                    }
                    warn!("Rejected record: channel={}, error={}", session.channel_name(), e);
                    self.record_failure(
                        &mut summary,
                        started,
                        index..index + 1,
                        byte_cursor..byte_cursor,
                        BatchFailure::Record(e),
                    )?;
                    batch = Batch::starting_at(index + 1, byte_cursor);
                    continue;
                }
            };

            if !batch.fits(&row, self.limits) {
                // Cut before the record that would not fit.
                let full = std::mem::replace(&mut batch, Batch::starting_at(index, byte_cursor));
                if let Flow::Stop = self.flush(full, session, &mut summary, started).await? {
                    break;
                }
            }

            if !batch.is_empty() {
                byte_cursor += 1;
            }
            byte_cursor += row.get().len() as u64;
            batch.push(row);
        }

        if !batch.is_empty() && !summary.cancelled {
            self.flush(batch, session, &mut summary, started).await?;
        }

        summary.elapsed = started.elapsed();
        info!(
            "Finished write: channel={}, {}",
            session.channel_name(),
            summary
        );
        Ok(summary)
    }

    async fn flush(
        &self,
        batch: Batch,
        session: &mut ChannelSession,
        summary: &mut WriteSummary,
        started: Instant,
    ) -> Result<Flow, WriteError> {
        if self.is_cancelled() {
            summary.cancelled = true;
            return Ok(Flow::Stop);
        }

        summary.records_attempted += batch.len() as u64;
        debug!(
            "Flushing batch: channel={}, records={:?}, bytes={}",
            session.channel_name(),
            batch.record_range(),
            batch.payload_bytes()
        );

        let result = match &self.cancel {
            Some(token) => {
                tokio::select! {
                    result = session.insert(&batch) => result,
                    () = token.cancelled() => {
                        info!(
                            "Write cancelled during insert: records={:?}",
                            batch.record_range()
                        );
                        summary.cancelled = true;
                        summary.in_flight = Some(batch.record_range());
                        return Ok(Flow::Stop);
                    }
                }
            }
            None => session.insert(&batch).await,
        };

        match result {
            Ok(receipt) => {
                summary.records_accepted += receipt.rows as u64;
                summary.batches_accepted += 1;
                summary.retries += u64::from(receipt.attempts.saturating_sub(1));
                Ok(Flow::Continue)
            }
            Err(e) if e.is_fatal() => Err(self.fatal(summary, started, e)),
            Err(e) => {
                summary.retries += u64::from(failed_attempts(&e).saturating_sub(1));
                self.record_failure(
                    summary,
                    started,
                    batch.record_range(),
                    batch.byte_range(),
                    BatchFailure::Insert(e),
                )?;

                // The failed insert left the session Errored.
                if let Err(e) = session.reopen().await {
                    return Err(self.fatal(summary, started, e));
                }
                Ok(Flow::Continue)
            }
        }
    }

    // Fail-fast returns the abort error; best-effort records and continues.
    fn record_failure(
        &self,
        summary: &mut WriteSummary,
        started: Instant,
        records: Range<u64>,
        bytes: Range<u64>,
        error: BatchFailure,
    ) -> Result<(), WriteError> {
        match self.mode {
            WriteMode::FailFast => {
                summary.batches_failed += 1;
                summary.elapsed = started.elapsed();
                warn!(
                    "Aborting write: records={:?}, error={}",
                    records, error
                );
                Err(WriteError::Aborted {
                    records,
                    summary: Box::new(std::mem::take(summary)),
                    source: error,
                })
            }
            WriteMode::BestEffort => {
                warn!(
                    "Skipping failed records: records={:?}, bytes={:?}, error={}",
                    records, bytes, error
                );
                summary.batches_failed += 1;
                summary.failed_batches.push(FailedBatch {
                    records,
                    bytes,
                    error,
                });
                Ok(())
            }
        }
    }

    fn fatal(&self, summary: &mut WriteSummary, started: Instant, source: SessionError) -> WriteError {
        summary.elapsed = started.elapsed();
        warn!("Aborting write on fatal error: error={}", source);
        WriteError::Fatal {
            summary: Box::new(std::mem::take(summary)),
            source,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

fn failed_attempts(e: &SessionError) -> u32 {
    match e {
        SessionError::Insert { source, .. } => source.attempts().unwrap_or(1),
        _ => 1,
    }
}
