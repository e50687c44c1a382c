use std::ops::Range;

use serde::Serialize;
use serde_json::value::RawValue;

use super::errors::RecordError;
use crate::config::ConfigError;
use crate::constants::{
    DEFAULT_MAX_BATCH_RECORDS, DEFAULT_MAX_REQUEST_BYTES, FRAMING_OVERHEAD_BYTES,
    PLATFORM_MAX_REQUEST_BYTES,
};

/// Upper bounds for one insert request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    max_records: usize,
    max_request_bytes: usize,
}

impl BatchLimits {
    /// Creates limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `max_records` is zero, or if
    /// `max_request_bytes` leaves no room after the framing reserve or exceeds
    /// the platform ceiling.
    pub fn new(max_records: usize, max_request_bytes: usize) -> Result<Self, ConfigError> {
        if max_records == 0 {
            return Err(ConfigError::Invalid {
                field: "max_batch_records",
                reason: "must be at least 1".into(),
            });
        }
        if max_request_bytes <= FRAMING_OVERHEAD_BYTES {
            return Err(ConfigError::Invalid {
                field: "max_batch_bytes",
                reason: format!(
                    "{max_request_bytes} leaves no room after the {FRAMING_OVERHEAD_BYTES}-byte framing reserve"
                ),
            });
        }
        if max_request_bytes > PLATFORM_MAX_REQUEST_BYTES {
            return Err(ConfigError::Invalid {
                field: "max_batch_bytes",
                reason: format!(
                    "{max_request_bytes} exceeds the platform ceiling of {PLATFORM_MAX_REQUEST_BYTES}"
                ),
            });
        }
        Ok(Self {
            max_records,
            max_request_bytes,
        })
    }

    /// Returns the record limit.
    pub const fn max_records(&self) -> usize {
        self.max_records
    }

    /// Returns the request body limit.
    pub const fn max_request_bytes(&self) -> usize {
        self.max_request_bytes
    }

    /// Bytes available for the serialized rows (and the commas between them).
    pub const fn row_budget(&self) -> usize {
        self.max_request_bytes - FRAMING_OVERHEAD_BYTES
    }
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_BATCH_RECORDS,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

/// Ordered, size-bounded group of serialized rows for one insert call.
///
/// `payload_bytes` counts the rows plus the commas between them, which is
/// exactly what lands inside the request's `rows` array.
#[derive(Debug, Clone)]
pub struct Batch {
    rows: Vec<Box<RawValue>>,
    payload_bytes: usize,
    first_record: u64,
    byte_offset: u64,
}

impl Batch {
    /// Creates an empty batch whose first record has input index `first_record`
    /// and whose first byte sits at `byte_offset` in the serialized input stream.
    pub const fn starting_at(first_record: u64, byte_offset: u64) -> Self {
        Self {
            rows: Vec::new(),
            payload_bytes: 0,
            first_record,
            byte_offset,
        }
    }

    /// Serializes `records` into a single batch, enforcing `limits`.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::TooManyRecords`] if `records` exceeds the record
    /// limit, otherwise the error of the first record that is not an object,
    /// fails to serialize or does not fit.
    pub fn from_records<T: Serialize>(
        records: &[T],
        limits: BatchLimits,
    ) -> Result<Self, RecordError> {
        if records.len() > limits.max_records() {
            return Err(RecordError::TooManyRecords {
                count: records.len(),
                max_records: limits.max_records(),
            });
        }
        let mut batch = Self::starting_at(0, 0);
        for (index, record) in (0u64..).zip(records) {
            let row = encode_row(index, record, limits.row_budget())?;
            if !batch.fits(&row, limits) {
                return Err(RecordError::TooLarge {
                    index,
                    bytes: batch.payload_bytes + separator(&batch) + row.get().len(),
                    budget: limits.row_budget(),
                });
            }
            batch.push(row);
        }
        Ok(batch)
    }

    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if the batch holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the serialized size of the rows, commas included.
    pub const fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    /// Returns the input indices of the rows.
    pub fn record_range(&self) -> Range<u64> {
        self.first_record..self.first_record + self.rows.len() as u64
    }

    /// Returns the rows' byte range within the serialized input stream.
    pub fn byte_range(&self) -> Range<u64> {
        self.byte_offset..self.byte_offset + self.payload_bytes as u64
    }

    pub(crate) fn rows(&self) -> &[Box<RawValue>] {
        &self.rows
    }

    pub(crate) fn fits(&self, row: &RawValue, limits: BatchLimits) -> bool {
        self.rows.len() < limits.max_records()
            && self.payload_bytes + separator(self) + row.get().len() <= limits.row_budget()
    }

    pub(crate) fn push(&mut self, row: Box<RawValue>) {
        self.payload_bytes += separator(self) + row.get().len();
        self.rows.push(row);
    }
}

const fn separator(batch: &Batch) -> usize {
    if batch.rows.is_empty() {
        0
    } else {
        1
    }
}

/// Serializes one record and checks it against the row budget.
pub(crate) fn encode_row<T: Serialize + ?Sized>(
    index: u64,
    record: &T,
    budget: usize,
) -> Result<Box<RawValue>, RecordError> {
    let row = serde_json::value::to_raw_value(record)
        .map_err(|source| RecordError::Serialize { index, source })?;
    if !row.get().starts_with('{') {
        return Err(RecordError::NotAnObject { index });
    }
    let bytes = row.get().len();
    if bytes > budget {
        return Err(RecordError::TooLarge {
            index,
            bytes,
            budget,
        });
    }
    Ok(row)
}
