use serde::{Serialize, Serializer};
use serde_json::{Map, Number, Value};
use time::{OffsetDateTime, UtcOffset};

/// One flat row: an ordered map of column name to primitive JSON value.
///
/// Any `Serialize` type that serializes to a JSON object can be written by the
/// [`BatchWriter`](super::BatchWriter); `Record` is a convenience for callers
/// that assemble rows field by field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a string column.
    pub fn set_str(&mut self, column: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.set(column, Value::String(value.into()))
    }

    /// Sets an integer column.
    pub fn set_i64(&mut self, column: impl Into<String>, value: i64) -> &mut Self {
        self.set(column, Value::Number(value.into()))
    }

    /// Sets a float column. NaN and infinities become `null`.
    pub fn set_f64(&mut self, column: impl Into<String>, value: f64) -> &mut Self {
        let value = Number::from_f64(value).map_or(Value::Null, Value::Number);
        self.set(column, value)
    }

    /// Sets a boolean column.
    pub fn set_bool(&mut self, column: impl Into<String>, value: bool) -> &mut Self {
        self.set(column, Value::Bool(value))
    }

    /// Sets a column to `null`.
    pub fn set_null(&mut self, column: impl Into<String>) -> &mut Self {
        self.set(column, Value::Null)
    }

    /// Sets a timestamp column as UTC `YYYY-MM-DDTHH:MM:SS.mmm`, no offset suffix.
    pub fn set_timestamp(&mut self, column: impl Into<String>, value: OffsetDateTime) -> &mut Self {
        self.set(column, Value::String(format_timestamp(value)))
    }

    /// Sets a column to an arbitrary JSON value.
    pub fn set(&mut self, column: impl Into<String>, value: Value) -> &mut Self {
        self.fields.insert(column.into(), value);
        self
    }

    /// Returns the value of `column`.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if no column is set.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Consumes the record into a JSON object.
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

/// Formats `value` in UTC with millisecond precision and no offset, the
/// platform's timestamp-without-time-zone text form.
pub fn format_timestamp(value: OffsetDateTime) -> String {
    let utc = value.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}",
        utc.year(),
        u8::from(utc.month()),
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second(),
        utc.millisecond()
    )
}
