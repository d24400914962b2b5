//! Key/value records and their `key;value` line encoding.
//!
//! Every intermediate file in a join pipeline is a sequence of lines of the form
//! `key;value`. The first `;` separates the key from the value and neither side may
//! contain the delimiter or a line break. Keys compare byte-wise, never numerically,
//! so numeric ids must be zero-padded by the caller when numeric order matters.
//!
//! Records form a multiset: two records with the same key and value are distinct
//! entries and survive sorting and merging independently.

use std::error::Error;
use std::fmt;

/// Separator between key and value on every intermediate line.
pub const DELIMITER: char = ';';

/// A single `(key, value)` pair.
///
/// The derived ordering compares the key first and the value second, which gives
/// bucket spills a deterministic order for records sharing a key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Record {
    pub key: String,
    pub value: String,
}

impl Record {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Build a record after checking that neither half contains reserved characters.
    ///
    /// # Errors
    /// Returns a [`RecordError`] of kind [`RecordErrorKind::ReservedCharacter`] if the
    /// key or value contains `;`, `\n` or `\r`.
    pub fn checked(key: impl Into<String>, value: impl Into<String>) -> Result<Self, RecordError> {
        let record = Self::new(key, value);
        check_field("key", &record.key)?;
        check_field("value", &record.value)?;
        Ok(record)
    }

    /// Parse a `key;value` line, splitting on the first delimiter.
    ///
    /// # Errors
    /// Returns [`RecordErrorKind::MissingDelimiter`] when the line has no `;`.
    pub fn parse_line(line: &str) -> Result<Self, RecordError> {
        let (key, value) = split_line(line)?;
        Ok(Self::new(key, value))
    }

    pub fn into_parts(self) -> (String, String) {
        (self.key, self.value)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.key, DELIMITER, self.value)
    }
}

impl From<(String, String)> for Record {
    fn from((key, value): (String, String)) -> Self {
        Self { key, value }
    }
}

impl From<(&str, &str)> for Record {
    fn from((key, value): (&str, &str)) -> Self {
        Self::new(key, value)
    }
}

/// Split a line into borrowed key and value halves.
///
/// # Errors
/// Returns [`RecordErrorKind::MissingDelimiter`] when the line has no `;`.
pub fn split_line(line: &str) -> Result<(&str, &str), RecordError> {
    line.split_once(DELIMITER).ok_or_else(|| {
        RecordError::new(
            RecordErrorKind::MissingDelimiter,
            format!("line has no key: {line:?}"),
        )
    })
}

fn check_field(what: &str, field: &str) -> Result<(), RecordError> {
    if let Some(c) = field.chars().find(|c| matches!(c, ';' | '\n' | '\r')) {
        return Err(RecordError::new(
            RecordErrorKind::ReservedCharacter,
            format!("{what} contains reserved character {c:?}: {field:?}"),
        ));
    }
    Ok(())
}

/// Categories of engine errors that callers may want to match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordErrorKind {
    /// An intermediate line had no `;` separator.
    MissingDelimiter,
    /// A key or value passed to a sorter contained `;` or a line break.
    ReservedCharacter,
    /// Invalid sorter or pipeline configuration.
    Config,
    /// A join input went backwards while validation was enabled.
    UnsortedInput,
    /// The sorter was used after a failed spill.
    Closed,
}

/// Error raised by the record codec, the sorter and the join.
///
/// It travels inside `anyhow::Error`; use `err.downcast_ref::<RecordError>()` to
/// inspect the kind.
#[derive(Debug, Clone)]
pub struct RecordError {
    pub kind: RecordErrorKind,
    pub message: String,
}

impl RecordError {
    pub fn new(kind: RecordErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl Error for RecordError {}
