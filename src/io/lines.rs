//! Line-oriented record files.
//!
//! [`RecordReader`] is the sorted record stream used throughout the engine: a
//! forward-only, read-once iterator over the `key;value` lines of a (usually
//! compressed) file. [`RecordWriter`] produces such files.
//!
//! Malformed lines are fatal. A reader yields an error carrying the file name
//! and line number instead of skipping the line, because a silently dropped
//! record would corrupt every join downstream.

use crate::io::compression::{
    FinishWrite, create_gzip_writer, create_writer, open_reader, open_reader_with_capacity,
};
use crate::record::Record;
use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Lines, Read, Write};
use std::path::Path;

/// Forward-only stream of records read from `key;value` lines.
pub struct RecordReader {
    lines: Lines<Box<dyn BufRead + Send>>,
    source: String,
    line_no: usize,
}

impl RecordReader {
    /// Open a record file, decompressing according to its extension or magic bytes.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = open_reader(path)?;
        Ok(Self::from_reader(reader, path.display().to_string()))
    }

    /// Like [`RecordReader::open`], with `capacity` bytes of buffering under the codec.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn open_with_buffer(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref();
        let reader = open_reader_with_capacity(path, capacity)?;
        Ok(Self::from_reader(reader, path.display().to_string()))
    }

    /// Read records from an arbitrary byte stream; `source` names it in errors.
    pub fn from_reader<R: Read + Send + 'static>(reader: R, source: impl Into<String>) -> Self {
        let buffered: Box<dyn BufRead + Send> = Box::new(BufReader::new(reader));
        Self {
            lines: buffered.lines(),
            source: source.into(),
            line_no: 0,
        }
    }
}

impl Iterator for RecordReader {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = self.lines.next()?;
        self.line_no += 1;
        let line_no = self.line_no;
        Some(
            line.with_context(|| format!("read line {line_no} in {}", self.source))
                .and_then(|line| {
                    Record::parse_line(&line).with_context(|| {
                        format!("parse line {line_no} in {}", self.source)
                    })
                }),
        )
    }
}

/// Writer of `key;value` lines into a compressed file.
///
/// Call [`RecordWriter::finish`] to complete the file; dropping the writer without
/// finishing leaves a truncated stream behind.
pub struct RecordWriter {
    inner: Box<dyn FinishWrite>,
    written: u64,
}

impl RecordWriter {
    /// Create `path`, compressing with the codec selected by `codec_hint`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create(path: impl AsRef<Path>, codec_hint: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            inner: create_writer(path, codec_hint)?,
            written: 0,
        })
    }

    /// Create a gzip-compressed record file regardless of its name.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn gzip(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            inner: create_gzip_writer(path)?,
            written: 0,
        })
    }

    /// # Errors
    /// Returns an error if the underlying write fails.
    pub fn write(&mut self, key: &str, value: &str) -> Result<()> {
        self.inner.write_all(key.as_bytes())?;
        self.inner.write_all(b";")?;
        self.inner.write_all(value.as_bytes())?;
        self.inner.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the underlying write fails.
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        self.write(&record.key, &record.value)
    }

    /// Terminate the compressed stream and return the number of records written.
    ///
    /// # Errors
    /// Returns an error if flushing or writing the codec trailer fails.
    pub fn finish(self) -> Result<u64> {
        self.inner.finish().context("finish record file")?;
        Ok(self.written)
    }
}

/// Write `records` to `path` in one go; handy for fixtures and small side files.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_records<'a>(
    path: impl AsRef<Path>,
    records: impl IntoIterator<Item = &'a Record>,
) -> Result<u64> {
    let path = path.as_ref();
    let mut w = RecordWriter::create(path, path)?;
    for r in records {
        w.write_record(r)?;
    }
    w.finish()
        .with_context(|| format!("write {}", path.display()))
}

/// Read every record of `path` into memory.
///
/// # Errors
/// Returns the first I/O or parse error encountered.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<Record>> {
    RecordReader::open(path)?.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordError, RecordErrorKind};

    #[test]
    fn malformed_line_reports_position() {
        let data = "1;a\n2;b\nbroken\n3;c\n";
        let reader = RecordReader::from_reader(data.as_bytes(), "fixture");
        let out: Vec<Result<Record>> = reader.collect();
        assert!(out[0].is_ok());
        assert!(out[1].is_ok());
        let err = out[2].as_ref().unwrap_err();
        assert!(err.to_string().contains("line 3 in fixture"));
        let kind = err.downcast_ref::<RecordError>().map(|e| e.kind);
        assert_eq!(kind, Some(RecordErrorKind::MissingDelimiter));
    }

    #[test]
    fn write_then_read_gzip_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pairs.gz");
        let records = vec![
            Record::new("1", "a"),
            Record::new("1", "a"),
            Record::new("2", ""),
        ];
        assert_eq!(write_records(&path, &records)?, 3);
        assert_eq!(read_records(&path)?, records);
        Ok(())
    }
}
