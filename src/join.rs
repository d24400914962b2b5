//! Streaming inner join of two key-sorted record streams.
//!
//! [`SortMergeJoin`] walks both inputs forward once. The right side drives: each
//! run of equal right keys becomes one [`JoinedGroup`] if the left side has a run
//! with the same key. Keys present on only one side produce nothing.
//!
//! # Precondition
//! Both inputs must be sorted ascending by key with equal keys contiguous, as a
//! [`SortingWriter`](crate::sorter::SortingWriter) output is. The join never looks
//! backwards: on unsorted input it skips records and silently returns incomplete
//! groups. Call [`SortMergeJoin::validated`] to turn a key regression into an
//! [`RecordErrorKind::UnsortedInput`] error instead.
//!
//! ```
//! use osmjoin::join::SortMergeJoin;
//! use osmjoin::record::Record;
//!
//! let left = vec![Record::new("1", "node-1"), Record::new("2", "node-2")];
//! let right = vec![Record::new("2", "way-7"), Record::new("3", "way-8")];
//! let groups: Vec<_> = SortMergeJoin::new(left.into_iter().map(Ok), right.into_iter().map(Ok))
//!     .collect::<anyhow::Result<_>>()
//!     .unwrap();
//! assert_eq!(groups.len(), 1);
//! assert_eq!(groups[0].key, "2");
//! ```

use crate::io::RecordReader;
use crate::record::{Record, RecordError, RecordErrorKind};
use anyhow::Result;
use std::cmp::Ordering;
use std::iter::Peekable;
use std::path::Path;

/// All left and right values sharing one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinedGroup {
    pub key: String,
    pub left: Vec<String>,
    pub right: Vec<String>,
}

impl JoinedGroup {
    /// Every `(left, right)` value pairing of this group.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.left.iter().flat_map(move |l| {
            self.right
                .iter()
                .map(move |r| (l.as_str(), r.as_str()))
        })
    }
}

enum Cursor {
    Exhausted,
    Failed,
    At(Ordering),
}

/// Inner sort-merge join over two sorted record streams.
pub struct SortMergeJoin<L, R>
where
    L: Iterator<Item = Result<Record>>,
    R: Iterator<Item = Result<Record>>,
{
    left: Peekable<L>,
    right: Peekable<R>,
    validate: bool,
    last_left: Option<String>,
    last_right: Option<String>,
    done: bool,
}

impl<L, R> SortMergeJoin<L, R>
where
    L: Iterator<Item = Result<Record>>,
    R: Iterator<Item = Result<Record>>,
{
    pub fn new(left: L, right: R) -> Self {
        Self {
            left: left.peekable(),
            right: right.peekable(),
            validate: false,
            last_left: None,
            last_right: None,
            done: false,
        }
    }

    /// Check that keys never decrease on either side and that right keys are contiguous.
    #[must_use]
    pub fn validated(mut self) -> Self {
        self.validate = true;
        self
    }

    fn check_order(last: &mut Option<String>, key: &str, strict: bool, side: &str) -> Result<()> {
        if let Some(prev) = last.as_deref() {
            let bad = match prev.cmp(key) {
                Ordering::Greater => true,
                Ordering::Equal => strict,
                Ordering::Less => false,
            };
            if bad {
                return Err(RecordError::new(
                    RecordErrorKind::UnsortedInput,
                    format!("{side} key {key:?} follows {prev:?}"),
                )
                .into());
            }
        }
        *last = Some(key.to_string());
        Ok(())
    }

    fn left_cursor(&mut self, key: &str) -> Cursor {
        match self.left.peek() {
            None => Cursor::Exhausted,
            Some(Err(_)) => Cursor::Failed,
            Some(Ok(l)) => Cursor::At(l.key.as_str().cmp(key)),
        }
    }

    fn take_left(&mut self) -> Result<Record> {
        let record = self
            .left
            .next()
            .unwrap_or_else(|| Err(anyhow::anyhow!("left side ended unexpectedly")))?;
        if self.validate {
            Self::check_order(&mut self.last_left, &record.key, false, "left")?;
        }
        Ok(record)
    }

    /// Take the next run of equal right keys.
    fn right_group(&mut self) -> Option<Result<(String, Vec<String>)>> {
        let first = match self.right.next()? {
            Ok(r) => r,
            Err(e) => return Some(Err(e)),
        };
        if self.validate
            && let Err(e) = Self::check_order(&mut self.last_right, &first.key, true, "right")
        {
            return Some(Err(e));
        }
        let (key, value) = first.into_parts();
        let mut values = vec![value];
        while let Some(Ok(next)) = self.right.peek()
            && next.key == key
        {
            if let Some(Ok(next)) = self.right.next() {
                values.push(next.value);
            }
        }
        Some(Ok((key, values)))
    }

    fn advance(&mut self) -> Option<Result<JoinedGroup>> {
        loop {
            let (key, right) = match self.right_group()? {
                Ok(group) => group,
                Err(e) => return Some(Err(e)),
            };

            // Left keys below the right key can never match again.
            loop {
                match self.left_cursor(&key) {
                    Cursor::Exhausted => return None,
                    Cursor::Failed | Cursor::At(Ordering::Less) => {
                        if let Err(e) = self.take_left() {
                            return Some(Err(e));
                        }
                    }
                    Cursor::At(_) => break,
                }
            }

            let mut left = Vec::new();
            while let Cursor::At(Ordering::Equal) = self.left_cursor(&key) {
                match self.take_left() {
                    Ok(record) => left.push(record.value),
                    Err(e) => return Some(Err(e)),
                }
            }
            if !left.is_empty() {
                return Some(Ok(JoinedGroup { key, left, right }));
            }
        }
    }
}

impl<L, R> Iterator for SortMergeJoin<L, R>
where
    L: Iterator<Item = Result<Record>>,
    R: Iterator<Item = Result<Record>>,
{
    type Item = Result<JoinedGroup>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let out = self.advance();
        if !matches!(out, Some(Ok(_))) {
            self.done = true;
        }
        out
    }
}

/// Join two record files.
///
/// # Errors
/// Returns an error if either file cannot be opened.
pub fn join_files(
    left: impl AsRef<Path>,
    right: impl AsRef<Path>,
) -> Result<SortMergeJoin<RecordReader, RecordReader>> {
    Ok(SortMergeJoin::new(
        RecordReader::open(left)?,
        RecordReader::open(right)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(pairs: &[(&str, &str)]) -> std::vec::IntoIter<Result<Record>> {
        pairs
            .iter()
            .map(|&(k, v)| Ok(Record::new(k, v)))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn pairs_is_cross_product() {
        let g = JoinedGroup {
            key: "1".into(),
            left: vec!["a".into(), "b".into()],
            right: vec!["x".into()],
        };
        assert_eq!(g.pairs().collect::<Vec<_>>(), vec![("a", "x"), ("b", "x")]);
    }

    #[test]
    fn empty_sides_produce_nothing() {
        assert_eq!(SortMergeJoin::new(stream(&[]), stream(&[("1", "a")])).count(), 0);
        assert_eq!(SortMergeJoin::new(stream(&[("1", "a")]), stream(&[])).count(), 0);
    }

    #[test]
    fn unsorted_input_is_silent_by_default() -> Result<()> {
        let left = stream(&[("2", "b"), ("1", "a")]);
        let right = stream(&[("1", "x"), ("2", "y")]);
        let groups: Vec<JoinedGroup> = SortMergeJoin::new(left, right).collect::<Result<_>>()?;
        // Left "1" sits behind "2" and is never reached for right key "1".
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "2");
        Ok(())
    }

    #[test]
    fn validation_reports_left_regression() {
        let left = stream(&[("2", "b"), ("1", "a"), ("3", "c")]);
        let right = stream(&[("3", "z")]);
        let err = SortMergeJoin::new(left, right)
            .validated()
            .find_map(Result::err)
            .expect("regression detected");
        let kind = err.downcast_ref::<RecordError>().map(|e| e.kind);
        assert_eq!(kind, Some(RecordErrorKind::UnsortedInput));
    }

    #[test]
    fn validation_reports_split_right_run() {
        let left = stream(&[("1", "a"), ("2", "b")]);
        let right = stream(&[("1", "x"), ("2", "y"), ("1", "z")]);
        let results: Vec<Result<JoinedGroup>> = SortMergeJoin::new(left, right).validated().collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(results[2].is_err());
    }

    #[test]
    fn read_error_stops_the_join() {
        let left = vec![Ok(Record::new("1", "a")), Err(anyhow::anyhow!("corrupt"))].into_iter();
        let right = stream(&[("1", "x"), ("2", "y")]);
        let results: Vec<Result<JoinedGroup>> = SortMergeJoin::new(left, right).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
