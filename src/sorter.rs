//! Bucketed external sorter.
//!
//! [`SortingWriter`] accepts `(key, value)` records in any order, from any number
//! of threads, and produces one file of `key;value` lines sorted by key. Records
//! are collected in an in-memory bucket; when the bucket reaches its capacity it is
//! retired, sorted, and spilled to a gzip file in the sorter's private working
//! directory. [`SortingWriter::close`] spills the remainder, merges every bucket
//! file into the output, and removes the working directory.
//!
//! # Concurrency
//!
//! The active bucket sits behind a read-write lock. `put` appends under the shared
//! (read) side, which excludes only the bucket swap; the append itself is still
//! serialised by the bucket's own mutex. Retiring a bucket takes the
//! exclusive side, swaps in an empty bucket, and re-checks the size under the same
//! lock so that two threads racing to flush the same full bucket spill it once.
//! The swap can never observe a half-finished append, and the spill itself runs
//! outside the lock while other threads fill the new bucket.
//!
//! # Example
//! ```no_run
//! use osmjoin::config::SorterConfig;
//! use osmjoin::sorter::SortingWriter;
//! # fn main() -> anyhow::Result<()> {
//! let sorter = SortingWriter::open(SorterConfig::new("./tmp/ways", "./ways.gz", 100_000)?)?;
//! sorter.put("0000000000000000042", "{\"id\":42}")?;
//! let stats = sorter.close()?;
//! assert_eq!(stats.records, 1);
//! # Ok(())
//! # }
//! ```

use crate::config::SorterConfig;
use crate::io::{RecordReader, RecordWriter};
use crate::merge::merge_records;
use crate::metrics::ProgressCounter;
use crate::record::{Record, RecordError, RecordErrorKind};
use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

/// Read buffer per bucket file during the final merge, which keeps every bucket
/// open at once.
const BUCKET_READ_BUFFER: usize = 16 * 1024;

/// In-memory multiset of pending records.
///
/// A plain list keeps every duplicate `(key, value)` pair; order is imposed only
/// when the bucket is spilled. Appends are serialised by the inner mutex; the
/// outer read lock held by `put` only keeps a swap from retiring the bucket
/// mid-append.
struct Bucket {
    records: Mutex<Vec<Record>>,
}

impl Bucket {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    fn push(&self, record: Record) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow!("bucket lock poisoned"))?
            .push(record);
        Ok(())
    }

    fn into_records(self) -> Result<Vec<Record>> {
        self.records
            .into_inner()
            .map_err(|_| anyhow!("bucket lock poisoned"))
    }
}

/// Owned working directory, removed when dropped.
///
/// Removal on drop covers every exit path, including errors and panics.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    removed: bool,
}

impl WorkDir {
    /// Create `path` for exclusive use.
    ///
    /// An existing empty directory is adopted; one that already holds files
    /// belongs to someone else and is refused.
    ///
    /// # Errors
    /// Returns a [`RecordErrorKind::Config`] error if the directory cannot be
    /// created or is not empty.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config_err = |msg: String| RecordError::new(RecordErrorKind::Config, msg);
        fs::create_dir_all(&path)
            .map_err(|e| config_err(format!("create work dir {}: {e}", path.display())))?;
        let occupied = fs::read_dir(&path)
            .map_err(|e| config_err(format!("read work dir {}: {e}", path.display())))?
            .next()
            .is_some();
        if occupied {
            return Err(config_err(format!(
                "work dir {} is not empty; is another sorter using it?",
                path.display()
            ))
            .into());
        }
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory now, reporting failure.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be removed.
    pub fn remove(mut self) -> Result<()> {
        self.removed = true;
        fs::remove_dir_all(&self.path)
            .with_context(|| format!("remove work dir {}", self.path.display()))
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if !self.removed
            && let Err(e) = fs::remove_dir_all(&self.path)
        {
            warn!("could not remove work dir {}: {e}", self.path.display());
        }
    }
}

/// Output file under construction; deleted unless committed.
struct PartialOutput {
    partial: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl PartialOutput {
    fn new(target: &Path) -> Self {
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(".partial");
        Self {
            partial: target.with_file_name(name),
            target: target.to_path_buf(),
            committed: false,
        }
    }

    fn commit(mut self) -> Result<()> {
        fs::rename(&self.partial, &self.target).with_context(|| {
            format!(
                "rename {} to {}",
                self.partial.display(),
                self.target.display()
            )
        })?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.partial);
        }
    }
}

/// Outcome of a completed sort.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortStats {
    pub output: PathBuf,
    /// Records written to the output.
    pub records: u64,
    /// Bucket files spilled, including the final partial bucket.
    pub buckets: usize,
}

/// Bucketed external sorter; see the [module documentation](self).
pub struct SortingWriter {
    config: SorterConfig,
    work_dir: WorkDir,
    active: RwLock<Bucket>,
    /// Records in the active bucket. Written under the bucket lock, read without it.
    pending: AtomicUsize,
    next_bucket: AtomicUsize,
    /// Bucket files written successfully.
    spilled: AtomicUsize,
    bucket_files: Mutex<Vec<PathBuf>>,
    failed: AtomicBool,
    progress: ProgressCounter,
}

impl SortingWriter {
    /// Create the working directory and an empty active bucket.
    ///
    /// # Errors
    /// Returns a [`RecordErrorKind::Config`] error if the working directory cannot
    /// be created or is already in use.
    pub fn open(config: SorterConfig) -> Result<Self> {
        let work_dir = WorkDir::create(&config.work_dir)?;
        let progress = ProgressCounter::new(
            format!("sort buckets {}", config.output.display()),
            "lines",
            config.log_every,
        );
        Ok(Self {
            active: RwLock::new(Bucket::with_capacity(config.bucket_size)),
            pending: AtomicUsize::new(0),
            next_bucket: AtomicUsize::new(0),
            spilled: AtomicUsize::new(0),
            bucket_files: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
            progress,
            work_dir,
            config,
        })
    }

    pub fn output(&self) -> &Path {
        &self.config.output
    }

    /// Records accepted so far.
    pub fn accepted(&self) -> u64 {
        self.progress.get()
    }

    /// Bucket files spilled so far. A failed spill is not counted.
    pub fn spilled(&self) -> usize {
        self.spilled.load(Ordering::Relaxed)
    }

    /// Snapshot of records accepted and buckets spilled so far.
    pub fn stats(&self) -> SortStats {
        SortStats {
            output: self.config.output.clone(),
            records: self.accepted(),
            buckets: self.spilled(),
        }
    }

    /// Add a record. Safe to call from many threads at once.
    ///
    /// The thread that finds the bucket full spills it before adding its record.
    ///
    /// # Errors
    /// Fails if the key or value contains `;` or a line break, if a spill fails,
    /// or if an earlier spill of this sorter failed.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let record = Record::checked(key, value)?;
        if self.failed.load(Ordering::Acquire) {
            return Err(RecordError::new(
                RecordErrorKind::Closed,
                format!("sorter for {} failed earlier", self.config.output.display()),
            )
            .into());
        }
        if self.pending.load(Ordering::Relaxed) >= self.config.bucket_size {
            self.flush(false)?;
        }
        {
            let bucket = self
                .active
                .read()
                .map_err(|_| anyhow!("active bucket lock poisoned"))?;
            bucket.push(record)?;
            self.pending.fetch_add(1, Ordering::Relaxed);
        }
        self.progress.inc();
        Ok(())
    }

    /// Retire the active bucket if it is full, or if `force` and it holds anything.
    fn flush(&self, force: bool) -> Result<()> {
        let retired = {
            let mut active = self
                .active
                .write()
                .map_err(|_| anyhow!("active bucket lock poisoned"))?;
            let len = self.pending.load(Ordering::Relaxed);
            if len == 0 || (!force && len < self.config.bucket_size) {
                return Ok(());
            }
            self.pending.store(0, Ordering::Relaxed);
            std::mem::replace(&mut *active, Bucket::with_capacity(self.config.bucket_size))
        };

        let number = self.next_bucket.fetch_add(1, Ordering::Relaxed);
        let path = self.work_dir.path().join(format!("bucket-{number}.gz"));
        match spill(retired, &path) {
            Ok(n) => {
                debug!("spilled {n} records to {}", path.display());
                self.bucket_files
                    .lock()
                    .map_err(|_| anyhow!("bucket file list poisoned"))?
                    .push(path);
                self.spilled.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.failed.store(true, Ordering::Release);
                Err(e.context(format!(
                    "spill bucket {number} for {}",
                    self.config.output.display()
                )))
            }
        }
    }

    /// Spill the remaining records, merge all buckets into the output, and remove
    /// the working directory.
    ///
    /// The output appears at its final path only once it is completely written.
    ///
    /// # Errors
    /// Any I/O or parse failure aborts the sort; the working directory is removed
    /// and no output file is left behind.
    pub fn close(self) -> Result<SortStats> {
        if self.failed.load(Ordering::Acquire) {
            return Err(RecordError::new(
                RecordErrorKind::Closed,
                format!("sorter for {} failed earlier", self.config.output.display()),
            )
            .into());
        }
        self.flush(true)?;
        self.progress.finish();

        let files = self
            .bucket_files
            .into_inner()
            .map_err(|_| anyhow!("bucket file list poisoned"))?;
        let output = self.config.output;
        let records = merge_into(&files, &output, self.config.log_every)?;
        self.work_dir.remove()?;
        Ok(SortStats {
            output,
            records,
            buckets: files.len(),
        })
    }
}

/// Sort a retired bucket and write it as a gzip record file.
fn spill(bucket: Bucket, path: &Path) -> Result<usize> {
    let mut records = bucket.into_records()?;
    records.par_sort_unstable();
    let mut w = RecordWriter::gzip(path)?;
    for r in &records {
        w.write_record(r)?;
    }
    w.finish()?;
    Ok(records.len())
}

/// Merge sorted bucket files into `output`, returning the number of records written.
fn merge_into(files: &[PathBuf], output: &Path, log_every: u64) -> Result<u64> {
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    info!("merging {} buckets into {}", files.len(), output.display());
    let counter = ProgressCounter::new(
        format!("merge buckets into {}", output.display()),
        "lines",
        log_every,
    );

    let readers = files
        .iter()
        .map(|path| RecordReader::open_with_buffer(path, BUCKET_READ_BUFFER))
        .collect::<Result<Vec<_>>>()?;
    let partial = PartialOutput::new(output);
    let mut w = RecordWriter::create(&partial.partial, output)?;
    for record in merge_records(readers) {
        w.write_record(&record?)?;
        counter.inc();
    }
    let written = w
        .finish()
        .with_context(|| format!("write {}", output.display()))?;
    partial.commit()?;
    counter.finish();
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::read_records;
    use std::io::Write;

    fn config(dir: &Path, bucket_size: usize) -> SorterConfig {
        SorterConfig::new(dir.join("work"), dir.join("out.gz"), bucket_size)
            .unwrap()
            .with_log_every(0)
    }

    #[test]
    fn duplicates_survive_spills() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sorter = SortingWriter::open(config(dir.path(), 2))?;
        for _ in 0..5 {
            sorter.put("k", "same")?;
        }
        assert_eq!(sorter.spilled(), 2);
        let stats = sorter.close()?;
        assert_eq!(stats.records, 5);
        assert_eq!(stats.buckets, 3);
        assert_eq!(read_records(dir.path().join("out.gz"))?.len(), 5);
        Ok(())
    }

    #[test]
    fn reserved_characters_are_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sorter = SortingWriter::open(config(dir.path(), 10))?;
        let err = sorter.put("a;b", "v").unwrap_err();
        let kind = err.downcast_ref::<RecordError>().map(|e| e.kind);
        assert_eq!(kind, Some(RecordErrorKind::ReservedCharacter));
        assert_eq!(sorter.accepted(), 0);
        sorter.close()?;
        Ok(())
    }

    #[test]
    fn occupied_work_dir_is_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let work = dir.path().join("work");
        fs::create_dir_all(&work)?;
        fs::write(work.join("stray"), b"x")?;
        let err = SortingWriter::open(config(dir.path(), 10)).err().expect("refused");
        let kind = err.downcast_ref::<RecordError>().map(|e| e.kind);
        assert_eq!(kind, Some(RecordErrorKind::Config));
        // The refused directory is not ours to delete.
        assert!(work.join("stray").exists());
        Ok(())
    }

    #[test]
    fn failed_spill_poisons_the_sorter() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sorter = SortingWriter::open(config(dir.path(), 2))?;
        fs::remove_dir_all(dir.path().join("work"))?;
        sorter.put("1", "a")?;
        sorter.put("2", "b")?;

        let err = sorter.put("3", "c").unwrap_err();
        assert!(err.to_string().contains("spill bucket 0"), "{err:#}");
        assert_eq!(sorter.spilled(), 0);

        let err = sorter.put("4", "d").unwrap_err();
        let kind = err.downcast_ref::<RecordError>().map(|e| e.kind);
        assert_eq!(kind, Some(RecordErrorKind::Closed));

        let err = sorter.close().unwrap_err();
        let kind = err.downcast_ref::<RecordError>().map(|e| e.kind);
        assert_eq!(kind, Some(RecordErrorKind::Closed));
        assert!(!dir.path().join("out.gz").exists());
        Ok(())
    }

    #[test]
    fn failed_merge_leaves_no_output() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sorter = SortingWriter::open(config(dir.path(), 1))?;
        sorter.put("1", "a")?;
        sorter.put("2", "b")?;
        assert_eq!(sorter.spilled(), 1);

        let mut w = crate::io::compression::create_gzip_writer(
            dir.path().join("work").join("bucket-0.gz"),
        )?;
        w.write_all(b"1;a\nbroken\n")?;
        w.finish()?;

        let err = sorter.close().unwrap_err();
        assert!(format!("{err:#}").contains("bucket-0.gz"), "{err:#}");
        assert!(!dir.path().join("out.gz").exists());
        assert!(!dir.path().join("out.gz.partial").exists());
        assert!(!dir.path().join("work").exists());
        Ok(())
    }

    #[test]
    fn dropping_without_close_cleans_up() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sorter = SortingWriter::open(config(dir.path(), 1))?;
        sorter.put("1", "a")?;
        sorter.put("2", "b")?;
        drop(sorter);
        assert!(!dir.path().join("work").exists());
        assert!(!dir.path().join("out.gz").exists());
        Ok(())
    }
}
