//! Configuration for sorters and the join pipeline.

use crate::record::{RecordError, RecordErrorKind};
use std::path::PathBuf;

/// Per-sorter configuration: where to spill, where to write, and how much to hold.
#[derive(Clone, Debug)]
pub struct SorterConfig {
    /// Private working directory for bucket files; created on open, removed on close.
    pub work_dir: PathBuf,
    /// Final sorted output. Its extension selects the compression codec.
    pub output: PathBuf,
    /// Records held in memory before a bucket is spilled.
    pub bucket_size: usize,
    /// Log progress every this many records; 0 disables.
    pub log_every: u64,
}

impl SorterConfig {
    /// # Errors
    /// Returns a [`RecordErrorKind::Config`] error if `bucket_size` is zero.
    pub fn new(
        work_dir: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        bucket_size: usize,
    ) -> Result<Self, RecordError> {
        if bucket_size == 0 {
            return Err(RecordError::new(
                RecordErrorKind::Config,
                "bucket size must be at least 1",
            ));
        }
        Ok(Self {
            work_dir: work_dir.into(),
            output: output.into(),
            bucket_size,
            log_every: 100_000,
        })
    }

    #[must_use]
    pub fn with_log_every(mut self, log_every: u64) -> Self {
        self.log_every = log_every;
        self
    }
}

/// Bucket capacities per pipeline stage.
///
/// Payloads grow as children are folded into parents, so later stages hold
/// fewer records per bucket to keep memory per bucket roughly constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketSizes {
    pub split: usize,
    pub node_fold: usize,
    pub way_fold: usize,
    pub relation_fold: usize,
}

impl Default for BucketSizes {
    fn default() -> Self {
        Self {
            split: 100_000,
            node_fold: 50_000,
            way_fold: 25_000,
            relation_fold: 10_000,
        }
    }
}

impl BucketSizes {
    /// The same capacity for every stage; mostly for tests.
    #[must_use]
    pub fn uniform(size: usize) -> Self {
        Self {
            split: size,
            node_fold: size,
            way_fold: size,
            relation_fold: size,
        }
    }
}

/// Configuration of a full split-and-fold run.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// OSM XML input, optionally compressed (`.osm.bz2`, `.osm.gz`, ...).
    pub input: PathBuf,
    /// Directory receiving every stage output.
    pub output_dir: PathBuf,
    /// Parent of the per-sorter working directories.
    pub temp_dir: PathBuf,
    pub buckets: BucketSizes,
    /// Worker threads decoding blobs during the split stage.
    pub workers: usize,
    /// Bound on in-flight results between workers and the consumer.
    pub queue_capacity: usize,
    /// Progress log interval in records; 0 disables.
    pub log_every: u64,
    /// Fail a join on out-of-order keys instead of silently skipping records.
    pub validate_joins: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("planet.osm.bz2"),
            output_dir: PathBuf::from("./osmjoin-out"),
            temp_dir: PathBuf::from("./osmjoin-out/temp"),
            buckets: BucketSizes::default(),
            workers: num_cpus::get().max(1),
            queue_capacity: 1000,
            log_every: 100_000,
            validate_joins: false,
        }
    }
}

impl PipelineConfig {
    pub fn new(input: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        Self {
            input: input.into(),
            temp_dir: output_dir.join("temp"),
            output_dir,
            ..Default::default()
        }
    }

    /// Path of a named stage output inside `output_dir`.
    pub fn output(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{name}.gz"))
    }

    /// Private working directory for the sorter producing `name`.
    pub fn work_dir(&self, name: &str) -> PathBuf {
        self.temp_dir.join(name)
    }

    /// Sorter configuration for the stage output `name`.
    ///
    /// # Errors
    /// Returns a [`RecordErrorKind::Config`] error if `bucket_size` is zero.
    pub fn sorter(&self, name: &str, bucket_size: usize) -> Result<SorterConfig, RecordError> {
        Ok(SorterConfig::new(self.work_dir(name), self.output(name), bucket_size)?
            .with_log_every(self.log_every))
    }

    /// # Errors
    /// Returns a [`RecordErrorKind::Config`] error for zero workers or queue capacity.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.workers == 0 || self.queue_capacity == 0 {
            return Err(RecordError::new(
                RecordErrorKind::Config,
                "workers and queue capacity must be at least 1",
            ));
        }
        if self.temp_dir == self.output_dir {
            return Err(RecordError::new(
                RecordErrorKind::Config,
                "temp dir must differ from the output dir",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_bucket_size_is_a_config_error() {
        let err = SorterConfig::new("w", "o.gz", 0).unwrap_err();
        assert_eq!(err.kind, RecordErrorKind::Config);
    }

    #[test]
    fn stage_paths_are_private_per_sorter() {
        let cfg = PipelineConfig::new("in.osm", "/data/out");
        assert_eq!(cfg.output("nodes"), PathBuf::from("/data/out/nodes.gz"));
        assert_ne!(cfg.work_dir("nodes"), cfg.work_dir("ways"));
        assert!(cfg.validate().is_ok());
    }
}
