//! Progress reporting and run statistics.
//!
//! Long sorts and joins run for hours on a planet file, so every stage reports
//! progress through the `log` facade:
//!
//! - [`ProgressCounter`] logs `"<activity>: <n> <unit>"` every `every` increments and
//!   a completion line with the elapsed time when finished. It is safe to share
//!   between threads.
//! - [`Stopwatch`] times one stage.
//! - [`PipelineReport`] collects per-stage counts and timings, and can be printed
//!   to the log or saved as JSON next to the outputs.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Thread-safe counter that logs every `every` increments.
pub struct ProgressCounter {
    activity: String,
    unit: &'static str,
    every: u64,
    count: AtomicU64,
    started: Instant,
}

impl ProgressCounter {
    /// `every == 0` disables the periodic log line.
    pub fn new(activity: impl Into<String>, unit: &'static str, every: u64) -> Self {
        Self {
            activity: activity.into(),
            unit,
            every,
            count: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn inc(&self) -> u64 {
        self.add(1)
    }

    pub fn add(&self, n: u64) -> u64 {
        let before = self.count.fetch_add(n, Ordering::Relaxed);
        let after = before + n;
        if self.every > 0 && before / self.every != after / self.every {
            info!("{}: {} {}", self.activity, after, self.unit);
        }
        after
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Log the completion line and return the final count.
    pub fn finish(&self) -> u64 {
        let n = self.get();
        info!(
            "completed {}: {} {} in {:.1}s",
            self.activity,
            n,
            self.unit,
            self.elapsed().as_secs_f64()
        );
        n
    }
}

/// Times a named stage; logs start and stop.
pub struct Stopwatch {
    name: String,
    started: Instant,
}

impl Stopwatch {
    pub fn start(name: impl Into<String>) -> Self {
        let name = name.into();
        info!("start {name}");
        Self {
            name,
            started: Instant::now(),
        }
    }

    pub fn stop(self) -> Duration {
        let elapsed = self.started.elapsed();
        info!("{} took {:.1}s", self.name, elapsed.as_secs_f64());
        elapsed
    }
}

/// Statistics for one pipeline stage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    /// Records written by the stage, summed over its sorters.
    pub records: u64,
    /// Bucket files spilled by the stage's sorters.
    pub buckets: usize,
    pub elapsed_ms: u64,
}

/// Input element counts observed by the split stage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitCounts {
    pub nodes: u64,
    pub ways: u64,
    pub relations: u64,
    /// Blobs dropped because they could not be decoded.
    pub failed: u64,
}

/// Summary of a complete pipeline run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub input: String,
    pub split: SplitCounts,
    pub stages: Vec<StageReport>,
    pub elapsed_ms: u64,
}

impl PipelineReport {
    pub fn push_stage(&mut self, name: &str, records: u64, buckets: usize, elapsed: Duration) {
        self.stages.push(StageReport {
            name: name.to_string(),
            records,
            buckets,
            elapsed_ms: duration_ms(elapsed),
        });
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn log(&self) {
        info!(
            "{}: {} nodes, {} ways, {} relations, {} failed blobs",
            self.input, self.split.nodes, self.split.ways, self.split.relations, self.split.failed
        );
        for s in &self.stages {
            info!(
                "  {:<24} {:>12} records {:>6} buckets {:>9} ms",
                s.name, s.records, s.buckets, s.elapsed_ms
            );
        }
        info!("total {} ms", self.elapsed_ms);
    }

    /// Save the report as pretty-printed JSON.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut w = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut w, self)
            .with_context(|| format!("serialize report to {}", path.display()))?;
        w.write_all(b"\n")?;
        w.flush()?;
        Ok(())
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_is_exact_across_threads() {
        let counter = Arc::new(ProgressCounter::new("test", "lines", 7));
        std::thread::scope(|s| {
            for _ in 0..4 {
                let counter = Arc::clone(&counter);
                s.spawn(move || {
                    for _ in 0..250 {
                        counter.inc();
                    }
                });
            }
        });
        assert_eq!(counter.finish(), 1000);
    }

    #[test]
    fn report_round_trips_through_json() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut report = PipelineReport {
            input: "tiny.osm".into(),
            ..Default::default()
        };
        report.split.nodes = 3;
        report.push_stage("split", 10, 2, Duration::from_millis(5));

        let path = dir.path().join("report.json");
        report.save_to_file(&path)?;
        let loaded: PipelineReport = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(loaded, report);
        assert_eq!(loaded.stage("split").map(|s| s.records), Some(10));
        Ok(())
    }
}
