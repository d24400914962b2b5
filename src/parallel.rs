//! Bounded parallel map with a single consumer.
//!
//! [`ParallelMap::run`] decodes work items on a dedicated rayon pool and hands each
//! result to a consumer closure running on the calling thread. Results travel
//! through a bounded `crossbeam-channel`, so a slow consumer stalls the workers
//! instead of letting decoded results pile up in memory.
//!
//! A work item whose mapping fails is logged and counted; the run carries on. A
//! consumer error stops the run: the channel is dropped, workers stop pulling new
//! items, and the error is returned once in-flight work has drained.

use crate::record::{RecordError, RecordErrorKind};
use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, bounded};
use log::warn;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Counts from one [`ParallelMap::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapStats {
    /// Results handed to the consumer.
    pub ok: u64,
    /// Items whose mapping failed.
    pub failed: u64,
}

/// Worker pool settings for a bounded parallel map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParallelMap {
    workers: usize,
    queue_capacity: usize,
}

impl ParallelMap {
    /// # Errors
    /// Returns a [`RecordErrorKind::Config`] error if either argument is zero.
    pub fn new(workers: usize, queue_capacity: usize) -> Result<Self, RecordError> {
        if workers == 0 || queue_capacity == 0 {
            return Err(RecordError::new(
                RecordErrorKind::Config,
                format!("parallel map needs workers and queue capacity, got {workers} and {queue_capacity}"),
            ));
        }
        Ok(Self {
            workers,
            queue_capacity,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Map `items` with `map` on the worker pool and feed every successful result
    /// to `consume` on the calling thread.
    ///
    /// Results reach the consumer in completion order, not input order.
    ///
    /// # Errors
    /// Returns an error if the pool cannot be built or `consume` fails.
    pub fn run<I, T, U, M, C>(&self, items: I, map: M, mut consume: C) -> Result<MapStats>
    where
        I: Iterator<Item = T> + Send,
        T: Send,
        U: Send,
        M: Fn(T) -> Result<U> + Sync,
        C: FnMut(U) -> Result<()>,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("osmjoin-worker-{i}"))
            .build()
            .context("build worker pool")?;
        let (tx, rx) = bounded::<Result<U>>(self.queue_capacity);
        let map = &map;

        pool.in_place_scope(|scope| {
            scope.spawn(move |_| {
                // A send fails only once the consumer has gone away.
                let _ = items
                    .par_bridge()
                    .try_for_each_with(tx, |tx, item| tx.send(map(item)));
            });
            drain(rx, &mut consume)
        })
    }
}

/// Consume results until every sender is gone or the consumer fails.
///
/// Takes the receiver by value so an early return disconnects the workers.
fn drain<U>(rx: Receiver<Result<U>>, consume: &mut impl FnMut(U) -> Result<()>) -> Result<MapStats> {
    let mut stats = MapStats::default();
    for result in rx {
        match result {
            Ok(value) => {
                consume(value)?;
                stats.ok += 1;
            }
            Err(e) => {
                stats.failed += 1;
                warn!("skipping work item: {e:#}");
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_workers_is_a_config_error() {
        let err = ParallelMap::new(0, 10).unwrap_err();
        assert_eq!(err.kind, RecordErrorKind::Config);
        assert!(ParallelMap::new(1, 0).is_err());
    }

    #[test]
    fn settings_are_kept() -> Result<()> {
        let map = ParallelMap::new(3, 17)?;
        assert_eq!((map.workers(), map.queue_capacity()), (3, 17));
        Ok(())
    }

    #[test]
    fn single_worker_with_tiny_queue_completes() -> Result<()> {
        let mut sum = 0u64;
        let stats = ParallelMap::new(1, 1)?.run(1..=100u64, |n| Ok(n * 2), |n| {
            sum += n;
            Ok(())
        })?;
        assert_eq!(stats.ok, 100);
        assert_eq!(sum, 10_100);
        Ok(())
    }
}
