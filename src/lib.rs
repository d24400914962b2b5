//! # osmjoin
//!
//! An **external sort and sort-merge join engine** for key/value record streams
//! that do not fit in memory, and an OpenStreetMap pipeline built on it that
//! inlines nodes into ways and nodes and ways into relations.
//!
//! ## Key Features
//!
//! - **Bucketed external sorter**: concurrent `put` from many threads, sorted
//!   gzip spills, k-way merge into one compressed output
//! - **K-way merge**: pairwise cascade or heap, picked by fan-in
//! - **Streaming sort-merge join**: one forward pass over two sorted files, with
//!   optional key-order validation
//! - **Compression**: gzip, zstd, bzip2 and xz, selected by file extension (all
//!   but gzip optional via feature flags)
//! - **Parallel decoding**: bounded rayon worker pool feeding the sorters
//!
//! ## Quick Start
//!
//! ```no_run
//! use osmjoin::config::SorterConfig;
//! use osmjoin::join::join_files;
//! use osmjoin::sorter::SortingWriter;
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let parents = SortingWriter::open(SorterConfig::new("tmp/parents", "parents.gz", 100_000)?)?;
//! parents.put("2", "two")?;
//! parents.put("1", "one")?;
//! parents.close()?;
//!
//! let children = SortingWriter::open(SorterConfig::new("tmp/children", "children.gz", 100_000)?)?;
//! children.put("1", "child-a")?;
//! children.put("1", "child-b")?;
//! children.close()?;
//!
//! for group in join_files("parents.gz", "children.gz")? {
//!     let group = group?;
//!     println!("{} -> {:?} {:?}", group.key, group.left, group.right);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Records and sorted streams
//!
//! A [`Record`] is a `(key, value)` pair of strings stored as one `key;value` line.
//! Keys compare lexicographically; numeric ids must be zero-padded
//! ([`osm::id_key`]). A [`RecordReader`] is a forward-only stream over such a file.
//!
//! ### Sorting
//!
//! [`SortingWriter`] collects records into buckets, spills each full bucket as a
//! sorted gzip file into its own working directory, and merges all buckets into
//! the output on [`close`](SortingWriter::close). Duplicate records survive.
//!
//! ### Joining
//!
//! [`SortMergeJoin`] pairs two sorted streams into [`JoinedGroup`]s, one per key
//! present on both sides. Inputs must be sorted; see the [`join`] module.
//!
//! ### The OSM pipeline
//!
//! [`OsmPipeline`] splits an OSM XML file into id-keyed payload and association
//! files, then folds children into parents one containment level at a time. The
//! `osmjoin` binary runs it from the command line.

pub mod config;
pub mod io;
pub mod join;
pub mod merge;
pub mod metrics;
pub mod osm;
pub mod parallel;
pub mod pipeline;
pub mod record;
pub mod sorter;
pub mod testing;

pub use config::{BucketSizes, PipelineConfig, SorterConfig};
pub use io::{RecordReader, RecordWriter};
pub use join::{JoinedGroup, SortMergeJoin, join_files};
pub use merge::{KMerge, MergePair, MergeStrategy, merge, merge_records};
pub use metrics::{PipelineReport, ProgressCounter};
pub use parallel::ParallelMap;
pub use pipeline::OsmPipeline;
pub use record::{Record, RecordError, RecordErrorKind};
pub use sorter::{SortStats, SortingWriter};
