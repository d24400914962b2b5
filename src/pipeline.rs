//! Split-and-fold orchestration over OSM XML.
//!
//! [`OsmPipeline::run`] executes three stages, each reading only complete files
//! written by earlier stages:
//!
//! 1. **split**: decode the XML in parallel and feed six sorters, one payload
//!    stream per element kind plus one association per reference kind
//!    ([`NODES`], [`WAYS`], [`RELATIONS`], [`NODE2WAY`], [`NODE2RELATION`],
//!    [`WAY2RELATION`]).
//! 2. **fold ways**: `nodes ⋈ node2way` gives [`WAY2NODE`] (way id to node payload),
//!    then `way2node ⋈ ways` gives [`WAYS_ENRICHED`].
//! 3. **fold relations**: `nodes ⋈ node2relation` and `ways-enriched ⋈ way2relation`
//!    both feed [`RELATION2MEMBER`], then `relation2member ⋈ relations` gives
//!    [`RELATIONS_ENRICHED`].
//!
//! Every join is an inner join, so an element none of whose children resolve does
//! not appear in the enriched output. Any stage error aborts the run; outputs of
//! finished stages stay in place.

use crate::config::PipelineConfig;
use crate::io::RecordReader;
use crate::io::compression::open_reader;
use crate::join::{JoinedGroup, SortMergeJoin};
use crate::metrics::{PipelineReport, ProgressCounter, SplitCounts, Stopwatch, duration_ms};
use crate::osm::{
    Element, ElementKind, OsmBlobs, decode_payload, encode_payload, enrich_relation, enrich_way,
    id_key, member_payload,
};
use crate::parallel::ParallelMap;
use crate::sorter::{SortStats, SortingWriter};
use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

pub const NODES: &str = "nodes";
pub const WAYS: &str = "ways";
pub const RELATIONS: &str = "relations";
pub const NODE2WAY: &str = "node2way";
pub const NODE2RELATION: &str = "node2relation";
pub const WAY2RELATION: &str = "way2relation";
pub const WAY2NODE: &str = "way2node";
pub const WAYS_ENRICHED: &str = "ways-enriched";
pub const RELATION2MEMBER: &str = "relation2member";
pub const RELATIONS_ENRICHED: &str = "relations-enriched";

/// File name of the JSON run report inside the output directory.
pub const REPORT_FILE: &str = "report.json";

/// The six sorters fed by the split stage.
struct SplitSorters {
    nodes: SortingWriter,
    ways: SortingWriter,
    relations: SortingWriter,
    node2way: SortingWriter,
    node2relation: SortingWriter,
    way2relation: SortingWriter,
}

impl SplitSorters {
    fn open(config: &PipelineConfig) -> Result<Self> {
        let open = |name: &str| SortingWriter::open(config.sorter(name, config.buckets.split)?);
        Ok(Self {
            nodes: open(NODES)?,
            ways: open(WAYS)?,
            relations: open(RELATIONS)?,
            node2way: open(NODE2WAY)?,
            node2relation: open(NODE2RELATION)?,
            way2relation: open(WAY2RELATION)?,
        })
    }

    /// Write an element's payload and one association per reference it makes.
    fn emit(&self, element: &Element) -> Result<()> {
        let key = id_key(element.id());
        match element {
            Element::Node { payload, .. } => self.nodes.put(key, encode_payload(payload)?),
            Element::Way { refs, payload, .. } => {
                for r in refs {
                    self.node2way.put(id_key(*r), key.as_str())?;
                }
                self.ways.put(key, encode_payload(payload)?)
            }
            Element::Relation {
                members, payload, ..
            } => {
                for m in members {
                    let assoc = match m.kind {
                        ElementKind::Node => &self.node2relation,
                        ElementKind::Way => &self.way2relation,
                        ElementKind::Relation => continue,
                    };
                    assoc.put(id_key(m.id), key.as_str())?;
                }
                self.relations.put(key, encode_payload(payload)?)
            }
        }
    }

    fn close(self) -> Result<Vec<SortStats>> {
        [
            self.nodes,
            self.ways,
            self.relations,
            self.node2way,
            self.node2relation,
            self.way2relation,
        ]
        .into_iter()
        .map(SortingWriter::close)
        .collect()
    }
}

/// Runs the split and fold stages for one input file.
pub struct OsmPipeline {
    config: PipelineConfig,
}

impl OsmPipeline {
    /// # Errors
    /// Returns a configuration error if `config` does not validate.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage and save the report as [`REPORT_FILE`] in the output directory.
    ///
    /// # Errors
    /// The first stage error aborts the run and is returned.
    pub fn run(&self) -> Result<PipelineReport> {
        let started = Instant::now();
        let total = Stopwatch::start(format!("process {}", self.config.input.display()));
        fs::create_dir_all(&self.config.output_dir)
            .with_context(|| format!("mkdir -p {}", self.config.output_dir.display()))?;

        let mut report = PipelineReport {
            input: self.config.input.display().to_string(),
            ..Default::default()
        };
        self.split(&mut report)?;
        self.fold_ways(&mut report)?;
        self.fold_relations(&mut report)?;
        total.stop();

        if let Err(e) = fs::remove_dir(&self.config.temp_dir) {
            debug!("leaving {}: {e}", self.config.temp_dir.display());
        }
        report.elapsed_ms = duration_ms(started.elapsed());
        report.log();
        report.save_to_file(self.config.output_dir.join(REPORT_FILE))?;
        Ok(report)
    }

    /// Path of a stage output.
    pub fn output(&self, name: &str) -> PathBuf {
        self.config.output(name)
    }

    /// Decode the input and fill the six split outputs.
    ///
    /// # Errors
    /// Fails on unreadable input or any sorter error. Blobs that do not decode are
    /// logged, counted in [`SplitCounts::failed`], and skipped.
    pub fn split(&self, report: &mut PipelineReport) -> Result<()> {
        let watch = Stopwatch::start("split");
        let started = Instant::now();
        let input = &self.config.input;
        let reader = BufReader::new(open_reader(input)?);

        let read_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
        let blobs = OsmBlobs::new(reader.lines()).map_while(|blob| match blob {
            Ok(blob) => Some(blob),
            Err(e) => {
                if let Ok(mut slot) = read_error.lock() {
                    *slot = Some(e);
                }
                None
            }
        });

        let sorters = SplitSorters::open(&self.config)?;
        let progress = ProgressCounter::new(
            format!("split {}", input.display()),
            "elements",
            self.config.log_every,
        );
        let mut counts = SplitCounts::default();
        let workers = ParallelMap::new(self.config.workers, self.config.queue_capacity)?;
        info!(
            "decoding {} with {} workers, queue capacity {}",
            input.display(),
            workers.workers(),
            workers.queue_capacity()
        );
        let stats = workers.run(
            blobs,
            |blob: String| {
                let element = Element::parse(&blob)?;
                Ok(sorters.emit(&element).map(|()| element.kind()))
            },
            |emitted: Result<ElementKind>| {
                match emitted? {
                    ElementKind::Node => counts.nodes += 1,
                    ElementKind::Way => counts.ways += 1,
                    ElementKind::Relation => counts.relations += 1,
                }
                progress.inc();
                Ok(())
            },
        )?;
        if let Some(e) = read_error
            .into_inner()
            .map_err(|_| anyhow!("read error slot poisoned"))?
        {
            return Err(e.context(format!("split {}", input.display())));
        }
        progress.finish();
        counts.failed = stats.failed;

        let sorted = sorters.close()?;
        report.split = counts;
        report.push_stage(
            "split",
            sorted.iter().map(|s| s.records).sum(),
            sorted.iter().map(|s| s.buckets).sum(),
            started.elapsed(),
        );
        watch.stop();
        Ok(())
    }

    /// Attach node payloads and geometry to ways.
    ///
    /// # Errors
    /// Fails on any read, parse, or sorter error.
    pub fn fold_ways(&self, report: &mut PipelineReport) -> Result<()> {
        let watch = Stopwatch::start("fold nodes into ways");
        let started = Instant::now();
        let size = self.config.buckets.node_fold;

        let way2node = SortingWriter::open(self.config.sorter(WAY2NODE, size)?)?;
        for group in self.join(NODES, NODE2WAY)? {
            let group = group?;
            for (node, way) in group.pairs() {
                way2node.put(way, node)?;
            }
        }
        let first = way2node.close()?;

        let size = self.config.buckets.way_fold;
        let enriched = SortingWriter::open(self.config.sorter(WAYS_ENRICHED, size)?)?;
        for group in self.join(WAY2NODE, WAYS)? {
            let group = group?;
            let nodes = decode_all(&group.left)?;
            for way in &group.right {
                let way = enrich_way(decode_payload(way)?, &nodes)?;
                enriched.put(group.key.as_str(), encode_payload(&way)?)?;
            }
        }
        let second = enriched.close()?;

        report.push_stage(
            "fold ways",
            first.records + second.records,
            first.buckets + second.buckets,
            started.elapsed(),
        );
        watch.stop();
        Ok(())
    }

    /// Attach node and enriched way payloads to relations.
    ///
    /// # Errors
    /// Fails on any read, parse, or sorter error.
    pub fn fold_relations(&self, report: &mut PipelineReport) -> Result<()> {
        let watch = Stopwatch::start("fold members into relations");
        let started = Instant::now();
        let size = self.config.buckets.relation_fold;

        let members = SortingWriter::open(self.config.sorter(RELATION2MEMBER, size)?)?;
        for (children, assoc, kind) in [
            (NODES, NODE2RELATION, ElementKind::Node),
            (WAYS_ENRICHED, WAY2RELATION, ElementKind::Way),
        ] {
            for group in self.join(children, assoc)? {
                let group = group?;
                for child in &group.left {
                    let member = encode_payload(&member_payload(kind, decode_payload(child)?))?;
                    for relation in &group.right {
                        members.put(relation.as_str(), member.as_str())?;
                    }
                }
            }
        }
        let first = members.close()?;

        let enriched = SortingWriter::open(self.config.sorter(RELATIONS_ENRICHED, size)?)?;
        for group in self.join(RELATION2MEMBER, RELATIONS)? {
            let group = group?;
            let resolved = decode_all(&group.left)?;
            for relation in &group.right {
                let relation = enrich_relation(decode_payload(relation)?, &resolved)?;
                enriched.put(group.key.as_str(), encode_payload(&relation)?)?;
            }
        }
        let second = enriched.close()?;

        report.push_stage(
            "fold relations",
            first.records + second.records,
            first.buckets + second.buckets,
            started.elapsed(),
        );
        watch.stop();
        Ok(())
    }

    /// Join two stage outputs, logging the number of groups produced.
    fn join(&self, left: &str, right: &str) -> Result<impl Iterator<Item = Result<JoinedGroup>>> {
        info!("join {left} with {right}");
        let mut join = SortMergeJoin::new(
            RecordReader::open(self.output(left))?,
            RecordReader::open(self.output(right))?,
        );
        if self.config.validate_joins {
            join = join.validated();
        }
        let progress = ProgressCounter::new(
            format!("join {left} with {right}"),
            "groups",
            self.config.log_every,
        );
        Ok(join.inspect(move |_| {
            progress.inc();
        }))
    }
}

fn decode_all(payloads: &[String]) -> Result<Vec<serde_json::Value>> {
    payloads.iter().map(|p| decode_payload(p)).collect()
}
