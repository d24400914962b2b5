use anyhow::Result;
use clap::Parser;
use osmjoin::{BucketSizes, OsmPipeline, PipelineConfig};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(author, version, about = "Inline OSM nodes into ways and members into relations", long_about = None)]
struct Args {
    #[clap(help = "OSM XML input, optionally compressed (.gz, .bz2, .zst, .xz)")]
    input: PathBuf,

    #[clap(short, long, default_value = "./osmjoin-out", help = "Directory for stage outputs")]
    output_dir: PathBuf,

    #[clap(long, help = "Parent of the sorter working directories. Default: <output-dir>/temp")]
    temp_dir: Option<PathBuf>,

    #[clap(short, long, help = "Decoding threads. Default: all available cores")]
    workers: Option<usize>,

    #[clap(long, default_value_t = 1000, help = "Decoded elements buffered between workers and sorters")]
    queue_capacity: usize,

    #[clap(long, help = "Use one bucket size for every stage")]
    bucket_size: Option<usize>,

    #[clap(long, default_value_t = 100_000, help = "Log progress every N records, 0 to disable")]
    log_every: u64,

    #[clap(long, help = "Fail on out-of-order join input instead of skipping records")]
    validate_joins: bool,
}

impl Args {
    fn into_config(self) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.input, self.output_dir);
        if let Some(temp_dir) = self.temp_dir {
            config.temp_dir = temp_dir;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(size) = self.bucket_size {
            config.buckets = BucketSizes::uniform(size);
        }
        config.queue_capacity = self.queue_capacity;
        config.log_every = self.log_every;
        config.validate_joins = self.validate_joins;
        config
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = Args::parse().into_config();
    let report = OsmPipeline::new(config)?.run()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
