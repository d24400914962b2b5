pub mod compression;
pub mod lines;

pub use lines::{RecordReader, RecordWriter, read_records, write_records};
