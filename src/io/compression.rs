//! Pluggable compression for intermediate and output files.
//!
//! Every file the engine writes is compressed. Bucket spills always use gzip;
//! final outputs and pipeline inputs pick a codec from the file name:
//!
//! - **Gzip** (`.gz`) - via `flate2` (always available)
//! - **Zstd** (`.zst`) - via `zstd` (feature: `compression-zstd`)
//! - **Bzip2** (`.bz2`) - via `bzip2` (feature: `compression-bzip2`)
//! - **Xz** (`.xz`) - via `xz2` (feature: `compression-xz`)
//!
//! Readers fall back to magic-byte detection when the extension is not
//! recognised. Writers return a [`FinishWrite`] so that the trailer of the
//! compressed stream is written explicitly and any failure is reported, rather
//! than being swallowed by a destructor.
//!
//! ```no_run
//! use osmjoin::io::compression::{open_reader, create_writer};
//! # fn main() -> anyhow::Result<()> {
//! let mut w = create_writer("out.gz", "out.gz")?;
//! std::io::Write::write_all(&mut w, b"1;a\n")?;
//! w.finish()?;
//!
//! let r = open_reader("out.gz")?;
//! # drop(r);
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result, anyhow};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::LazyLock;

/// Buffer size used for file handles underneath codecs.
const IO_BUFFER: usize = 256 * 1024;

/// Built-in codecs, in detection order.
static CODECS: LazyLock<Vec<Box<dyn CompressionCodec>>> = LazyLock::new(builtin_codecs);

fn builtin_codecs() -> Vec<Box<dyn CompressionCodec>> {
    vec![
        Box::new(GzipCodec),
        #[cfg(feature = "compression-zstd")]
        Box::new(ZstdCodec),
        #[cfg(feature = "compression-bzip2")]
        Box::new(Bzip2Codec),
        #[cfg(feature = "compression-xz")]
        Box::new(XzCodec),
    ]
}

/// A writer whose stream must be explicitly terminated.
pub trait FinishWrite: Write + Send {
    /// Flush buffered data, write any codec trailer, and flush the file.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

impl<W: Write + Send> FinishWrite for BufWriter<W> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.flush()
    }
}

impl<W: Write + Send> FinishWrite for GzEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut inner = (*self).finish()?;
        inner.flush()
    }
}

#[cfg(feature = "compression-zstd")]
impl<W: Write + Send> FinishWrite for zstd::stream::write::Encoder<'static, W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut inner = (*self).finish()?;
        inner.flush()
    }
}

#[cfg(feature = "compression-bzip2")]
impl<W: Write + Send> FinishWrite for bzip2::write::BzEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut inner = (*self).finish()?;
        inner.flush()
    }
}

#[cfg(feature = "compression-xz")]
impl<W: Write + Send> FinishWrite for xz2::write::XzEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut inner = (*self).finish()?;
        inner.flush()
    }
}

/// Compression algorithm that can be selected by extension or magic bytes.
pub trait CompressionCodec: Send + Sync {
    fn name(&self) -> &str;

    /// Lowercase extensions including the leading dot, e.g. `&[".gz"]`.
    fn extensions(&self) -> &[&str];

    /// Signature at the start of a compressed stream, if the format has one.
    fn magic_bytes(&self) -> Option<&[u8]>;

    fn wrap_reader(&self, reader: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>>;

    fn wrap_writer(&self, writer: BufWriter<File>) -> io::Result<Box<dyn FinishWrite>>;
}

/// Codec registered for the extension of `path`, if any.
pub fn codec_for(path: impl AsRef<Path>) -> Option<&'static dyn CompressionCodec> {
    let name = path.as_ref().to_string_lossy().to_lowercase();
    CODECS
        .iter()
        .map(|codec| &**codec)
        .find(|codec| codec.extensions().iter().any(|ext| name.ends_with(ext)))
}

fn codec_for_magic<R: BufRead>(reader: &mut R) -> Option<&'static dyn CompressionCodec> {
    let buf = reader.fill_buf().ok()?;
    if buf.is_empty() {
        return None;
    }
    CODECS.iter().map(|codec| &**codec).find(|codec| {
        codec
            .magic_bytes()
            .is_some_and(|magic| buf.starts_with(magic))
    })
}

/// Wrap `reader` with the decompressor matching `path_hint`, or sniff magic bytes.
///
/// Streams with no recognised codec are returned as plain buffered readers.
///
/// # Errors
/// Returns an error if the codec fails to initialise.
pub fn auto_detect_reader<R: Read + Send + 'static>(
    reader: R,
    path_hint: impl AsRef<Path>,
) -> Result<Box<dyn Read + Send>> {
    auto_detect_reader_with_capacity(reader, path_hint, IO_BUFFER)
}

/// [`auto_detect_reader`] with an explicit size for the buffer under the codec.
///
/// # Errors
/// Returns an error if the codec fails to initialise.
pub fn auto_detect_reader_with_capacity<R: Read + Send + 'static>(
    reader: R,
    path_hint: impl AsRef<Path>,
    capacity: usize,
) -> Result<Box<dyn Read + Send>> {
    if let Some(codec) = codec_for(&path_hint) {
        return codec
            .wrap_reader(Box::new(BufReader::with_capacity(capacity, reader)))
            .with_context(|| format!("wrap reader with {} codec", codec.name()));
    }

    let mut buf_reader = BufReader::with_capacity(capacity, reader);
    if let Some(codec) = codec_for_magic(&mut buf_reader) {
        return codec
            .wrap_reader(Box::new(buf_reader))
            .with_context(|| format!("wrap reader with {} codec", codec.name()));
    }
    Ok(Box::new(buf_reader))
}

/// Open `path` for reading, decompressing transparently.
///
/// # Errors
/// Returns an error if the file cannot be opened or the codec fails to initialise.
pub fn open_reader(path: impl AsRef<Path>) -> Result<Box<dyn Read + Send>> {
    open_reader_with_capacity(path, IO_BUFFER)
}

/// [`open_reader`] with a smaller or larger read buffer, for callers that keep
/// many files open at once.
///
/// # Errors
/// Returns an error if the file cannot be opened or the codec fails to initialise.
pub fn open_reader_with_capacity(
    path: impl AsRef<Path>,
    capacity: usize,
) -> Result<Box<dyn Read + Send>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    auto_detect_reader_with_capacity(file, path, capacity)
}

/// Create `path` for writing, compressing with the codec chosen by `codec_hint`.
///
/// The hint is separate from the path so that a temporary file can be written
/// with the codec of its final name. Unrecognised extensions get gzip, so every
/// file written here is compressed.
///
/// # Errors
/// Returns an error if the file cannot be created or the codec fails to initialise.
pub fn create_writer(
    path: impl AsRef<Path>,
    codec_hint: impl AsRef<Path>,
) -> Result<Box<dyn FinishWrite>> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let buf = BufWriter::with_capacity(IO_BUFFER, file);
    let codec: &dyn CompressionCodec = match codec_for(codec_hint) {
        Some(codec) => codec,
        None => &GzipCodec,
    };
    codec
        .wrap_writer(buf)
        .with_context(|| format!("wrap writer with {} codec", codec.name()))
}

/// Create a gzip file regardless of its name; used for bucket spills.
///
/// # Errors
/// Returns an error if the file cannot be created.
pub fn create_gzip_writer(path: impl AsRef<Path>) -> Result<Box<dyn FinishWrite>> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    GzipCodec
        .wrap_writer(BufWriter::with_capacity(IO_BUFFER, file))
        .map_err(|e| anyhow!("gzip {}: {e}", path.display()))
}

struct GzipCodec;

impl CompressionCodec for GzipCodec {
    fn name(&self) -> &str {
        "gzip"
    }

    fn extensions(&self) -> &[&str] {
        &[".gz", ".gzip"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x1f, 0x8b])
    }

    fn wrap_reader(&self, reader: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(MultiGzDecoder::new(reader)))
    }

    fn wrap_writer(&self, writer: BufWriter<File>) -> io::Result<Box<dyn FinishWrite>> {
        Ok(Box::new(GzEncoder::new(writer, Compression::fast())))
    }
}

#[cfg(feature = "compression-zstd")]
struct ZstdCodec;

#[cfg(feature = "compression-zstd")]
impl CompressionCodec for ZstdCodec {
    fn name(&self) -> &str {
        "zstd"
    }

    fn extensions(&self) -> &[&str] {
        &[".zst", ".zstd"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x28, 0xb5, 0x2f, 0xfd])
    }

    fn wrap_reader(&self, reader: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        zstd::stream::read::Decoder::new(reader).map(|d| Box::new(d) as Box<dyn Read + Send>)
    }

    fn wrap_writer(&self, writer: BufWriter<File>) -> io::Result<Box<dyn FinishWrite>> {
        zstd::stream::write::Encoder::new(writer, 3).map(|e| Box::new(e) as Box<dyn FinishWrite>)
    }
}

#[cfg(feature = "compression-bzip2")]
struct Bzip2Codec;

#[cfg(feature = "compression-bzip2")]
impl CompressionCodec for Bzip2Codec {
    fn name(&self) -> &str {
        "bzip2"
    }

    fn extensions(&self) -> &[&str] {
        &[".bz2", ".bzip2"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0x42, 0x5a, 0x68])
    }

    fn wrap_reader(&self, reader: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        // Planet dumps are multi-stream bzip2.
        Ok(Box::new(bzip2::read::MultiBzDecoder::new(reader)))
    }

    fn wrap_writer(&self, writer: BufWriter<File>) -> io::Result<Box<dyn FinishWrite>> {
        Ok(Box::new(bzip2::write::BzEncoder::new(
            writer,
            bzip2::Compression::default(),
        )))
    }
}

#[cfg(feature = "compression-xz")]
struct XzCodec;

#[cfg(feature = "compression-xz")]
impl CompressionCodec for XzCodec {
    fn name(&self) -> &str {
        "xz"
    }

    fn extensions(&self) -> &[&str] {
        &[".xz"]
    }

    fn magic_bytes(&self) -> Option<&[u8]> {
        Some(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00])
    }

    fn wrap_reader(&self, reader: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(xz2::read::XzDecoder::new(reader)))
    }

    fn wrap_writer(&self, writer: BufWriter<File>) -> io::Result<Box<dyn FinishWrite>> {
        Ok(Box::new(xz2::write::XzEncoder::new(writer, 6)))
    }
}
