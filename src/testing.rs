//! Helpers for testing sorters, joins, and pipelines.
//!
//! - **Assertions**: [`assert_non_decreasing`] and [`assert_same_multiset`] check
//!   the two properties every sorted record file must have.
//! - **Fixtures**: [`OsmFixture`] builds small OSM XML documents, optionally
//!   compressed, for end-to-end runs.
//!
//! ```
//! use osmjoin::record::Record;
//! use osmjoin::testing::{assert_non_decreasing, assert_same_multiset};
//!
//! let out = vec![Record::new("1", "a"), Record::new("1", "a"), Record::new("2", "b")];
//! assert_non_decreasing(&out);
//! assert_same_multiset(&out, &[Record::new("2", "b"), Record::new("1", "a"), Record::new("1", "a")]);
//! ```

use crate::io::compression::create_writer;
use crate::record::Record;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};

pub use crate::io::read_records;

/// Build records from `(key, value)` string pairs.
pub fn records(pairs: &[(&str, &str)]) -> Vec<Record> {
    pairs.iter().map(|&(k, v)| Record::new(k, v)).collect()
}

/// Assert that keys never decrease from one record to the next.
///
/// # Panics
/// Panics at the first key regression, naming its position.
pub fn assert_non_decreasing(records: &[Record]) {
    for (i, pair) in records.windows(2).enumerate() {
        assert!(
            pair[0].key <= pair[1].key,
            "key order violated at index {}: {:?} follows {:?}",
            i + 1,
            pair[1].key,
            pair[0].key
        );
    }
}

/// Assert that two record lists hold the same records with the same
/// multiplicities, ignoring order.
///
/// # Panics
/// Panics if the lists differ as multisets.
pub fn assert_same_multiset(actual: &[Record], expected: &[Record]) {
    let mut a = actual.to_vec();
    let mut e = expected.to_vec();
    a.sort();
    e.sort();
    assert_eq!(
        a.len(),
        e.len(),
        "record count mismatch: expected {}, got {}",
        e.len(),
        a.len()
    );
    if let Some(i) = a.iter().zip(&e).position(|(x, y)| x != y) {
        panic!(
            "multiset mismatch at sorted position {i}:\n  expected: {}\n  actual:   {}",
            e[i], a[i]
        );
    }
}

/// Builder for small OSM XML documents.
///
/// ```
/// use osmjoin::testing::OsmFixture;
///
/// let xml = OsmFixture::new()
///     .node(1, 52.5, 13.4)
///     .node(2, 52.6, 13.5)
///     .way(10, &[1, 2], &[("highway", "residential")])
///     .build();
/// assert!(xml.contains("<nd ref=\"2\"/>"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct OsmFixture {
    body: String,
}

impl OsmFixture {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_tags(&mut self, tags: &[(&str, &str)]) {
        for (k, v) in tags {
            let _ = writeln!(self.body, "    <tag k=\"{k}\" v=\"{v}\"/>");
        }
    }

    /// Add a self-closing node without tags.
    #[must_use]
    pub fn node(self, id: u64, lat: f64, lon: f64) -> Self {
        self.tagged_node(id, lat, lon, &[])
    }

    #[must_use]
    pub fn tagged_node(mut self, id: u64, lat: f64, lon: f64, tags: &[(&str, &str)]) -> Self {
        let open = format!("  <node id=\"{id}\" version=\"1\" uid=\"7\" lat=\"{lat}\" lon=\"{lon}\"");
        if tags.is_empty() {
            let _ = writeln!(self.body, "{open}/>");
        } else {
            let _ = writeln!(self.body, "{open}>");
            self.push_tags(tags);
            self.body.push_str("  </node>\n");
        }
        self
    }

    #[must_use]
    pub fn way(mut self, id: u64, refs: &[u64], tags: &[(&str, &str)]) -> Self {
        let _ = writeln!(self.body, "  <way id=\"{id}\" version=\"1\">");
        for r in refs {
            let _ = writeln!(self.body, "    <nd ref=\"{r}\"/>");
        }
        self.push_tags(tags);
        self.body.push_str("  </way>\n");
        self
    }

    /// Add a relation; members are `(type, ref, role)`.
    #[must_use]
    pub fn relation(mut self, id: u64, members: &[(&str, u64, &str)], tags: &[(&str, &str)]) -> Self {
        let _ = writeln!(self.body, "  <relation id=\"{id}\" version=\"1\">");
        for (kind, r, role) in members {
            let _ = writeln!(
                self.body,
                "    <member type=\"{kind}\" ref=\"{r}\" role=\"{role}\"/>"
            );
        }
        self.push_tags(tags);
        self.body.push_str("  </relation>\n");
        self
    }

    /// Append literal XML, e.g. a deliberately broken element.
    #[must_use]
    pub fn raw(mut self, xml: &str) -> Self {
        self.body.push_str(xml);
        self.body.push('\n');
        self
    }

    pub fn build(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<osm version=\"0.6\">\n  <bounds minlat=\"0\" minlon=\"0\" maxlat=\"90\" maxlon=\"180\"/>\n{}</osm>\n",
            self.body
        )
    }

    /// Write the document to `path`, compressed according to its extension.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let mut w = create_writer(path, path)?;
        w.write_all(self.build().as_bytes())
            .with_context(|| format!("write fixture {}", path.display()))?;
        w.finish()
            .with_context(|| format!("finish fixture {}", path.display()))?;
        Ok(path.to_path_buf())
    }
}
