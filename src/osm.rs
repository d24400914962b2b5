//! OpenStreetMap XML decoding and element assembly.
//!
//! Planet files are far too large for a DOM and too regular to need a full XML
//! parser. [`OsmBlobs`] cuts the line stream into one string per `<node>`, `<way>`
//! or `<relation>` element, and [`Element::parse`] pulls the handful of fields the
//! pipeline needs out of a blob with regular expressions.
//!
//! Payloads are compact JSON objects:
//!
//! | element  | payload                                                        |
//! |----------|----------------------------------------------------------------|
//! | node     | `{"id":1,"l":[lon,lat], tags...}`                              |
//! | way      | `{"id":2,"refs":[1,...], tags...}`                             |
//! | relation | `{"id":3,"members":[{"type":"way","ref":2,"role":"outer"}], tags...}` |
//!
//! Every record key is an id formatted by [`id_key`], so the lexicographic order
//! used by the sorter matches numeric id order.

use crate::record::DELIMITER;
use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Tag names that would collide with payload fields; such tags are dropped.
pub const BLACKLISTED_TAGS: &[&str] = &[
    "created_by",
    "source",
    "id",
    "latitude",
    "longitude",
    "location",
    "members",
    "ways",
    "relations",
    "l",
    "geometry",
    "role",
    "refs",
    "nodes",
    "incomplete",
];

/// Width of a formatted id key; `u64::MAX` has 20 digits.
pub const ID_KEY_WIDTH: usize = 20;

/// Format an OSM id as a fixed-width record key.
pub fn id_key(id: u64) -> String {
    format!("{id:0width$}", width = ID_KEY_WIDTH)
}

/// Parse a key produced by [`id_key`].
pub fn parse_id_key(key: &str) -> Result<u64> {
    key.parse()
        .with_context(|| format!("invalid id key {key:?}"))
}

/// Serialize a payload so it can never contain the record delimiter.
///
/// `;` only occurs inside JSON strings, where `\u003b` is an equivalent escape.
pub fn encode_payload(value: &Value) -> Result<String> {
    let json = serde_json::to_string(value).context("serialize payload")?;
    if json.contains(DELIMITER) {
        Ok(json.replace(DELIMITER, "\\u003b"))
    } else {
        Ok(json)
    }
}

pub fn decode_payload(payload: &str) -> Result<Value> {
    serde_json::from_str(payload).with_context(|| format!("invalid payload {payload:?}"))
}

/// Iterator over the element blobs of an OSM XML line stream.
///
/// A blob is the trimmed concatenation of the lines from an opening `<node`, `<way`
/// or `<relation` tag up to its closing tag, or the single line of a self-closing
/// element. Everything between elements is skipped.
pub struct OsmBlobs<I> {
    lines: I,
    done: bool,
}

impl<I> OsmBlobs<I>
where
    I: Iterator<Item = std::io::Result<String>>,
{
    pub fn new(lines: I) -> Self {
        Self { lines, done: false }
    }

    fn closing_tag(line: &str) -> Option<&'static str> {
        if line.starts_with("<node") {
            Some("</node>")
        } else if line.starts_with("<way") {
            Some("</way>")
        } else if line.starts_with("<relation") {
            Some("</relation>")
        } else {
            None
        }
    }

    fn next_blob(&mut self) -> Result<Option<String>> {
        while let Some(line) = self.lines.next() {
            let line = line.context("read OSM XML")?;
            let trimmed = line.trim();
            let Some(closing) = Self::closing_tag(trimmed) else {
                continue;
            };
            let mut blob = trimmed.to_string();
            if trimmed.ends_with("/>") || trimmed.ends_with(closing) {
                return Ok(Some(blob));
            }
            loop {
                let line = self
                    .lines
                    .next()
                    .ok_or_else(|| anyhow!("unterminated element, expected {closing}"))?
                    .context("read OSM XML")?;
                let trimmed = line.trim();
                blob.push_str(trimmed);
                if trimmed.ends_with(closing) {
                    return Ok(Some(blob));
                }
            }
        }
        Ok(None)
    }
}

impl<I> Iterator for OsmBlobs<I>
where
    I: Iterator<Item = std::io::Result<String>>,
{
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let out = self.next_blob().transpose();
        if !matches!(out, Some(Ok(_))) {
            self.done = true;
        }
        out
    }
}

struct Patterns {
    id: Regex,
    lat: Regex,
    lon: Regex,
    tag: Regex,
    nd: Regex,
    member: Regex,
}

static PATTERNS: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    id: Regex::new(r#"\sid="([0-9]+)""#).expect("valid id regex"),
    lat: Regex::new(r#"\slat="(-?[0-9]+(?:\.[0-9]+)?)""#).expect("valid lat regex"),
    lon: Regex::new(r#"\slon="(-?[0-9]+(?:\.[0-9]+)?)""#).expect("valid lon regex"),
    tag: Regex::new(r#"k="(.*?)"\s+v="(.*?)""#).expect("valid tag regex"),
    nd: Regex::new(r#"<nd ref="([0-9]+)""#).expect("valid nd regex"),
    member: Regex::new(r#"<member type="(.*?)" ref="([0-9]+)" role="(.*?)""#)
        .expect("valid member regex"),
});

/// Replace the five predefined XML entities.
fn unescape_xml(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn tags(blob: &str, into: &mut Map<String, Value>) {
    for cap in PATTERNS.tag.captures_iter(blob) {
        let name = unescape_xml(&cap[1]);
        if !BLACKLISTED_TAGS.contains(&name.as_str()) {
            into.insert(name, Value::String(unescape_xml(&cap[2])));
        }
    }
}

/// Kind of an OSM element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Node,
    Way,
    Relation,
}

/// A node or way referenced by a relation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    #[serde(rename = "type")]
    pub kind: ElementKind,
    #[serde(rename = "ref")]
    pub id: u64,
    pub role: String,
}

/// One decoded element and its JSON payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Element {
    Node { id: u64, payload: Value },
    Way { id: u64, refs: Vec<u64>, payload: Value },
    Relation { id: u64, members: Vec<Member>, payload: Value },
}

impl Element {
    /// Decode one blob from [`OsmBlobs`].
    ///
    /// Relation members other than nodes and ways are ignored.
    ///
    /// # Errors
    /// Fails for an unknown element, a missing id, or a node without coordinates.
    pub fn parse(blob: &str) -> Result<Self> {
        let p = &*PATTERNS;
        let id: u64 = match p.id.captures(blob) {
            Some(cap) => cap[1].parse().context("parse element id")?,
            None => bail!("element without id: {}", preview(blob)),
        };
        let mut payload = Map::new();
        payload.insert("id".into(), json!(id));

        if blob.starts_with("<node") {
            let (Some(lat), Some(lon)) = (p.lat.captures(blob), p.lon.captures(blob)) else {
                bail!("node {id} has no lat/lon");
            };
            let lat: f64 = lat[1].parse().with_context(|| format!("node {id} latitude"))?;
            let lon: f64 = lon[1].parse().with_context(|| format!("node {id} longitude"))?;
            payload.insert("l".into(), json!([lon, lat]));
            tags(blob, &mut payload);
            Ok(Element::Node {
                id,
                payload: Value::Object(payload),
            })
        } else if blob.starts_with("<way") {
            let refs = p
                .nd
                .captures_iter(blob)
                .map(|cap| cap[1].parse::<u64>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("way {id} node refs"))?;
            tags(blob, &mut payload);
            payload.insert("refs".into(), json!(refs));
            Ok(Element::Way {
                id,
                refs,
                payload: Value::Object(payload),
            })
        } else if blob.starts_with("<relation") {
            let mut members = Vec::new();
            for cap in p.member.captures_iter(blob) {
                let kind = match cap[1].to_ascii_lowercase().as_str() {
                    "node" => ElementKind::Node,
                    "way" => ElementKind::Way,
                    _ => continue,
                };
                members.push(Member {
                    kind,
                    id: cap[2].parse().with_context(|| format!("relation {id} member ref"))?,
                    role: unescape_xml(&cap[3]),
                });
            }
            tags(blob, &mut payload);
            payload.insert("members".into(), serde_json::to_value(&members)?);
            Ok(Element::Relation {
                id,
                members,
                payload: Value::Object(payload),
            })
        } else {
            bail!("unexpected element: {}", preview(blob))
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Element::Node { id, .. } | Element::Way { id, .. } | Element::Relation { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> ElementKind {
        match self {
            Element::Node { .. } => ElementKind::Node,
            Element::Way { .. } => ElementKind::Way,
            Element::Relation { .. } => ElementKind::Relation,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Element::Node { payload, .. }
            | Element::Way { payload, .. }
            | Element::Relation { payload, .. } => payload,
        }
    }
}

fn preview(blob: &str) -> &str {
    let end = blob
        .char_indices()
        .nth(80)
        .map_or(blob.len(), |(i, _)| i);
    &blob[..end]
}

fn object_mut<'a>(value: &'a mut Value, what: &str) -> Result<&'a mut Map<String, Value>> {
    value
        .as_object_mut()
        .ok_or_else(|| anyhow!("{what} payload is not a JSON object"))
}

fn payload_id(value: &Value) -> Option<u64> {
    value.get("id").and_then(Value::as_u64)
}

/// Attach resolved nodes and a geometry to a way payload.
///
/// `nodes` are node payloads in any order, possibly with duplicates. Nodes are
/// placed in the way's `refs` order; a ref with no matching node marks the way
/// `"incomplete": true`. A closed ring of at least four points becomes a
/// `Polygon`, anything else a `LineString`.
///
/// # Errors
/// Fails if a payload is not a JSON object.
pub fn enrich_way(mut way: Value, nodes: &[Value]) -> Result<Value> {
    let by_id: HashMap<u64, &Value> = nodes
        .iter()
        .filter_map(|n| payload_id(n).map(|id| (id, n)))
        .collect();
    let refs: Vec<u64> = way
        .get("refs")
        .and_then(Value::as_array)
        .map(|refs| refs.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default();

    let mut resolved = Vec::with_capacity(refs.len());
    let mut coordinates = Vec::with_capacity(refs.len());
    let mut incomplete = false;
    for r in &refs {
        match by_id.get(r) {
            Some(node) => {
                if let Some(l) = node.get("l") {
                    coordinates.push(l.clone());
                }
                resolved.push((*node).clone());
            }
            None => incomplete = true,
        }
    }

    let closed = coordinates.len() >= 4 && coordinates.first() == coordinates.last();
    let geometry = if closed {
        json!({"type": "Polygon", "coordinates": [coordinates]})
    } else {
        json!({"type": "LineString", "coordinates": coordinates})
    };

    let obj = object_mut(&mut way, "way")?;
    obj.insert("nodes".into(), Value::Array(resolved));
    obj.insert("geometry".into(), geometry);
    if incomplete {
        obj.insert("incomplete".into(), Value::Bool(true));
    }
    Ok(way)
}

/// Wrap a node or enriched way payload for grouping under a relation key.
pub fn member_payload(kind: ElementKind, element: Value) -> Value {
    json!({"type": kind, "element": element})
}

/// Attach resolved members to a relation payload.
///
/// `resolved` holds values built by [`member_payload`], in any order. Each entry of
/// the relation's `members` list is replaced by the matching element with its
/// `type` and `role` added; node members also get a GeoJSON `Point` geometry. If
/// any member cannot be resolved the relation is marked `"incomplete": true`.
///
/// # Errors
/// Fails if a payload is not a JSON object.
pub fn enrich_relation(mut relation: Value, resolved: &[Value]) -> Result<Value> {
    let mut by_ref: HashMap<(ElementKind, u64), &Value> = HashMap::new();
    for m in resolved {
        let kind = m
            .get("type")
            .cloned()
            .map(serde_json::from_value::<ElementKind>)
            .transpose()
            .context("member type")?;
        if let (Some(kind), Some(element)) = (kind, m.get("element"))
            && let Some(id) = payload_id(element)
        {
            by_ref.insert((kind, id), element);
        }
    }

    let wanted: Vec<Member> = match relation.get("members") {
        Some(members) => serde_json::from_value(members.clone()).context("relation members")?,
        None => Vec::new(),
    };

    let mut members = Vec::with_capacity(wanted.len());
    let mut incomplete = false;
    for m in &wanted {
        let Some(element) = by_ref.get(&(m.kind, m.id)) else {
            incomplete = true;
            continue;
        };
        let mut element = (*element).clone();
        let obj = object_mut(&mut element, "member")?;
        if m.kind == ElementKind::Node
            && let Some(l) = obj.remove("l")
        {
            obj.insert("geometry".into(), json!({"type": "Point", "coordinates": l}));
        }
        obj.insert("type".into(), json!(m.kind));
        obj.insert("role".into(), Value::String(m.role.clone()));
        members.push(element);
    }

    let obj = object_mut(&mut relation, "relation")?;
    obj.insert("members".into(), Value::Array(members));
    if incomplete {
        obj.insert("incomplete".into(), Value::Bool(true));
    }
    Ok(relation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs(xml: &str) -> Vec<String> {
        OsmBlobs::new(xml.lines().map(|l| Ok(l.to_string())))
            .collect::<Result<_>>()
            .unwrap()
    }

    #[test]
    fn id_keys_sort_numerically() {
        assert_eq!(id_key(42), "00000000000000000042");
        assert!(id_key(9) < id_key(10));
        assert_eq!(id_key(u64::MAX).len(), ID_KEY_WIDTH);
        assert_eq!(parse_id_key(&id_key(1234)).unwrap(), 1234);
    }

    #[test]
    fn blobs_cover_self_closing_and_nested_elements() {
        let xml = r#"<?xml version="1.0"?>
<osm>
  <bounds minlat="1"/>
  <node id="1" lat="1.0" lon="2.0"/>
  <node id="2" lat="1.5" lon="2.5">
    <tag k="name" v="x"/>
  </node>
  <way id="3">
    <nd ref="1"/>
  </way>
</osm>"#;
        let b = blobs(xml);
        assert_eq!(b.len(), 3);
        assert!(b[1].starts_with("<node id=\"2\"") && b[1].ends_with("</node>"));
        assert_eq!(b[2], r#"<way id="3"><nd ref="1"/></way>"#);
    }

    #[test]
    fn unterminated_element_is_an_error() {
        let mut it = OsmBlobs::new(vec![Ok("<way id=\"1\">".to_string())].into_iter());
        assert!(matches!(it.next(), Some(Err(_))));
        assert!(it.next().is_none());
    }

    #[test]
    fn uid_is_not_mistaken_for_id() -> Result<()> {
        let e = Element::parse(r#"<node uid="99" id="7" lat="-1.5" lon="3"/>"#)?;
        assert_eq!(e.id(), 7);
        assert_eq!(e.payload()["l"], json!([3.0, -1.5]));
        Ok(())
    }

    #[test]
    fn payload_never_contains_delimiter() -> Result<()> {
        let e = Element::parse(r#"<node id="1" lat="1" lon="1"><tag k="name" v="a;b &amp; c"/></node>"#)?;
        let encoded = encode_payload(e.payload())?;
        assert!(!encoded.contains(';'));
        assert_eq!(decode_payload(&encoded)?["name"], json!("a;b & c"));
        Ok(())
    }

    #[test]
    fn open_way_is_a_line_string() -> Result<()> {
        let way = json!({"id": 5, "refs": [1, 2, 3]});
        let nodes = [json!({"id": 2, "l": [1.0, 1.0]}), json!({"id": 1, "l": [0.0, 0.0]})];
        let out = enrich_way(way, &nodes)?;
        assert_eq!(out["geometry"]["type"], "LineString");
        assert_eq!(out["geometry"]["coordinates"], json!([[0.0, 0.0], [1.0, 1.0]]));
        assert_eq!(out["incomplete"], json!(true));
        Ok(())
    }
}
