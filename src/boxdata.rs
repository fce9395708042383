use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AnnotationError, Result};

// ── Coordinates ─────────────────────────────────────────────────────────────

/// Axis-aligned rectangle `(x, y, width, height)` in un-rotated image pixels.
///
/// This is also the lookup key for a box: two boxes with equal coordinates are
/// the same box as far as selection and tag editing are concerned, whatever
/// their tags say. Distinct boxes that share coordinates collide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct Coords {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Coords {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// Flip negative extents (a drag towards the top-left) into a
    /// non-negative rectangle covering the same pixels.
    pub fn normalized(self) -> Self {
        let flip = |p: i32, extent: i32| {
            if extent < 0 {
                (p.saturating_add(extent), extent.saturating_neg())
            } else {
                (p, extent)
            }
        };
        let (x, w) = flip(self.x, self.w);
        let (y, h) = flip(self.y, self.h);
        Self { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// Saturates at `i32::MAX`; files may carry any `i32`.
    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.w)
    }

    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.h)
    }
}

impl From<[i32; 4]> for Coords {
    fn from([x, y, w, h]: [i32; 4]) -> Self {
        Self { x, y, w, h }
    }
}

impl From<Coords> for [i32; 4] {
    fn from(c: Coords) -> Self {
        [c.x, c.y, c.w, c.h]
    }
}

impl From<(i32, i32, i32, i32)> for Coords {
    fn from((x, y, w, h): (i32, i32, i32, i32)) -> Self {
        Self { x, y, w, h }
    }
}

impl fmt::Display for Coords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x, self.y, self.w, self.h)
    }
}

// ── Provenance ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxSource {
    /// Drawn by hand.
    User,
    /// Carried forward by the tracker. Files written before provenance was
    /// recorded load as automatic.
    #[default]
    Automatic,
}

impl BoxSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoxSource::User => "user",
            BoxSource::Automatic => "automatic",
        }
    }
}

impl FromStr for BoxSource {
    type Err = AnnotationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(BoxSource::User),
            "automatic" => Ok(BoxSource::Automatic),
            other => Err(AnnotationError::InvalidSource(other.to_string())),
        }
    }
}

impl fmt::Display for BoxSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Box ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxData {
    pub coords: Coords,
    #[serde(
        serialize_with = "serialize_tags",
        deserialize_with = "deserialize_tags"
    )]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source: BoxSource,
}

impl BoxData {
    pub fn new(coords: impl Into<Coords>, tags: Vec<String>, source: BoxSource) -> Self {
        Self {
            coords: coords.into(),
            tags,
            source,
        }
    }

    /// Build a box from a textual provenance, rejecting anything other than
    /// `user` or `automatic`.
    pub fn with_source_name(
        coords: impl Into<Coords>,
        tags: Vec<String>,
        source: &str,
    ) -> Result<Self> {
        Ok(Self::new(coords, tags, source.parse()?))
    }

    pub fn key(&self) -> Coords {
        self.coords
    }

    pub fn tag(&self, index: usize) -> Option<&str> {
        self.tags.get(index).map(String::as_str)
    }

    pub fn set_tag(&mut self, index: usize, tag: impl Into<String>) -> Result<()> {
        let len = self.tags.len();
        match self.tags.get_mut(index) {
            Some(slot) => {
                *slot = tag.into();
                Ok(())
            }
            None => Err(AnnotationError::TagIndex { index, len }),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Returns `false` when the tag was already present.
    pub fn add_tag(&mut self, tag: &str) -> bool {
        if self.has_tag(tag) {
            return false;
        }
        self.tags.push(tag.to_string());
        true
    }

    /// Removes the first occurrence. Returns `false` when absent.
    pub fn remove_tag(&mut self, tag: &str) -> bool {
        match self.tags.iter().position(|t| t == tag) {
            Some(i) => {
                self.tags.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn label(&self) -> String {
        self.tags.join(", ")
    }
}

pub(crate) fn is_blank(tag: &str) -> bool {
    tag.trim().is_empty()
}

fn serialize_tags<S: Serializer>(tags: &[String], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(tags.iter().filter(|t| !is_blank(t)))
}

fn deserialize_tags<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    let tags = Vec::<String>::deserialize(deserializer)?;
    Ok(tags.into_iter().filter(|t| !is_blank(t)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(t: &[&str]) -> Vec<String> {
        t.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalizes_reverse_drag() {
        let c = Coords::new(50, 40, -20, -10).normalized();
        assert_eq!(c, Coords::new(30, 30, 20, 10));
        assert_eq!(Coords::new(1, 2, 3, 4).normalized(), Coords::new(1, 2, 3, 4));
    }

    #[test]
    fn rejects_unknown_source() {
        let err = BoxData::with_source_name((0, 0, 1, 1), vec![], "robot").unwrap_err();
        assert!(matches!(err, AnnotationError::InvalidSource(s) if s == "robot"));
        let ok = BoxData::with_source_name((0, 0, 1, 1), vec![], "user").unwrap();
        assert_eq!(ok.source, BoxSource::User);
    }

    #[test]
    fn add_tag_is_idempotent() {
        let mut b = BoxData::new((0, 0, 5, 5), tags(&["cat"]), BoxSource::User);
        assert!(b.add_tag("x"));
        assert!(!b.add_tag("x"));
        assert_eq!(b.tags.iter().filter(|t| *t == "x").count(), 1);
    }

    #[test]
    fn remove_missing_tag_is_noop() {
        let mut b = BoxData::new((0, 0, 5, 5), tags(&["cat", "dog"]), BoxSource::User);
        assert!(!b.remove_tag("y"));
        assert_eq!(b.tags, tags(&["cat", "dog"]));
        assert!(b.remove_tag("cat"));
        assert_eq!(b.tags, tags(&["dog"]));
    }

    #[test]
    fn set_tag_out_of_range() {
        let mut b = BoxData::new((0, 0, 5, 5), tags(&["a"]), BoxSource::User);
        b.set_tag(0, "b").unwrap();
        assert_eq!(b.tag(0), Some("b"));
        let err = b.set_tag(3, "c").unwrap_err();
        assert!(matches!(err, AnnotationError::TagIndex { index: 3, len: 1 }));
    }

    #[test]
    fn blank_tags_are_not_written() {
        let b = BoxData::new((1, 2, 3, 4), tags(&["cat", "", "  "]), BoxSource::User);
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"coords": [1, 2, 3, 4], "tags": ["cat"], "source": "user"})
        );
    }

    #[test]
    fn missing_source_reads_as_automatic() {
        let b: BoxData = serde_json::from_str(r#"{"coords": [1, 2, 3, 4], "tags": ["a", " "]}"#).unwrap();
        assert_eq!(b.source, BoxSource::Automatic);
        assert_eq!(b.tags, tags(&["a"]));
    }
}
