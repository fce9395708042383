use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::boxdata::{is_blank, BoxData, Coords};
use crate::error::{AnnotationError, Result};

/// Sidecar path for a video file or an image directory: same stem, `.json`.
pub fn annotation_path(source: &Path) -> PathBuf {
    source.with_extension("json")
}

/// Collapse boxes sharing coordinates into the first one seen, keeping its
/// source and concatenating the others' tags without repeats or blanks.
/// Group order follows first appearance.
pub fn merge_duplicate_boxes(boxes: Vec<BoxData>) -> Vec<BoxData> {
    let mut merged: Vec<BoxData> = Vec::with_capacity(boxes.len());
    let mut slots: HashMap<Coords, usize> = HashMap::new();

    for b in boxes {
        match slots.get(&b.key()) {
            Some(&i) => merged[i].tags.extend(b.tags),
            None => {
                slots.insert(b.key(), merged.len());
                merged.push(b);
            }
        }
    }

    for b in &mut merged {
        let mut seen: Vec<String> = Vec::with_capacity(b.tags.len());
        for tag in b.tags.drain(..) {
            if !is_blank(&tag) && !seen.contains(&tag) {
                seen.push(tag);
            }
        }
        b.tags = seen;
    }
    merged
}

/// Boxes per frame index. A frame with no entry reads as an empty list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameAnnotationStore {
    frames: BTreeMap<usize, Vec<BoxData>>,
}

impl FrameAnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutable list for `frame`, inserting an empty one on first access.
    pub fn get_boxes(&mut self, frame: usize) -> &mut Vec<BoxData> {
        self.frames.entry(frame).or_default()
    }

    /// Read-only view that does not materialize the frame.
    pub fn boxes(&self, frame: usize) -> &[BoxData] {
        self.frames.get(&frame).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn set_boxes(&mut self, frame: usize, boxes: Vec<BoxData>) {
        self.frames.insert(frame, boxes);
    }

    /// Whether the frame has an entry, even an empty one.
    pub fn contains_frame(&self, frame: usize) -> bool {
        self.frames.contains_key(&frame)
    }

    pub fn find(&self, frame: usize, key: Coords) -> Option<&BoxData> {
        self.boxes(frame).iter().find(|b| b.key() == key)
    }

    pub fn find_mut(&mut self, frame: usize, key: Coords) -> Result<&mut BoxData> {
        self.frames
            .get_mut(&frame)
            .and_then(|boxes| boxes.iter_mut().find(|b| b.key() == key))
            .ok_or(AnnotationError::BoxNotFound { frame, coords: key })
    }

    pub fn count_boxes(&self) -> usize {
        self.frames.values().map(Vec::len).sum()
    }

    pub fn box_count(&self, frame: usize) -> usize {
        self.boxes(frame).len()
    }

    /// Frames carrying at least one box, ascending.
    pub fn annotated_frames(&self) -> impl Iterator<Item = usize> + '_ {
        self.frames
            .iter()
            .filter(|(_, boxes)| !boxes.is_empty())
            .map(|(&frame, _)| frame)
    }

    pub fn is_empty(&self) -> bool {
        self.count_boxes() == 0
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    pub fn save_to_writer<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer_pretty(writer, &self.frames).map_err(AnnotationError::StoreSave)
    }

    pub fn load_from_reader<R: Read>(reader: R) -> Result<Self> {
        let raw: BTreeMap<usize, Vec<BoxData>> =
            serde_json::from_reader(reader).map_err(AnnotationError::StoreLoad)?;
        let frames = raw
            .into_iter()
            .map(|(frame, boxes)| (frame, merge_duplicate_boxes(boxes)))
            .collect();
        Ok(Self { frames })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.frames).map_err(AnnotationError::StoreSave)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::load_from_reader(json.as_bytes())
    }

    /// Whole-file write.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.save_to_writer(&mut writer)?;
        writer.flush()?;
        info!(path = %path.display(), boxes = self.count_boxes(), "saved annotations");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let store = Self::load_from_reader(BufReader::new(File::open(path)?))?;
        debug!(path = %path.display(), boxes = store.count_boxes(), "loaded annotations");
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxdata::BoxSource;

    fn b(coords: (i32, i32, i32, i32), tags: &[&str], source: BoxSource) -> BoxData {
        BoxData::new(coords, tags.iter().map(|s| s.to_string()).collect(), source)
    }

    #[test]
    fn merges_overlapping_tags() {
        let merged = merge_duplicate_boxes(vec![
            b((10, 20, 30, 40), &["cat", "dog"], BoxSource::User),
            b((10, 20, 30, 40), &["dog", "mouse"], BoxSource::User),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].coords, Coords::new(10, 20, 30, 40));
        assert_eq!(merged[0].tags, vec!["cat", "dog", "mouse"]);
        assert_eq!(merged[0].tags.iter().filter(|t| *t == "dog").count(), 1);
    }

    #[test]
    fn keeps_distinct_coords_apart() {
        let merged = merge_duplicate_boxes(vec![
            b((1, 2, 3, 4), &["a"], BoxSource::User),
            b((5, 6, 7, 8), &["b"], BoxSource::User),
        ]);
        let coords: Vec<_> = merged.iter().map(|b| b.coords).collect();
        assert_eq!(coords, vec![Coords::new(1, 2, 3, 4), Coords::new(5, 6, 7, 8)]);
    }

    #[test]
    fn merge_keeps_first_source_and_drops_blanks() {
        let merged = merge_duplicate_boxes(vec![
            b((0, 0, 9, 9), &["", "x"], BoxSource::Automatic),
            b((3, 3, 3, 3), &["y"], BoxSource::User),
            b((0, 0, 9, 9), &["x", " "], BoxSource::User),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].source, BoxSource::Automatic);
        assert_eq!(merged[0].tags, vec!["x"]);
        assert_eq!(merged[1].coords, Coords::new(3, 3, 3, 3));
    }

    #[test]
    fn merge_is_idempotent() {
        let boxes = vec![
            b((1, 1, 2, 2), &["a", "b", "a"], BoxSource::User),
            b((1, 1, 2, 2), &["c", ""], BoxSource::Automatic),
            b((4, 4, 2, 2), &[], BoxSource::User),
            b((4, 4, 2, 2), &["d"], BoxSource::User),
        ];
        let once = merge_duplicate_boxes(boxes);
        let twice = merge_duplicate_boxes(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn lazy_frame_materialization() {
        let mut store = FrameAnnotationStore::new();
        assert!(!store.contains_frame(3));
        assert!(store.boxes(3).is_empty());
        assert!(!store.contains_frame(3));
        assert!(store.get_boxes(3).is_empty());
        assert!(store.contains_frame(3));
        store.get_boxes(3).push(b((0, 0, 1, 1), &["t"], BoxSource::User));
        assert_eq!(store.get_boxes(3).len(), 1);
        assert_eq!(store.count_boxes(), 1);
        assert_eq!(store.annotated_frames().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn file_format_uses_string_frame_keys() {
        let mut store = FrameAnnotationStore::new();
        store.set_boxes(12, vec![b((1, 2, 3, 4), &["pin", ""], BoxSource::User)]);
        let value: serde_json::Value = serde_json::from_str(&store.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"12": [{"coords": [1, 2, 3, 4], "tags": ["pin"], "source": "user"}]})
        );
    }

    #[test]
    fn load_merges_and_defaults_source() {
        let json = r#"{
            "0": [
                {"coords": [5, 5, 10, 10], "tags": ["cat", "  "]},
                {"coords": [5, 5, 10, 10], "tags": ["dog"], "source": "user"}
            ],
            "7": []
        }"#;
        let store = FrameAnnotationStore::from_json(json).unwrap();
        assert_eq!(store.count_boxes(), 1);
        assert!(store.contains_frame(7));
        let only = &store.boxes(0)[0];
        assert_eq!(only.source, BoxSource::Automatic);
        assert_eq!(only.tags, vec!["cat", "dog"]);
    }

    #[test]
    fn malformed_files_fail_to_load() {
        for json in [
            "not json",
            r#"{"0": [{"tags": ["a"]}]}"#,
            r#"{"0": [{"coords": [1, 2, 3], "tags": []}]}"#,
            r#"{"0": [{"coords": [1, 2, 3, 4], "tags": [], "source": "robot"}]}"#,
            r#"{"zero": []}"#,
        ] {
            let err = FrameAnnotationStore::from_json(json).unwrap_err();
            assert!(matches!(err, AnnotationError::StoreLoad(_)), "{json}");
        }
    }

    #[test]
    fn round_trip() {
        let mut store = FrameAnnotationStore::new();
        store.set_boxes(
            0,
            vec![
                b((1, 2, 3, 4), &["a", "b"], BoxSource::User),
                b((9, 9, 9, 9), &[], BoxSource::Automatic),
            ],
        );
        store.set_boxes(25, vec![b((0, 0, 5, 5), &["c"], BoxSource::Automatic)]);
        let reloaded = FrameAnnotationStore::from_json(&store.to_json().unwrap()).unwrap();
        assert_eq!(reloaded, store);
    }

    #[test]
    fn sidecar_replaces_extension() {
        assert_eq!(annotation_path(Path::new("/v/clip.mp4")), PathBuf::from("/v/clip.json"));
        assert_eq!(annotation_path(Path::new("/v/frames")), PathBuf::from("/v/frames.json"));
    }
}
