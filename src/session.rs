//! The annotation session: one writer for the store and the undo history,
//! driven by UI commands and reporting back through observers.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use tracing::{debug, error, info, warn};

use crate::boxdata::{is_blank, BoxData, BoxSource, Coords};
use crate::config::{AppConfig, TrackerConfig};
use crate::error::{AnnotationError, Result};
use crate::frames::FrameSource;
use crate::store::FrameAnnotationStore;
use crate::tracker::ObjectTracker;
use crate::transform::{rect_contains, DisplayGeometry, Rotation};
use crate::undo::{UndoAction, UndoRedoEngine};

/// Sent to observers once the change it describes is committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    BoxAdded { frame: usize, coords: Coords },
    BoxEdited { frame: usize, coords: Coords },
    BoxRemoved { frame: usize, coords: Coords },
    /// The frame's whole list changed (tracking, undo, redo).
    BoxesUpdated { frame: usize },
    BoxSelected(Option<Coords>),
    FrameChanged { frame: usize },
    RotationChanged(Rotation),
}

type Observer = Box<dyn FnMut(&SessionEvent)>;

pub struct AnnotationSession<S: FrameSource> {
    source: S,
    store: FrameAnnotationStore,
    history: UndoRedoEngine,
    tracker: ObjectTracker,
    current: usize,
    rotation: Rotation,
    selected: Option<Coords>,
    annotation_path: Option<PathBuf>,
    set_aside: Option<PathBuf>,
    auto_save: bool,
    observers: Vec<Observer>,
}

impl<S: FrameSource> AnnotationSession<S> {
    /// In-memory session with no sidecar file.
    pub fn new(source: S, tracker: &TrackerConfig) -> Self {
        let mut session = Self {
            source,
            store: FrameAnnotationStore::new(),
            history: UndoRedoEngine::new(),
            tracker: ObjectTracker::new(tracker),
            current: 0,
            rotation: Rotation::Deg0,
            selected: None,
            annotation_path: None,
            set_aside: None,
            auto_save: false,
            observers: Vec::new(),
        };
        session.visit_current();
        session
    }

    /// Session backed by a sidecar file. A missing or unreadable file starts
    /// an empty store. An unreadable file is renamed to `<name>.bak` before
    /// anything can be saved over it; if that fails, auto-save stays off.
    pub fn open(source: S, annotation_path: PathBuf, config: &AppConfig) -> Self {
        let mut set_aside = None;
        let mut auto_save = config.auto_save;
        let store = if annotation_path.exists() {
            match FrameAnnotationStore::load(&annotation_path) {
                Ok(store) => store,
                Err(e) => {
                    warn!(path = %annotation_path.display(), "starting with empty annotations: {e}");
                    let backup = backup_path(&annotation_path);
                    match std::fs::rename(&annotation_path, &backup) {
                        Ok(()) => {
                            warn!(backup = %backup.display(), "moved unreadable annotations aside");
                            set_aside = Some(backup);
                        }
                        Err(e) => {
                            error!(path = %annotation_path.display(), "cannot move unreadable annotations aside, auto-save disabled: {e}");
                            auto_save = false;
                        }
                    }
                    FrameAnnotationStore::new()
                }
            }
        } else {
            FrameAnnotationStore::new()
        };
        let mut session = Self::new(source, &config.tracker).with_store(store);
        session.annotation_path = Some(annotation_path);
        session.set_aside = set_aside;
        session.auto_save = auto_save;
        session
    }

    pub fn with_store(mut self, store: FrameAnnotationStore) -> Self {
        self.store = store;
        self.history.clear();
        self.visit_current();
        self
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&SessionEvent) + 'static) {
        self.observers.push(Box::new(observer));
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn store(&self) -> &FrameAnnotationStore {
        &self.store
    }

    pub fn frame_count(&self) -> usize {
        self.source.frame_count()
    }

    pub fn current_frame(&self) -> usize {
        self.current
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn current_boxes(&self) -> &[BoxData] {
        self.store.boxes(self.current)
    }

    pub fn selected(&self) -> Option<&BoxData> {
        self.selected.and_then(|key| self.store.find(self.current, key))
    }

    pub fn annotation_path(&self) -> Option<&Path> {
        self.annotation_path.as_deref()
    }

    /// Where an unreadable sidecar was moved when the session opened.
    pub fn set_aside(&self) -> Option<&Path> {
        self.set_aside.as_deref()
    }

    pub fn auto_save(&self) -> bool {
        self.auto_save
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// The current frame as displayed.
    pub fn current_image(&self) -> Option<DynamicImage> {
        self.source.get_frame(self.current, self.rotation)
    }

    // ── Navigation ──────────────────────────────────────────────────────────

    /// Step forward one frame, carrying the current boxes over by tracking
    /// when the next frame has none yet. Returns `false` on the last frame.
    pub fn advance_to_next_frame(&mut self) -> bool {
        let next = self.current + 1;
        if next >= self.frame_count() {
            return false;
        }

        let mut tracked = false;
        if self.store.boxes(next).is_empty() && self.store.contains_frame(self.current) {
            let found = self.track_forward(self.current, next);
            if !found.is_empty() {
                self.store.get_boxes(next).extend(found);
                tracked = true;
            }
        }

        self.move_to(next);
        if tracked {
            self.notify(SessionEvent::BoxesUpdated { frame: next });
            self.persist();
        }
        true
    }

    pub fn go_to_previous_frame(&mut self) -> bool {
        if self.current == 0 {
            return false;
        }
        self.move_to(self.current - 1);
        true
    }

    /// Jump to `index`, clamped to the last frame. Never tracks.
    pub fn go_to_frame(&mut self, index: usize) -> bool {
        let Some(last) = self.frame_count().checked_sub(1) else {
            return false;
        };
        let target = index.min(last);
        if target == self.current {
            return false;
        }
        self.move_to(target);
        true
    }

    fn move_to(&mut self, frame: usize) {
        self.current = frame;
        self.visit_current();
        let had_selection = self.selected.take().is_some();
        self.notify(SessionEvent::FrameChanged { frame });
        if had_selection {
            self.notify(SessionEvent::BoxSelected(None));
        }
    }

    /// A displayed frame counts as visited, which is what lets tracking
    /// start from it.
    fn visit_current(&mut self) {
        if self.current < self.frame_count() {
            self.store.get_boxes(self.current);
        }
    }

    fn track_forward(&self, from: usize, to: usize) -> Vec<BoxData> {
        let boxes = self.store.boxes(from);
        if boxes.is_empty() {
            return Vec::new();
        }
        let (Some(prev), Some(next)) = (
            self.source.get_frame(from, Rotation::Deg0),
            self.source.get_frame(to, Rotation::Deg0),
        ) else {
            warn!(from, to, "frame unavailable, skipping tracking");
            return Vec::new();
        };
        let prev = ObjectTracker::to_gray(&prev);
        let next = ObjectTracker::to_gray(&next);

        let found: Vec<BoxData> = boxes
            .iter()
            .filter_map(|b| self.tracker.locate(&prev, &next, b))
            .collect();
        info!(from, to, tracked = found.len(), of = boxes.len(), "tracked boxes");
        found
    }

    // ── Rotation ────────────────────────────────────────────────────────────

    pub fn set_rotation(&mut self, degrees: i32) -> Result<()> {
        let angle = Rotation::from_degrees(degrees)?;
        self.rotate_to(angle);
        Ok(())
    }

    pub fn rotate_cw(&mut self) {
        self.rotate_to(self.rotation.cw());
    }

    pub fn rotate_ccw(&mut self) {
        self.rotate_to(self.rotation.ccw());
    }

    fn rotate_to(&mut self, angle: Rotation) {
        self.checkpoint(UndoAction::Rotate { angle: self.rotation });
        self.rotation = angle;
        debug!(%angle, "rotation changed");
        self.notify(SessionEvent::RotationChanged(angle));
    }

    // ── Box edits ───────────────────────────────────────────────────────────

    /// Turn a drag between two panel points into a user box on the current
    /// frame. Zero-area drags add nothing.
    pub fn draw_box(
        &mut self,
        start: (i32, i32),
        end: (i32, i32),
        geometry: &DisplayGeometry,
    ) -> Option<BoxData> {
        let coords = geometry.drag_to_image_rect(start, end);
        if coords.is_empty() {
            return None;
        }
        Some(self.add_user_box(coords))
    }

    /// Append a user box given in original image coordinates, with a
    /// placeholder tag numbered by its position in the frame.
    pub fn add_user_box(&mut self, coords: Coords) -> BoxData {
        let coords = coords.normalized();
        self.checkpoint(UndoAction::DrawBox);
        let boxes = self.store.get_boxes(self.current);
        let b = BoxData::new(coords, vec![format!("unknown-{}", boxes.len() + 1)], BoxSource::User);
        boxes.push(b.clone());
        info!(frame = self.current, %coords, "box drawn");
        self.notify(SessionEvent::BoxAdded {
            frame: self.current,
            coords,
        });
        self.persist();
        b
    }

    /// Hit-test a panel point against the current frame's boxes, first box
    /// in list order wins. A miss clears the selection.
    pub fn select_box_at(&mut self, point: (i32, i32), geometry: &DisplayGeometry) -> Option<BoxData> {
        let hit = self
            .current_boxes()
            .iter()
            .find(|b| rect_contains(geometry.rect_to_display(b.coords), point.0, point.1))
            .cloned();
        self.select(hit.as_ref().map(BoxData::key));
        hit
    }

    pub fn select(&mut self, key: Option<Coords>) {
        let key = key.filter(|k| self.store.find(self.current, *k).is_some());
        if key == self.selected {
            return;
        }
        self.selected = key;
        self.notify(SessionEvent::BoxSelected(key));
    }

    pub fn delete_box(&mut self, key: Coords) -> Result<()> {
        self.require(key)?;
        self.checkpoint(UndoAction::DeleteBox);
        let boxes = self.store.get_boxes(self.current);
        if let Some(i) = boxes.iter().position(|b| b.key() == key) {
            boxes.remove(i);
        }
        if self.selected == Some(key) {
            self.selected = None;
        }
        info!(frame = self.current, coords = %key, "box deleted");
        self.notify(SessionEvent::BoxRemoved {
            frame: self.current,
            coords: key,
        });
        self.persist();
        Ok(())
    }

    /// Returns `Ok(false)` without recording anything when the tag is
    /// already there (exact match) or blank. Blank tags are never written.
    pub fn add_tag(&mut self, key: Coords, tag: &str) -> Result<bool> {
        if self.require(key)?.has_tag(tag) || is_blank(tag) {
            return Ok(false);
        }
        self.checkpoint(UndoAction::AddTag);
        self.store.find_mut(self.current, key)?.add_tag(tag);
        self.edited(key);
        Ok(true)
    }

    /// Returns `Ok(false)` without recording anything when the tag is absent.
    pub fn remove_tag(&mut self, key: Coords, tag: &str) -> Result<bool> {
        if !self.require(key)?.has_tag(tag) {
            return Ok(false);
        }
        self.checkpoint(UndoAction::RemoveTag);
        self.store.find_mut(self.current, key)?.remove_tag(tag);
        self.edited(key);
        Ok(true)
    }

    /// Replace the tag at `index`. Unchanged text is not recorded.
    pub fn edit_tag(&mut self, key: Coords, index: usize, text: &str) -> Result<()> {
        let current = self.require(key)?;
        match current.tag(index) {
            None => {
                return Err(AnnotationError::TagIndex {
                    index,
                    len: current.tags.len(),
                })
            }
            Some(old) if old == text => return Ok(()),
            Some(_) => {}
        }
        self.checkpoint(UndoAction::EditTag);
        self.store.find_mut(self.current, key)?.set_tag(index, text)?;
        self.edited(key);
        Ok(())
    }

    fn require(&self, key: Coords) -> Result<&BoxData> {
        self.store
            .find(self.current, key)
            .ok_or(AnnotationError::BoxNotFound {
                frame: self.current,
                coords: key,
            })
    }

    fn checkpoint(&mut self, action: UndoAction) {
        self.history.record(action, self.current, self.store.boxes(self.current));
    }

    fn edited(&mut self, key: Coords) {
        self.notify(SessionEvent::BoxEdited {
            frame: self.current,
            coords: key,
        });
        self.persist();
    }

    // ── History ─────────────────────────────────────────────────────────────

    pub fn undo(&mut self) -> Option<UndoAction> {
        let applied = self.history.undo(&mut self.store, &mut self.rotation)?;
        Some(self.after_history(applied))
    }

    pub fn redo(&mut self) -> Option<UndoAction> {
        let applied = self.history.redo(&mut self.store, &mut self.rotation)?;
        Some(self.after_history(applied))
    }

    fn after_history(&mut self, (action, frame): (UndoAction, usize)) -> UndoAction {
        debug!(%action, frame, "history step");
        if let Some(key) = self.selected {
            if self.store.find(self.current, key).is_none() {
                self.selected = None;
                self.notify(SessionEvent::BoxSelected(None));
            }
        }
        self.notify(SessionEvent::BoxesUpdated { frame });
        if let UndoAction::Rotate { .. } = action {
            self.notify(SessionEvent::RotationChanged(self.rotation));
        }
        self.persist();
        action
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// Write the sidecar file. A session without one has nothing to write.
    pub fn save(&self) -> Result<()> {
        match &self.annotation_path {
            Some(path) => self.store.save(path),
            None => Ok(()),
        }
    }

    fn persist(&self) {
        if !self.auto_save {
            return;
        }
        if let Err(e) = self.save() {
            error!("auto-save failed, annotations kept in memory: {e}");
        }
    }

    fn notify(&mut self, event: SessionEvent) {
        for observer in &mut self.observers {
            observer(&event);
        }
    }
}

/// `clip.json` -> `clip.json.bak`, or `clip.json.bak.N` when earlier
/// backups already exist.
fn backup_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let first = path.with_file_name(format!("{name}.bak"));
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| path.with_file_name(format!("{name}.bak.{n}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use assert_matches::assert_matches;
    use image::{GrayImage, Luma};

    use super::*;
    use crate::frames::MemoryFrames;

    fn blank_frames(n: usize) -> MemoryFrames {
        MemoryFrames::new(
            (0..n)
                .map(|_| DynamicImage::ImageLuma8(GrayImage::from_pixel(120, 80, Luma([40]))))
                .collect(),
        )
    }

    fn session(n: usize) -> AnnotationSession<MemoryFrames> {
        AnnotationSession::new(blank_frames(n), &TrackerConfig::default())
    }

    fn geometry() -> DisplayGeometry {
        DisplayGeometry::fit(120, 80, 120, 80, Rotation::Deg0)
    }

    fn recorder(s: &mut AnnotationSession<MemoryFrames>) -> Rc<RefCell<Vec<SessionEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        s.subscribe(move |e| sink.borrow_mut().push(e.clone()));
        events
    }

    #[test]
    fn draw_box_adds_numbered_user_boxes() {
        let mut s = session(1);
        let first = s.draw_box((10, 10), (40, 30), &geometry()).unwrap();
        let second = s.draw_box((60, 50), (50, 40), &geometry()).unwrap();
        assert_eq!(first.coords, Coords::new(10, 10, 30, 20));
        assert_eq!(first.tags, vec!["unknown-1"]);
        assert_eq!(first.source, BoxSource::User);
        assert_eq!(second.coords, Coords::new(50, 40, 10, 10));
        assert_eq!(second.tags, vec!["unknown-2"]);
        assert!(s.draw_box((5, 5), (5, 30), &geometry()).is_none());
        assert_eq!(s.current_boxes().len(), 2);
    }

    #[test]
    fn selection_hits_first_box_and_misses_clear() {
        let mut s = session(1);
        s.add_user_box(Coords::new(0, 0, 50, 50));
        s.add_user_box(Coords::new(20, 20, 50, 50));
        let hit = s.select_box_at((30, 30), &geometry()).unwrap();
        assert_eq!(hit.coords, Coords::new(0, 0, 50, 50));
        assert_eq!(s.selected().map(|b| b.coords), Some(Coords::new(0, 0, 50, 50)));
        assert!(s.select_box_at((110, 5), &geometry()).is_none());
        assert!(s.selected().is_none());
    }

    #[test]
    fn tag_edits_are_undoable_and_noops_record_nothing() {
        let mut s = session(1);
        let key = s.add_user_box(Coords::new(1, 1, 10, 10)).key();
        assert!(s.add_tag(key, "x").unwrap());
        assert!(!s.add_tag(key, "x").unwrap());
        assert!(!s.remove_tag(key, "y").unwrap());
        assert_eq!(s.current_boxes()[0].tags, vec!["unknown-1", "x"]);

        s.edit_tag(key, 0, "cat").unwrap();
        assert_eq!(s.current_boxes()[0].tags, vec!["cat", "x"]);
        assert_matches!(s.edit_tag(key, 5, "dog"), Err(AnnotationError::TagIndex { index: 5, len: 2 }));

        assert_eq!(s.undo(), Some(UndoAction::EditTag));
        assert_eq!(s.undo(), Some(UndoAction::AddTag));
        assert_eq!(s.current_boxes()[0].tags, vec!["unknown-1"]);
        assert_eq!(s.undo(), Some(UndoAction::DrawBox));
        assert!(s.current_boxes().is_empty());
        assert_eq!(s.undo(), None);
    }

    #[test]
    fn missing_box_is_reported() {
        let mut s = session(1);
        let key = Coords::new(9, 9, 9, 9);
        assert_matches!(s.delete_box(key), Err(AnnotationError::BoxNotFound { frame: 0, .. }));
        assert_matches!(s.add_tag(key, "a"), Err(AnnotationError::BoxNotFound { .. }));
        assert!(!s.can_undo());
    }

    #[test]
    fn delete_clears_selection_and_undo_restores() {
        let mut s = session(1);
        let key = s.add_user_box(Coords::new(5, 5, 20, 20)).key();
        s.select(Some(key));
        s.delete_box(key).unwrap();
        assert!(s.selected().is_none());
        assert!(s.current_boxes().is_empty());
        assert_eq!(s.undo(), Some(UndoAction::DeleteBox));
        assert_eq!(s.current_boxes()[0].coords, key);
        assert_eq!(s.redo(), Some(UndoAction::DeleteBox));
        assert!(s.current_boxes().is_empty());
    }

    #[test]
    fn rotation_is_recorded_and_keeps_coordinates() {
        let mut s = session(1);
        s.add_user_box(Coords::new(10, 20, 30, 40));
        s.set_rotation(-90).unwrap();
        assert_eq!(s.rotation(), Rotation::Deg270);
        assert_eq!(s.current_boxes()[0].coords, Coords::new(10, 20, 30, 40));
        assert_matches!(s.set_rotation(45), Err(AnnotationError::InvalidRotation(45)));

        s.rotate_cw();
        assert_eq!(s.rotation(), Rotation::Deg0);
        s.undo();
        assert_eq!(s.rotation(), Rotation::Deg270);
        s.undo();
        assert_eq!(s.rotation(), Rotation::Deg0);
        s.redo();
        assert_eq!(s.rotation(), Rotation::Deg270);
    }

    #[test]
    fn navigation_clamps_and_blank_frames_track_nothing() {
        let mut s = session(3);
        s.add_user_box(Coords::new(10, 10, 40, 30));
        assert!(!s.go_to_previous_frame());
        assert!(s.advance_to_next_frame());
        assert!(s.current_boxes().is_empty());
        assert!(s.advance_to_next_frame());
        assert!(!s.advance_to_next_frame());
        assert_eq!(s.current_frame(), 2);
        assert!(!s.go_to_frame(99));
        assert_eq!(s.current_frame(), 2);
        assert!(s.go_to_frame(0));
        assert_eq!(s.current_boxes().len(), 1);
    }

    #[test]
    fn undo_after_navigation_restores_the_edited_frame() {
        let mut s = session(2);
        s.add_user_box(Coords::new(10, 10, 40, 30));
        s.go_to_frame(1);
        assert_eq!(s.undo(), Some(UndoAction::DrawBox));
        assert!(s.store().boxes(0).is_empty());
        assert_eq!(s.current_frame(), 1);
    }

    #[test]
    fn observers_see_committed_changes_in_order() {
        let mut s = session(2);
        let events = recorder(&mut s);
        let key = s.add_user_box(Coords::new(1, 2, 3, 4)).key();
        s.select(Some(key));
        s.add_tag(key, "pin").unwrap();
        s.advance_to_next_frame();
        s.undo();
        assert_eq!(
            *events.borrow(),
            vec![
                SessionEvent::BoxAdded { frame: 0, coords: key },
                SessionEvent::BoxSelected(Some(key)),
                SessionEvent::BoxEdited { frame: 0, coords: key },
                SessionEvent::FrameChanged { frame: 1 },
                SessionEvent::BoxSelected(None),
                SessionEvent::BoxesUpdated { frame: 0 },
            ]
        );
    }

    #[test]
    fn auto_save_writes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.json");
        let mut s = AnnotationSession::open(blank_frames(1), path.clone(), &AppConfig::default());
        s.add_user_box(Coords::new(3, 3, 10, 10));
        let saved = FrameAnnotationStore::load(&path).unwrap();
        assert_eq!(saved.boxes(0), s.current_boxes());
    }

    #[test]
    fn unreadable_sidecar_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.json");
        std::fs::write(&path, "{ not json").unwrap();
        let s = AnnotationSession::open(blank_frames(1), path.clone(), &AppConfig::default());
        assert!(s.store().is_empty());
        assert!(s.auto_save());
        assert_eq!(s.set_aside(), Some(dir.path().join("clip.json.bak").as_path()));
        assert!(!path.exists());
    }

    #[test]
    fn earlier_backups_are_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.json");
        std::fs::write(dir.path().join("clip.json.bak"), "older").unwrap();
        std::fs::write(&path, "{ not json").unwrap();
        let s = AnnotationSession::open(blank_frames(1), path, &AppConfig::default());
        assert_eq!(s.set_aside(), Some(dir.path().join("clip.json.bak.1").as_path()));
        assert_eq!(std::fs::read_to_string(dir.path().join("clip.json.bak")).unwrap(), "older");
    }

    #[test]
    fn tags_match_exactly_and_blanks_are_refused() {
        let mut s = AnnotationSession::new(blank_frames(1), &TrackerConfig::default());
        let key = s.add_user_box(Coords::new(1, 1, 10, 10)).key();
        assert!(s.add_tag(key, "x").unwrap());
        assert!(s.add_tag(key, " x").unwrap());
        assert!(!s.add_tag(key, "x").unwrap());
        assert!(!s.add_tag(key, "   ").unwrap());
        assert_eq!(s.current_boxes()[0].tags, vec!["unknown-1", "x", " x"]);
    }
}
