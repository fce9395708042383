use std::fmt;

use crate::boxdata::BoxData;
use crate::store::FrameAnnotationStore;
use crate::transform::Rotation;

/// What kind of edit an undo entry reverts. Only rotation carries extra state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UndoAction {
    DrawBox,
    /// The angle in effect before (for undo) or after (for redo) the change.
    Rotate { angle: Rotation },
    DeleteBox,
    AddTag,
    RemoveTag,
    EditTag,
}

impl fmt::Display for UndoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndoAction::DrawBox => f.write_str("draw_box"),
            UndoAction::Rotate { angle } => write!(f, "rotate({angle})"),
            UndoAction::DeleteBox => f.write_str("delete_box"),
            UndoAction::AddTag => f.write_str("add_tag"),
            UndoAction::RemoveTag => f.write_str("remove_tag"),
            UndoAction::EditTag => f.write_str("edit_tag"),
        }
    }
}

/// An owned copy of one frame's box list taken before an edit.
#[derive(Clone, Debug, PartialEq)]
pub struct UndoEntry {
    pub action: UndoAction,
    pub frame: usize,
    pub snapshot: Vec<BoxData>,
}

/// Two stacks of whole-list snapshots. Entries are owned values, so nothing
/// on either stack aliases the live store.
#[derive(Debug, Default)]
pub struct UndoRedoEngine {
    undo_stack: Vec<UndoEntry>,
    redo_stack: Vec<UndoEntry>,
}

impl UndoRedoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push the pre-edit state. A new edit invalidates the redo branch.
    pub fn record(&mut self, action: UndoAction, frame: usize, snapshot_before: &[BoxData]) {
        self.undo_stack.push(UndoEntry {
            action,
            frame,
            snapshot: snapshot_before.to_vec(),
        });
        self.redo_stack.clear();
    }

    /// Restore the most recent snapshot. Returns the reverted entry's action
    /// and frame, or `None` when there is nothing to undo.
    pub fn undo(
        &mut self,
        store: &mut FrameAnnotationStore,
        rotation: &mut Rotation,
    ) -> Option<(UndoAction, usize)> {
        let entry = self.undo_stack.pop()?;
        let inverse = Self::apply(entry, store, rotation);
        let applied = (inverse.action, inverse.frame);
        self.redo_stack.push(inverse);
        Some(applied)
    }

    pub fn redo(
        &mut self,
        store: &mut FrameAnnotationStore,
        rotation: &mut Rotation,
    ) -> Option<(UndoAction, usize)> {
        let entry = self.redo_stack.pop()?;
        let inverse = Self::apply(entry, store, rotation);
        let applied = (inverse.action, inverse.frame);
        self.undo_stack.push(inverse);
        Some(applied)
    }

    /// Swap the entry's state in and return the state it replaced, tagged
    /// with the same kind.
    fn apply(entry: UndoEntry, store: &mut FrameAnnotationStore, rotation: &mut Rotation) -> UndoEntry {
        let UndoEntry { action, frame, snapshot } = entry;
        let current = std::mem::replace(store.get_boxes(frame), snapshot);
        let action = match action {
            UndoAction::Rotate { angle } => {
                let previous = std::mem::replace(rotation, angle);
                UndoAction::Rotate { angle: previous }
            }
            other => other,
        };
        UndoEntry {
            action,
            frame,
            snapshot: current,
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}
