//! Frame-by-frame bounding-box annotation: a per-frame box store with a JSON
//! sidecar, snapshot undo, display rotation and keypoint tracking that
//! carries boxes forward to the next frame.

pub mod boxdata;
pub mod config;
pub mod error;
pub mod frames;
pub mod logging;
pub mod session;
pub mod store;
pub mod tracker;
pub mod transform;
pub mod undo;

pub use boxdata::{BoxData, BoxSource, Coords};
pub use config::{AppConfig, LogConfig, TrackerConfig};
pub use error::{AnnotationError, Result};
pub use frames::{FrameSource, ImageSequence, MemoryFrames};
pub use session::{AnnotationSession, SessionEvent};
pub use store::{annotation_path, merge_duplicate_boxes, FrameAnnotationStore};
pub use tracker::ObjectTracker;
pub use transform::{DisplayGeometry, Rotation};
pub use undo::{UndoAction, UndoRedoEngine};
