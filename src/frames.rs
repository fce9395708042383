use std::fs;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use tracing::{info, warn};

use crate::error::{AnnotationError, Result};
use crate::transform::Rotation;

/// Anything that can hand out decoded frames by index.
pub trait FrameSource {
    fn frame_count(&self) -> usize;

    /// The frame rotated clockwise by `rotation`, or `None` past the end or
    /// when the frame cannot be decoded.
    fn get_frame(&self, index: usize, rotation: Rotation) -> Option<DynamicImage>;
}

pub fn rotate_image(image: DynamicImage, rotation: Rotation) -> DynamicImage {
    match rotation {
        Rotation::Deg0 => image,
        Rotation::Deg90 => image.rotate90(),
        Rotation::Deg180 => image.rotate180(),
        Rotation::Deg270 => image.rotate270(),
    }
}

fn is_frame_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

// ── Image sequence ──────────────────────────────────────────────────────────

/// A directory of stills, one frame per file, ordered by file name.
#[derive(Debug)]
pub struct ImageSequence {
    paths: Vec<PathBuf>,
}

impl ImageSequence {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_frame_file(p))
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(AnnotationError::NoFrames(dir.to_path_buf()));
        }
        info!(dir = %dir.display(), frames = paths.len(), "opened image sequence");
        Ok(Self { paths })
    }

    pub fn path(&self, index: usize) -> Option<&Path> {
        self.paths.get(index).map(PathBuf::as_path)
    }
}

impl FrameSource for ImageSequence {
    fn frame_count(&self) -> usize {
        self.paths.len()
    }

    fn get_frame(&self, index: usize, rotation: Rotation) -> Option<DynamicImage> {
        let path = self.paths.get(index)?;
        match image::open(path) {
            Ok(img) => Some(rotate_image(img, rotation)),
            Err(e) => {
                warn!(path = %path.display(), "failed to decode frame: {e}");
                None
            }
        }
    }
}

// ── In-memory frames ────────────────────────────────────────────────────────

/// Frames already decoded by the caller.
#[derive(Clone, Debug, Default)]
pub struct MemoryFrames {
    frames: Vec<DynamicImage>,
}

impl MemoryFrames {
    pub fn new(frames: Vec<DynamicImage>) -> Self {
        Self { frames }
    }
}

impl FrameSource for MemoryFrames {
    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn get_frame(&self, index: usize, rotation: Rotation) -> Option<DynamicImage> {
        self.frames.get(index).map(|f| rotate_image(f.clone(), rotation))
    }
}
