use std::path::PathBuf;

use thiserror::Error;

use crate::boxdata::Coords;

pub type Result<T> = std::result::Result<T, AnnotationError>;

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("invalid box source: {0:?} (expected \"user\" or \"automatic\")")]
    InvalidSource(String),

    #[error("invalid rotation: {0} degrees is not a multiple of 90")]
    InvalidRotation(i32),

    #[error("failed to load annotations: {0}")]
    StoreLoad(#[source] serde_json::Error),

    #[error("failed to write annotations: {0}")]
    StoreSave(#[source] serde_json::Error),

    #[error("no box at {coords} on frame {frame}")]
    BoxNotFound { frame: usize, coords: Coords },

    #[error("tag index {index} out of range for box with {len} tags")]
    TagIndex { index: usize, len: usize },

    #[error("invalid config file: {0}")]
    Config(#[source] serde_json::Error),

    #[error("no frames found in {0}")]
    NoFrames(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}
