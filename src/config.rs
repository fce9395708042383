use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AnnotationError, Result};

/// Application settings. Every field has a default, so a config file only
/// needs the values it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogConfig,
    pub tracker: TrackerConfig,
    /// Write the sidecar file after every committed edit.
    pub auto_save: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            tracker: TrackerConfig::default(),
            auto_save: true,
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(AnnotationError::Config)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    pub filter: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "box_scrubber=info".to_string(),
            json: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Keypoints kept per image, strongest first.
    pub max_features: usize,
    pub fast_threshold: u8,
    /// Smoothing applied before descriptor sampling.
    pub blur_sigma: f32,
    /// Detection layers, full resolution included.
    pub pyramid_levels: usize,
    /// Size ratio between consecutive layers.
    pub scale_factor: f32,
    pub ransac_threshold: f64,
    pub ransac_max_iters: usize,
    pub ransac_confidence: f64,
    pub refine_iters: usize,
    pub seed: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_features: 500,
            fast_threshold: 20,
            blur_sigma: 2.0,
            pyramid_levels: 3,
            scale_factor: 1.2,
            ransac_threshold: 3.0,
            ransac_max_iters: 2000,
            ransac_confidence: 0.99,
            refine_iters: 10,
            seed: 0x5eed,
        }
    }
}
