//! Carries a box from one frame to the next by matching keypoints inside the
//! box against the whole next frame.

pub mod affine;
pub mod matcher;
pub mod orb;

use image::{imageops, DynamicImage, GrayImage};
use tracing::debug;

use crate::boxdata::{BoxData, BoxSource, Coords};
use crate::config::TrackerConfig;

use self::affine::{estimate_partial_affine, PartialAffine, Point, RansacParams};
use self::matcher::cross_check_match;
use self::orb::OrbExtractor;

const MIN_MATCHES: usize = 3;

pub struct ObjectTracker {
    extractor: OrbExtractor,
    ransac: RansacParams,
}

impl Default for ObjectTracker {
    fn default() -> Self {
        Self::new(&TrackerConfig::default())
    }
}

impl ObjectTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            extractor: OrbExtractor::new(config),
            ransac: RansacParams::from(config),
        }
    }

    pub fn to_gray(frame: &DynamicImage) -> GrayImage {
        frame.to_luma8()
    }

    /// Where `prior` (a box on `prev`) sits in `next`. `None` means the
    /// object could not be followed: no texture, too few matches or no
    /// consistent motion.
    pub fn locate(&self, prev: &GrayImage, next: &GrayImage, prior: &BoxData) -> Option<BoxData> {
        let region = clip_to_image(prior.coords.normalized(), prev)?;
        let Coords { x, y, w, h } = region;
        let template = imageops::crop_imm(prev, x as u32, y as u32, w as u32, h as u32).to_image();

        let (template_kps, template_desc) = self.extractor.detect_and_compute(&template);
        let (next_kps, next_desc) = self.extractor.detect_and_compute(next);
        if template_desc.is_empty() || next_desc.is_empty() {
            debug!(coords = %prior.coords, "no features to track");
            return None;
        }

        let matches = cross_check_match(&template_desc, &next_desc);
        if matches.len() < MIN_MATCHES {
            debug!(coords = %prior.coords, matches = matches.len(), "too few matches");
            return None;
        }

        let (ox, oy) = (x as f64, y as f64);
        let (src, dst): (Vec<Point>, Vec<Point>) = matches
            .iter()
            .map(|m| {
                let t = &template_kps[m.query];
                let n = &next_kps[m.train];
                ((t.x as f64, t.y as f64), (n.x as f64 - ox, n.y as f64 - oy))
            })
            .unzip();

        let Some((model, inliers)) = estimate_partial_affine(&src, &dst, &self.ransac) else {
            debug!(coords = %prior.coords, "no motion model");
            return None;
        };
        let coords = project_box(&model, region)?;
        debug!(
            from = %prior.coords,
            to = %coords,
            matches = matches.len(),
            inliers = inliers.iter().filter(|&&i| i).count(),
            scale = model.scale(),
            "tracked box"
        );
        Some(BoxData::new(coords, prior.tags.clone(), BoxSource::Automatic))
    }
}

fn clip_to_image(rect: Coords, image: &GrayImage) -> Option<Coords> {
    let (iw, ih) = (image.width() as i32, image.height() as i32);
    let x0 = rect.x.clamp(0, iw);
    let y0 = rect.y.clamp(0, ih);
    let x1 = rect.right().clamp(0, iw);
    let y1 = rect.bottom().clamp(0, ih);
    (x1 > x0 && y1 > y0).then(|| Coords::new(x0, y0, x1 - x0, y1 - y0))
}

/// Axis-aligned bounds of the transformed box corners.
fn project_box(model: &PartialAffine, rect: Coords) -> Option<Coords> {
    let (x, y) = (rect.x as f64, rect.y as f64);
    let (r, b) = (rect.right() as f64, rect.bottom() as f64);
    let corners = [(x, y), (r, y), (r, b), (x, b)].map(|p| model.apply(p));

    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for (cx, cy) in corners {
        min_x = min_x.min(cx);
        min_y = min_y.min(cy);
        max_x = max_x.max(cx);
        max_y = max_y.max(cy);
    }
    if ![min_x, min_y, max_x, max_y].iter().all(|v| v.is_finite()) {
        return None;
    }
    // Snap to the nearest pixel first so float noise does not grow the box.
    let snap = |v: f64| (v * 1e6).round() / 1e6;
    let (x0, y0) = (snap(min_x).floor(), snap(min_y).floor());
    let (x1, y1) = (snap(max_x).ceil(), snap(max_y).ceil());
    if x0 < i32::MIN as f64 || y0 < i32::MIN as f64 || x1 > i32::MAX as f64 || y1 > i32::MAX as f64 {
        return None;
    }
    Some(Coords::new(x0 as i32, y0 as i32, (x1 - x0) as i32, (y1 - y0) as i32))
}
