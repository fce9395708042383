//! Oriented FAST keypoints with rotated binary descriptors.
//!
//! Detection runs on a small image pyramid (`pyramid_levels` layers, each
//! `scale_factor` smaller than the last) so an object that grows or shrinks
//! between frames still produces comparable descriptors. On each layer,
//! corners come from a FAST-9 segment test, thinned by a 3x3 non-maximum
//! suppression and capped to the strongest `max_features`; the union is
//! capped again after mapping back to full-resolution coordinates.
//! Each keypoint gets an orientation from the intensity centroid of a
//! radius-15 disc, and a 256-bit descriptor built from pixel comparisons on a
//! Gaussian-blurred copy, with the sampling pattern rotated to that
//! orientation.

use image::imageops::{self, FilterType};
use image::GrayImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TrackerConfig;

/// Bresenham circle of radius 3, clockwise from 12 o'clock.
const CIRCLE_OFFSETS: [(i32, i32); 16] = [
    (0, -3), (1, -3), (2, -2), (3, -1),
    (3, 0), (3, 1), (2, 2), (1, 3),
    (0, 3), (-1, 3), (-2, 2), (-3, 1),
    (-3, 0), (-3, -1), (-2, -2), (-1, -3),
];

const ARC_LENGTH: u32 = 9;
const CENTROID_RADIUS: i32 = 15;
const PATTERN_RADIUS: i32 = 13;
const PATTERN_PAIRS: usize = 256;
const PATTERN_SEED: u64 = 0x0b5e_55ed;

/// Keypoints closer than this to the image edge have no room for the
/// orientation disc, so they are never reported.
pub const EDGE_BORDER: u32 = CENTROID_RADIUS as u32 + 1;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub score: f32,
    /// Radians, from the intensity centroid.
    pub angle: f32,
    /// Pyramid layer the point was found on; `x`/`y` are always in
    /// full-resolution pixels.
    pub level: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Descriptor(pub [u64; 4]);

impl Descriptor {
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

type PointPair = [(i32, i32); 2];

pub struct OrbExtractor {
    threshold: i16,
    max_features: usize,
    blur_sigma: f32,
    levels: usize,
    scale_factor: f32,
    pattern: Vec<PointPair>,
}

impl OrbExtractor {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            threshold: config.fast_threshold as i16,
            max_features: config.max_features,
            blur_sigma: config.blur_sigma,
            levels: config.pyramid_levels.max(1),
            scale_factor: if config.scale_factor > 1.0 { config.scale_factor } else { 1.2 },
            pattern: sampling_pattern(),
        }
    }

    /// Keypoints from every pyramid layer, strongest first, with their
    /// descriptors in the same order.
    pub fn detect_and_compute(&self, image: &GrayImage) -> (Vec<Keypoint>, Vec<Descriptor>) {
        let mut found: Vec<(Keypoint, Descriptor)> = Vec::new();
        for (level, layer) in self.pyramid(image).iter().enumerate() {
            let keypoints = self.detect(layer);
            if keypoints.is_empty() {
                continue;
            }
            let smoothed = if self.blur_sigma > 0.0 {
                imageops::blur(layer, self.blur_sigma)
            } else {
                layer.clone()
            };
            // Pixel centres line up between layers.
            let rx = image.width() as f32 / layer.width() as f32;
            let ry = image.height() as f32 / layer.height() as f32;
            for kp in keypoints {
                let descriptor = self.describe(&smoothed, &kp);
                let full = Keypoint {
                    x: (kp.x + 0.5) * rx - 0.5,
                    y: (kp.y + 0.5) * ry - 0.5,
                    level,
                    ..kp
                };
                found.push((full, descriptor));
            }
        }
        found.sort_by(|a, b| b.0.score.total_cmp(&a.0.score));
        found.truncate(self.max_features);
        found.into_iter().unzip()
    }

    /// The image itself, then successively smaller copies until one is too
    /// small to hold a keypoint.
    fn pyramid(&self, image: &GrayImage) -> Vec<GrayImage> {
        let mut layers = vec![image.clone()];
        let mut scale = 1.0f32;
        for _ in 1..self.levels {
            scale *= self.scale_factor;
            let w = (image.width() as f32 / scale).round() as u32;
            let h = (image.height() as f32 / scale).round() as u32;
            if w <= 2 * EDGE_BORDER || h <= 2 * EDGE_BORDER {
                break;
            }
            layers.push(imageops::resize(image, w, h, FilterType::Triangle));
        }
        layers
    }

    pub fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        let (w, h) = image.dimensions();
        if w <= 2 * EDGE_BORDER || h <= 2 * EDGE_BORDER {
            return Vec::new();
        }
        let (w, h) = (w as usize, h as usize);
        let data = image.as_raw();
        let border = EDGE_BORDER as usize;

        let mut scores = vec![0.0f32; w * h];
        for y in border..h - border {
            for x in border..w - border {
                if let Some(score) = self.segment_test(data, w, x, y) {
                    scores[y * w + x] = score;
                }
            }
        }

        let mut keypoints = Vec::new();
        for y in border..h - border {
            for x in border..w - border {
                let score = scores[y * w + x];
                if score > 0.0 && is_local_max(&scores, w, x, y) {
                    keypoints.push(Keypoint {
                        x: x as f32,
                        y: y as f32,
                        score,
                        angle: 0.0,
                        level: 0,
                    });
                }
            }
        }

        keypoints.sort_by(|a, b| b.score.total_cmp(&a.score));
        keypoints.truncate(self.max_features);
        for kp in &mut keypoints {
            kp.angle = intensity_centroid_angle(data, w, kp.x as usize, kp.y as usize);
        }
        keypoints
    }

    /// FAST-9: at least nine contiguous circle pixels all brighter or all
    /// darker than the centre by more than the threshold. Returns the score
    /// of the longest qualifying arc.
    fn segment_test(&self, data: &[u8], w: usize, x: usize, y: usize) -> Option<f32> {
        let center = data[y * w + x] as i16;
        let t = self.threshold;

        let mut circle = [0i16; 16];
        let mut bright: u16 = 0;
        let mut dark: u16 = 0;
        for (i, &(dx, dy)) in CIRCLE_OFFSETS.iter().enumerate() {
            let px = (x as i32 + dx) as usize;
            let py = (y as i32 + dy) as usize;
            let v = data[py * w + px] as i16;
            circle[i] = v;
            if v > center + t {
                bright |= 1 << i;
            } else if v < center - t {
                dark |= 1 << i;
            }
        }

        let mut best: Option<f32> = None;
        for mask in [bright, dark] {
            if mask.count_ones() < ARC_LENGTH || !has_contiguous_run(mask, ARC_LENGTH) {
                continue;
            }
            let score = arc_score(center, &circle, t, mask);
            best = Some(best.map_or(score, |b| b.max(score)));
        }
        best
    }

    fn describe(&self, smoothed: &GrayImage, kp: &Keypoint) -> Descriptor {
        let w = smoothed.width() as usize;
        let data = smoothed.as_raw();
        let (sin, cos) = kp.angle.sin_cos();
        let cx = kp.x as i32;
        let cy = kp.y as i32;

        let sample = |(px, py): (i32, i32)| -> u8 {
            let rx = (cos * px as f32 - sin * py as f32).round() as i32;
            let ry = (sin * px as f32 + cos * py as f32).round() as i32;
            data[(cy + ry) as usize * w + (cx + rx) as usize]
        };

        let mut bits = [0u64; 4];
        for (i, [p, q]) in self.pattern.iter().enumerate() {
            if sample(*p) < sample(*q) {
                bits[i / 64] |= 1 << (i % 64);
            }
        }
        Descriptor(bits)
    }
}

/// Wrap-around run check: double the mask and AND-shift `n - 1` times.
fn has_contiguous_run(mask: u16, n: u32) -> bool {
    let mut acc = (mask as u32) | ((mask as u32) << 16);
    for _ in 1..n {
        acc &= acc >> 1;
    }
    acc != 0
}

fn arc_score(center: i16, circle: &[i16; 16], t: i16, mask: u16) -> f32 {
    let doubled = (mask as u32) | ((mask as u32) << 16);
    let (mut best_start, mut best_len) = (0usize, 0usize);
    let mut i = 0usize;
    while i < 16 {
        if doubled & (1 << i) == 0 {
            i += 1;
            continue;
        }
        let start = i;
        while i < 32 && doubled & (1 << i) != 0 {
            i += 1;
        }
        if i - start > best_len {
            best_len = i - start;
            best_start = start;
        }
    }
    (best_start..best_start + best_len.min(16))
        .map(|j| ((circle[j % 16] - center).abs() - t).max(0) as f32)
        .sum()
}

/// Ties go to the earlier pixel in raster order.
fn is_local_max(scores: &[f32], w: usize, x: usize, y: usize) -> bool {
    let s = scores[y * w + x];
    for dy in -1i32..=1 {
        for dx in -1i32..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let n = scores[(y as i32 + dy) as usize * w + (x as i32 + dx) as usize];
            let earlier = dy < 0 || (dy == 0 && dx < 0);
            if n > s || (earlier && n == s) {
                return false;
            }
        }
    }
    true
}

fn intensity_centroid_angle(data: &[u8], w: usize, x: usize, y: usize) -> f32 {
    let (mut m10, mut m01) = (0i64, 0i64);
    let r2 = CENTROID_RADIUS * CENTROID_RADIUS;
    for dy in -CENTROID_RADIUS..=CENTROID_RADIUS {
        for dx in -CENTROID_RADIUS..=CENTROID_RADIUS {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let v = data[(y as i32 + dy) as usize * w + (x as i32 + dx) as usize] as i64;
            m10 += dx as i64 * v;
            m01 += dy as i64 * v;
        }
    }
    (m01 as f32).atan2(m10 as f32)
}

/// Fixed comparison pairs inside a radius-13 disc, so any rotation of the
/// pattern stays within the keypoint border.
fn sampling_pattern() -> Vec<PointPair> {
    let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
    let r2 = PATTERN_RADIUS * PATTERN_RADIUS;
    let point = |rng: &mut StdRng| loop {
        let px = rng.random_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
        let py = rng.random_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
        if px * px + py * py <= r2 {
            return (px, py);
        }
    };

    let mut pattern = Vec::with_capacity(PATTERN_PAIRS);
    while pattern.len() < PATTERN_PAIRS {
        let p = point(&mut rng);
        let q = point(&mut rng);
        if p != q {
            pattern.push([p, q]);
        }
    }
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn extractor() -> OrbExtractor {
        OrbExtractor::new(&TrackerConfig::default())
    }

    fn square_image(size: u32, sq: (u32, u32, u32), bg: u8, fg: u8) -> GrayImage {
        let (sx, sy, side) = sq;
        GrayImage::from_fn(size, size, |x, y| {
            if x >= sx && x < sx + side && y >= sy && y < sy + side {
                Luma([fg])
            } else {
                Luma([bg])
            }
        })
    }

    #[test]
    fn flat_image_has_no_keypoints() {
        let img = GrayImage::from_pixel(80, 80, Luma([128]));
        let (kps, descs) = extractor().detect_and_compute(&img);
        assert!(kps.is_empty());
        assert!(descs.is_empty());
    }

    #[test]
    fn square_corners_are_detected() {
        let img = square_image(100, (30, 30, 40), 20, 220);
        let kps = extractor().detect(&img);
        assert!(kps.len() >= 4, "expected square corners, got {}", kps.len());
        for kp in &kps {
            assert!(kp.x >= EDGE_BORDER as f32 && kp.y >= EDGE_BORDER as f32);
        }
        let near = |cx: f32, cy: f32| kps.iter().any(|k| (k.x - cx).abs() <= 3.0 && (k.y - cy).abs() <= 3.0);
        assert!(near(30.0, 30.0) && near(69.0, 69.0));
    }

    #[test]
    fn too_small_for_border() {
        let img = square_image(32, (8, 8, 16), 20, 220);
        assert!(extractor().detect(&img).is_empty());
    }

    #[test]
    fn feature_cap_is_respected() {
        let config = TrackerConfig {
            max_features: 2,
            ..TrackerConfig::default()
        };
        let img = square_image(100, (30, 30, 40), 20, 220);
        let kps = OrbExtractor::new(&config).detect(&img);
        assert_eq!(kps.len(), 2);
        assert!(kps[0].score >= kps[1].score);
    }

    #[test]
    fn descriptors_survive_translation() {
        let a = square_image(100, (30, 30, 40), 20, 220);
        let b = square_image(100, (35, 28, 40), 20, 220);
        let ex = extractor();
        let (ka, da) = ex.detect_and_compute(&a);
        let (kb, db) = ex.detect_and_compute(&b);
        let i = ka.iter().position(|k| k.level == 0 && k.x == 30.0 && k.y == 30.0);
        let j = kb.iter().position(|k| k.level == 0 && k.x == 35.0 && k.y == 28.0);
        if let (Some(i), Some(j)) = (i, j) {
            assert_eq!(da[i].distance(&db[j]), 0);
        }
        assert_eq!(da.len(), ka.len());
        assert_eq!(db.len(), kb.len());
    }

    #[test]
    fn smaller_layers_contribute_keypoints() {
        let img = square_image(160, (40, 40, 80), 20, 220);
        let (kps, descs) = extractor().detect_and_compute(&img);
        assert_eq!(kps.len(), descs.len());
        assert!(kps.iter().any(|k| k.level == 0));
        assert!(kps.iter().any(|k| k.level > 0));
        for kp in &kps {
            assert!(kp.x >= 0.0 && kp.y >= 0.0 && kp.x < 160.0 && kp.y < 160.0);
        }
        // A layer-1 corner maps back near the full-resolution corner.
        let near = |cx: f32, cy: f32| {
            kps.iter().any(|k| k.level == 1 && (k.x - cx).abs() <= 3.0 && (k.y - cy).abs() <= 3.0)
        };
        assert!(near(40.0, 40.0) || near(119.0, 119.0));
    }

    #[test]
    fn single_level_pyramid_stays_at_full_resolution() {
        let config = TrackerConfig {
            pyramid_levels: 1,
            ..TrackerConfig::default()
        };
        let img = square_image(160, (40, 40, 80), 20, 220);
        let (kps, _) = OrbExtractor::new(&config).detect_and_compute(&img);
        assert!(!kps.is_empty());
        assert!(kps.iter().all(|k| k.level == 0));
        assert_eq!(extractor().pyramid(&img).len(), 3);
        assert_eq!(extractor().pyramid(&GrayImage::new(36, 36)).len(), 1);
    }

    #[test]
    fn run_detection_wraps_around() {
        assert!(has_contiguous_run(0b1111_0000_0001_1111, 9));
        assert!(!has_contiguous_run(0b0101_0101_0101_0101, 9));
        assert!(has_contiguous_run(0b0000_0001_1111_1111, 9));
    }

    #[test]
    fn pattern_is_deterministic() {
        assert_eq!(sampling_pattern(), sampling_pattern());
        assert_eq!(sampling_pattern().len(), PATTERN_PAIRS);
    }
}
