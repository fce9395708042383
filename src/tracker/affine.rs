//! Robust fit of a 4-DOF similarity (rotation, uniform scale, translation).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TrackerConfig;

pub type Point = (f64, f64);

const DEGENERATE_EPS: f64 = 1e-9;

/// `x' = a*x - b*y + tx`, `y' = b*x + a*y + ty`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PartialAffine {
    pub a: f64,
    pub b: f64,
    pub tx: f64,
    pub ty: f64,
}

impl PartialAffine {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    pub fn apply(&self, (x, y): Point) -> Point {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    pub fn scale(&self) -> f64 {
        self.a.hypot(self.b)
    }

    pub fn angle(&self) -> f64 {
        self.b.atan2(self.a)
    }

    fn is_finite(&self) -> bool {
        self.a.is_finite() && self.b.is_finite() && self.tx.is_finite() && self.ty.is_finite()
    }

    /// Exact model through two correspondences, treating points as complex
    /// numbers: `q = s*p + t`.
    fn from_two_pairs(p1: Point, p2: Point, q1: Point, q2: Point) -> Option<Self> {
        let (dpx, dpy) = (p2.0 - p1.0, p2.1 - p1.1);
        let (dqx, dqy) = (q2.0 - q1.0, q2.1 - q1.1);
        let norm = dpx * dpx + dpy * dpy;
        if norm < DEGENERATE_EPS {
            return None;
        }
        let a = (dqx * dpx + dqy * dpy) / norm;
        let b = (dqy * dpx - dqx * dpy) / norm;
        let model = Self {
            a,
            b,
            tx: q1.0 - (a * p1.0 - b * p1.1),
            ty: q1.1 - (b * p1.0 + a * p1.1),
        };
        model.is_finite().then_some(model)
    }

    /// Closed-form least squares over the selected correspondences.
    fn least_squares(src: &[Point], dst: &[Point], mask: &[bool]) -> Option<Self> {
        let pairs: Vec<(Point, Point)> = src
            .iter()
            .zip(dst)
            .zip(mask)
            .filter(|(_, keep)| **keep)
            .map(|((&p, &q), _)| (p, q))
            .collect();
        if pairs.len() < 2 {
            return None;
        }
        let n = pairs.len() as f64;
        let (mut spx, mut spy, mut sqx, mut sqy) = (0.0, 0.0, 0.0, 0.0);
        for &((px, py), (qx, qy)) in &pairs {
            spx += px;
            spy += py;
            sqx += qx;
            sqy += qy;
        }
        let (mpx, mpy, mqx, mqy) = (spx / n, spy / n, sqx / n, sqy / n);

        let (mut num_a, mut num_b, mut den) = (0.0, 0.0, 0.0);
        for &((px, py), (qx, qy)) in &pairs {
            let (px, py, qx, qy) = (px - mpx, py - mpy, qx - mqx, qy - mqy);
            num_a += px * qx + py * qy;
            num_b += px * qy - py * qx;
            den += px * px + py * py;
        }
        if den < DEGENERATE_EPS {
            return None;
        }
        let (a, b) = (num_a / den, num_b / den);
        let model = Self {
            a,
            b,
            tx: mqx - (a * mpx - b * mpy),
            ty: mqy - (b * mpx + a * mpy),
        };
        model.is_finite().then_some(model)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RansacParams {
    /// Maximum reprojection error, in pixels, for an inlier.
    pub threshold: f64,
    pub max_iters: usize,
    pub confidence: f64,
    pub refine_iters: usize,
    pub seed: u64,
}

impl From<&TrackerConfig> for RansacParams {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            threshold: config.ransac_threshold,
            max_iters: config.ransac_max_iters,
            confidence: config.ransac_confidence,
            refine_iters: config.refine_iters,
            seed: config.seed,
        }
    }
}

/// Iterations needed to draw one all-inlier sample of size `sample` with the
/// given confidence, capped at `max_iters`.
fn update_num_iters(confidence: f64, inlier_ratio: f64, sample: i32, max_iters: usize) -> usize {
    let confidence = confidence.clamp(0.0, 1.0);
    let num = (1.0 - confidence).max(f64::MIN_POSITIVE).ln();
    let denom = 1.0 - inlier_ratio.powi(sample);
    if denom < f64::MIN_POSITIVE {
        return 0;
    }
    let denom = denom.ln();
    if denom >= 0.0 || -num >= max_iters as f64 * -denom {
        return max_iters;
    }
    (num / denom).round() as usize
}

fn inlier_mask(model: &PartialAffine, src: &[Point], dst: &[Point], threshold: f64) -> Vec<bool> {
    let t2 = threshold * threshold;
    src.iter()
        .zip(dst)
        .map(|(&p, &(qx, qy))| {
            let (x, y) = model.apply(p);
            (x - qx).powi(2) + (y - qy).powi(2) <= t2
        })
        .collect()
}

fn count(mask: &[bool]) -> usize {
    mask.iter().filter(|&&m| m).count()
}

/// RANSAC over two-point samples followed by least-squares refinement on the
/// inliers. Returns the model and its inlier mask, or `None` when no
/// non-degenerate model exists.
pub fn estimate_partial_affine(
    src: &[Point],
    dst: &[Point],
    params: &RansacParams,
) -> Option<(PartialAffine, Vec<bool>)> {
    let n = src.len();
    if n < 2 || n != dst.len() {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best: Option<(PartialAffine, Vec<bool>, usize)> = None;
    let mut max_iters = params.max_iters;
    let mut iter = 0;

    while iter < max_iters {
        iter += 1;
        let i = rng.random_range(0..n);
        let mut j = rng.random_range(0..n - 1);
        if j >= i {
            j += 1;
        }
        let Some(model) = PartialAffine::from_two_pairs(src[i], src[j], dst[i], dst[j]) else {
            continue;
        };
        let mask = inlier_mask(&model, src, dst, params.threshold);
        let inliers = count(&mask);
        if best.as_ref().map_or(true, |(_, _, c)| inliers > *c) {
            max_iters = max_iters.min(update_num_iters(
                params.confidence,
                inliers as f64 / n as f64,
                2,
                params.max_iters,
            ));
            best = Some((model, mask, inliers));
        }
    }

    let (mut model, mut mask, mut inliers) = best?;
    for _ in 0..params.refine_iters {
        let Some(refined) = PartialAffine::least_squares(src, dst, &mask) else {
            break;
        };
        let refined_mask = inlier_mask(&refined, src, dst, params.threshold);
        let refined_inliers = count(&refined_mask);
        if refined_inliers < inliers {
            break;
        }
        let converged = refined_mask == mask;
        model = refined;
        mask = refined_mask;
        inliers = refined_inliers;
        if converged {
            break;
        }
    }
    Some((model, mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RansacParams {
        RansacParams::from(&TrackerConfig::default())
    }

    fn close(a: Point, b: Point) -> bool {
        (a.0 - b.0).abs() < 1e-6 && (a.1 - b.1).abs() < 1e-6
    }

    #[test]
    fn recovers_similarity_with_outliers() {
        let truth = PartialAffine {
            a: 0.9 * 0.3f64.cos(),
            b: 0.9 * 0.3f64.sin(),
            tx: 12.0,
            ty: -4.0,
        };
        let mut src: Vec<Point> = (0..20)
            .map(|i| ((i * 7 % 50) as f64, (i * 13 % 40) as f64))
            .collect();
        let mut dst: Vec<Point> = src.iter().map(|&p| truth.apply(p)).collect();
        src.push((5.0, 5.0));
        dst.push((400.0, -300.0));
        src.push((30.0, 2.0));
        dst.push((-90.0, 80.0));

        let (model, mask) = estimate_partial_affine(&src, &dst, &params()).unwrap();
        assert!((model.scale() - 0.9).abs() < 1e-6);
        assert!((model.angle() - 0.3).abs() < 1e-6);
        assert!(close(model.apply((0.0, 0.0)), (12.0, -4.0)));
        assert_eq!(count(&mask), 20);
        assert!(!mask[20] && !mask[21]);
    }

    #[test]
    fn pure_translation() {
        let src: Vec<Point> = vec![(0.0, 0.0), (10.0, 0.0), (0.0, 10.0), (7.0, 3.0)];
        let dst: Vec<Point> = src.iter().map(|&(x, y)| (x + 5.0, y - 2.0)).collect();
        let (model, _) = estimate_partial_affine(&src, &dst, &params()).unwrap();
        assert!(close(model.apply((100.0, 100.0)), (105.0, 98.0)));
    }

    #[test]
    fn coincident_points_have_no_model() {
        let src = vec![(3.0, 3.0); 5];
        let dst = vec![(8.0, 1.0); 5];
        assert!(estimate_partial_affine(&src, &dst, &params()).is_none());
    }

    #[test]
    fn too_few_points() {
        assert!(estimate_partial_affine(&[(0.0, 0.0)], &[(1.0, 1.0)], &params()).is_none());
    }

    #[test]
    fn identity_applies_unchanged() {
        assert_eq!(PartialAffine::IDENTITY.apply((3.5, -2.0)), (3.5, -2.0));
    }

    #[test]
    fn iteration_bound_shrinks_with_inliers() {
        assert_eq!(update_num_iters(0.99, 1.0, 2, 2000), 0);
        assert!(update_num_iters(0.99, 0.5, 2, 2000) < 20);
        assert_eq!(update_num_iters(0.99, 0.01, 2, 2000), 2000);
    }
}
