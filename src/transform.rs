//! Mapping between the three coordinate spaces of the scrubber:
//! original image pixels, the image rotated for display, and the scaled
//! bitmap drawn inside the panel.
//!
//! All conversions truncate towards zero, like pixel indexing does.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::boxdata::Coords;
use crate::error::{AnnotationError, Result};

// ── Rotation ────────────────────────────────────────────────────────────────

/// Clockwise display rotation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Accepts any multiple of 90, negative included, reduced mod 360.
    pub fn from_degrees(degrees: i32) -> Result<Self> {
        match degrees.rem_euclid(360) {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            _ => Err(AnnotationError::InvalidRotation(degrees)),
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    pub fn cw(self) -> Self {
        self.add(Rotation::Deg90)
    }

    pub fn ccw(self) -> Self {
        self.add(Rotation::Deg270)
    }

    pub fn add(self, other: Rotation) -> Self {
        Self::quarter_turns(self.turns() + other.turns())
    }

    /// The rotation that undoes this one.
    pub fn inverse(self) -> Self {
        Self::quarter_turns(4 - self.turns())
    }

    /// True for 90 and 270, where width and height trade places.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }

    fn turns(self) -> u8 {
        (self.degrees() / 90) as u8
    }

    fn quarter_turns(turns: u8) -> Self {
        match turns % 4 {
            0 => Rotation::Deg0,
            1 => Rotation::Deg90,
            2 => Rotation::Deg180,
            _ => Rotation::Deg270,
        }
    }
}

impl TryFrom<i32> for Rotation {
    type Error = AnnotationError;

    fn try_from(degrees: i32) -> Result<Self> {
        Self::from_degrees(degrees)
    }
}

impl From<Rotation> for i32 {
    fn from(r: Rotation) -> Self {
        r.degrees()
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

// ── Scaling and placement ──────────────────────────────────────────────────

/// Largest scale that fits the image inside the panel, never above 1.
pub fn scale_to_fit(image_w: u32, image_h: u32, panel_w: u32, panel_h: u32) -> f64 {
    if image_w == 0 || image_h == 0 {
        return 1.0;
    }
    let sx = panel_w as f64 / image_w as f64;
    let sy = panel_h as f64 / image_h as f64;
    sx.min(sy).min(1.0)
}

pub fn scaled_size(image_w: u32, image_h: u32, scale: f64) -> (u32, u32) {
    (
        (image_w as f64 * scale).round() as u32,
        (image_h as f64 * scale).round() as u32,
    )
}

/// Top-left corner of the bitmap when centred in the panel. `bitmap_w` and
/// `bitmap_h` are the un-rotated bitmap dimensions.
pub fn display_offset(
    panel_w: u32,
    panel_h: u32,
    bitmap_w: u32,
    bitmap_h: u32,
    rotation: Rotation,
) -> (i32, i32) {
    let (eff_w, eff_h) = if rotation.swaps_axes() {
        (bitmap_h, bitmap_w)
    } else {
        (bitmap_w, bitmap_h)
    };
    (
        (panel_w as i32 - eff_w as i32).div_euclid(2),
        (panel_h as i32 - eff_h as i32).div_euclid(2),
    )
}

// ── Rotation of rectangles ─────────────────────────────────────────────────

/// Where a rectangle given in original image space lands once the image is
/// rotated by `angle`. Display only: stored coordinates are untouched.
pub fn rotate_rect(rect: Coords, angle: Rotation, orig_w: i32, orig_h: i32) -> Coords {
    let Coords { x, y, w, h } = rect;
    let flip_x = || orig_w.saturating_sub(x).saturating_sub(w);
    let flip_y = || orig_h.saturating_sub(y).saturating_sub(h);
    match angle {
        Rotation::Deg0 => rect,
        Rotation::Deg90 => Coords::new(flip_y(), x, h, w),
        Rotation::Deg180 => Coords::new(flip_x(), flip_y(), w, h),
        Rotation::Deg270 => Coords::new(y, flip_x(), h, w),
    }
}

/// Inverse of [`rotate_rect`]: takes a rectangle in the rotated image back to
/// original image space. `orig_w`/`orig_h` are the un-rotated dimensions.
pub fn unrotate_rect(rect: Coords, angle: Rotation, orig_w: i32, orig_h: i32) -> Coords {
    let (rot_w, rot_h) = if angle.swaps_axes() { (orig_h, orig_w) } else { (orig_w, orig_h) };
    rotate_rect(rect, angle.inverse(), rot_w, rot_h)
}

fn rotate_point(x: i32, y: i32, angle: Rotation, orig_w: i32, orig_h: i32) -> (i32, i32) {
    match angle {
        Rotation::Deg0 => (x, y),
        Rotation::Deg90 => (orig_h.saturating_sub(y), x),
        Rotation::Deg180 => (orig_w.saturating_sub(x), orig_h.saturating_sub(y)),
        Rotation::Deg270 => (y, orig_w.saturating_sub(x)),
    }
}

/// Rewrites a rectangle given by two opposite corners into a coordinate system
/// rotated by `angle_diff`. Unlike [`rotate_rect`] this is meant for rewriting
/// stored coordinates; the session keeps rotation display-only and does not
/// call it.
pub fn remap_rect_for_rotation_change(
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
    angle_diff: Rotation,
    orig_w: i32,
    orig_h: i32,
) -> Coords {
    let (ax, ay) = rotate_point(x1, y1, angle_diff, orig_w, orig_h);
    let (bx, by) = rotate_point(x2, y2, angle_diff, orig_w, orig_h);
    let span = |a: i32, b: i32| a.abs_diff(b).min(i32::MAX as u32) as i32;
    Coords::new(ax.min(bx), ay.min(by), span(ax, bx), span(ay, by))
}

// ── Image <-> bitmap ───────────────────────────────────────────────────────

fn rescale(v: i32, from: u32, to: u32) -> i32 {
    if from == 0 {
        return 0;
    }
    (v as i64 * to as i64 / from as i64) as i32
}

pub fn image_to_bitmap(
    ix: i32,
    iy: i32,
    image_w: u32,
    image_h: u32,
    bitmap_w: u32,
    bitmap_h: u32,
) -> (i32, i32) {
    (rescale(ix, image_w, bitmap_w), rescale(iy, image_h, bitmap_h))
}

pub fn bitmap_to_image(
    bx: i32,
    by: i32,
    bitmap_w: u32,
    bitmap_h: u32,
    image_w: u32,
    image_h: u32,
) -> (i32, i32) {
    (rescale(bx, bitmap_w, image_w), rescale(by, bitmap_h, image_h))
}

pub fn clamp_to_bitmap(x: i32, y: i32, bitmap_w: u32, bitmap_h: u32) -> (i32, i32) {
    let max_x = (bitmap_w as i32 - 1).max(0);
    let max_y = (bitmap_h as i32 - 1).max(0);
    (x.clamp(0, max_x), y.clamp(0, max_y))
}

// ── Display geometry ───────────────────────────────────────────────────────

/// Everything needed to go between panel pixels and original image pixels
/// for one displayed frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisplayGeometry {
    /// Un-rotated source image size.
    pub image_w: u32,
    pub image_h: u32,
    /// Un-rotated size of the scaled bitmap.
    pub bitmap_w: u32,
    pub bitmap_h: u32,
    pub panel_w: u32,
    pub panel_h: u32,
    pub rotation: Rotation,
    pub scale: f64,
}

impl DisplayGeometry {
    pub fn fit(image_w: u32, image_h: u32, panel_w: u32, panel_h: u32, rotation: Rotation) -> Self {
        let (rot_w, rot_h) = if rotation.swaps_axes() { (image_h, image_w) } else { (image_w, image_h) };
        let scale = scale_to_fit(rot_w, rot_h, panel_w, panel_h);
        let (bitmap_w, bitmap_h) = scaled_size(image_w, image_h, scale);
        Self {
            image_w,
            image_h,
            bitmap_w,
            bitmap_h,
            panel_w,
            panel_h,
            rotation,
            scale,
        }
    }

    pub fn rotated_image_size(&self) -> (u32, u32) {
        if self.rotation.swaps_axes() {
            (self.image_h, self.image_w)
        } else {
            (self.image_w, self.image_h)
        }
    }

    pub fn rotated_bitmap_size(&self) -> (u32, u32) {
        if self.rotation.swaps_axes() {
            (self.bitmap_h, self.bitmap_w)
        } else {
            (self.bitmap_w, self.bitmap_h)
        }
    }

    pub fn offset(&self) -> (i32, i32) {
        display_offset(self.panel_w, self.panel_h, self.bitmap_w, self.bitmap_h, self.rotation)
    }

    /// Panel-space rectangle where a stored box is drawn.
    pub fn rect_to_display(&self, rect: Coords) -> Coords {
        let rect = rect.normalized();
        let (iw, ih) = self.rotated_image_size();
        let (bw, bh) = self.rotated_bitmap_size();
        let (ox, oy) = self.offset();
        let r = rotate_rect(rect, self.rotation, self.image_w as i32, self.image_h as i32);
        let (x1, y1) = image_to_bitmap(r.x, r.y, iw, ih, bw, bh);
        let (x2, y2) = image_to_bitmap(r.right(), r.bottom(), iw, ih, bw, bh);
        Coords::new(
            x1.saturating_add(ox),
            y1.saturating_add(oy),
            x2.saturating_sub(x1),
            y2.saturating_sub(y1),
        )
    }

    /// Panel point to rotated-image pixels, clamped to the bitmap.
    pub fn display_to_rotated_image(&self, px: i32, py: i32) -> (i32, i32) {
        let (ox, oy) = self.offset();
        let (iw, ih) = self.rotated_image_size();
        let (bw, bh) = self.rotated_bitmap_size();
        let (bx, by) = clamp_to_bitmap(px - ox, py - oy, bw, bh);
        bitmap_to_image(bx, by, bw, bh, iw, ih)
    }

    /// A drag gesture between two panel points, as a normalized rectangle in
    /// original image space.
    pub fn drag_to_image_rect(&self, start: (i32, i32), end: (i32, i32)) -> Coords {
        let (x1, y1) = self.display_to_rotated_image(start.0, start.1);
        let (x2, y2) = self.display_to_rotated_image(end.0, end.1);
        let rotated = Coords::new(x1, y1, x2 - x1, y2 - y1).normalized();
        unrotate_rect(rotated, self.rotation, self.image_w as i32, self.image_h as i32)
    }
}

/// Half-open containment test on a panel-space rectangle.
pub fn rect_contains(rect: Coords, px: i32, py: i32) -> bool {
    let r = rect.normalized();
    px >= r.x && px < r.right() && py >= r.y && py < r.bottom()
}
