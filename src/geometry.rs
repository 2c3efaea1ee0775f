//! Mapping detector boxes from model input space to image pixel space.
//!
//! The detector consumes a fixed square input regardless of the image's aspect
//! ratio, so x and y are scaled independently back to the image.

use crate::tensor::BoundingBox;

/// Integer pixel rectangle inside an image.
///
/// Regions produced by [`to_image_region`] and [`ImageRegion::clamp_to`]
/// always lie within the image they were clamped against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageRegion {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl ImageRegion {
    /// Whether the region covers no pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels covered.
    #[must_use]
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Clamp to an image of `img_w` x `img_h`.
    ///
    /// The origin is clipped first, then width and height shrink so the far
    /// edges stay inside the image. The origin is never moved to keep size.
    #[must_use]
    pub fn clamp_to(self, img_w: u32, img_h: u32) -> Self {
        let x = self.x.min(img_w.saturating_sub(1));
        let y = self.y.min(img_h.saturating_sub(1));
        Self {
            x,
            y,
            width: self.width.min(img_w.saturating_sub(x)),
            height: self.height.min(img_h.saturating_sub(y)),
        }
    }
}

/// Convert a model-space box into a padded pixel region of the image.
///
/// Coordinates with `w < 1.0` are treated as fractions of `input_size`. The
/// region is grown by `padding` times its width and height on each side and
/// rounded once, after padding. The result is clamped to the image; an empty
/// region means there is nothing to repair.
#[must_use]
pub fn to_image_region(
    bbox: &BoundingBox,
    input_size: u32,
    img_w: u32,
    img_h: u32,
    padding: f64,
) -> ImageRegion {
    let input = f64::from(input_size);
    let (mut cx, mut cy, mut w, mut h) = (
        f64::from(bbox.cx),
        f64::from(bbox.cy),
        f64::from(bbox.w),
        f64::from(bbox.h),
    );
    if w < 1.0 {
        cx *= input;
        cy *= input;
        w *= input;
        h *= input;
    }

    let scale_x = f64::from(img_w) / input;
    let scale_y = f64::from(img_h) / input;

    let mut x = (cx - w / 2.0) * scale_x;
    let mut y = (cy - h / 2.0) * scale_y;
    let mut width = w * scale_x;
    let mut height = h * scale_y;

    let pad_w = width * padding;
    let pad_h = height * padding;
    x -= pad_w;
    y -= pad_h;
    width += 2.0 * pad_w;
    height += 2.0 * pad_h;

    // f64::round is half away from zero
    let (x, y, width, height) = (x.round(), y.round(), width.round(), height.round());

    let x = clamp_coord(x, img_w);
    let y = clamp_coord(y, img_h);
    ImageRegion {
        x,
        y,
        width: clamp_extent(width, img_w - x),
        height: clamp_extent(height, img_h - y),
    }
}

/// Clip an origin coordinate into `[0, limit - 1]`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_coord(v: f64, limit: u32) -> u32 {
    let max = f64::from(limit.saturating_sub(1));
    // NaN casts to 0
    v.clamp(0.0, max) as u32
}

/// Clip an extent into `[0, room]`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_extent(v: f64, room: u32) -> u32 {
    v.clamp(0.0, f64::from(room)) as u32
}
