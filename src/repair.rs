//! Patch-based repair from a clean reference image.
//!
//! The reference depicts the same scene as the target, possibly at another
//! resolution. It is stretched to the target's size and the detected region
//! is copied over verbatim: no blending or feathering at the border.

use image::imageops::{self, FilterType};
use image::{Pixel, Rgb, RgbImage};

use crate::error::{Error, Result};
use crate::geometry::ImageRegion;

/// Result of [`patch_region`].
#[derive(Debug)]
pub enum PatchOutcome {
    /// The region was overwritten; holds the new image.
    Repaired(RgbImage),
    /// The region was empty after clamping; nothing was copied.
    NoChange,
}

/// Resize `reference` to exactly `width` x `height` with a Lanczos3 filter.
///
/// No content registration is attempted beyond the uniform resize.
///
/// # Errors
///
/// Returns [`Error::Repair`] if the reference has no pixels to sample from.
pub fn align_reference(reference: &RgbImage, width: u32, height: u32) -> Result<RgbImage> {
    if reference.dimensions() == (width, height) {
        return Ok(reference.clone());
    }
    if reference.width() == 0 || reference.height() == 0 {
        return Err(Error::Repair(format!(
            "reference image is {}x{}, cannot resize to {width}x{height}",
            reference.width(),
            reference.height()
        )));
    }
    Ok(imageops::resize(reference, width, height, FilterType::Lanczos3))
}

/// Overwrite `region` of `target` with the same pixels of `source`.
///
/// The region is clamped to both buffers first.
///
/// # Errors
///
/// Returns [`Error::Repair`] if the two buffers differ in size.
pub fn copy_region(target: &mut RgbImage, source: &RgbImage, region: ImageRegion) -> Result<()> {
    if target.dimensions() != source.dimensions() {
        return Err(Error::Repair(format!(
            "target is {:?} but source is {:?}",
            target.dimensions(),
            source.dimensions()
        )));
    }

    let (img_w, img_h) = target.dimensions();
    let region = region.clamp_to(img_w, img_h);
    if region.is_empty() {
        return Ok(());
    }

    let channels = usize::from(<Rgb<u8> as Pixel>::CHANNEL_COUNT);
    let stride = img_w as usize * channels;
    let start = region.x as usize * channels;
    let end = start + region.width as usize * channels;

    let src: &[u8] = source;
    let dst: &mut [u8] = target;
    for row in region.y..region.y + region.height {
        let offset = row as usize * stride;
        dst[offset + start..offset + end].copy_from_slice(&src[offset + start..offset + end]);
    }
    Ok(())
}

/// Repair `region` of `target` using pixels from `reference`.
///
/// The reference is aligned to the target first. The returned image has the
/// target's dimensions and every pixel outside the region is unchanged.
///
/// # Errors
///
/// Returns [`Error::Repair`] if the reference cannot be aligned to the target.
pub fn patch_region(
    target: &RgbImage,
    reference: &RgbImage,
    region: ImageRegion,
) -> Result<PatchOutcome> {
    let (img_w, img_h) = target.dimensions();
    let region = region.clamp_to(img_w, img_h);
    if region.is_empty() {
        return Ok(PatchOutcome::NoChange);
    }

    let aligned = align_reference(reference, img_w, img_h)?;
    let region = region.clamp_to(aligned.width(), aligned.height());
    if region.is_empty() {
        return Ok(PatchOutcome::NoChange);
    }

    let mut repaired = target.clone();
    copy_region(&mut repaired, &aligned, region)?;
    Ok(PatchOutcome::Repaired(repaired))
}
