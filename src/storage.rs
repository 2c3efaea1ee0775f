//! Decoding inputs and persisting repaired images.

use std::fs;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, RgbImage};
use tracing::debug;

use crate::error::{Error, Result};

/// Album (sub-directory) that repaired images are grouped under.
pub const ALBUM: &str = "LofterFixed";

/// Prefix prepended to the original file name of a repaired image.
pub const OUTPUT_PREFIX: &str = "Fixed_";

/// JPEG quality used for repaired images.
pub const JPEG_QUALITY: u8 = 98;

/// Persistence backend for repaired images.
pub trait Storage: Send + Sync {
    /// Save `image` as `file_name` inside `category` and return its absolute path.
    ///
    /// The returned path may differ from `file_name` in its extension when the
    /// backend re-encodes into another format.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be encoded or written.
    fn save(&self, image: &RgbImage, file_name: &str, category: &str) -> Result<PathBuf>;
}

/// Stores images as files under `<root>/<category>/<file_name>`.
///
/// Names whose extension has no encoder here are written as JPEG with a
/// `.jpg` extension.
#[derive(Debug, Clone)]
pub struct AlbumStorage {
    root: PathBuf,
    quality: u8,
}

impl AlbumStorage {
    /// Create a storage rooted at `root` using [`JPEG_QUALITY`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quality: JPEG_QUALITY,
        }
    }

    /// Override the JPEG quality (1-100).
    #[must_use]
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    /// Root directory of the album tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Storage for AlbumStorage {
    fn save(&self, image: &RgbImage, file_name: &str, category: &str) -> Result<PathBuf> {
        let dir = self.root.join(category);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = std::path::absolute(dir.join(storable_name(file_name)))?;
        save_image(image, &path, self.quality)?;
        debug!(path = %path.display(), "saved repaired image");
        Ok(path)
    }
}

/// Decode the image at `path` into 8-bit RGB.
///
/// # Errors
///
/// Returns [`Error::Read`] if the file cannot be opened or decoded.
pub fn load_image(path: &Path) -> Result<RgbImage> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Encode `image` as a JPEG byte stream.
///
/// # Errors
///
/// Returns [`Error::Image`] if encoding fails.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(image)?;
    Ok(buf)
}

/// Save an RGB image, choosing the codec from the file extension.
///
/// # Errors
///
/// Returns an error if the format is unsupported or writing fails.
pub fn save_image(img: &RgbImage, path: &Path, jpeg_quality: u8) -> Result<()> {
    let format =
        ImageFormat::from_path(path).map_err(|e| Error::UnsupportedFormat(e.to_string()))?;

    match format {
        ImageFormat::Jpeg => {
            fs::write(path, encode_jpeg(img, jpeg_quality)?)?;
        }
        ImageFormat::Png | ImageFormat::WebP | ImageFormat::Bmp => {
            DynamicImage::ImageRgb8(img.clone()).save_with_format(path, format)?;
        }
        _ => {
            return Err(Error::UnsupportedFormat(format!("{format:?}")));
        }
    }

    Ok(())
}

/// `file_name`, or the same name with a `.jpg` extension when its format has
/// no encoder in [`save_image`].
fn storable_name(file_name: &str) -> PathBuf {
    let name = Path::new(file_name);
    if is_supported_image(name) {
        name.to_path_buf()
    } else {
        name.with_extension("jpg")
    }
}

/// Check if a file has a supported image extension.
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => matches!(
            ext.to_lowercase().as_str(),
            "jpg" | "jpeg" | "png" | "webp" | "bmp"
        ),
        None => false,
    }
}

/// File name for the repaired version of `target`.
///
/// Example: `"/sdcard/a/photo.jpg"` becomes `"Fixed_photo.jpg"`.
#[must_use]
pub fn output_file_name(target: &Path) -> String {
    let name = target.file_name().unwrap_or_default().to_string_lossy();
    format!("{OUTPUT_PREFIX}{name}")
}
