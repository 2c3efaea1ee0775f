//! Error types for the lofter-fixer crate.

use std::fmt;
use std::path::PathBuf;

/// Errors that can occur while detecting and repairing watermark regions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An input image could not be opened or decoded.
    #[error("cannot read image {}: {source}", path.display())]
    Read {
        /// Path of the image that failed to decode.
        path: PathBuf,
        /// Underlying decoder error.
        source: image::ImageError,
    },

    /// The detector could not be created.
    #[error("failed to load detection model: {0}")]
    ModelLoad(String),

    /// The detector failed while running a forward pass.
    #[error("inference failed: {0}")]
    Inference(String),

    /// The detector returned a tensor with an unusable rank or shape.
    #[error("malformed detection tensor: {0}")]
    MalformedTensor(String),

    /// The reference patch could not be applied to the target.
    #[error("repair failed: {0}")]
    Repair(String),

    /// The batch request did not pass validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An I/O error occurred while reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image format is not supported.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// An error occurred during image encoding or saving.
    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// A JSON request or payload could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Stage at which a single task stopped short of a repaired image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Target or reference image could not be decoded.
    Read,
    /// The detector failed or returned a malformed tensor.
    Inference,
    /// The best candidate scored below the confidence threshold.
    LowConfidence,
    /// The region collapsed to zero width or height after clamping.
    DegenerateRegion,
    /// Resizing or copying the reference patch failed.
    Repair,
    /// The repaired image could not be persisted.
    Save,
}

impl FailureKind {
    /// Short human-readable description used in batch diagnostics.
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::Read => "cannot read image",
            Self::Inference => "inference failed",
            Self::LowConfidence => "confidence too low",
            Self::DegenerateRegion => "no region to repair",
            Self::Repair => "repair failed",
            Self::Save => "save failed",
        }
    }

    /// Whether this kind is an expected negative result rather than an error.
    #[must_use]
    pub fn is_negative_result(self) -> bool {
        matches!(self, Self::LowConfidence | Self::DegenerateRegion)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Structured reason attached to a skipped or failed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// What went wrong.
    pub kind: FailureKind,
    /// Free-text detail, possibly empty.
    pub detail: String,
}

impl TaskFailure {
    /// Build a failure of `kind` with the given detail text.
    pub fn new(kind: FailureKind, detail: impl fmt::Display) -> Self {
        Self {
            kind,
            detail: detail.to_string(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{} ({})", self.kind, self.detail)
        }
    }
}
