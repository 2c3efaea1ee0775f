//! Locate a watermark with a pretrained detector and patch it from a clean
//! reference image of the same scene.
//!
//! A detector (see [`Detector`]) returns a raw `[1, A, B]` tensor. The single
//! best candidate is mapped back to image pixels, padded and clamped, and the
//! region is overwritten with pixels from the reference after resizing it to
//! the target's dimensions.
//!
//! # Quick Start
//!
//! ```no_run
//! use lofter_fixer::{AlbumStorage, BatchRequest, ModelService, RepairEngine};
//! # use lofter_fixer::{Detector, DetectionTensor, InputTensor};
//! # struct MyDetector;
//! # impl Detector for MyDetector {
//! #     fn detect(&mut self, _: &InputTensor) -> lofter_fixer::Result<DetectionTensor> {
//! #         DetectionTensor::new(&[1, 5, 0], Vec::new())
//! #     }
//! # }
//!
//! let model = ModelService::with_detector(MyDetector);
//! let engine = RepairEngine::new(model, AlbumStorage::new("Pictures"));
//! let request = BatchRequest::from_json(
//!     r#"{"tasks": [{"target_path": "wm.jpg", "reference_path": "clean.jpg"}]}"#,
//! )
//! .expect("valid request");
//! match engine.run(&request) {
//!     Ok(summary) => println!("repaired {}", summary.count),
//!     Err(failure) => eprintln!("{}", failure.message),
//! }
//! ```

#![warn(missing_docs)]

mod engine;
pub mod error;
pub mod geometry;
pub mod inference;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod repair;
pub mod storage;
pub mod tensor;

pub use engine::{
    BatchFailure, BatchFailureKind, BatchReport, BatchRequest, BatchResult, BatchSummary,
    RepairEngine, RepairTask, TaskEntry, TaskOutcome, TaskReport, DEFAULT_CONFIDENCE,
    DEFAULT_PADDING,
};
pub use error::{Error, FailureKind, Result, TaskFailure};
pub use geometry::{to_image_region, ImageRegion};
pub use inference::{Detector, Inference, InputTensor, ModelService, DEFAULT_INPUT_SIZE};
#[cfg(feature = "onnx")]
pub use onnx::OnnxDetector;
pub use repair::{patch_region, PatchOutcome};
pub use storage::{AlbumStorage, Storage};
pub use tensor::{BoundingBox, Candidate, DetectionTensor, Layout};
