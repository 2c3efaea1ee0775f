//! Detector seam and the shared, lazily loaded model handle.
//!
//! Inference itself is delegated to a [`Detector`] implementation. This module
//! owns preprocessing and the [`ModelService`] that serializes access to the
//! one detector instance shared by every batch.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::tensor::DetectionTensor;

/// Square input resolution used by the bundled watermark detector.
pub const DEFAULT_INPUT_SIZE: u32 = 640;

/// Preprocessed `[1, 3, size, size]` detector input with values in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct InputTensor {
    size: u32,
    data: Vec<f32>,
}

impl InputTensor {
    /// Side length of the square input.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// NCHW shape of the tensor.
    #[must_use]
    pub fn shape(&self) -> [usize; 4] {
        let s = self.size as usize;
        [1, 3, s, s]
    }

    /// Flat NCHW data.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Resize `image` to `size` x `size` (bilinear) and scale pixels to `[0, 1]`.
///
/// The aspect ratio is not preserved; the detector always sees a square.
#[must_use]
pub fn preprocess(image: &RgbImage, size: u32) -> InputTensor {
    let resized = imageops::resize(image, size, size, FilterType::Triangle);
    let plane = size as usize * size as usize;
    let mut data = vec![0.0_f32; plane * 3];

    #[cfg(feature = "cli")]
    {
        use rayon::prelude::*;
        data.par_chunks_mut(plane.max(1))
            .enumerate()
            .for_each(|(channel, out)| fill_plane(&resized, channel, out));
    }

    #[cfg(not(feature = "cli"))]
    {
        data.chunks_mut(plane.max(1))
            .enumerate()
            .for_each(|(channel, out)| fill_plane(&resized, channel, out));
    }

    InputTensor { size, data }
}

fn fill_plane(image: &RgbImage, channel: usize, out: &mut [f32]) {
    for (dst, px) in out.iter_mut().zip(image.pixels()) {
        *dst = f32::from(px[channel]) / 255.0;
    }
}

/// A pretrained single-class detector.
///
/// Implementations run one forward pass per call. They are never called
/// concurrently when owned by a [`ModelService`].
pub trait Detector: Send {
    /// Square input resolution the model expects.
    fn input_size(&self) -> u32 {
        DEFAULT_INPUT_SIZE
    }

    /// Run the model on a preprocessed input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Inference`] or [`Error::MalformedTensor`] on failure.
    fn detect(&mut self, input: &InputTensor) -> Result<DetectionTensor>;
}

/// Raw detector output together with the input resolution it refers to.
#[derive(Debug, Clone)]
pub struct Inference {
    /// Output tensor.
    pub tensor: DetectionTensor,
    /// Model input resolution the box coordinates are expressed in.
    pub input_size: u32,
}

type Loader = Box<dyn Fn() -> Result<Box<dyn Detector>> + Send + Sync>;

/// Owner of the process-wide detector handle.
///
/// The detector is created on first use and guarded by a mutex held across
/// both the create-if-missing check and the forward pass, so at most one
/// inference runs at a time.
pub struct ModelService {
    loader: Loader,
    handle: Mutex<Option<Box<dyn Detector>>>,
}

impl ModelService {
    /// Create a service that builds its detector lazily with `loader`.
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Detector>> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            handle: Mutex::new(None),
        }
    }

    /// Create a service around an already constructed detector.
    ///
    /// Once shut down, such a service cannot reload.
    pub fn with_detector(detector: impl Detector + 'static) -> Self {
        Self {
            loader: Box::new(|| -> Result<Box<dyn Detector>> {
                Err(Error::ModelLoad(
                    "detector was shut down and has no loader".to_string(),
                ))
            }),
            handle: Mutex::new(Some(Box::new(detector))),
        }
    }

    /// Whether a detector instance currently exists.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.lock().is_some()
    }

    /// Create the detector if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] if the loader fails.
    pub fn ensure_loaded(&self) -> Result<()> {
        let mut slot = self.lock();
        self.load_into(&mut slot)?;
        Ok(())
    }

    /// Preprocess `image` and run the detector on it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] if the detector could not be created, and
    /// [`Error::Inference`] or [`Error::MalformedTensor`] if the pass fails.
    pub fn infer(&self, image: &RgbImage) -> Result<Inference> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::Inference("image has no pixels".to_string()));
        }

        let mut slot = self.lock();
        let detector = self.load_into(&mut slot)?;
        let input_size = detector.input_size();

        let start = Instant::now();
        let input = preprocess(image, input_size);
        let tensor = detector.detect(&input)?;
        debug!(
            anchors = tensor.anchors(),
            fields = tensor.fields(),
            layout = ?tensor.layout(),
            elapsed = ?start.elapsed(),
            "inference finished"
        );

        Ok(Inference { tensor, input_size })
    }

    /// Drop the detector. Returns whether one was loaded.
    pub fn shutdown(&self) -> bool {
        let released = self.lock().take().is_some();
        if released {
            info!("detection model released");
        }
        released
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn Detector>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_into<'a>(
        &self,
        slot: &'a mut Option<Box<dyn Detector>>,
    ) -> Result<&'a mut Box<dyn Detector>> {
        if slot.is_none() {
            info!("loading detection model");
            let detector = (self.loader)()?;
            info!(input_size = detector.input_size(), "detection model ready");
            *slot = Some(detector);
        }
        slot.as_mut()
            .ok_or_else(|| Error::ModelLoad("detector slot is empty".to_string()))
    }
}

impl Drop for ModelService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
