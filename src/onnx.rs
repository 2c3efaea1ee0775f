//! ONNX Runtime backed [`Detector`].

use std::path::{Path, PathBuf};

use ndarray::ArrayView4;
use ort::session::Session;
use ort::value::TensorRef;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::inference::{Detector, InputTensor, DEFAULT_INPUT_SIZE};
use crate::tensor::DetectionTensor;

/// Single-output YOLO style detector exported to ONNX.
pub struct OnnxDetector {
    session: Session,
    input_size: u32,
}

impl OnnxDetector {
    /// Load a model from `path` expecting [`DEFAULT_INPUT_SIZE`] inputs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] if the session cannot be created.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_file_with_size(path, DEFAULT_INPUT_SIZE)
    }

    /// Load a model from `path` expecting `input_size` x `input_size` inputs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] if the session cannot be created.
    pub fn from_file_with_size(path: &Path, input_size: u32) -> Result<Self> {
        info!(model = %path.display(), input_size, "creating ONNX session");
        let session = Session::builder()
            .and_then(|builder| builder.commit_from_file(path))
            .map_err(|e| Error::ModelLoad(format!("{}: {e}", path.display())))?;
        debug!(
            inputs = session.inputs.len(),
            outputs = session.outputs.len(),
            "ONNX session ready"
        );
        Ok(Self {
            session,
            input_size,
        })
    }

    /// A loader for [`crate::ModelService::new`] that opens `path` on first use.
    pub fn loader(
        path: impl Into<PathBuf>,
        input_size: u32,
    ) -> impl Fn() -> Result<Box<dyn Detector>> + Send + Sync + 'static {
        let path = path.into();
        move || {
            let detector = Self::from_file_with_size(&path, input_size)?;
            Ok(Box::new(detector) as Box<dyn Detector>)
        }
    }
}

impl Detector for OnnxDetector {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn detect(&mut self, input: &InputTensor) -> Result<DetectionTensor> {
        let view = ArrayView4::from_shape(input.shape(), input.as_slice())
            .map_err(|e| Error::Inference(format!("input shape: {e}")))?;
        let tensor =
            TensorRef::from_array_view(view).map_err(|e| Error::Inference(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| Error::Inference(e.to_string()))?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Inference(format!("failed to extract tensor: {e}")))?;

        let dims = shape
            .iter()
            .map(|&d| {
                usize::try_from(d)
                    .map_err(|_| Error::MalformedTensor(format!("dynamic dimension {d}")))
            })
            .collect::<Result<Vec<_>>>()?;
        DetectionTensor::new(&dims, data.to_vec())
    }
}
