//! Batch runner: detection, repair and persistence for image pairs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};

use crate::error::{Error, FailureKind, Result, TaskFailure};
use crate::geometry::to_image_region;
use crate::inference::ModelService;
use crate::repair::{patch_region, PatchOutcome};
use crate::storage::{is_supported_image, load_image, output_file_name, Storage, ALBUM};

/// Default minimum confidence for a detection to be repaired.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Default padding ratio applied around a detected box.
pub const DEFAULT_PADDING: f64 = 0.2;

/// One `(target, reference)` pair as it appears in a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    /// Watermarked image to repair.
    #[serde(alias = "wm")]
    pub target_path: PathBuf,
    /// Clean image of the same scene.
    #[serde(alias = "clean")]
    pub reference_path: PathBuf,
}

/// Batch entry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Pairs to process, in order.
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
    /// Minimum confidence in `[0, 1]`.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Padding ratio, `>= 0`.
    #[serde(default = "default_padding")]
    pub padding: f64,
}

fn default_confidence() -> f64 {
    DEFAULT_CONFIDENCE
}

fn default_padding() -> f64 {
    DEFAULT_PADDING
}

impl Default for BatchRequest {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            confidence: DEFAULT_CONFIDENCE,
            padding: DEFAULT_PADDING,
        }
    }
}

impl BatchRequest {
    /// Parse a request from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the document does not match the schema.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Pair every supported image in `targets` with the same file name in `references`.
    ///
    /// Targets without a reference are left out with a warning. Pairs are
    /// sorted by file name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if `targets` cannot be listed.
    pub fn from_directories(targets: &Path, references: &Path) -> Result<Vec<TaskEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(targets)? {
            let path = entry?.path();
            if !path.is_file() || !is_supported_image(&path) {
                continue;
            }
            let Some(name) = path.file_name() else {
                continue;
            };
            let reference = references.join(name);
            if reference.is_file() {
                entries.push(TaskEntry {
                    target_path: path,
                    reference_path: reference,
                });
            } else {
                warn!(target = %path.display(), "no reference image with the same name");
            }
        }
        entries.sort_by(|a, b| a.target_path.cmp(&b.target_path));
        Ok(entries)
    }

    /// Check shared parameters and paths, producing typed tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] on the first invalid field.
    pub fn validate(&self) -> Result<Vec<RepairTask>> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::InvalidRequest(format!(
                "confidence must be between 0.0 and 1.0, got {}",
                self.confidence
            )));
        }
        if !self.padding.is_finite() || self.padding < 0.0 {
            return Err(Error::InvalidRequest(format!(
                "padding must be a finite value >= 0, got {}",
                self.padding
            )));
        }

        self.tasks
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                if entry.target_path.as_os_str().is_empty() {
                    return Err(Error::InvalidRequest(format!("task {i}: empty target_path")));
                }
                if entry.reference_path.as_os_str().is_empty() {
                    return Err(Error::InvalidRequest(format!(
                        "task {i}: empty reference_path"
                    )));
                }
                Ok(RepairTask {
                    target: entry.target_path.clone(),
                    reference: entry.reference_path.clone(),
                    confidence: self.confidence,
                    padding: self.padding,
                })
            })
            .collect()
    }
}

/// A validated unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairTask {
    /// Watermarked image to repair.
    pub target: PathBuf,
    /// Clean image of the same scene.
    pub reference: PathBuf,
    /// Minimum confidence in `[0, 1]`.
    pub confidence: f64,
    /// Padding ratio, `>= 0`.
    pub padding: f64,
}

/// How a single task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Repaired and saved at the given path.
    Repaired(PathBuf),
    /// Nothing to repair (low confidence or empty region).
    Skipped(TaskFailure),
    /// An error stopped the task.
    Failed(TaskFailure),
}

impl TaskOutcome {
    /// A task that was not repaired for `kind`.
    ///
    /// Expected negative results (see [`FailureKind::is_negative_result`])
    /// are [`TaskOutcome::Skipped`]; everything else is [`TaskOutcome::Failed`].
    #[must_use]
    pub fn from_failure(kind: FailureKind, detail: impl fmt::Display) -> Self {
        let failure = TaskFailure::new(kind, detail);
        if kind.is_negative_result() {
            Self::Skipped(failure)
        } else {
            Self::Failed(failure)
        }
    }

    /// The failure reason, unless the task was repaired.
    #[must_use]
    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::Repaired(_) => None,
            Self::Skipped(f) | Self::Failed(f) => Some(f),
        }
    }
}

/// Outcome of one task, tagged with its target image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    /// Target image of the task.
    pub target: PathBuf,
    /// What happened to it.
    pub outcome: TaskOutcome,
}

impl TaskReport {
    /// File name of the target, for diagnostics.
    #[must_use]
    pub fn file_name(&self) -> String {
        display_name(&self.target)
    }
}

/// Per-task outcomes of a batch plus any batch-level error.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Reports in task order.
    pub reports: Vec<TaskReport>,
    /// Error that stopped the batch before all tasks ran.
    pub aborted: Option<String>,
}

impl BatchReport {
    /// Number of repaired tasks.
    #[must_use]
    pub fn repaired_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Repaired(_)))
            .count()
    }

    /// Path of the first repaired image.
    #[must_use]
    pub fn first_repaired(&self) -> Option<&Path> {
        self.reports.iter().find_map(|r| match &r.outcome {
            TaskOutcome::Repaired(p) => Some(p.as_path()),
            _ => None,
        })
    }

    /// One `<file name> -> <reason>` line per task that was not repaired.
    #[must_use]
    pub fn diagnostics(&self) -> String {
        self.reports
            .iter()
            .filter_map(|r| {
                r.outcome
                    .failure()
                    .map(|f| format!("{} -> {f}\n", r.file_name()))
            })
            .collect()
    }

    /// Collapse into the caller-facing payload.
    ///
    /// # Errors
    ///
    /// Returns [`BatchFailureKind::Err`] if the batch was aborted, and
    /// [`BatchFailureKind::NoDetection`] if a non-empty batch repaired nothing.
    pub fn into_result(self) -> BatchResult {
        if let Some(error) = self.aborted {
            return Err(BatchFailure {
                kind: BatchFailureKind::Err,
                message: format!("system error: {error}"),
            });
        }

        let count = self.repaired_count();
        if count == 0 && !self.reports.is_empty() {
            return Err(BatchFailure {
                kind: BatchFailureKind::NoDetection,
                message: format!(
                    "no watermark detected or save failed:\n{}",
                    self.diagnostics()
                ),
            });
        }

        Ok(BatchSummary {
            count,
            first_path: self.first_repaired().map(Path::to_path_buf),
        })
    }
}

/// Success payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Number of repaired images.
    pub count: usize,
    /// First repaired image, for preview.
    #[serde(rename = "firstPath")]
    pub first_path: Option<PathBuf>,
}

/// Failure payload category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchFailureKind {
    /// Every task was skipped or failed.
    #[serde(rename = "NO_DETECTION")]
    NoDetection,
    /// The batch could not run (bad request, model unavailable).
    #[serde(rename = "ERR")]
    Err,
}

/// Failure payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct BatchFailure {
    /// Failure category.
    pub kind: BatchFailureKind,
    /// Aggregated diagnostics.
    pub message: String,
}

/// Result of a whole batch as seen by the caller.
pub type BatchResult = std::result::Result<BatchSummary, BatchFailure>;

/// Detects and repairs watermarks for batches of image pairs.
///
/// Tasks run strictly one after another; the only shared state is the
/// [`ModelService`], which serializes inference on its own.
pub struct RepairEngine {
    model: ModelService,
    storage: Box<dyn Storage>,
    album: String,
}

impl RepairEngine {
    /// Create an engine saving into the default [`ALBUM`].
    pub fn new(model: ModelService, storage: impl Storage + 'static) -> Self {
        Self {
            model,
            storage: Box::new(storage),
            album: ALBUM.to_string(),
        }
    }

    /// Save into `album` instead of the default.
    #[must_use]
    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = album.into();
        self
    }

    /// The shared model handle.
    #[must_use]
    pub fn model(&self) -> &ModelService {
        &self.model
    }

    /// Release the detector.
    pub fn shutdown(&self) {
        self.model.shutdown();
    }

    /// Validate `request`, run it, and build the caller payload.
    ///
    /// # Errors
    ///
    /// Returns a [`BatchFailure`] as described in [`BatchReport::into_result`];
    /// an invalid request is an [`BatchFailureKind::Err`].
    pub fn run(&self, request: &BatchRequest) -> BatchResult {
        match request.validate() {
            Ok(tasks) => self.run_batch(&tasks).into_result(),
            Err(e) => Err(BatchFailure {
                kind: BatchFailureKind::Err,
                message: e.to_string(),
            }),
        }
    }

    /// Run `request` on a dedicated worker thread.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn(
        self: &Arc<Self>,
        request: BatchRequest,
    ) -> std::io::Result<JoinHandle<BatchResult>> {
        let engine = Arc::clone(self);
        thread::Builder::new()
            .name("lofter-batch".to_string())
            .spawn(move || engine.run(&request))
    }

    /// Process `tasks` in order, isolating per-task failures.
    ///
    /// A model that cannot be loaded stops the batch; the remaining tasks are
    /// not attempted.
    #[must_use]
    pub fn run_batch(&self, tasks: &[RepairTask]) -> BatchReport {
        let mut report = BatchReport::default();
        info!(tasks = tasks.len(), "starting batch");

        for task in tasks {
            match self.process_task(task) {
                Ok(outcome) => {
                    report.reports.push(TaskReport {
                        target: task.target.clone(),
                        outcome,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "batch aborted");
                    report.aborted = Some(e.to_string());
                    break;
                }
            }
        }

        info!(
            repaired = report.repaired_count(),
            total = tasks.len(),
            "batch finished"
        );
        report
    }

    /// Run one task through detection, repair and persistence.
    ///
    /// # Errors
    ///
    /// Only batch-level problems are returned as errors (currently a model
    /// that fails to load); everything else becomes a [`TaskOutcome`].
    pub fn process_task(&self, task: &RepairTask) -> Result<TaskOutcome> {
        let span = info_span!("task", file = %display_name(&task.target));
        let _guard = span.enter();

        let target = match load_image(&task.target) {
            Ok(img) => img,
            Err(e) => return Ok(self.report(TaskOutcome::from_failure(FailureKind::Read, e))),
        };
        let reference = match load_image(&task.reference) {
            Ok(img) => img,
            Err(e) => {
                return Ok(self.report(TaskOutcome::from_failure(
                    FailureKind::Read,
                    format_args!("reference: {e}"),
                )))
            }
        };

        let inference = match self.model.infer(&target) {
            Ok(inference) => inference,
            Err(e @ Error::ModelLoad(_)) => return Err(e),
            Err(e) => return Ok(self.report(TaskOutcome::from_failure(FailureKind::Inference, e))),
        };

        let Some(candidate) = inference.tensor.select(task.confidence) else {
            let detail = match inference.tensor.best_candidate() {
                Some(best) => format!(
                    "best {:.2} < {:.2}",
                    best.bbox.confidence, task.confidence
                ),
                None => "no candidates".to_string(),
            };
            return Ok(self.report(TaskOutcome::from_failure(
                FailureKind::LowConfidence,
                detail,
            )));
        };
        let confidence = candidate.bbox.confidence;

        let (img_w, img_h) = target.dimensions();
        let region = to_image_region(
            &candidate.bbox,
            inference.input_size,
            img_w,
            img_h,
            task.padding,
        );
        info!(
            anchor = candidate.anchor,
            confidence,
            x = region.x,
            y = region.y,
            width = region.width,
            height = region.height,
            "watermark located"
        );

        let repaired = match patch_region(&target, &reference, region) {
            Ok(PatchOutcome::Repaired(img)) => img,
            Ok(PatchOutcome::NoChange) => {
                return Ok(self.report(TaskOutcome::from_failure(
                    FailureKind::DegenerateRegion,
                    format_args!(
                        "{}x{} at ({}, {})",
                        region.width, region.height, region.x, region.y
                    ),
                )))
            }
            Err(e) => return Ok(self.report(TaskOutcome::from_failure(FailureKind::Repair, e))),
        };

        let outcome = match self
            .storage
            .save(&repaired, &output_file_name(&task.target), &self.album)
        {
            Ok(path) => TaskOutcome::Repaired(path),
            Err(e) => TaskOutcome::from_failure(FailureKind::Save, e),
        };
        Ok(self.report(outcome))
    }

    #[allow(clippy::unused_self)]
    fn report(&self, outcome: TaskOutcome) -> TaskOutcome {
        match &outcome {
            TaskOutcome::Repaired(path) => info!(output = %path.display(), "repaired"),
            TaskOutcome::Skipped(reason) => info!(%reason, "skipped"),
            TaskOutcome::Failed(reason) => warn!(%reason, "failed"),
        }
        outcome
    }
}

fn display_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |f| f.to_string_lossy().to_string(),
    )
}
