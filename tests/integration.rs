use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::{Rgb, RgbImage};
use lofter_fixer::{
    AlbumStorage, BatchFailureKind, BatchRequest, DetectionTensor, Detector, Error, FailureKind,
    InputTensor, ModelService, RepairEngine, Storage, TaskEntry, TaskOutcome,
};

/// Detector that always returns the same tensor.
struct ScriptedDetector {
    input_size: u32,
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl ScriptedDetector {
    /// Field-major `[1, 5, anchors]` output with one anchor set to `record`.
    fn standard(input_size: u32, anchors: usize, hit: usize, record: [f32; 5]) -> Self {
        let mut data = vec![0.0; 5 * anchors];
        for (field, v) in record.iter().enumerate() {
            data[field * anchors + hit] = *v;
        }
        Self {
            input_size,
            shape: vec![1, 5, anchors],
            data,
        }
    }

    /// Anchor-major `[1, anchors, 5]` output with one anchor set to `record`.
    fn transposed(input_size: u32, anchors: usize, hit: usize, record: [f32; 5]) -> Self {
        let mut data = vec![0.0; 5 * anchors];
        data[hit * 5..hit * 5 + 5].copy_from_slice(&record);
        Self {
            input_size,
            shape: vec![1, anchors, 5],
            data,
        }
    }
}

impl Detector for ScriptedDetector {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn detect(&mut self, input: &InputTensor) -> lofter_fixer::Result<DetectionTensor> {
        assert_eq!(input.size(), self.input_size);
        DetectionTensor::new(&self.shape, self.data.clone())
    }
}

/// Storage whose disk is always full.
struct FullDisk;

impl Storage for FullDisk {
    fn save(&self, _: &RgbImage, _: &str, _: &str) -> lofter_fixer::Result<PathBuf> {
        Err(Error::Io(std::io::Error::other("no space left on device")))
    }
}

#[allow(clippy::cast_possible_truncation)]
fn gradient(w: u32, h: u32) -> RgbImage {
    RgbImage::from_fn(w, h, |x, y| Rgb([(x * 2 % 256) as u8, (y * 2 % 256) as u8, 40]))
}

fn write(dir: &Path, name: &str, img: &RgbImage) -> PathBuf {
    let path = dir.join(name);
    img.save(&path).unwrap();
    path
}

fn entry(target: &Path, reference: &Path) -> TaskEntry {
    TaskEntry {
        target_path: target.to_path_buf(),
        reference_path: reference.to_path_buf(),
    }
}

fn request(tasks: Vec<TaskEntry>, padding: f64) -> BatchRequest {
    BatchRequest {
        tasks,
        confidence: 0.5,
        padding,
    }
}

/// Box at (cx=32, cy=24, w=16, h=8) on a 64px model input maps to
/// (48, 30, 32, 12) on a 128x96 image.
const RECORD: [f32; 5] = [32.0, 24.0, 16.0, 8.0, 0.9];

#[test]
fn repairs_detected_region_and_leaves_rest_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let target_img = gradient(128, 96);
    let target = write(dir.path(), "photo.png", &target_img);
    let clean = RgbImage::from_pixel(64, 48, Rgb([200, 10, 90]));
    let reference = write(dir.path(), "clean.png", &clean);

    let model = ModelService::with_detector(ScriptedDetector::standard(64, 300, 42, RECORD));
    let engine = RepairEngine::new(model, AlbumStorage::new(dir.path().join("out")));

    let summary = engine
        .run(&request(vec![entry(&target, &reference)], 0.0))
        .unwrap();
    assert_eq!(summary.count, 1);
    let saved = summary.first_path.unwrap();
    assert!(saved.ends_with("LofterFixed/Fixed_photo.png"));

    let out = image::open(&saved).unwrap().to_rgb8();
    assert_eq!(out.dimensions(), (128, 96));
    for (x, y, px) in out.enumerate_pixels() {
        let inside = (48..80).contains(&x) && (30..42).contains(&y);
        if inside {
            let expected = [200u8, 10, 90];
            for ch in 0..3 {
                assert!(px[ch].abs_diff(expected[ch]) <= 1, "({x},{y}) = {px:?}");
            }
        } else {
            assert_eq!(px, target_img.get_pixel(x, y), "({x},{y}) changed");
        }
    }
}

#[test]
fn transposed_output_repairs_the_same_region() {
    let dir = tempfile::tempdir().unwrap();
    let target = write(dir.path(), "a.png", &gradient(128, 96));
    let clean = RgbImage::from_pixel(128, 96, Rgb([1, 2, 3]));
    let reference = write(dir.path(), "b.png", &clean);

    let standard = RepairEngine::new(
        ModelService::with_detector(ScriptedDetector::standard(64, 300, 7, RECORD)),
        AlbumStorage::new(dir.path().join("standard")),
    );
    let transposed = RepairEngine::new(
        ModelService::with_detector(ScriptedDetector::transposed(64, 300, 7, RECORD)),
        AlbumStorage::new(dir.path().join("transposed")),
    );

    let req = request(vec![entry(&target, &reference)], 0.2);
    let a = standard.run(&req).unwrap().first_path.unwrap();
    let b = transposed.run(&req).unwrap().first_path.unwrap();
    assert_eq!(
        image::open(a).unwrap().to_rgb8(),
        image::open(b).unwrap().to_rgb8()
    );
}

#[test]
fn empty_batch_succeeds_without_loading_model() {
    let loads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&loads);
    let model = ModelService::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedDetector::standard(64, 1, 0, RECORD)) as Box<dyn Detector>)
    });
    let dir = tempfile::tempdir().unwrap();
    let engine = RepairEngine::new(model, AlbumStorage::new(dir.path()));

    let summary = engine.run(&BatchRequest::default()).unwrap();
    assert_eq!(summary.count, 0);
    assert!(summary.first_path.is_none());
    assert_eq!(loads.load(Ordering::SeqCst), 0);
    assert!(!engine.model().is_loaded());
}

#[test]
fn low_confidence_is_skipped_and_fails_single_task_batch() {
    let dir = tempfile::tempdir().unwrap();
    let target = write(dir.path(), "wm.png", &gradient(32, 32));
    let reference = write(dir.path(), "clean.png", &gradient(32, 32));

    let mut record = RECORD;
    record[4] = 0.3;
    let engine = RepairEngine::new(
        ModelService::with_detector(ScriptedDetector::standard(64, 10, 3, record)),
        AlbumStorage::new(dir.path().join("out")),
    );

    let req = request(vec![entry(&target, &reference)], 0.2);
    let tasks = req.validate().unwrap();
    match engine.process_task(&tasks[0]).unwrap() {
        TaskOutcome::Skipped(reason) => assert_eq!(reason.kind, FailureKind::LowConfidence),
        other => panic!("expected skip, got {other:?}"),
    }

    let failure = engine.run(&req).unwrap_err();
    assert_eq!(failure.kind, BatchFailureKind::NoDetection);
    assert!(failure.message.contains("wm.png -> confidence too low"));
    assert!(!dir.path().join("out").join("LofterFixed").join("Fixed_wm.png").exists());
}

#[test]
fn unreadable_task_does_not_abort_batch() {
    let dir = tempfile::tempdir().unwrap();
    let broken = dir.path().join("broken.png");
    std::fs::write(&broken, b"not an image").unwrap();
    let target = write(dir.path(), "good.png", &gradient(128, 96));
    let reference = write(dir.path(), "ref.png", &gradient(64, 48));

    let engine = RepairEngine::new(
        ModelService::with_detector(ScriptedDetector::standard(64, 20, 1, RECORD)),
        AlbumStorage::new(dir.path().join("out")),
    );

    let tasks = request(
        vec![entry(&broken, &reference), entry(&target, &reference)],
        0.1,
    )
    .validate()
    .unwrap();
    let report = engine.run_batch(&tasks);
    assert_eq!(report.reports.len(), 2);
    assert!(matches!(
        &report.reports[0].outcome,
        TaskOutcome::Failed(reason) if reason.kind == FailureKind::Read
    ));
    assert_eq!(report.repaired_count(), 1);

    let summary = report.into_result().unwrap();
    assert_eq!(summary.count, 1);
    assert!(summary.first_path.unwrap().ends_with("Fixed_good.png"));
}

#[test]
fn malformed_tensor_is_an_inference_failure() {
    let dir = tempfile::tempdir().unwrap();
    let target = write(dir.path(), "t.png", &gradient(16, 16));
    let reference = write(dir.path(), "r.png", &gradient(16, 16));

    let detector = ScriptedDetector {
        input_size: 64,
        shape: vec![1, 3, 4],
        data: vec![0.0; 12],
    };
    let engine = RepairEngine::new(
        ModelService::with_detector(detector),
        AlbumStorage::new(dir.path().join("out")),
    );

    let tasks = request(vec![entry(&target, &reference)], 0.2)
        .validate()
        .unwrap();
    let report = engine.run_batch(&tasks);
    match &report.reports[0].outcome {
        TaskOutcome::Failed(reason) => assert_eq!(reason.kind, FailureKind::Inference),
        other => panic!("expected inference failure, got {other:?}"),
    }
}

#[test]
fn model_load_failure_aborts_batch() {
    let dir = tempfile::tempdir().unwrap();
    let target = write(dir.path(), "t.png", &gradient(16, 16));
    let reference = write(dir.path(), "r.png", &gradient(16, 16));

    let loads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&loads);
    let model = ModelService::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(Error::ModelLoad("best_float16 missing".to_string()))
    });
    let engine = RepairEngine::new(model, AlbumStorage::new(dir.path().join("out")));

    let req = request(
        vec![entry(&target, &reference), entry(&target, &reference)],
        0.2,
    );
    let failure = engine.run(&req).unwrap_err();
    assert_eq!(failure.kind, BatchFailureKind::Err);
    assert!(failure.message.contains("best_float16 missing"));
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[test]
fn invalid_request_is_rejected_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let engine = RepairEngine::new(
        ModelService::with_detector(ScriptedDetector::standard(64, 1, 0, RECORD)),
        AlbumStorage::new(dir.path()),
    );
    let req = BatchRequest {
        padding: -1.0,
        ..BatchRequest::default()
    };
    let failure = engine.run(&req).unwrap_err();
    assert_eq!(failure.kind, BatchFailureKind::Err);
    assert!(failure.message.contains("padding"));
}

#[test]
fn batch_runs_on_worker_thread() {
    let dir = tempfile::tempdir().unwrap();
    let target = write(dir.path(), "w.png", &gradient(128, 96));
    let reference = write(dir.path(), "c.png", &gradient(128, 96));

    let engine = Arc::new(RepairEngine::new(
        ModelService::with_detector(ScriptedDetector::transposed(64, 50, 49, RECORD)),
        AlbumStorage::new(dir.path().join("out")),
    ));
    let handle = engine
        .spawn(request(vec![entry(&target, &reference)], 0.2))
        .unwrap();
    let summary = handle.join().unwrap().unwrap();
    assert_eq!(summary.count, 1);
}

#[test]
fn collapsed_box_is_skipped_as_degenerate() {
    let dir = tempfile::tempdir().unwrap();
    let target = write(dir.path(), "flat.png", &gradient(128, 96));
    let reference = write(dir.path(), "ref.png", &gradient(128, 96));

    // negative height collapses to an empty region after clamping
    let record = [32.0, 24.0, 16.0, -8.0, 0.9];
    let engine = RepairEngine::new(
        ModelService::with_detector(ScriptedDetector::standard(64, 10, 4, record)),
        AlbumStorage::new(dir.path().join("out")),
    );

    let req = request(vec![entry(&target, &reference)], 0.0);
    let tasks = req.validate().unwrap();
    match engine.process_task(&tasks[0]).unwrap() {
        TaskOutcome::Skipped(reason) => assert_eq!(reason.kind, FailureKind::DegenerateRegion),
        other => panic!("expected degenerate skip, got {other:?}"),
    }

    let failure = engine.run(&req).unwrap_err();
    assert_eq!(failure.kind, BatchFailureKind::NoDetection);
    assert!(failure.message.contains("flat.png -> no region to repair"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn storage_error_fails_task_with_save_reason() {
    let dir = tempfile::tempdir().unwrap();
    let target = write(dir.path(), "t.png", &gradient(128, 96));
    let reference = write(dir.path(), "r.png", &gradient(64, 48));

    let engine = RepairEngine::new(
        ModelService::with_detector(ScriptedDetector::standard(64, 10, 2, RECORD)),
        FullDisk,
    );

    let req = request(vec![entry(&target, &reference)], 0.2);
    let tasks = req.validate().unwrap();
    match engine.process_task(&tasks[0]).unwrap() {
        TaskOutcome::Failed(reason) => {
            assert_eq!(reason.kind, FailureKind::Save);
            assert!(reason.detail.contains("no space left"));
        }
        other => panic!("expected save failure, got {other:?}"),
    }

    let failure = engine.run(&req).unwrap_err();
    assert_eq!(failure.kind, BatchFailureKind::NoDetection);
    assert!(failure.message.contains("t.png -> save failed"));
}

#[test]
fn tiff_target_is_repaired_and_saved_as_jpeg() {
    let dir = tempfile::tempdir().unwrap();
    let target = write(dir.path(), "wm.tiff", &gradient(128, 96));
    let reference = write(dir.path(), "clean.png", &gradient(128, 96));

    let engine = RepairEngine::new(
        ModelService::with_detector(ScriptedDetector::standard(64, 1, 0, RECORD)),
        AlbumStorage::new(dir.path().join("out")),
    );

    let summary = engine
        .run(&request(vec![entry(&target, &reference)], 0.2))
        .unwrap();
    assert_eq!(summary.count, 1);
    let saved = summary.first_path.unwrap();
    assert!(saved.ends_with("LofterFixed/Fixed_wm.jpg"));
    let out = image::open(&saved).unwrap();
    assert_eq!(out.width(), 128);
    assert_eq!(out.height(), 96);
}
