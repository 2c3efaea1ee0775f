//! Parsing of raw detector output into a single best candidate.
//!
//! Single-class YOLO style heads emit a `[1, A, B]` tensor where one trailing
//! axis enumerates anchors and the other enumerates per-anchor fields
//! `(cx, cy, w, h, confidence, ...)`. Exporters disagree on which axis comes
//! first, so the layout is resolved per tensor.

use crate::error::{Error, Result};

/// Number of fields every anchor must carry: four box coordinates plus confidence.
pub const MIN_FIELDS: usize = 5;

/// Field index of the confidence score.
const CONFIDENCE_FIELD: usize = 4;

/// Axis ordering of a detection tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Field-major `[1, fields, anchors]`: each field is contiguous across anchors.
    Standard,
    /// Anchor-major `[1, anchors, fields]`: each anchor is a contiguous record.
    Transposed,
}

impl Layout {
    /// Resolve the layout from the two trailing dimensions.
    ///
    /// When exactly one dimension is too small to hold the mandatory fields,
    /// the other one is the field axis. Otherwise the larger dimension is
    /// taken as the anchor axis, with ties resolving to [`Layout::Standard`].
    #[must_use]
    pub fn resolve(dim1: usize, dim2: usize) -> Self {
        match (dim1 >= MIN_FIELDS, dim2 >= MIN_FIELDS) {
            (true, false) => Self::Standard,
            (false, true) => Self::Transposed,
            _ if dim1 > dim2 => Self::Transposed,
            _ => Self::Standard,
        }
    }
}

/// Raw `[1, A, B]` output of a detector.
#[derive(Debug, Clone)]
pub struct DetectionTensor {
    data: Vec<f32>,
    layout: Layout,
    anchors: usize,
    fields: usize,
}

impl DetectionTensor {
    /// Wrap a flat row-major buffer with the given shape.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedTensor`] if the shape is not `[1, A, B]`,
    /// the buffer length does not match, or a non-empty tensor carries fewer
    /// than [`MIN_FIELDS`] fields per anchor.
    pub fn new(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let &[batch, dim1, dim2] = shape else {
            return Err(Error::MalformedTensor(format!(
                "expected rank 3, got shape {shape:?}"
            )));
        };
        if batch != 1 {
            return Err(Error::MalformedTensor(format!(
                "expected batch size 1, got {batch}"
            )));
        }
        let expected = dim1
            .checked_mul(dim2)
            .ok_or_else(|| Error::MalformedTensor(format!("shape {shape:?} overflows")))?;
        if data.len() != expected {
            return Err(Error::MalformedTensor(format!(
                "shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }

        let layout = Layout::resolve(dim1, dim2);
        let (anchors, fields) = match layout {
            Layout::Standard => (dim2, dim1),
            Layout::Transposed => (dim1, dim2),
        };
        if anchors > 0 && fields < MIN_FIELDS {
            return Err(Error::MalformedTensor(format!(
                "shape {shape:?} has {fields} fields per anchor, need at least {MIN_FIELDS}"
            )));
        }

        Ok(Self {
            data,
            layout,
            anchors,
            fields,
        })
    }

    /// Resolved axis ordering.
    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Number of candidate anchors.
    #[must_use]
    pub fn anchors(&self) -> usize {
        self.anchors
    }

    /// Number of fields per anchor.
    #[must_use]
    pub fn fields(&self) -> usize {
        self.fields
    }

    /// Value of `field` for `anchor`, independent of layout.
    ///
    /// Callers stay below `anchors` and `fields`, which `new` checked
    /// against the buffer length.
    fn value(&self, anchor: usize, field: usize) -> f32 {
        match self.layout {
            Layout::Standard => self.data[field * self.anchors + anchor],
            Layout::Transposed => self.data[anchor * self.fields + field],
        }
    }

    /// The highest-confidence anchor, regardless of any threshold.
    ///
    /// Ties keep the earliest anchor index. Returns `None` for a tensor with
    /// no anchors or when no confidence is comparable (all NaN).
    #[must_use]
    pub fn best_candidate(&self) -> Option<Candidate> {
        argmax_confidence(self.anchors, |anchor, field| self.value(anchor, field))
    }

    /// The best candidate if its confidence reaches `threshold`.
    ///
    /// The threshold is applied once, to the global maximum.
    #[must_use]
    pub fn select(&self, threshold: f64) -> Option<Candidate> {
        self.best_candidate()
            .filter(|candidate| f64::from(candidate.bbox.confidence) >= threshold)
    }
}

/// Box proposal in model input space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// Center x.
    pub cx: f32,
    /// Center y.
    pub cy: f32,
    /// Width.
    pub w: f32,
    /// Height.
    pub h: f32,
    /// Confidence score.
    pub confidence: f32,
}

/// The anchor chosen by [`DetectionTensor::best_candidate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Index of the anchor in the tensor.
    pub anchor: usize,
    /// The anchor's box.
    pub bbox: BoundingBox,
}

/// Linear argmax over anchors shared by both layouts.
fn argmax_confidence(anchors: usize, value: impl Fn(usize, usize) -> f32) -> Option<Candidate> {
    let mut best: Option<(usize, f32)> = None;
    for anchor in 0..anchors {
        let conf = value(anchor, CONFIDENCE_FIELD);
        // strict `>` keeps the earliest index on ties and skips NaN
        if best.map_or(!conf.is_nan(), |(_, best_conf)| conf > best_conf) {
            best = Some((anchor, conf));
        }
    }

    best.map(|(anchor, confidence)| Candidate {
        anchor,
        bbox: BoundingBox {
            cx: value(anchor, 0),
            cy: value(anchor, 1),
            w: value(anchor, 2),
            h: value(anchor, 3),
            confidence,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a field-major `[1, 5, anchors]` tensor with one interesting anchor.
    fn standard_with(anchors: usize, hit: usize, record: [f32; 5]) -> DetectionTensor {
        let mut data = vec![0.0; 5 * anchors];
        for (field, v) in record.iter().enumerate() {
            data[field * anchors + hit] = *v;
        }
        DetectionTensor::new(&[1, 5, anchors], data).unwrap()
    }

    fn transposed_with(anchors: usize, hit: usize, record: [f32; 5]) -> DetectionTensor {
        let mut data = vec![0.0; 5 * anchors];
        data[hit * 5..hit * 5 + 5].copy_from_slice(&record);
        DetectionTensor::new(&[1, anchors, 5], data).unwrap()
    }

    #[test]
    fn layout_follows_larger_anchor_axis() {
        assert_eq!(Layout::resolve(5, 8400), Layout::Standard);
        assert_eq!(Layout::resolve(8400, 5), Layout::Transposed);
        assert_eq!(Layout::resolve(5, 5), Layout::Standard);
    }

    #[test]
    fn layout_uses_field_count_when_one_axis_is_too_small() {
        assert_eq!(Layout::resolve(5, 1), Layout::Standard);
        assert_eq!(Layout::resolve(1, 5), Layout::Transposed);
        assert_eq!(Layout::resolve(6, 3), Layout::Standard);
    }

    #[test]
    fn standard_layout_selects_best_anchor() {
        let t = standard_with(8400, 100, [320.0, 240.0, 100.0, 50.0, 0.9]);
        assert_eq!(t.layout(), Layout::Standard);
        assert_eq!(t.anchors(), 8400);

        let c = t.select(0.5).unwrap();
        assert_eq!(c.anchor, 100);
        assert_eq!(
            c.bbox,
            BoundingBox {
                cx: 320.0,
                cy: 240.0,
                w: 100.0,
                h: 50.0,
                confidence: 0.9
            }
        );
    }

    #[test]
    fn transposed_layout_selects_best_anchor() {
        let t = transposed_with(8400, 7, [10.0, 20.0, 30.0, 40.0, 0.8]);
        assert_eq!(t.layout(), Layout::Transposed);
        let c = t.select(0.5).unwrap();
        assert_eq!(c.anchor, 7);
        assert!((c.bbox.h - 40.0).abs() < f32::EPSILON);
    }

    #[test]
    fn single_anchor_parses_identically_in_both_layouts() {
        let record = [0.5, 0.4, 0.2, 0.1, 0.75];
        let standard = DetectionTensor::new(&[1, 5, 1], record.to_vec()).unwrap();
        let transposed = DetectionTensor::new(&[1, 1, 5], record.to_vec()).unwrap();
        assert_eq!(standard.select(0.5), transposed.select(0.5));
        assert_eq!(standard.select(0.5).unwrap().bbox.w, 0.2);
    }

    #[test]
    fn extra_fields_are_ignored() {
        // [1, 6, 3]: four coords, confidence, one class score
        let data = vec![
            1.0, 2.0, 3.0, // cx
            1.0, 2.0, 3.0, // cy
            1.0, 2.0, 3.0, // w
            1.0, 2.0, 3.0, // h
            0.1, 0.9, 0.2, // conf
            0.0, 0.0, 0.0, // extra
        ];
        let t = DetectionTensor::new(&[1, 6, 3], data).unwrap();
        assert_eq!(t.select(0.5).unwrap().anchor, 1);
    }

    #[test]
    fn threshold_applies_to_global_maximum_only() {
        let t = standard_with(50, 3, [1.0, 1.0, 1.0, 1.0, 0.3]);
        assert!(t.select(0.5).is_none());
        let best = t.best_candidate().unwrap();
        assert_eq!(best.anchor, 3);
        assert!((best.bbox.confidence - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn confidence_equal_to_threshold_is_accepted() {
        let t = standard_with(4, 2, [1.0, 1.0, 1.0, 1.0, 0.5]);
        assert_eq!(t.select(0.5).unwrap().anchor, 2);
    }

    #[test]
    fn ties_keep_earliest_anchor() {
        let mut data = vec![0.0; 5 * 4];
        data[4 * 4 + 1] = 0.7;
        data[4 * 4 + 3] = 0.7;
        let t = DetectionTensor::new(&[1, 5, 4], data).unwrap();
        assert_eq!(t.best_candidate().unwrap().anchor, 1);
    }

    #[test]
    fn scaling_confidences_keeps_selected_index() {
        let confs = [0.12, 0.55, 0.31, 0.54, 0.05];
        let build = |scale: f32| {
            let mut data = vec![0.0; 5 * confs.len()];
            for (i, c) in confs.iter().enumerate() {
                data[4 * confs.len() + i] = c * scale;
            }
            DetectionTensor::new(&[1, 5, confs.len()], data).unwrap()
        };
        let base = build(1.0).best_candidate().unwrap().anchor;
        for scale in [0.01, 0.5, 3.0, 1000.0] {
            assert_eq!(build(scale).best_candidate().unwrap().anchor, base);
        }
    }

    #[test]
    fn nan_confidences_are_never_selected() {
        let mut data = vec![0.0; 5 * 3];
        data[12] = f32::NAN;
        data[13] = 0.2;
        data[14] = f32::NAN;
        let t = DetectionTensor::new(&[1, 5, 3], data).unwrap();
        assert_eq!(t.best_candidate().unwrap().anchor, 1);
    }

    #[test]
    fn zero_anchors_yield_no_candidate() {
        let standard = DetectionTensor::new(&[1, 5, 0], Vec::new()).unwrap();
        assert!(standard.best_candidate().is_none());
        let transposed = DetectionTensor::new(&[1, 0, 5], Vec::new()).unwrap();
        assert!(transposed.select(0.0).is_none());
    }

    #[test]
    fn rejects_malformed_shapes() {
        assert!(matches!(
            DetectionTensor::new(&[5, 8400], vec![0.0; 5 * 8400]),
            Err(Error::MalformedTensor(_))
        ));
        assert!(matches!(
            DetectionTensor::new(&[2, 5, 4], vec![0.0; 40]),
            Err(Error::MalformedTensor(_))
        ));
        assert!(matches!(
            DetectionTensor::new(&[1, 5, 4], vec![0.0; 19]),
            Err(Error::MalformedTensor(_))
        ));
        assert!(matches!(
            DetectionTensor::new(&[1, 3, 4], vec![0.0; 12]),
            Err(Error::MalformedTensor(_))
        ));
    }
}
