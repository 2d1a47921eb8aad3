use ndarray::Array4;

use crate::config::DetectorConfig;
use crate::detection::{self, BBox};
use crate::error::Result;
use crate::labels::{self, GroundTruthBox, LabelAssignment};
use crate::yolo;

/// Full inference pipeline: decode -> confidence filter -> NMS -> rescale.
///
/// Holds only an already validated configuration, so one detector can be
/// shared freely between threads working on different images.
#[derive(Debug, Clone)]
pub struct Detector {
    config: DetectorConfig,
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Detections in model-input pixel space.
    pub fn decode_and_suppress(&self, predictions: &[Array4<f32>]) -> Result<Vec<BBox>> {
        decode_and_suppress(predictions, &self.config)
    }

    /// Detections in the pixel space of an `(height, width)` original image.
    pub fn detect(
        &self,
        predictions: &[Array4<f32>],
        original_shape: (usize, usize),
    ) -> Result<Vec<BBox>> {
        let boxes = self.decode_and_suppress(predictions)?;
        Ok(rescale(&boxes, original_shape, self.config.input_size))
    }

    /// Same as [`Detector::detect`] for ONNX-runtime style outputs.
    pub fn detect_raw(
        &self,
        outputs: &[(&[i64], &[f32])],
        original_shape: (usize, usize),
    ) -> Result<Vec<BBox>> {
        let predictions = yolo::parse_raw_outputs(outputs, &self.config)?;
        self.detect(&predictions, original_shape)
    }

    pub fn assign_labels(&self, ground_truth: &[GroundTruthBox]) -> Result<LabelAssignment> {
        labels::assign_labels(ground_truth, &self.config)
    }
}

/// Decode, drop boxes at or below `conf_threshold`, then merge duplicates
/// above `nms_threshold`.
pub fn decode_and_suppress(
    predictions: &[Array4<f32>],
    config: &DetectorConfig,
) -> Result<Vec<BBox>> {
    let candidates = yolo::decode_predictions(predictions, config)?;
    let confident = detection::filter_by_confidence(&candidates, config.conf_threshold);
    let kept = detection::nms(&confident, config.nms_threshold);

    log::debug!(
        "{} candidates, {} above confidence {}, {} after NMS",
        candidates.len(),
        confident.len(),
        config.conf_threshold,
        kept.len()
    );
    Ok(kept)
}

pub fn rescale(boxes: &[BBox], original_shape: (usize, usize), input_size: usize) -> Vec<BBox> {
    detection::rescale(boxes, original_shape, input_size)
}
