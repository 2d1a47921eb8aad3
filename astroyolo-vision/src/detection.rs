//! Candidate boxes and the passes applied to them after decoding:
//! confidence filtering, greedy non-maximum suppression and rescaling back
//! to the original image resolution.

use serde::{Deserialize, Serialize};

/// Axis-aligned detection in corner form.
///
/// Coordinates are pixels in either model-input space or original-image
/// space depending on the pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    pub class_id: usize,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32, class_id: usize) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            score,
            class_id,
        }
    }

    /// Build from center form.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32, score: f32, class_id: usize) -> Self {
        Self::new(
            cx - w / 2.0,
            cy - h / 2.0,
            cx + w / 2.0,
            cy + h / 2.0,
            score,
            class_id,
        )
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.width() > 0.0 && self.height() > 0.0)
    }

    fn same_geometry(&self, other: &BBox) -> bool {
        self.x1 == other.x1 && self.y1 == other.y1 && self.x2 == other.x2 && self.y2 == other.y2
    }

    /// Clip the corners into `[0, limit]` on both axes.
    pub fn clamped(&self, limit: f32) -> BBox {
        BBox {
            x1: self.x1.clamp(0.0, limit),
            y1: self.y1.clamp(0.0, limit),
            x2: self.x2.clamp(0.0, limit),
            y2: self.y2.clamp(0.0, limit),
            ..*self
        }
    }
}

/// Intersection over union of two boxes.
///
/// A zero-area box overlaps nothing, except an identical copy of itself.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;

    if union <= 0.0 {
        return if a.same_geometry(b) { 1.0 } else { 0.0 };
    }
    inter / union
}

/// Keep boxes with `score > threshold`.
pub fn filter_by_confidence(boxes: &[BBox], threshold: f32) -> Vec<BBox> {
    boxes
        .iter()
        .filter(|b| b.score > threshold)
        .copied()
        .collect()
}

/// Greedy class-agnostic non-maximum suppression.
///
/// Boxes are visited in descending score order, equal scores keep their
/// input order. Every box whose IoU with an already kept box is strictly
/// greater than `iou_threshold` is dropped.
pub fn nms(boxes: &[BBox], iou_threshold: f32) -> Vec<BBox> {
    if boxes.is_empty() {
        return vec![];
    }

    let mut sorted = boxes.to_vec();
    // stable: ties keep original order
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(sorted[i]);

        for j in (i + 1)..sorted.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&sorted[i], &sorted[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    log::trace!("nms kept {} of {} boxes", keep.len(), boxes.len());
    keep
}

/// Run [`nms`] separately for every class and merge the survivors by score.
pub fn nms_per_class(boxes: &[BBox], iou_threshold: f32) -> Vec<BBox> {
    let mut classes: Vec<usize> = boxes.iter().map(|b| b.class_id).collect();
    classes.sort_unstable();
    classes.dedup();

    let mut keep: Vec<BBox> = classes
        .into_iter()
        .flat_map(|class_id| {
            let same: Vec<BBox> = boxes
                .iter()
                .filter(|b| b.class_id == class_id)
                .copied()
                .collect();
            nms(&same, iou_threshold)
        })
        .collect();
    keep.sort_by(|a, b| b.score.total_cmp(&a.score));
    keep
}

/// Map boxes from the square model input back to an `(height, width)` image.
///
/// Only geometry changes; score and class are carried through. `input_size`
/// must be positive, as guaranteed by [`DetectorConfig::validate`].
///
/// [`DetectorConfig::validate`]: crate::config::DetectorConfig::validate
pub fn rescale(boxes: &[BBox], original_shape: (usize, usize), input_size: usize) -> Vec<BBox> {
    debug_assert!(input_size > 0, "rescale from a zero-sized input");
    let (height, width) = original_shape;
    let h_scale = height as f32 / input_size as f32;
    let w_scale = width as f32 / input_size as f32;

    boxes
        .iter()
        .map(|b| BBox {
            x1: b.x1 * w_scale,
            y1: b.y1 * h_scale,
            x2: b.x2 * w_scale,
            y2: b.y2 * h_scale,
            ..*b
        })
        .collect()
}
