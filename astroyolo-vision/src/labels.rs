//! Training-time anchor assignment.
//!
//! Every ground-truth box is compared against the anchors of each scale,
//! placed at the grid cell containing the box center. Anchors with IoU above
//! the positive threshold are assigned the box; when no anchor on any scale
//! qualifies, the single best anchor is used instead so that no box goes
//! without a target.
//!
//! Label tensor channels per anchor: `cx, cy, w, h` (pixels), objectness,
//! mixup weight, then the label-smoothed class distribution. Unassigned
//! cells have objectness 0 and the weight slot set to 1.

use ndarray::{s, Array2, Array3, Array4, ArrayView1, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::config::{BoxBuffer, ConflictPolicy, DetectorConfig};
use crate::detection::{iou, BBox};
use crate::error::{Result, VisionError};
use crate::yolo::argmax;

/// One annotated object of a training image, corner form in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub class_id: usize,
    /// Blend weight of the source image under mixup, 1.0 without mixup.
    pub mix_weight: f32,
}

impl GroundTruthBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, class_id: usize) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            class_id,
            mix_weight: 1.0,
        }
    }

    pub fn with_mix_weight(self, mix_weight: f32) -> Self {
        Self { mix_weight, ..self }
    }
}

/// One line of a detection annotation file.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub image: String,
    pub boxes: Vec<GroundTruthBox>,
}

fn parse_box_field(field: &str) -> Result<GroundTruthBox> {
    let values = field
        .split(',')
        .map(|v| {
            v.trim().parse::<f32>().map_err(|e| {
                VisionError::annotation(format!("bad number `{}` in `{}`: {}", v, field, e))
            })
        })
        .collect::<Result<Vec<f32>>>()?;

    let [x1, y1, x2, y2, class] = values[..] else {
        return Err(VisionError::annotation(format!(
            "expected `x1,y1,x2,y2,class`, got `{}`",
            field
        )));
    };
    if class < 0.0 || class.fract() != 0.0 {
        return Err(VisionError::annotation(format!(
            "class id must be a non-negative integer, got {}",
            class
        )));
    }
    Ok(GroundTruthBox::new(x1, y1, x2, y2, class as usize))
}

/// Parse `image_path x1,y1,x2,y2,class x1,y1,x2,y2,class ...`.
pub fn parse_annotation_line(line: &str) -> Result<Annotation> {
    let mut fields = line.split_whitespace();
    let image = fields
        .next()
        .ok_or_else(|| VisionError::annotation("empty annotation line"))?
        .to_string();
    let boxes = fields.map(parse_box_field).collect::<Result<Vec<_>>>()?;
    Ok(Annotation { image, boxes })
}

/// Weight two images' boxes for mixup: `lambda` for `org`, `1 - lambda` for `mix`.
pub fn mixup_weights(
    org: &[GroundTruthBox],
    mix: &[GroundTruthBox],
    lambda: f32,
) -> Vec<GroundTruthBox> {
    let lambda = lambda.clamp(0.0, 1.0);
    org.iter()
        .map(|b| b.with_mix_weight(lambda))
        .chain(mix.iter().map(|b| b.with_mix_weight(1.0 - lambda)))
        .collect()
}

/// One-hot vector with `delta` of the mass spread uniformly over all classes.
pub fn smooth_one_hot(class_id: usize, num_classes: usize, delta: f32) -> Vec<f32> {
    let uniform = delta / num_classes as f32;
    (0..num_classes)
        .map(|c| {
            let hot = if c == class_id { 1.0 } else { 0.0 };
            hot * (1.0 - delta) + uniform
        })
        .collect()
}

/// Dense per-scale training target of shape `[grid, grid, anchors, 6 + classes]`.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelTensor {
    data: Array4<f32>,
}

/// A positive cell read back out of a [`LabelTensor`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AssignedCell {
    pub grid_y: usize,
    pub grid_x: usize,
    pub anchor: usize,
    /// `cx, cy, w, h` in pixels.
    pub xywh: [f32; 4],
    pub mix_weight: f32,
    pub class_id: usize,
}

impl LabelTensor {
    pub fn new(grid: usize, anchors: usize, num_classes: usize) -> Self {
        let mut data = Array4::zeros((grid, grid, anchors, 6 + num_classes));
        data.slice_mut(s![.., .., .., 5]).fill(1.0);
        Self { data }
    }

    pub fn grid_size(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn view(&self) -> ArrayView4<f32> {
        self.data.view()
    }

    pub fn into_inner(self) -> Array4<f32> {
        self.data
    }

    pub fn cell(&self, grid_y: usize, grid_x: usize, anchor: usize) -> ArrayView1<f32> {
        self.data.slice(s![grid_y, grid_x, anchor, ..])
    }

    pub fn objectness(&self, grid_y: usize, grid_x: usize, anchor: usize) -> f32 {
        self.data[[grid_y, grid_x, anchor, 4]]
    }

    fn write(
        &mut self,
        grid_y: usize,
        grid_x: usize,
        anchor: usize,
        xywh: [f32; 4],
        mix_weight: f32,
        classes: &[f32],
    ) {
        let mut cell = self.data.slice_mut(s![grid_y, grid_x, anchor, ..]);
        for (dst, &v) in cell.iter_mut().zip(xywh.iter()) {
            *dst = v;
        }
        cell[4] = 1.0;
        cell[5] = mix_weight;
        for (dst, &v) in cell.slice_mut(s![6..]).iter_mut().zip(classes) {
            *dst = v;
        }
    }

    /// Every cell with objectness set, in row-major order.
    pub fn positives(&self) -> Vec<AssignedCell> {
        self.data
            .slice(s![.., .., .., 4])
            .indexed_iter()
            .filter(|&(_, &obj)| obj > 0.0)
            .map(|((grid_y, grid_x, anchor), _)| {
                let cell = self.cell(grid_y, grid_x, anchor);
                let (class_id, _) = argmax(cell.iter().skip(6).copied());
                AssignedCell {
                    grid_y,
                    grid_x,
                    anchor,
                    xywh: [cell[0], cell[1], cell[2], cell[3]],
                    mix_weight: cell[5],
                    class_id,
                }
            })
            .collect()
    }
}

/// Assigned box geometries (`cx, cy, w, h`) of one scale.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxList {
    boxes: Vec<[f32; 4]>,
    capacity: Option<usize>,
    assigned: usize,
}

impl BoxList {
    pub fn growable() -> Self {
        Self {
            boxes: Vec::new(),
            capacity: None,
            assigned: 0,
        }
    }

    /// Fixed number of zeroed slots; overflowing writes wrap to `count % capacity`.
    pub fn wrapping(capacity: usize) -> Self {
        Self {
            boxes: vec![[0.0; 4]; capacity],
            capacity: Some(capacity),
            assigned: 0,
        }
    }

    pub fn push(&mut self, xywh: [f32; 4]) {
        match self.capacity {
            None => self.boxes.push(xywh),
            Some(cap) => {
                if self.assigned == cap {
                    log::warn!(
                        "box buffer of {} slots is full, overwriting from the start",
                        cap
                    );
                }
                self.boxes[self.assigned % cap] = xywh;
            }
        }
        self.assigned += 1;
    }

    pub fn as_slice(&self) -> &[[f32; 4]] {
        &self.boxes
    }

    /// Number of boxes written, including ones lost to wrap-around.
    pub fn assigned(&self) -> usize {
        self.assigned
    }

    pub fn is_empty(&self) -> bool {
        self.assigned == 0
    }

    /// `[slots, 4]` array, zero rows included for a wrapping buffer.
    pub fn to_array(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.boxes.len(), 4), |(i, j)| self.boxes[i][j])
    }
}

/// Label tensor and box list of a single scale.
#[derive(Debug, Clone)]
pub struct ScaleTargets {
    pub stride: usize,
    pub label: LabelTensor,
    pub boxes: BoxList,
    // anchor IoU of the box currently owning each cell
    owner_iou: Array3<f32>,
}

impl ScaleTargets {
    fn new(stride: usize, grid: usize, anchors: usize, config: &DetectorConfig) -> Self {
        let boxes = match config.box_buffer {
            BoxBuffer::Growable => BoxList::growable(),
            BoxBuffer::Wrapping => BoxList::wrapping(config.max_boxes_per_scale),
        };
        Self {
            stride,
            label: LabelTensor::new(grid, anchors, config.num_classes),
            boxes,
            owner_iou: Array3::zeros((grid, grid, anchors)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn claim(
        &mut self,
        policy: ConflictPolicy,
        cell: (usize, usize),
        anchor: usize,
        anchor_iou: f32,
        xywh: [f32; 4],
        mix_weight: f32,
        classes: &[f32],
    ) -> bool {
        let (grid_y, grid_x) = cell;
        let occupied = self.label.objectness(grid_y, grid_x, anchor) > 0.0;
        if occupied {
            match policy {
                ConflictPolicy::LastWriteWins => {
                    log::trace!(
                        "cell ({}, {}) anchor {} reassigned to a later box",
                        grid_y,
                        grid_x,
                        anchor
                    );
                }
                ConflictPolicy::KeepHighestIou => {
                    if anchor_iou <= self.owner_iou[[grid_y, grid_x, anchor]] {
                        return false;
                    }
                }
            }
        }
        self.label.write(grid_y, grid_x, anchor, xywh, mix_weight, classes);
        self.owner_iou[[grid_y, grid_x, anchor]] = anchor_iou;
        true
    }
}

/// Result of assigning one image's ground truth, ordered small -> large scale.
#[derive(Debug, Clone)]
pub struct LabelAssignment {
    pub scales: Vec<ScaleTargets>,
}

impl LabelAssignment {
    pub fn positive_count(&self) -> usize {
        self.scales.iter().map(|s| s.label.positives().len()).sum()
    }

    pub fn into_parts(self) -> (Vec<LabelTensor>, Vec<BoxList>) {
        self.scales
            .into_iter()
            .map(|s| (s.label, s.boxes))
            .unzip()
    }
}

fn xywh_iou(a: [f32; 4], b: [f32; 4]) -> f32 {
    let a = BBox::from_center(a[0], a[1], a[2], a[3], 0.0, 0);
    let b = BBox::from_center(b[0], b[1], b[2], b[3], 0.0, 0);
    iou(&a, &b)
}

/// Corner box -> `cx, cy, w, h` kept inside a `size` x `size` input.
///
/// `None` when nothing of the box is left inside the input.
fn clamped_xywh(gt: &GroundTruthBox, size: usize) -> Option<[f32; 4]> {
    let limit = size as f32;
    let x1 = gt.x1.clamp(0.0, limit);
    let y1 = gt.y1.clamp(0.0, limit);
    let x2 = gt.x2.clamp(0.0, limit);
    let y2 = gt.y2.clamp(0.0, limit);
    if !(x2 > x1 && y2 > y1) {
        return None;
    }

    let mut xywh = [(x1 + x2) * 0.5, (y1 + y2) * 0.5, x2 - x1, y2 - y1];
    for v in xywh.iter_mut() {
        if v.trunc() >= limit {
            *v = limit - 1.0;
        }
        *v = v.max(0.0);
    }
    Some(xywh)
}

/// Build per-scale training targets for one image.
///
/// No ground truth yields all-background tensors and empty box lists.
pub fn assign_labels(
    ground_truth: &[GroundTruthBox],
    config: &DetectorConfig,
) -> Result<LabelAssignment> {
    config.validate()?;

    let anchors_per_scale = config.anchors.anchors_per_scale();
    let mut scales: Vec<ScaleTargets> = config
        .anchors
        .scales
        .iter()
        .map(|spec| {
            ScaleTargets::new(
                spec.stride,
                spec.grid_size(config.input_size),
                anchors_per_scale,
                config,
            )
        })
        .collect();

    for (gt_idx, gt) in ground_truth.iter().enumerate() {
        if gt.class_id >= config.num_classes {
            return Err(VisionError::annotation(format!(
                "box {} has class {} but only {} classes are configured",
                gt_idx, gt.class_id, config.num_classes
            )));
        }
        let Some(xywh) = clamped_xywh(gt, config.input_size) else {
            log::debug!("box {} lies outside the input, no target written", gt_idx);
            continue;
        };
        let classes = smooth_one_hot(gt.class_id, config.num_classes, config.label_smoothing);

        let mut cells = Vec::with_capacity(scales.len());
        let mut all_ious = Vec::with_capacity(scales.len() * anchors_per_scale);
        let mut exist_positive = false;

        for (scale_idx, (spec, targets)) in config
            .anchors
            .scales
            .iter()
            .zip(scales.iter_mut())
            .enumerate()
        {
            let stride = spec.stride as f32;
            let scaled = xywh.map(|v| v / stride);
            let last = targets.label.grid_size() - 1;
            let grid_x = (scaled[0].floor() as usize).min(last);
            let grid_y = (scaled[1].floor() as usize).min(last);
            cells.push((grid_y, grid_x));

            let ious: Vec<f32> = spec
                .anchors
                .iter()
                .map(|a| {
                    xywh_iou(
                        scaled,
                        [grid_x as f32 + 0.5, grid_y as f32 + 0.5, a.width, a.height],
                    )
                })
                .collect();

            let mut claimed = 0;
            for (anchor, &anchor_iou) in ious.iter().enumerate() {
                if anchor_iou > config.anchor_iou_threshold {
                    exist_positive = true;
                    if targets.claim(
                        config.conflict_policy,
                        (grid_y, grid_x),
                        anchor,
                        anchor_iou,
                        xywh,
                        gt.mix_weight,
                        &classes,
                    ) {
                        claimed += 1;
                    }
                }
            }
            if claimed > 0 {
                targets.boxes.push(xywh);
                log::trace!(
                    "box {} -> {} scale, cell ({}, {}), {} anchors",
                    gt_idx,
                    config.anchors.scale_name(scale_idx),
                    grid_y,
                    grid_x,
                    claimed
                );
            }
            all_ious.extend(ious);
        }

        if !exist_positive {
            let (best, best_iou) = argmax(all_ious.iter().copied());
            let scale_idx = best / anchors_per_scale;
            let anchor = best % anchors_per_scale;
            log::debug!(
                "box {} below IoU threshold on every anchor, falling back to {} scale anchor {} (IoU {:.3})",
                gt_idx,
                config.anchors.scale_name(scale_idx),
                anchor,
                best_iou
            );

            let targets = &mut scales[scale_idx];
            if targets.claim(
                config.conflict_policy,
                cells[scale_idx],
                anchor,
                best_iou,
                xywh,
                gt.mix_weight,
                &classes,
            ) {
                targets.boxes.push(xywh);
            }
        }
    }

    Ok(LabelAssignment { scales })
}
