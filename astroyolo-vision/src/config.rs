use serde::{Deserialize, Serialize};

use crate::anchors::AnchorTable;
use crate::error::{Result, VisionError};

/// What happens when two ground-truth boxes claim the same anchor cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Later boxes overwrite earlier ones.
    #[default]
    LastWriteWins,
    /// A cell is only overwritten by a box with strictly higher anchor IoU.
    KeepHighestIou,
}

/// Storage policy for the per-scale lists of assigned box geometries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxBuffer {
    #[default]
    Growable,
    /// Fixed `max_boxes_per_scale` slots, overflow wraps around (`count % cap`).
    Wrapping,
}

/// Everything the decode, suppression and assignment passes need.
///
/// Passed explicitly into every call; nothing is read from global state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Side length of the square model input, in pixels.
    pub input_size: usize,
    pub num_classes: usize,
    pub class_names: Vec<String>,
    pub conf_threshold: f32,
    pub nms_threshold: f32,
    /// Anchors whose IoU with a ground-truth box exceeds this become positives.
    pub anchor_iou_threshold: f32,
    pub label_smoothing: f32,
    pub max_boxes_per_scale: usize,
    pub conflict_policy: ConflictPolicy,
    pub box_buffer: BoxBuffer,
    pub anchors: AnchorTable,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_size: 352,
            num_classes: 1,
            class_names: vec!["bhb".to_string()],
            conf_threshold: 0.3,
            nms_threshold: 0.9,
            anchor_iou_threshold: 0.3,
            label_smoothing: 0.01,
            max_boxes_per_scale: 150,
            conflict_policy: ConflictPolicy::default(),
            box_buffer: BoxBuffer::default(),
            anchors: AnchorTable::default(),
        }
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(VisionError::config(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )))
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            return Err(VisionError::config("input size must be positive"));
        }
        self.anchors.validate(self.input_size)?;
        if self.num_classes == 0 {
            return Err(VisionError::config("num_classes must be at least 1"));
        }
        if !self.class_names.is_empty() && self.class_names.len() != self.num_classes {
            return Err(VisionError::config(format!(
                "{} class names given for {} classes",
                self.class_names.len(),
                self.num_classes
            )));
        }
        check_unit("conf_threshold", self.conf_threshold)?;
        check_unit("nms_threshold", self.nms_threshold)?;
        check_unit("anchor_iou_threshold", self.anchor_iou_threshold)?;
        check_unit("label_smoothing", self.label_smoothing)?;
        if self.max_boxes_per_scale == 0 {
            return Err(VisionError::config("max_boxes_per_scale must be positive"));
        }
        Ok(())
    }

    /// Channels per anchor in a raw prediction: `tx, ty, tw, th, obj, classes..`.
    pub fn prediction_channels(&self) -> usize {
        5 + self.num_classes
    }

    /// Channels per anchor in a label tensor: `cx, cy, w, h, obj, mix, classes..`.
    pub fn label_channels(&self) -> usize {
        6 + self.num_classes
    }

    /// Expected `[grid, grid, anchors, 5 + classes]` shape of a scale's prediction.
    pub fn prediction_shape(&self, scale: usize) -> Option<[usize; 4]> {
        let spec = self.anchors.scales.get(scale)?;
        let grid = spec.grid_size(self.input_size);
        Some([
            grid,
            grid,
            spec.anchors.len(),
            self.prediction_channels(),
        ])
    }

    pub fn class_name(&self, class_id: usize) -> Option<&str> {
        self.class_names.get(class_id).map(String::as_str)
    }
}
