use anyhow::{Context, Result};
use astroyolo_vision::{AssignedCell, BBox, DetectorConfig, LabelAssignment};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Detection as handed to the web layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// 1-based position in the result list.
    pub id: usize,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub class_id: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

impl Detection {
    pub fn from_boxes(boxes: &[BBox], config: Option<&DetectorConfig>) -> Vec<Detection> {
        boxes
            .iter()
            .enumerate()
            .map(|(i, b)| Detection {
                id: i + 1,
                confidence: b.score,
                x1: b.x1,
                y1: b.y1,
                x2: b.x2,
                y2: b.y2,
                class_id: b.class_id,
                class_name: config
                    .and_then(|c| c.class_name(b.class_id))
                    .map(str::to_string),
            })
            .collect()
    }
}

/// One raw model output tensor, row-major.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOutput {
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

/// JSON file of raw per-scale outputs, ordered small -> large scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOutputs {
    pub outputs: Vec<RawOutput>,
}

impl RawOutputs {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn as_refs(&self) -> Vec<(&[i64], &[f32])> {
        self.outputs
            .iter()
            .map(|o| (o.shape.as_slice(), o.data.as_slice()))
            .collect()
    }
}

/// Positive cells of one scale.
#[derive(Debug, Clone, Serialize)]
pub struct ScaleSummary {
    pub stride: usize,
    pub boxes_assigned: usize,
    pub positives: Vec<AssignedCell>,
}

/// Assignment result of one annotation line.
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentSummary {
    pub image: String,
    pub ground_truth: usize,
    pub scales: Vec<ScaleSummary>,
}

impl AssignmentSummary {
    pub fn new(image: &str, ground_truth: usize, assignment: &LabelAssignment) -> Self {
        Self {
            image: image.to_string(),
            ground_truth,
            scales: assignment
                .scales
                .iter()
                .map(|s| ScaleSummary {
                    stride: s.stride,
                    boxes_assigned: s.boxes.assigned(),
                    positives: s.label.positives(),
                })
                .collect(),
        }
    }
}

pub fn to_json<T: Serialize>(value: &T, pretty: bool) -> Result<String> {
    let out = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    Ok(out)
}
