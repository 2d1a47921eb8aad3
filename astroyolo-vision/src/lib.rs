pub mod anchors;
pub mod config;
pub mod detection;
pub mod error;
pub mod labels;
#[cfg(feature = "onnx")]
pub mod model;
pub mod pipeline;
pub mod yolo;

// Re-export commonly used types
pub use anchors::{Anchor, AnchorTable, ScaleSpec};
pub use config::{BoxBuffer, ConflictPolicy, DetectorConfig};
pub use detection::{filter_by_confidence, iou, nms, nms_per_class, BBox};
pub use error::{Result, VisionError};
pub use labels::{
    assign_labels, AssignedCell, BoxList, GroundTruthBox, LabelAssignment, LabelTensor,
};
pub use pipeline::{decode_and_suppress, rescale, Detector};
