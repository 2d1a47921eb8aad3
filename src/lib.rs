pub mod config;
pub mod record;

// Re-export vision types for convenience
pub use astroyolo_vision::{
    detection, labels, pipeline, yolo, BBox, Detector, DetectorConfig, GroundTruthBox,
    LabelAssignment,
};
pub use record::Detection;
