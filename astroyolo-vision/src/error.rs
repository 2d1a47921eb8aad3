use thiserror::Error;

/// Errors raised by the detection and label-assignment core.
///
/// Empty results (no candidates, nothing surviving NMS, images without
/// ground truth) are never errors; they come back as empty collections.
#[derive(Error, Debug)]
pub enum VisionError {
    /// Anchor table, strides or thresholds do not describe a usable detector.
    #[error("invalid detector configuration: {0}")]
    Configuration(String),
    /// A prediction tensor disagrees with the configured grid/anchor layout.
    #[error("scale {scale}: expected tensor shape {expected:?}, got {actual:?}")]
    Shape {
        scale: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("malformed annotation: {0}")]
    Annotation(String),
    #[error(transparent)]
    Ndarray(#[from] ndarray::ShapeError),
}

impl VisionError {
    pub fn config(msg: impl Into<String>) -> Self {
        VisionError::Configuration(msg.into())
    }

    pub fn annotation(msg: impl Into<String>) -> Self {
        VisionError::Annotation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, VisionError>;
