//! Anchor priors and strides for the three detection scales.
//!
//! Anchor sizes are expressed in grid-cell units of their own scale, so the
//! pixel size of an anchor is `anchor * stride`. With the default 352x352
//! input the grids are 44x44 (stride 8), 22x22 (stride 16) and 11x11
//! (stride 32).

use serde::{Deserialize, Serialize};

use crate::error::{Result, VisionError};

/// Prior box shape in grid-cell units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub width: f32,
    pub height: f32,
}

impl Anchor {
    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// One detection scale: its stride and the anchors predicted at each cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleSpec {
    pub stride: usize,
    pub anchors: Vec<Anchor>,
}

impl ScaleSpec {
    /// Side length of this scale's (square) output grid.
    pub fn grid_size(&self, input_size: usize) -> usize {
        input_size / self.stride
    }
}

/// Immutable table of per-scale anchors, ordered small -> large objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorTable {
    pub scales: Vec<ScaleSpec>,
}

const SCALE_NAMES: [&str; 3] = ["small", "medium", "large"];

impl Default for AnchorTable {
    fn default() -> Self {
        Self {
            scales: vec![
                // (12,16),(19,36),(40,28) px
                ScaleSpec {
                    stride: 8,
                    anchors: vec![
                        Anchor::new(1.25, 1.625),
                        Anchor::new(2.0, 3.75),
                        Anchor::new(4.125, 2.875),
                    ],
                },
                // (36,75),(76,55),(72,146) px
                ScaleSpec {
                    stride: 16,
                    anchors: vec![
                        Anchor::new(1.875, 3.8125),
                        Anchor::new(3.875, 2.8125),
                        Anchor::new(3.6875, 7.4375),
                    ],
                },
                ScaleSpec {
                    stride: 32,
                    anchors: vec![
                        Anchor::new(3.625, 2.8125),
                        Anchor::new(4.875, 6.1875),
                        Anchor::new(11.65625, 10.1875),
                    ],
                },
            ],
        }
    }
}

impl AnchorTable {
    pub fn num_scales(&self) -> usize {
        self.scales.len()
    }

    /// Anchors per scale. Only meaningful after [`AnchorTable::validate`].
    pub fn anchors_per_scale(&self) -> usize {
        self.scales.first().map_or(0, |s| s.anchors.len())
    }

    pub fn strides(&self) -> Vec<usize> {
        self.scales.iter().map(|s| s.stride).collect()
    }

    /// Human readable scale name used in logs.
    pub fn scale_name(&self, scale: usize) -> &'static str {
        SCALE_NAMES.get(scale).copied().unwrap_or("extra")
    }

    pub fn validate(&self, input_size: usize) -> Result<()> {
        if self.scales.is_empty() {
            return Err(VisionError::config("anchor table has no scales"));
        }
        let per_scale = self.anchors_per_scale();
        for (idx, scale) in self.scales.iter().enumerate() {
            if scale.stride == 0 || input_size % scale.stride != 0 {
                return Err(VisionError::config(format!(
                    "stride {} of scale {} does not divide input size {}",
                    scale.stride, idx, input_size
                )));
            }
            if scale.anchors.is_empty() {
                return Err(VisionError::config(format!("scale {} has no anchors", idx)));
            }
            if scale.anchors.len() != per_scale {
                return Err(VisionError::config(format!(
                    "scale {} has {} anchors, expected {}",
                    idx,
                    scale.anchors.len(),
                    per_scale
                )));
            }
            if let Some(bad) = scale
                .anchors
                .iter()
                .find(|a| !(a.width > 0.0 && a.height > 0.0))
            {
                return Err(VisionError::config(format!(
                    "scale {} has non-positive anchor {:?}",
                    idx, bad
                )));
            }
        }
        Ok(())
    }
}
