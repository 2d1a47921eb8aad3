//! Anchor-based YOLO head decoding.
//!
//! For each stride (8, 16, 32) the network emits a tensor of shape
//! `[grid, grid, anchors, 5 + classes]`, channels `tx, ty, tw, th, obj`
//! followed by one logit per class.
//!
//! Decoding per cell `(gx, gy)` and anchor `(aw, ah)`:
//! cx = (sigmoid(tx) + gx) * stride
//! cy = (sigmoid(ty) + gy) * stride
//! w  = exp(tw) * aw * stride
//! h  = exp(th) * ah * stride
//!
//! Boxes are clipped to the model input and zero-area results are dropped.

use ndarray::{Array4, ArrayView1};

use crate::config::DetectorConfig;
use crate::detection::BBox;
use crate::error::{Result, VisionError};

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// First index of the largest value, `(0, -inf)` when empty.
pub(crate) fn argmax(values: impl Iterator<Item = f32>) -> (usize, f32) {
    values
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (idx, v)| {
            if v > best.1 {
                (idx, v)
            } else {
                best
            }
        })
}

/// Check every prediction against the configured grid/anchor layout.
pub fn check_prediction_shapes(
    predictions: &[Array4<f32>],
    config: &DetectorConfig,
) -> Result<()> {
    let num_scales = config.anchors.num_scales();
    if predictions.len() != num_scales {
        return Err(VisionError::config(format!(
            "expected {} prediction tensors, got {}",
            num_scales,
            predictions.len()
        )));
    }
    for (scale, pred) in predictions.iter().enumerate() {
        let expected = config
            .prediction_shape(scale)
            .ok_or_else(|| VisionError::config(format!("no anchors for scale {}", scale)))?;
        if pred.shape() != expected {
            return Err(VisionError::Shape {
                scale,
                expected: expected.to_vec(),
                actual: pred.shape().to_vec(),
            });
        }
    }
    Ok(())
}

fn decode_cell(
    cell: ArrayView1<f32>,
    grid_x: usize,
    grid_y: usize,
    anchor_w: f32,
    anchor_h: f32,
    stride: f32,
) -> BBox {
    let cx = (sigmoid(cell[0]) + grid_x as f32) * stride;
    let cy = (sigmoid(cell[1]) + grid_y as f32) * stride;
    let w = cell[2].exp() * anchor_w * stride;
    let h = cell[3].exp() * anchor_h * stride;

    let score = sigmoid(cell[4]);
    let (class_id, _) = argmax(cell.iter().skip(5).map(|&logit| sigmoid(logit)));

    BBox::from_center(cx, cy, w, h, score, class_id)
}

/// Decode raw per-scale predictions into candidate boxes in model-input pixels.
///
/// A tensor whose shape disagrees with the anchor table is a configuration
/// error; a scale without usable boxes simply contributes nothing.
pub fn decode_predictions(
    predictions: &[Array4<f32>],
    config: &DetectorConfig,
) -> Result<Vec<BBox>> {
    check_prediction_shapes(predictions, config)?;

    let limit = config.input_size as f32;
    let mut candidates = Vec::new();

    for (scale_idx, (pred, spec)) in predictions
        .iter()
        .zip(config.anchors.scales.iter())
        .enumerate()
    {
        let stride = spec.stride as f32;
        let before = candidates.len();
        let mut degenerate = 0usize;

        let grid = pred.shape()[0];
        for grid_y in 0..grid {
            for grid_x in 0..grid {
                for (anchor_idx, anchor) in spec.anchors.iter().enumerate() {
                    let cell = pred.slice(ndarray::s![grid_y, grid_x, anchor_idx, ..]);
                    let bbox =
                        decode_cell(cell, grid_x, grid_y, anchor.width, anchor.height, stride)
                            .clamped(limit);

                    if bbox.is_degenerate() {
                        degenerate += 1;
                        continue;
                    }
                    candidates.push(bbox);
                }
            }
        }

        log::debug!(
            "{} scale (stride {}): {} candidates, {} degenerate dropped",
            config.anchors.scale_name(scale_idx),
            spec.stride,
            candidates.len() - before,
            degenerate
        );
    }

    Ok(candidates)
}

/// Parse ONNX-runtime style `(shape, flat data)` outputs into per-scale tensors.
///
/// Outputs must be ordered small -> large scale and shaped either
/// `[1, grid, grid, anchors, 5 + classes]` or without the batch axis.
pub fn parse_raw_outputs(
    outputs: &[(&[i64], &[f32])],
    config: &DetectorConfig,
) -> Result<Vec<Array4<f32>>> {
    let num_scales = config.anchors.num_scales();
    let mut predictions = Vec::with_capacity(num_scales);

    for scale in 0..num_scales {
        let expected = config
            .prediction_shape(scale)
            .ok_or_else(|| VisionError::config(format!("no anchors for scale {}", scale)))?;
        let Some(&(shape, data)) = outputs.get(scale) else {
            return Err(VisionError::config(format!(
                "missing prediction output for scale {}",
                scale
            )));
        };

        let dims: Vec<usize> = match shape {
            [1, rest @ ..] if rest.len() == 4 => rest.iter().map(|&d| d.max(0) as usize).collect(),
            _ if shape.len() == 4 => shape.iter().map(|&d| d.max(0) as usize).collect(),
            _ => {
                return Err(VisionError::Shape {
                    scale,
                    expected: expected.to_vec(),
                    actual: shape.iter().map(|&d| d.max(0) as usize).collect(),
                })
            }
        };
        if dims != expected {
            return Err(VisionError::Shape {
                scale,
                expected: expected.to_vec(),
                actual: dims,
            });
        }

        let arr = Array4::from_shape_vec(
            (expected[0], expected[1], expected[2], expected[3]),
            data.to_vec(),
        )?;
        predictions.push(arr);
    }

    if outputs.len() > num_scales {
        log::warn!(
            "ignoring {} extra model outputs",
            outputs.len() - num_scales
        );
    }

    Ok(predictions)
}
