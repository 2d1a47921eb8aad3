#![allow(dead_code)]

use astroyolo_vision::DetectorConfig;
use ndarray::{s, Array4};

/// Predictions where every anchor is confidently empty: objectness logit
/// -10, zero offsets and zero size logits.
pub fn background_predictions(config: &DetectorConfig) -> Vec<Array4<f32>> {
    (0..config.anchors.num_scales())
        .map(|scale| {
            let [g, _, a, c] = config.prediction_shape(scale).unwrap();
            let mut arr = Array4::<f32>::zeros((g, g, a, c));
            arr.slice_mut(s![.., .., .., 4]).fill(-10.0);
            arr
        })
        .collect()
}

/// Set one anchor's raw channels `tx, ty, tw, th, obj`.
pub fn set_cell(
    preds: &mut [Array4<f32>],
    scale: usize,
    grid_y: usize,
    grid_x: usize,
    anchor: usize,
    raw: [f32; 5],
) {
    let mut cell = preds[scale].slice_mut(s![grid_y, grid_x, anchor, ..]);
    for (dst, v) in cell.iter_mut().zip(raw) {
        *dst = v;
    }
}
