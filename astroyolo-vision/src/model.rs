//! ONNX runtime session wrapper, only built with the `onnx` feature.
//!
//! Image preprocessing is left to the caller: `run` takes the already
//! normalised `[1, 3, S, S]` input tensor.

use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array4;
use ort::{
    ep::{self, ExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::Value,
};

use crate::config::DetectorConfig;
use crate::yolo;

pub fn session_builder() -> Result<SessionBuilder> {
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    #[cfg(feature = "openvino")]
    {
        let ep = ep::OpenVINO::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("openvino feature is enabled, onnx runtime not compiled with openvino")
        }
    }

    #[cfg(feature = "cuda")]
    {
        let ep = ep::CUDA::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("cuda feature is enabled, onnx runtime not compiled with cuda")
        }
    }

    Ok(builder)
}

pub fn session_from_file(path: &Path) -> Result<Session> {
    session_builder()?
        .commit_from_file(path)
        .with_context(|| format!("load detector model {}", path.display()))
}

/// Run the detector and return its per-scale raw predictions.
pub fn run(
    session: &mut Session,
    input: Array4<f32>,
    config: &DetectorConfig,
) -> Result<Vec<Array4<f32>>> {
    let expected = [1, 3, config.input_size, config.input_size];
    if input.shape() != expected {
        anyhow::bail!(
            "Expected model input {:?}, got {:?}",
            expected,
            input.shape()
        );
    }

    let input_tensor = Value::from_array(input)?;
    let outputs = session.run(ort::inputs![input_tensor])?;

    let mut output_data: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
    for (_name, output) in outputs.iter() {
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        output_data.push((shape.iter().copied().collect(), data.to_vec()));
    }

    let output_refs: Vec<(&[i64], &[f32])> = output_data
        .iter()
        .map(|(s, d)| (s.as_slice(), d.as_slice()))
        .collect();

    yolo::parse_raw_outputs(&output_refs, config).context("parsing detector outputs")
}
