//! Inference Adapter: wraps the `ort` ONNX Runtime session API behind a
//! narrow surface (load model, run named input tensors -> named output
//! tensors) so the rest of the engine never talks to `ort` types directly
//! outside this module and the model modules that use it.

use crate::error::{Error, Result};
use ndarray::{ArrayD, IxDyn};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Input, Output, Session};
use ort::value::{Tensor, ValueType};
use std::path::Path;
use std::sync::OnceLock;

static ORT_ENV_INITIALIZED: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Execution provider preference for ONNX sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionProviderPreference {
    #[default]
    CpuOnly,
    PreferGpu,
}

#[derive(Debug, Clone)]
pub struct OnnxSessionOptions {
    pub intra_threads: usize,
    pub inter_threads: usize,
    pub execution_provider: ExecutionProviderPreference,
    pub log_ort_run: bool,
}

impl Default for OnnxSessionOptions {
    fn default() -> Self {
        Self {
            intra_threads: 1,
            inter_threads: 1,
            execution_provider: ExecutionProviderPreference::CpuOnly,
            log_ort_run: false,
        }
    }
}

fn init_ort_environment() -> Result<()> {
    let result = ORT_ENV_INITIALIZED.get_or_init(|| {
        ort::init()
            .commit()
            .map(|_| ())
            .map_err(|e| e.to_string())
    });
    result.clone().map_err(Error::LoadError)
}

/// Loads an ONNX model file into a ready-to-run session.
pub fn load_session(path: impl AsRef<Path>, options: &OnnxSessionOptions) -> Result<Session> {
    init_ort_environment()?;

    let builder = Session::builder()
        .map_err(Error::from)?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(Error::from)?
        .with_intra_threads(options.intra_threads)
        .map_err(Error::from)?
        .with_inter_threads(options.inter_threads)
        .map_err(Error::from)?;

    #[cfg(feature = "ort-cuda")]
    let builder = if options.execution_provider == ExecutionProviderPreference::PreferGpu {
        use ort::execution_providers::cuda::CUDAExecutionProvider;
        builder
            .with_execution_providers([CUDAExecutionProvider::default().build()])
            .map_err(Error::from)?
    } else {
        builder
    };

    let path = path.as_ref();
    builder.commit_from_file(path).map_err(|e| {
        Error::LoadError(format!("failed to load ONNX model {}: {e}", path.display()))
    })
}

/// Loads an ONNX model from an in-memory byte buffer.
pub fn load_session_from_memory(data: &[u8], options: &OnnxSessionOptions) -> Result<Session> {
    init_ort_environment()?;

    let builder = Session::builder()
        .map_err(Error::from)?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(Error::from)?
        .with_intra_threads(options.intra_threads)
        .map_err(Error::from)?
        .with_inter_threads(options.inter_threads)
        .map_err(Error::from)?;

    builder
        .commit_from_memory(data)
        .map_err(|e| Error::LoadError(format!("failed to load ONNX model from memory: {e}")))
}

/// Wraps an owned `f32` buffer as an ONNX tensor of the given shape.
pub fn tensor_f32_from_vec(shape: &[usize], data: Vec<f32>) -> Result<Tensor<f32>> {
    let array = ArrayD::from_shape_vec(IxDyn(shape), data)
        .map_err(|e| Error::InferenceError(format!("tensor shape mismatch: {e}")))?;
    Tensor::from_array(array).map_err(Error::from)
}

/// Wraps an owned `i64` buffer as an ONNX tensor of the given shape.
pub fn tensor_i64_from_vec(shape: &[usize], data: Vec<i64>) -> Result<Tensor<i64>> {
    let array = ArrayD::from_shape_vec(IxDyn(shape), data)
        .map_err(|e| Error::InferenceError(format!("tensor shape mismatch: {e}")))?;
    Tensor::from_array(array).map_err(Error::from)
}

/// Resolves an input/output tensor name by trying exact candidate matches
/// first, then case-insensitive substring matches, falling back to "the
/// only tensor" when a graph exposes just one.
///
/// Mirrors the reference backend's candidate-name resolution: ONNX export
/// tooling is not consistent about input/output naming across checkpoints,
/// so graphs are matched by a list of plausible names rather than one fixed
/// string.
pub fn resolve_name(names: &[&str], candidates: &[&str], label: &str) -> Result<String> {
    if names.len() == 1 {
        return Ok(names[0].to_string());
    }
    for candidate in candidates {
        for name in names {
            if name.eq_ignore_ascii_case(candidate) {
                return Ok((*name).to_string());
            }
        }
    }
    for candidate in candidates {
        let candidate_lower = candidate.to_lowercase();
        for name in names {
            if name.to_lowercase().contains(&candidate_lower) {
                return Ok((*name).to_string());
            }
        }
    }
    Err(Error::LoadError(format!(
        "unable to resolve {label} (candidates: {candidates:?}, available: {names:?})"
    )))
}

pub fn resolve_input_name(inputs: &[Input], candidates: &[&str], label: &str) -> Result<String> {
    let names: Vec<&str> = inputs.iter().map(|i| i.name.as_str()).collect();
    resolve_name(&names, candidates, label)
}

pub fn resolve_output_name(outputs: &[Output], candidates: &[&str], label: &str) -> Result<String> {
    let names: Vec<&str> = outputs.iter().map(|o| o.name.as_str()).collect();
    resolve_name(&names, candidates, label)
}

pub fn resolve_optional_input_name(inputs: &[Input], candidates: &[&str]) -> Option<String> {
    for candidate in candidates {
        for input in inputs {
            if input.name.eq_ignore_ascii_case(candidate) {
                return Some(input.name.clone());
            }
        }
    }
    for candidate in candidates {
        let candidate_lower = candidate.to_lowercase();
        for input in inputs {
            if input.name.to_lowercase().contains(&candidate_lower) {
                return Some(input.name.clone());
            }
        }
    }
    None
}

/// Resolves an optional boolean-flag-like input (e.g. `use_cache_branch`),
/// returning both its name and element type so callers can build a
/// correctly-typed scalar tensor for it.
pub fn resolve_optional_flag_input(
    inputs: &[Input],
    candidates: &[&str],
) -> Option<(String, ort::tensor::TensorElementType)> {
    for candidate in candidates {
        for input in inputs {
            if input.name.eq_ignore_ascii_case(candidate) {
                if let ValueType::Tensor { ty, .. } = input.input_type {
                    return Some((input.name.clone(), ty));
                }
            }
        }
    }
    None
}

pub fn tensor_names_matching(names: &[String], predicate: impl Fn(&str) -> bool) -> Vec<String> {
    names.iter().filter(|n| predicate(n)).cloned().collect()
}
