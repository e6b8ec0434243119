//! Batch (non-streaming) transcriber: one encoder pass over the full
//! utterance, then autoregressive KV-cached decode to end-of-sequence.
//!
//! Tensor-running mechanics (session mutex, named I/O resolution, ndarray
//! <-> ort conversion) are ported from `backend/moonshine/backend.rs`'s
//! `greedy_decode_cached`. The decode-loop contract itself (start token,
//! `use_cache_branch` flag, per-layer zero-initialized KV tensors, argmax to
//! EOS) follows the architecture table and loop description.

use crate::config::{batch_arch_params, BatchArchParams, ModelArch};
use crate::error::{Error, Result};
use crate::model::{Transcriber, DECODER_START_TOKEN, EOS_TOKEN};
use crate::onnx::{self, OnnxSessionOptions};
use crate::tokenizer::Tokenizer;
use ndarray::{Array2, ArrayD, Axis, IxDyn};
use ort::session::{Input, Output, Session, SessionInputs, SessionInputValue};
use ort::value::Tensor;
use parking_lot::Mutex;
use std::path::Path;

const ENCODER_MODEL_FILE: &str = "encoder_model.ort";
const DECODER_MODEL_FILE: &str = "decoder_model_merged.ort";
const TOKENIZER_FILE: &str = "tokenizer.bin";

/// One layer's four cache tensor names: decoder self-attention and
/// encoder-side cross-attention, each with a key and a value.
struct LayerCacheNames {
    past_decoder_key: String,
    past_decoder_value: String,
    past_encoder_key: String,
    past_encoder_value: String,
    present_decoder_key: String,
    present_decoder_value: String,
    present_encoder_key: String,
    present_encoder_value: String,
}

pub struct BatchTranscriber {
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
    tokenizer: Tokenizer,
    arch: BatchArchParams,
    max_tokens_per_second: f32,

    encoder_input_name: String,
    encoder_attention_mask_name: Option<String>,
    encoder_output_name: String,
    decoder_input_ids_name: String,
    decoder_encoder_states_name: String,
    decoder_use_cache_branch: Option<(String, ort::tensor::TensorElementType)>,
    decoder_logits_name: String,
    layer_caches: Vec<LayerCacheNames>,
}

impl BatchTranscriber {
    pub fn load(
        model_dir: impl AsRef<Path>,
        arch: ModelArch,
        max_tokens_per_second: f32,
        session_options: &OnnxSessionOptions,
    ) -> Result<Self> {
        let arch_params = batch_arch_params(arch)?;
        let model_dir = model_dir.as_ref();

        let encoder = onnx::load_session(model_dir.join(ENCODER_MODEL_FILE), session_options)?;
        let decoder = onnx::load_session(model_dir.join(DECODER_MODEL_FILE), session_options)?;
        let tokenizer = Tokenizer::load_from_file(model_dir.join(TOKENIZER_FILE))?;

        let encoder_input_name = onnx::resolve_input_name(
            &encoder.inputs,
            &["input_features", "input_values", "features", "input"],
            "encoder input",
        )?;
        let encoder_output_name = onnx::resolve_output_name(
            &encoder.outputs,
            &["encoder_hidden_states", "last_hidden_state", "output"],
            "encoder output",
        )?;

        let decoder_input_ids_name = onnx::resolve_input_name(
            &decoder.inputs,
            &["input_ids", "tokens", "decoder_input_ids"],
            "decoder input_ids",
        )?;
        let decoder_encoder_states_name = onnx::resolve_input_name(
            &decoder.inputs,
            &[
                "encoder_hidden_states",
                "encoder_outputs",
                "encoder_hidden_state",
            ],
            "decoder encoder_hidden_states",
        )?;
        let encoder_attention_mask_name =
            onnx::resolve_optional_input_name(&encoder.inputs, &["attention_mask"]);
        let decoder_use_cache_branch =
            onnx::resolve_optional_flag_input(&decoder.inputs, &["use_cache_branch", "use_cache"]);
        let decoder_logits_name =
            onnx::resolve_output_name(&decoder.outputs, &["logits", "output"], "decoder logits")?;

        let layer_caches = resolve_layer_caches(&decoder.inputs, &decoder.outputs, arch_params.layers)?;

        Ok(Self {
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            tokenizer,
            arch: arch_params,
            max_tokens_per_second,
            encoder_input_name,
            encoder_attention_mask_name,
            encoder_output_name,
            decoder_input_ids_name,
            decoder_encoder_states_name,
            decoder_use_cache_branch,
            decoder_logits_name,
            layer_caches,
        })
    }

    fn encode(&self, audio: &[f32]) -> Result<ArrayD<f32>> {
        let features = Array2::from_shape_vec((1, audio.len()), audio.to_vec())
            .map_err(|e| Error::InferenceError(format!("invalid audio buffer shape: {e}")))?;
        let features_tensor = Tensor::from_array(features)?;

        let mut inputs: Vec<(String, SessionInputValue)> =
            vec![(self.encoder_input_name.clone(), features_tensor.into())];
        if let Some(mask_name) = &self.encoder_attention_mask_name {
            let mask = Array2::from_shape_vec((1, audio.len()), vec![1i64; audio.len()])
                .map_err(|e| Error::InferenceError(format!("invalid attention mask shape: {e}")))?;
            inputs.push((mask_name.clone(), Tensor::from_array(mask)?.into()));
        }

        let mut session = self.encoder.lock();
        let outputs = session.run(SessionInputs::from(inputs))?;
        let array = outputs[self.encoder_output_name.as_str()]
            .try_extract_array::<f32>()?
            .to_owned();
        Ok(array)
    }

    fn max_len(&self, audio_len: usize) -> usize {
        let seconds = audio_len as f32 / crate::vad::INTERNAL_SAMPLE_RATE;
        (seconds * self.max_tokens_per_second).ceil().max(1.0) as usize
    }

    fn zero_cache_value(&self) -> Result<ort::value::DynValue> {
        let shape = [1usize, self.arch.kv_heads, 1, self.arch.head_dim];
        let data = vec![0.0f32; shape.iter().product()];
        Ok(onnx::tensor_f32_from_vec(&shape, data)?.into_dyn())
    }

    fn decode(&self, encoder_states: &ArrayD<f32>, max_len: usize) -> Result<Vec<i64>> {
        let encoder_tensor = Tensor::from_array(encoder_states.clone())?;
        let mut tokens = vec![DECODER_START_TOKEN];

        // present.<layer>.<side>.<key|value> from the previous step, indexed
        // in the same order as `self.layer_caches`. Zero-initialized before
        // the first step, per spec.
        let mut present_decoder: Vec<(ort::value::DynValue, ort::value::DynValue)> = self
            .layer_caches
            .iter()
            .map(|_| Ok((self.zero_cache_value()?, self.zero_cache_value()?)))
            .collect::<Result<Vec<_>>>()?;
        let mut present_encoder: Vec<(ort::value::DynValue, ort::value::DynValue)> = self
            .layer_caches
            .iter()
            .map(|_| Ok((self.zero_cache_value()?, self.zero_cache_value()?)))
            .collect::<Result<Vec<_>>>()?;

        for step in 0..max_len {
            let use_cache = step > 0;
            let input_token = *tokens.last().unwrap();
            let input_ids = Array2::from_shape_vec((1, 1), vec![input_token])
                .map_err(|e| Error::InferenceError(format!("invalid input_ids shape: {e}")))?;
            let input_ids_tensor = Tensor::from_array(input_ids)?;

            let mut inputs: Vec<(String, SessionInputValue)> = vec![
                (self.decoder_input_ids_name.clone(), input_ids_tensor.into()),
                (
                    self.decoder_encoder_states_name.clone(),
                    (&encoder_tensor).into(),
                ),
            ];
            if let Some((name, element_type)) = &self.decoder_use_cache_branch {
                inputs.push((name.clone(), scalar_bool(use_cache, *element_type)?.into()));
            }
            for (index, names) in self.layer_caches.iter().enumerate() {
                inputs.push((names.past_decoder_key.clone(), (&present_decoder[index].0).into()));
                inputs.push((names.past_decoder_value.clone(), (&present_decoder[index].1).into()));
                inputs.push((names.past_encoder_key.clone(), (&present_encoder[index].0).into()));
                inputs.push((names.past_encoder_value.clone(), (&present_encoder[index].1).into()));
            }

            let mut session = self.decoder.lock();
            let mut outputs = session.run(SessionInputs::from(inputs))?;

            let logits = outputs[self.decoder_logits_name.as_str()]
                .try_extract_array::<f32>()?
                .to_owned();
            let next_token = argmax_last_step(&logits)?;

            for (index, names) in self.layer_caches.iter().enumerate() {
                let key = outputs
                    .remove(names.present_decoder_key.as_str())
                    .ok_or_else(|| Error::InferenceError("missing decoder present key".into()))?;
                let value = outputs
                    .remove(names.present_decoder_value.as_str())
                    .ok_or_else(|| Error::InferenceError("missing decoder present value".into()))?;
                present_decoder[index] = (key, value);

                // Encoder-side cross-attention K/V is fixed after the first
                // decode step; only refresh it then.
                if !use_cache {
                    let key = outputs
                        .remove(names.present_encoder_key.as_str())
                        .ok_or_else(|| Error::InferenceError("missing encoder present key".into()))?;
                    let value = outputs
                        .remove(names.present_encoder_value.as_str())
                        .ok_or_else(|| Error::InferenceError("missing encoder present value".into()))?;
                    present_encoder[index] = (key, value);
                }
            }

            tokens.push(next_token);
            if next_token == EOS_TOKEN {
                break;
            }
        }

        // Strip the leading start token (and trailing EOS if present).
        tokens.remove(0);
        if tokens.last() == Some(&EOS_TOKEN) {
            tokens.pop();
        }
        Ok(tokens)
    }
}

impl Transcriber for BatchTranscriber {
    fn transcribe(&mut self, audio: &[f32]) -> Result<String> {
        let encoder_states = self.encode(audio)?;
        let max_len = self.max_len(audio.len());
        let tokens = self.decode(&encoder_states, max_len)?;
        self.tokenizer.decode(&tokens, true)
    }
}

fn scalar_bool(
    value: bool,
    element_type: ort::tensor::TensorElementType,
) -> Result<ort::value::DynValue> {
    use ort::tensor::TensorElementType as T;
    match element_type {
        T::Bool => Ok(Tensor::from_array(ndarray::Array1::from(vec![value]))?.into_dyn()),
        T::Int64 => Ok(Tensor::from_array(ndarray::Array1::from(vec![if value { 1i64 } else { 0i64 }]))?
            .into_dyn()),
        T::Int32 => Ok(Tensor::from_array(ndarray::Array1::from(vec![if value { 1i32 } else { 0i32 }]))?
            .into_dyn()),
        other => Err(Error::InferenceError(format!(
            "unsupported use_cache_branch element type: {other:?}"
        ))),
    }
}

fn argmax_last_step(logits: &ArrayD<f32>) -> Result<i64> {
    let vector = match logits.ndim() {
        1 => logits.view().into_dimensionality::<ndarray::Ix1>().map_err(|e| {
            Error::InferenceError(format!("unexpected logits shape: {e}"))
        })?,
        2 => {
            let last_row = logits.shape()[0].saturating_sub(1);
            return argmax_1d(&logits.index_axis(Axis(0), last_row).to_owned());
        }
        3 => {
            let batch = logits.index_axis(Axis(0), 0);
            let last_row = batch.shape()[0].saturating_sub(1);
            return argmax_1d(&batch.index_axis(Axis(0), last_row).to_owned());
        }
        other => {
            return Err(Error::InferenceError(format!(
                "unsupported logits rank: {other}"
            )))
        }
    };
    argmax_1d(&vector.to_owned())
}

fn argmax_1d(vector: &ndarray::Array1<f32>) -> Result<i64> {
    let mut best_index = 0usize;
    let mut best_value = f32::NEG_INFINITY;
    for (index, &value) in vector.iter().enumerate() {
        if value > best_value {
            best_value = value;
            best_index = index;
        }
    }
    Ok(best_index as i64)
}

fn resolve_layer_caches(
    inputs: &[Input],
    outputs: &[Output],
    layers: usize,
) -> Result<Vec<LayerCacheNames>> {
    let input_names: Vec<&str> = inputs.iter().map(|i| i.name.as_str()).collect();
    let output_names: Vec<&str> = outputs.iter().map(|o| o.name.as_str()).collect();

    (0..layers)
        .map(|layer| {
            Ok(LayerCacheNames {
                past_decoder_key: resolve_layer_name(&input_names, layer, "decoder", "key", "past")?,
                past_decoder_value: resolve_layer_name(&input_names, layer, "decoder", "value", "past")?,
                past_encoder_key: resolve_layer_name(&input_names, layer, "encoder", "key", "past")?,
                past_encoder_value: resolve_layer_name(&input_names, layer, "encoder", "value", "past")?,
                present_decoder_key: resolve_layer_name(&output_names, layer, "decoder", "key", "present")?,
                present_decoder_value: resolve_layer_name(&output_names, layer, "decoder", "value", "present")?,
                present_encoder_key: resolve_layer_name(&output_names, layer, "encoder", "key", "present")?,
                present_encoder_value: resolve_layer_name(&output_names, layer, "encoder", "value", "present")?,
            })
        })
        .collect()
}

fn resolve_layer_name(
    names: &[&str],
    layer: usize,
    side: &str,
    kv: &str,
    stage: &str,
) -> Result<String> {
    let candidates = [
        format!("{stage}_key_values.{layer}.{side}.{kv}"),
        format!("{stage}.{layer}.{side}.{kv}"),
        format!("{stage}_key_values.{layer}.{side}_{kv}"),
    ];
    let candidate_refs: Vec<&str> = candidates.iter().map(|s| s.as_str()).collect();
    onnx::resolve_name(
        names,
        &candidate_refs,
        &format!("{stage} cache tensor (layer {layer}, {side}, {kv})"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_1d_picks_the_largest_logit() {
        let vector = ndarray::Array1::from(vec![0.1f32, 5.0, -2.0, 4.9]);
        assert_eq!(argmax_1d(&vector).unwrap(), 1);
    }

    #[test]
    fn argmax_last_step_uses_the_final_timestep_for_rank_two_logits() {
        let logits = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![9.0, 0.0, 0.0, 0.0, 0.0, 9.0])
            .unwrap();
        assert_eq!(argmax_last_step(&logits).unwrap(), 2);
    }
}
