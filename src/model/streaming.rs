//! Streaming transcriber: incremental frontend -> encoder -> adapter
//! pipeline feeding a persistent "memory" buffer, decoded with speculative
//! verification against a previously-produced token guess.
//!
//! Per-stream neural state (rolling sample/conv buffers, feature
//! accumulator, adapter position offset, memory accumulator, self/cross KV
//! caches) and the five-session layout (frontend, encoder, adapter,
//! cross_kv, decoder_kv) mirror the reference streaming model. The
//! cross-KV-survives-self-KV-reset invariant is preserved exactly: encoding
//! new audio invalidates the cross-attention cache (memory grew), but a
//! self-attention cache reset from speculative divergence never touches it.

use crate::config::StreamingModelConfig;
use crate::error::{Error, Result};
use crate::model::Transcriber;
use crate::onnx::{self, OnnxSessionOptions};
use crate::tokenizer::Tokenizer;
use ndarray::{Array1, Array2, Array3, ArrayD, Axis, IxDyn};
use ort::session::{Session, SessionInputs, SessionInputValue};
use ort::value::Tensor;
use parking_lot::Mutex;
use std::path::Path;

const FRONTEND_MODEL_FILE: &str = "frontend.ort";
const ENCODER_MODEL_FILE: &str = "encoder.ort";
const ADAPTER_MODEL_FILE: &str = "adapter.ort";
const CROSS_KV_MODEL_FILE: &str = "cross_kv.ort";
const DECODER_KV_MODEL_FILE: &str = "decoder_kv.ort";
const CONFIG_FILE: &str = "streaming_config.json";
const TOKENIZER_FILE: &str = "tokenizer.bin";

const SAMPLE_BUFFER_LEN: usize = 79;

/// Fixed rolling neural state for one streaming session. Reset by
/// [`StreamingTranscriber::reset_stream_state`] between independent
/// utterances; survives across repeated `process_audio_chunk`/`encode`/
/// `decode_full` calls within one.
struct StreamState {
    sample_buffer: Vec<f32>,
    sample_len: i64,
    conv1_buffer: Vec<f32>,
    conv2_buffer: Vec<f32>,
    frame_count: i64,

    accumulated_features: Vec<f32>,
    accumulated_feature_count: usize,

    encoder_frames_emitted: usize,
    adapter_pos_offset: i64,

    memory: Vec<f32>,
    memory_len: usize,

    k_self: Vec<f32>,
    v_self: Vec<f32>,
    cache_seq_len: usize,

    k_cross: Vec<f32>,
    v_cross: Vec<f32>,
    cross_len: usize,
    cross_kv_valid: bool,
}

impl StreamState {
    fn new(config: &StreamingModelConfig) -> Self {
        Self {
            sample_buffer: vec![0.0; SAMPLE_BUFFER_LEN],
            sample_len: 0,
            conv1_buffer: vec![0.0; config.d_model_frontend * 4],
            conv2_buffer: vec![0.0; config.c1 * 4],
            frame_count: 0,
            accumulated_features: Vec::new(),
            accumulated_feature_count: 0,
            encoder_frames_emitted: 0,
            adapter_pos_offset: 0,
            memory: Vec::new(),
            memory_len: 0,
            k_self: Vec::new(),
            v_self: Vec::new(),
            cache_seq_len: 0,
            k_cross: Vec::new(),
            v_cross: Vec::new(),
            cross_len: 0,
            cross_kv_valid: false,
        }
    }
}

pub struct StreamingTranscriber {
    frontend: Mutex<Session>,
    encoder: Mutex<Session>,
    adapter: Mutex<Session>,
    cross_kv: Mutex<Session>,
    decoder_kv: Mutex<Session>,
    tokenizer: Tokenizer,
    config: StreamingModelConfig,
    max_tokens_per_second: f32,
    state: Mutex<StreamState>,
}

impl StreamingTranscriber {
    pub fn load(
        model_dir: impl AsRef<Path>,
        max_tokens_per_second: f32,
        session_options: &OnnxSessionOptions,
    ) -> Result<Self> {
        let model_dir = model_dir.as_ref();

        let config_bytes = std::fs::read(model_dir.join(CONFIG_FILE))?;
        let config: StreamingModelConfig = serde_json::from_slice(&config_bytes)?;

        let frontend = onnx::load_session(model_dir.join(FRONTEND_MODEL_FILE), session_options)?;
        let encoder = onnx::load_session(model_dir.join(ENCODER_MODEL_FILE), session_options)?;
        let adapter = onnx::load_session(model_dir.join(ADAPTER_MODEL_FILE), session_options)?;
        let cross_kv = onnx::load_session(model_dir.join(CROSS_KV_MODEL_FILE), session_options)?;
        let decoder_kv =
            onnx::load_session(model_dir.join(DECODER_KV_MODEL_FILE), session_options)?;
        let tokenizer = Tokenizer::load_from_file(model_dir.join(TOKENIZER_FILE))?;

        let state = StreamState::new(&config);

        Ok(Self {
            frontend: Mutex::new(frontend),
            encoder: Mutex::new(encoder),
            adapter: Mutex::new(adapter),
            cross_kv: Mutex::new(cross_kv),
            decoder_kv: Mutex::new(decoder_kv),
            tokenizer,
            config,
            max_tokens_per_second,
            state: Mutex::new(state),
        })
    }

    /// Drops all neural state, returning the session to a fresh-stream
    /// state. Callers invoke this once per new utterance/VAD segment; the
    /// sessions themselves stay loaded and are reused.
    pub fn reset_stream_state(&self) {
        *self.state.lock() = StreamState::new(&self.config);
    }

    /// Runs the frontend over one chunk of audio, accumulating produced
    /// features into the running feature buffer. A no-op on an empty chunk.
    fn process_audio_chunk(&self, audio_chunk: &[f32]) -> Result<()> {
        if audio_chunk.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock();

        let audio_tensor =
            Tensor::from_array(Array2::from_shape_vec((1, audio_chunk.len()), audio_chunk.to_vec())
                .map_err(|e| Error::InferenceError(format!("invalid audio chunk shape: {e}")))?)?;
        let sample_buffer_tensor = Tensor::from_array(
            Array2::from_shape_vec((1, SAMPLE_BUFFER_LEN), state.sample_buffer.clone())
                .map_err(|e| Error::InferenceError(format!("invalid sample buffer shape: {e}")))?,
        )?;
        let sample_len_tensor = Tensor::from_array(Array1::from(vec![state.sample_len]))?;
        let conv1_tensor = Tensor::from_array(
            Array3::from_shape_vec((1, self.config.d_model_frontend, 4), state.conv1_buffer.clone())
                .map_err(|e| Error::InferenceError(format!("invalid conv1 buffer shape: {e}")))?,
        )?;
        let conv2_tensor = Tensor::from_array(
            Array3::from_shape_vec((1, self.config.c1, 4), state.conv2_buffer.clone())
                .map_err(|e| Error::InferenceError(format!("invalid conv2 buffer shape: {e}")))?,
        )?;
        let frame_count_tensor = Tensor::from_array(Array1::from(vec![state.frame_count]))?;

        let inputs: Vec<(String, SessionInputValue)> = vec![
            ("audio_chunk".to_string(), audio_tensor.into()),
            ("sample_buffer".to_string(), sample_buffer_tensor.into()),
            ("sample_len".to_string(), sample_len_tensor.into()),
            ("conv1_buffer".to_string(), conv1_tensor.into()),
            ("conv2_buffer".to_string(), conv2_tensor.into()),
            ("frame_count".to_string(), frame_count_tensor.into()),
        ];

        let mut session = self.frontend.lock();
        let outputs = session.run(SessionInputs::from(inputs))?;

        let features = outputs["features"].try_extract_array::<f32>()?;
        let feature_shape = features.shape();
        let num_features = feature_shape[1];
        let feat_dim = feature_shape[2];
        if num_features > 0 {
            state
                .accumulated_features
                .extend(features.iter().copied());
            debug_assert_eq!(
                state.accumulated_features.len(),
                (state.accumulated_feature_count + num_features) * feat_dim
            );
            state.accumulated_feature_count += num_features;
        }

        state.sample_buffer = outputs["sample_buffer_out"]
            .try_extract_array::<f32>()?
            .iter()
            .copied()
            .collect();
        state.sample_len = *outputs["sample_len_out"]
            .try_extract_array::<i64>()?
            .iter()
            .next()
            .ok_or_else(|| Error::InferenceError("empty sample_len_out".into()))?;
        state.conv1_buffer = outputs["conv1_buffer_out"]
            .try_extract_array::<f32>()?
            .iter()
            .copied()
            .collect();
        state.conv2_buffer = outputs["conv2_buffer_out"]
            .try_extract_array::<f32>()?
            .iter()
            .copied()
            .collect();
        state.frame_count = *outputs["frame_count_out"]
            .try_extract_array::<i64>()?
            .iter()
            .next()
            .ok_or_else(|| Error::InferenceError("empty frame_count_out".into()))?;

        Ok(())
    }

    /// Runs the encoder + adapter over whatever newly-stable frames have
    /// accumulated since the last call, appending the result to `memory`.
    /// `is_final` drops the lookahead margin so the tail of an utterance
    /// becomes stable immediately instead of waiting for future audio that
    /// will never arrive.
    fn encode(&self, is_final: bool) -> Result<usize> {
        let mut state = self.state.lock();
        let total_features = state.accumulated_feature_count;
        if total_features == 0 {
            return Ok(0);
        }

        let stable_count = if is_final {
            total_features
        } else {
            total_features.saturating_sub(self.config.total_lookahead)
        };
        if stable_count <= state.encoder_frames_emitted {
            return Ok(0);
        }
        let new_frames = stable_count - state.encoder_frames_emitted;

        let left_context_frames = 16 * self.config.depth;
        let window_start = state
            .encoder_frames_emitted
            .saturating_sub(left_context_frames);
        let window_size = total_features - window_start;

        let encoder_dim = self.config.encoder_dim;
        let window_start_elem = window_start * encoder_dim;
        let window_features = state.accumulated_features
            [window_start_elem..window_start_elem + window_size * encoder_dim]
            .to_vec();
        let features_tensor = Tensor::from_array(
            Array3::from_shape_vec((1, window_size, encoder_dim), window_features)
                .map_err(|e| Error::InferenceError(format!("invalid encoder window shape: {e}")))?,
        )?;

        let encoded = {
            let mut session = self.encoder.lock();
            let outputs =
                session.run(SessionInputs::from(vec![("features".to_string(), features_tensor.into())]))?;
            outputs["encoded"].try_extract_array::<f32>()?.to_owned()
        };
        let total_encoded = encoded.shape()[1];

        let start_idx = state.encoder_frames_emitted - window_start;
        if start_idx + new_frames > total_encoded {
            return Err(Error::InferenceError(format!(
                "encoder window misaligned: start_idx={start_idx}, new_frames={new_frames}, total={total_encoded}"
            )));
        }
        let new_encoded: Vec<f32> = encoded
            .index_axis(Axis(0), 0)
            .slice(ndarray::s![start_idx..start_idx + new_frames, ..])
            .iter()
            .copied()
            .collect();

        let encoded_slice_tensor = Tensor::from_array(
            Array3::from_shape_vec((1, new_frames, encoder_dim), new_encoded)
                .map_err(|e| Error::InferenceError(format!("invalid adapter input shape: {e}")))?,
        )?;
        let pos_tensor = Tensor::from_array(Array1::from(vec![state.adapter_pos_offset]))?;

        let memory_chunk = {
            let mut session = self.adapter.lock();
            let outputs = session.run(SessionInputs::from(vec![
                ("encoded".to_string(), encoded_slice_tensor.into()),
                ("pos_offset".to_string(), pos_tensor.into()),
            ]))?;
            outputs["memory"].try_extract_array::<f32>()?.to_owned()
        };

        state.memory.extend(memory_chunk.iter().copied());
        state.memory_len += new_frames;
        state.cross_kv_valid = false;
        state.encoder_frames_emitted = stable_count;
        state.adapter_pos_offset += new_frames as i64;

        Ok(new_frames)
    }

    fn ensure_cross_kv(&self, state: &mut StreamState) -> Result<()> {
        if state.cross_kv_valid {
            return Ok(());
        }
        if state.memory_len == 0 {
            return Err(Error::InferenceError(
                "memory is empty, cannot compute cross K/V".to_string(),
            ));
        }

        let memory_tensor = Tensor::from_array(
            Array3::from_shape_vec(
                (1, state.memory_len, self.config.decoder_dim),
                state.memory.clone(),
            )
            .map_err(|e| Error::InferenceError(format!("invalid memory shape: {e}")))?,
        )?;

        let mut session = self.cross_kv.lock();
        let outputs =
            session.run(SessionInputs::from(vec![("memory".to_string(), memory_tensor.into())]))?;
        let k_cross = outputs["k_cross"].try_extract_array::<f32>()?;
        let v_cross = outputs["v_cross"].try_extract_array::<f32>()?;
        let cross_len = k_cross.shape()[3];

        state.k_cross = k_cross.iter().copied().collect();
        state.v_cross = v_cross.iter().copied().collect();
        state.cross_len = cross_len;
        state.cross_kv_valid = true;
        Ok(())
    }

    /// Runs the decoder over `tokens` against the current self/cross KV
    /// caches, refreshing the self-attention cache from the outputs.
    /// Returns per-position logits flattened as `[tokens.len(), vocab_size]`.
    fn run_decoder_with_cross_kv(
        &self,
        state: &mut StreamState,
        tokens: &[i64],
    ) -> Result<Array2<f32>> {
        self.ensure_cross_kv(state)?;

        let depth = self.config.depth;
        let nheads = self.config.nheads;
        let head_dim = self.config.head_dim;
        let cache_len = state.cache_seq_len;

        if state.k_self.len() != depth * nheads * cache_len * head_dim {
            let size = depth * nheads * cache_len * head_dim;
            state.k_self = vec![0.0; size];
            state.v_self = vec![0.0; size];
        }

        let token_tensor =
            Tensor::from_array(Array2::from_shape_vec((1, tokens.len()), tokens.to_vec())
                .map_err(|e| Error::InferenceError(format!("invalid token shape: {e}")))?)?;
        let k_self_tensor = Tensor::from_array(
            ArrayD::from_shape_vec(IxDyn(&[depth, 1, nheads, cache_len, head_dim]), state.k_self.clone())
                .map_err(|e| Error::InferenceError(format!("invalid k_self shape: {e}")))?,
        )?;
        let v_self_tensor = Tensor::from_array(
            ArrayD::from_shape_vec(IxDyn(&[depth, 1, nheads, cache_len, head_dim]), state.v_self.clone())
                .map_err(|e| Error::InferenceError(format!("invalid v_self shape: {e}")))?,
        )?;
        let k_cross_tensor = Tensor::from_array(
            ArrayD::from_shape_vec(
                IxDyn(&[depth, 1, nheads, state.cross_len, head_dim]),
                state.k_cross.clone(),
            )
            .map_err(|e| Error::InferenceError(format!("invalid k_cross shape: {e}")))?,
        )?;
        let v_cross_tensor = Tensor::from_array(
            ArrayD::from_shape_vec(
                IxDyn(&[depth, 1, nheads, state.cross_len, head_dim]),
                state.v_cross.clone(),
            )
            .map_err(|e| Error::InferenceError(format!("invalid v_cross shape: {e}")))?,
        )?;

        let inputs: Vec<(String, SessionInputValue)> = vec![
            ("token".to_string(), token_tensor.into()),
            ("k_self".to_string(), k_self_tensor.into()),
            ("v_self".to_string(), v_self_tensor.into()),
            ("out_k_cross".to_string(), k_cross_tensor.into()),
            ("out_v_cross".to_string(), v_cross_tensor.into()),
        ];

        let mut session = self.decoder_kv.lock();
        let outputs = session.run(SessionInputs::from(inputs))?;

        let logits = outputs["logits"]
            .try_extract_array::<f32>()?
            .index_axis(Axis(0), 0)
            .to_owned();

        let new_k_self = outputs["out_k_self"].try_extract_array::<f32>()?;
        let new_cache_len = new_k_self.shape()[3];
        state.k_self = new_k_self.iter().copied().collect();
        state.v_self = outputs["out_v_self"]
            .try_extract_array::<f32>()?
            .iter()
            .copied()
            .collect();
        state.cache_seq_len = new_cache_len;

        Ok(logits)
    }

    /// Resets the decoder's self-attention cache only. Cross-attention K/V
    /// stays valid: it depends on `memory`, which hasn't changed, and is
    /// invalidated independently by [`Self::encode`] when it does.
    fn reset_self_attention_cache(state: &mut StreamState) {
        state.k_self.clear();
        state.v_self.clear();
        state.cache_seq_len = 0;
    }

    fn max_tokens(&self, memory_len: usize) -> usize {
        let duration_sec = memory_len as f32 * 0.020;
        let budget = (duration_sec * self.max_tokens_per_second).ceil() as usize;
        budget.min(self.config.max_seq_len).max(1)
    }

    /// Decodes to completion, optionally verifying a speculative token
    /// sequence from a prior partial decode first. Returns the newly decoded
    /// tokens (the speculative prefix is not re-included by this call; it
    /// is already known to the caller).
    ///
    /// On a full speculative match, decoding continues autoregressively from
    /// the one-past-the-end prediction with the self-attention cache intact.
    /// On a partial match, the self-attention cache (never the cross-
    /// attention cache) is reset and replayed over just the accepted prefix
    /// before continuing.
    pub fn decode_full(&self, speculative_tokens: Option<&[i64]>) -> Result<Vec<i64>> {
        let mut guard = self.state.lock();
        if guard.memory_len == 0 {
            return Ok(Vec::new());
        }

        let max_tokens = self.max_tokens(guard.memory_len);
        let mut result_tokens = Vec::new();
        let state: &mut StreamState = &mut guard;
        self.ensure_cross_kv(state)?;

        let continue_ar_decoding =
            |state: &mut StreamState, result_tokens: &mut Vec<i64>, start_token: i64| -> Result<()> {
                let mut current_token = start_token;
                while current_token != self.config.eos_id && result_tokens.len() < max_tokens {
                    result_tokens.push(current_token);
                    let logits = self.run_decoder_with_cross_kv(state, &[current_token])?;
                    current_token = argmax_row(&logits, 0)?;
                }
                Ok(())
            };

        match speculative_tokens {
            Some(speculative) if !speculative.is_empty() => {
                let mut tokens_with_bos = Vec::with_capacity(speculative.len() + 1);
                tokens_with_bos.push(self.config.bos_id);
                tokens_with_bos.extend_from_slice(speculative);

                let logits = self.run_decoder_with_cross_kv(state, &tokens_with_bos)?;
                let predictions: Vec<i64> = (0..tokens_with_bos.len())
                    .map(|t| argmax_row(&logits, t))
                    .collect::<Result<_>>()?;

                let mut diverge_point = 0usize;
                for (i, &speculated) in speculative.iter().enumerate() {
                    if predictions[i] == speculated {
                        diverge_point = i + 1;
                    } else {
                        break;
                    }
                }
                result_tokens.extend_from_slice(&speculative[..diverge_point]);

                if diverge_point == speculative.len() {
                    let final_pred = predictions[speculative.len()];
                    continue_ar_decoding(state, &mut result_tokens, final_pred)?;
                } else {
                    Self::reset_self_attention_cache(state);

                    let mut accepted_tokens = Vec::with_capacity(diverge_point + 1);
                    accepted_tokens.push(self.config.bos_id);
                    accepted_tokens.extend_from_slice(&speculative[..diverge_point]);

                    let logits2 = self.run_decoder_with_cross_kv(state, &accepted_tokens)?;
                    let new_pred = argmax_row(&logits2, diverge_point)?;
                    continue_ar_decoding(state, &mut result_tokens, new_pred)?;
                }
            }
            _ => {
                let logits = self.run_decoder_with_cross_kv(state, &[self.config.bos_id])?;
                let first_pred = argmax_row(&logits, 0)?;
                continue_ar_decoding(state, &mut result_tokens, first_pred)?;
            }
        }

        Ok(result_tokens)
    }
}

impl Transcriber for StreamingTranscriber {
    /// One-shot transcription of a whole utterance: resets per-stream state,
    /// feeds the whole buffer through the frontend in one chunk, encodes
    /// with `is_final=true` so the full utterance becomes stable
    /// immediately, then decodes with no speculative prefix.
    fn transcribe(&mut self, audio: &[f32]) -> Result<String> {
        self.reset_stream_state();
        self.process_audio_chunk(audio)?;
        self.encode(true)?;
        let tokens = self.decode_full(None)?;
        self.tokenizer.decode(&tokens, true)
    }
}

fn argmax_row(logits: &Array2<f32>, row: usize) -> Result<i64> {
    let row_view = logits
        .row(row.min(logits.nrows().saturating_sub(1)));
    let mut best_index = 0usize;
    let mut best_value = f32::NEG_INFINITY;
    for (index, &value) in row_view.iter().enumerate() {
        if value > best_value {
            best_value = value;
            best_index = index;
        }
    }
    Ok(best_index as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logits_from_rows(rows: &[Vec<f32>]) -> Array2<f32> {
        let cols = rows[0].len();
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Array2::from_shape_vec((rows.len(), cols), flat).unwrap()
    }

    #[test]
    fn argmax_row_picks_the_requested_timestep() {
        let logits = logits_from_rows(&[vec![9.0, 0.0, 0.0], vec![0.0, 0.0, 9.0]]);
        assert_eq!(argmax_row(&logits, 0).unwrap(), 0);
        assert_eq!(argmax_row(&logits, 1).unwrap(), 2);
    }

    #[test]
    fn fresh_stream_state_has_no_memory_or_cache() {
        let config = StreamingModelConfig {
            encoder_dim: 4,
            decoder_dim: 4,
            depth: 2,
            nheads: 2,
            head_dim: 2,
            vocab_size: 16,
            bos_id: 1,
            eos_id: 2,
            frame_len: 160,
            total_lookahead: 3,
            d_model_frontend: 4,
            c1: 4,
            c2: 4,
            max_seq_len: 64,
        };
        let state = StreamState::new(&config);
        assert_eq!(state.memory_len, 0);
        assert!(!state.cross_kv_valid);
        assert_eq!(state.cache_seq_len, 0);
        assert_eq!(state.sample_buffer.len(), SAMPLE_BUFFER_LEN);
    }

    #[test]
    fn reset_self_attention_cache_clears_only_self_kv() {
        let config = StreamingModelConfig {
            encoder_dim: 4,
            decoder_dim: 4,
            depth: 1,
            nheads: 1,
            head_dim: 2,
            vocab_size: 8,
            bos_id: 1,
            eos_id: 2,
            frame_len: 160,
            total_lookahead: 3,
            d_model_frontend: 4,
            c1: 4,
            c2: 4,
            max_seq_len: 64,
        };
        let mut state = StreamState::new(&config);
        state.k_self = vec![1.0; 4];
        state.v_self = vec![1.0; 4];
        state.cache_seq_len = 2;
        state.k_cross = vec![2.0; 4];
        state.v_cross = vec![2.0; 4];
        state.cross_len = 2;
        state.cross_kv_valid = true;

        StreamingTranscriber::reset_self_attention_cache(&mut state);

        assert!(state.k_self.is_empty());
        assert!(state.v_self.is_empty());
        assert_eq!(state.cache_seq_len, 0);
        // Cross K/V survives: memory hasn't changed.
        assert!(state.cross_kv_valid);
        assert_eq!(state.k_cross, vec![2.0; 4]);
    }
}
