//! Orchestrator configuration: typed options plus a `(name, value)`
//! string-pair loader for callers that configure the engine dynamically
//! (mirroring the reference's `parse_transcriber_options`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current compile-time header version, `MAJOR*10000 + MINOR*100 + PATCH`.
pub const HEADER_VERSION: u32 = 10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelSource {
    Files,
    Memory,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelArch {
    Tiny,
    Base,
    TinyStreaming,
    BaseStreaming,
    SmallStreaming,
    MediumStreaming,
}

impl ModelArch {
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            ModelArch::TinyStreaming
                | ModelArch::BaseStreaming
                | ModelArch::SmallStreaming
                | ModelArch::MediumStreaming
        )
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub model_source: ModelSource,
    pub model_path: Option<PathBuf>,
    pub model_arch: ModelArch,
    pub transcription_interval_s: f32,
    pub vad_threshold: f32,
    pub vad_window_count: usize,
    pub vad_hop_size: usize,
    pub vad_look_behind_samples: usize,
    pub vad_max_segment_duration_s: f32,
    pub max_tokens_per_second: f32,
    pub identify_speakers: bool,
    pub speaker_id_cluster_threshold: f32,
    pub return_audio_data: bool,
    pub save_input_wav_path: Option<PathBuf>,
    pub log_ort_run: bool,
    pub skip_transcription: bool,
    pub header_version: u32,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            model_source: ModelSource::None,
            model_path: None,
            model_arch: ModelArch::Tiny,
            transcription_interval_s: 0.5,
            vad_threshold: 0.5,
            vad_window_count: 32,
            vad_hop_size: 512,
            vad_look_behind_samples: 4096,
            vad_max_segment_duration_s: 15.0,
            max_tokens_per_second: 6.5,
            identify_speakers: true,
            speaker_id_cluster_threshold: 0.8,
            return_audio_data: true,
            save_input_wav_path: None,
            log_ort_run: false,
            skip_transcription: false,
            header_version: HEADER_VERSION,
        }
    }
}

impl OrchestratorOptions {
    /// Applies a single `(name, value)` option pair, following the
    /// case-insensitive-name / error-on-unknown convention of the reference
    /// loader. Unknown names fail with `InvalidArgument`.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        match name.to_ascii_lowercase().as_str() {
            "model_source" => {
                self.model_source = match value.to_ascii_uppercase().as_str() {
                    "FILES" => ModelSource::Files,
                    "MEMORY" => ModelSource::Memory,
                    "NONE" => ModelSource::None,
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "unknown model_source '{other}'"
                        )))
                    }
                };
            }
            "model_path" => self.model_path = Some(PathBuf::from(value)),
            "model_arch" => {
                self.model_arch = match value.to_ascii_uppercase().as_str() {
                    "TINY" => ModelArch::Tiny,
                    "BASE" => ModelArch::Base,
                    "TINY_STREAMING" => ModelArch::TinyStreaming,
                    "BASE_STREAMING" => ModelArch::BaseStreaming,
                    "SMALL_STREAMING" => ModelArch::SmallStreaming,
                    "MEDIUM_STREAMING" => ModelArch::MediumStreaming,
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "unknown model_arch '{other}'"
                        )))
                    }
                };
            }
            "transcription_interval_s" => self.transcription_interval_s = parse_f32(value)?,
            "vad_threshold" => self.vad_threshold = parse_f32(value)?,
            "vad_window_count" => self.vad_window_count = parse_usize(value)?,
            "vad_hop_size" => self.vad_hop_size = parse_usize(value)?,
            "vad_look_behind_samples" => self.vad_look_behind_samples = parse_usize(value)?,
            "vad_max_segment_duration_s" => self.vad_max_segment_duration_s = parse_f32(value)?,
            "max_tokens_per_second" => self.max_tokens_per_second = parse_f32(value)?,
            "identify_speakers" => self.identify_speakers = parse_bool(value)?,
            "speaker_id_cluster_threshold" => {
                self.speaker_id_cluster_threshold = parse_f32(value)?
            }
            "return_audio_data" => self.return_audio_data = parse_bool(value)?,
            "save_input_wav_path" => self.save_input_wav_path = Some(PathBuf::from(value)),
            "log_ort_run" => self.log_ort_run = parse_bool(value)?,
            "skip_transcription" => self.skip_transcription = parse_bool(value)?,
            "header_version" => self.header_version = parse_u32(value)?,
            other => {
                return Err(Error::InvalidArgument(format!("unknown option name '{other}'")))
            }
        }
        Ok(())
    }

    /// Applies a batch of `(name, value)` pairs in order.
    pub fn apply_options(&mut self, pairs: &[(&str, &str)]) -> Result<()> {
        for (name, value) in pairs {
            self.set_option(name, value)?;
        }
        Ok(())
    }
}

fn parse_bool(input: &str) -> Result<bool> {
    match input.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::InvalidArgument(format!("invalid boolean string '{other}'"))),
    }
}

fn parse_f32(input: &str) -> Result<f32> {
    input
        .parse::<f32>()
        .map_err(|e| Error::InvalidArgument(format!("invalid float string '{input}': {e}")))
}

fn parse_usize(input: &str) -> Result<usize> {
    input
        .parse::<usize>()
        .map_err(|e| Error::InvalidArgument(format!("invalid integer string '{input}': {e}")))
}

fn parse_u32(input: &str) -> Result<u32> {
    input
        .parse::<u32>()
        .map_err(|e| Error::InvalidArgument(format!("invalid integer string '{input}': {e}")))
}

/// Streaming-model architecture config, deserialized from
/// `streaming_config.json` (field set fixed by the external model export).
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingModelConfig {
    pub encoder_dim: usize,
    pub decoder_dim: usize,
    pub depth: usize,
    pub nheads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
    pub bos_id: i64,
    pub eos_id: i64,
    pub frame_len: usize,
    pub total_lookahead: usize,
    pub d_model_frontend: usize,
    pub c1: usize,
    pub c2: usize,
    pub max_seq_len: usize,
}

/// Fixed architecture table for non-streaming (batch) arches, used when the
/// model directory carries no explicit config of its own.
#[derive(Debug, Clone, Copy)]
pub struct BatchArchParams {
    pub layers: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
}

pub fn batch_arch_params(arch: ModelArch) -> Result<BatchArchParams> {
    match arch {
        ModelArch::Tiny => Ok(BatchArchParams {
            layers: 6,
            kv_heads: 8,
            head_dim: 36,
        }),
        ModelArch::Base => Ok(BatchArchParams {
            layers: 8,
            kv_heads: 8,
            head_dim: 52,
        }),
        other => Err(Error::InvalidArgument(format!(
            "{other:?} is a streaming architecture; it has no fixed batch-arch table entry"
        ))),
    }
}
