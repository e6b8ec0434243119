//! A real-time speech transcription engine: voice-activity segmentation,
//! ONNX-backed batch and streaming transcription models, online speaker
//! clustering, and an `Orchestrator` tying per-stream lifecycle together.
//!
//! Callers load an [`Orchestrator`](orchestrator::Orchestrator) with a
//! [`model::Transcriber`] implementation (and, optionally, a
//! [`orchestrator::SpeakerEmbeddingModel`]), then drive it through
//! `create_stream` / `start` / `add_audio_to_stream` / `transcribe_stream`.

pub mod clusterer;
pub mod config;
pub mod error;
pub mod intent;
pub mod model;
pub mod onnx;
pub mod orchestrator;
pub mod resampler;
pub mod tokenizer;
pub mod transcript;
pub mod utf8;
pub mod vad;

pub use config::{ModelArch, ModelSource, OrchestratorOptions};
pub use error::{Error, Result};
pub use model::Transcriber;
pub use orchestrator::{Orchestrator, SpeakerEmbeddingModel};
pub use transcript::{Line, Transcript};
