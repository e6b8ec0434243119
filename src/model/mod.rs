//! Transcription backends: the non-streaming (batch) architecture and the
//! streaming architecture, behind a common [`Transcriber`] capability
//! interface the Orchestrator drives without caring which is loaded.

pub mod batch;
pub mod streaming;

use crate::error::Result;

pub const DECODER_START_TOKEN: i64 = 1;
pub const EOS_TOKEN: i64 = 2;

/// Runs one segment of audio through a loaded model and returns sanitized
/// text. Implemented by [`batch::BatchTranscriber`] and
/// [`streaming::StreamingTranscriber`].
pub trait Transcriber: Send {
    fn transcribe(&mut self, audio: &[f32]) -> Result<String>;
}
