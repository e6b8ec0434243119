//! The transcription orchestrator: per-stream lifecycle, transcript
//! assembly with stable line identity, and speaker-cluster assignment.
//!
//! Ported from the reference `Transcriber` class (confusingly named the
//! same as this crate's [`crate::model::Transcriber`]; renamed here to
//! avoid the collision). Locking follows `parking_lot`, matching this
//! crate's own `Mutex<Session>` idiom rather than the reference's
//! `std::mutex`: one mutex over the stream map for lookup/insert/remove,
//! one mutex per stream for its VAD/transcript state, one mutex around the
//! loaded model (inference is not safely reentrant per session).

mod debug_wav;

use crate::clusterer::{OnlineClusterer, OnlineClustererOptions};
use crate::config::OrchestratorOptions;
use crate::error::{Error, Result};
use crate::model::Transcriber;
use crate::resampler::resample_audio;
use crate::transcript::{LineIdTracker, Transcript};
use crate::vad::{VadOptions, VoiceActivityDetector, INTERNAL_SAMPLE_RATE};
use debug_wav::DebugWavWriter;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

/// Forces `transcribe_stream` to process the pending buffer even if it's
/// shorter than `transcription_interval_s`.
pub const FLAG_FORCE_UPDATE: u32 = 1 << 0;

const IDEAL_SPEAKER_EMBEDDING_DURATION_S: f32 = 5.0;

/// A black-box speaker-embedding oracle: turns a segment of 16 kHz audio
/// into a fixed-dimension voice embedding. Implementations typically wrap
/// an ONNX session via [`crate::onnx`].
pub trait SpeakerEmbeddingModel: Send {
    fn embed(&mut self, audio: &[f32]) -> Result<Vec<f32>>;
}

struct StreamState {
    vad: VoiceActivityDetector,
    transcript: Transcript,
    line_tracker: LineIdTracker,
    pending_audio: Vec<f32>,
    /// Line ids already assigned a speaker, so step 7 only fires once per
    /// line (on the call where it first becomes complete).
    speaker_assigned: HashSet<u64>,
    /// Cluster ids in the order they first appeared in this stream's
    /// transcript, for `speaker_index`.
    cluster_order: Vec<u64>,
    /// Present only when the orchestrator was configured with a debug WAV
    /// directory; mirrors every sample handed to `add_audio_to_stream` to
    /// disk, pre-resample.
    debug_wav: Option<DebugWavWriter>,
}

impl StreamState {
    fn new(
        vad_options: VadOptions,
        oracle: Option<Box<dyn crate::vad::SpeechProbabilityModel>>,
        debug_wav: Option<DebugWavWriter>,
    ) -> Self {
        Self {
            vad: VoiceActivityDetector::new(vad_options, oracle),
            transcript: Transcript::new(),
            line_tracker: LineIdTracker::new(),
            pending_audio: Vec::new(),
            speaker_assigned: HashSet::new(),
            cluster_order: Vec::new(),
            debug_wav,
        }
    }
}

/// Owns the loaded model(s), the stream map, and the speaker clusterer.
/// Stream handles are opaque `i32`s looked up through an arena map, never
/// raw pointers or references held across calls.
pub struct Orchestrator {
    options: OrchestratorOptions,
    transcriber: Option<Mutex<Box<dyn Transcriber>>>,
    speaker_model: Option<Mutex<Box<dyn SpeakerEmbeddingModel>>>,
    clusterer: Mutex<OnlineClusterer>,
    vad_model_factory: Box<dyn Fn() -> Option<Box<dyn crate::vad::SpeechProbabilityModel>> + Send + Sync>,

    streams: Mutex<HashMap<i32, Arc<Mutex<StreamState>>>>,
    next_stream_id: AtomicI32,
    next_line_id: AtomicU64,
    batch_stream: Mutex<Option<Arc<Mutex<StreamState>>>>,
}

impl Orchestrator {
    /// `vad_model_factory` constructs a fresh VAD oracle for each new
    /// stream (the Silero model is stateful and not shared across
    /// streams); returning `None` disables speech-probability gating for
    /// that stream (matching `vad_threshold <= 0.0`'s always-voice path).
    pub fn new(
        options: OrchestratorOptions,
        transcriber: Option<Box<dyn Transcriber>>,
        speaker_model: Option<Box<dyn SpeakerEmbeddingModel>>,
        vad_model_factory: impl Fn() -> Option<Box<dyn crate::vad::SpeechProbabilityModel>> + Send + Sync + 'static,
    ) -> Self {
        let clusterer = OnlineClusterer::new(OnlineClustererOptions {
            embedding_size: 512,
            threshold: options.speaker_id_cluster_threshold,
        });
        Self {
            transcriber: transcriber.map(Mutex::new),
            speaker_model: speaker_model.map(Mutex::new),
            clusterer: Mutex::new(clusterer),
            vad_model_factory: Box::new(vad_model_factory),
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicI32::new(0),
            next_line_id: AtomicU64::new(rand::random::<u64>()),
            batch_stream: Mutex::new(None),
            options,
        }
    }

    fn vad_options(&self) -> VadOptions {
        VadOptions {
            threshold: self.options.vad_threshold,
            window_count: self.options.vad_window_count,
            hop_size: self.options.vad_hop_size,
            look_behind_samples: self.options.vad_look_behind_samples,
            max_segment_duration_s: self.options.vad_max_segment_duration_s,
        }
    }

    /// `debug_stream_id` names the debug WAV file (`input_batch.wav` when
    /// negative, `input_<id>.wav` otherwise); ignored when no debug WAV
    /// directory is configured.
    fn new_stream_state(&self, debug_stream_id: i32) -> Result<StreamState> {
        let debug_wav = match &self.options.save_input_wav_path {
            Some(dir) => Some(DebugWavWriter::new(dir, debug_stream_id)?),
            None => None,
        };
        Ok(StreamState::new(
            self.vad_options(),
            (self.vad_model_factory)(),
            debug_wav,
        ))
    }

    fn alloc_line_id(&self) -> u64 {
        self.next_line_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lookup_stream(&self, stream_id: i32) -> Result<Arc<Mutex<StreamState>>> {
        self.streams
            .lock()
            .get(&stream_id)
            .cloned()
            .ok_or_else(|| Error::InvalidHandle(format!("no stream with id {stream_id}")))
    }

    pub fn create_stream(&self) -> Result<i32> {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let state = self.new_stream_state(stream_id)?;
        self.streams
            .lock()
            .insert(stream_id, Arc::new(Mutex::new(state)));
        Ok(stream_id)
    }

    pub fn free_stream(&self, stream_id: i32) -> Result<()> {
        self.streams
            .lock()
            .remove(&stream_id)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidHandle(format!("no stream with id {stream_id}")))
    }

    /// Clears the stream's line map and ordered id list -- any `Line`s
    /// returned from a previous session are now stale -- and activates its
    /// VAD.
    pub fn start(&self, stream_id: i32) -> Result<()> {
        let stream = self.lookup_stream(stream_id)?;
        let mut stream = stream.lock();
        stream.transcript = Transcript::new();
        stream.line_tracker = LineIdTracker::new();
        stream.speaker_assigned.clear();
        stream.cluster_order.clear();
        stream.vad.start();
        tracing::debug!(stream_id, "stream started");
        Ok(())
    }

    pub fn stop(&self, stream_id: i32) -> Result<()> {
        let stream = self.lookup_stream(stream_id)?;
        let mut stream = stream.lock();
        stream.vad.stop();
        if let Some(debug_wav) = &mut stream.debug_wav {
            debug_wav.flush()?;
        }
        tracing::debug!(stream_id, "stream stopped");
        Ok(())
    }

    /// Mirrors `samples` (at their original `sample_rate`) to the debug WAV
    /// file if one is configured, resamples them to 16 kHz, and appends them
    /// to the stream's pending buffer. Fails with `InvalidState` if the
    /// stream's VAD is not active (i.e. `start` was never called, or `stop`
    /// already was).
    pub fn add_audio_to_stream(&self, stream_id: i32, samples: &[f32], sample_rate: f32) -> Result<()> {
        let stream = self.lookup_stream(stream_id)?;
        let mut stream = stream.lock();
        if !stream.vad.is_active() {
            return Err(Error::InvalidState(format!(
                "adding audio to stream {stream_id} but its VAD is not active; call start() first"
            )));
        }
        if let Some(debug_wav) = &mut stream.debug_wav {
            debug_wav.append(samples, sample_rate)?;
        }
        let resampled = resample_audio(samples, sample_rate, INTERNAL_SAMPLE_RATE);
        stream.pending_audio.extend(resampled);
        Ok(())
    }

    /// Runs the pending buffer through VAD and merges any newly-updated
    /// segments into the stream's transcript, following the
    /// `should_update` gate: a short pending buffer is skipped (its cached
    /// transcript is returned instead) unless `flags` forces the update or
    /// the VAD has just stopped.
    pub fn transcribe_stream(&self, stream_id: i32, flags: u32) -> Result<Transcript> {
        let stream = self.lookup_stream(stream_id)?;
        let mut stream = stream.lock();

        for line in &mut stream.transcript.lines {
            line.is_new = false;
            line.is_updated = false;
            line.has_text_changed = false;
        }

        let has_new_audio = !stream.pending_audio.is_empty();
        let new_audio_duration = stream.pending_audio.len() as f32 / INTERNAL_SAMPLE_RATE;
        let long_enough = new_audio_duration >= self.options.transcription_interval_s;
        let force_update = flags & FLAG_FORCE_UPDATE != 0;
        let should_update = (long_enough || force_update) && has_new_audio;
        let is_stopped = !stream.vad.is_active();

        if !should_update {
            if is_stopped {
                mark_all_lines_complete(&mut stream.transcript);
            }
            return Ok(stream.transcript.clone());
        }

        let pending = std::mem::take(&mut stream.pending_audio);
        stream.vad.process_audio(&pending, INTERNAL_SAMPLE_RATE)?;
        let segments = stream.vad.segments().to_vec();

        self.merge_segments(&mut stream, &segments)?;

        if is_stopped {
            mark_all_lines_complete(&mut stream.transcript);
        }

        self.assign_speaker_ids(&mut stream)?;

        Ok(stream.transcript.clone())
    }

    /// Lazily creates the implicit batch stream, pumps the whole buffer
    /// through it in one pass, and returns the final transcript. Every
    /// segment VAD produces from a fully-buffered utterance is complete by
    /// construction.
    pub fn transcribe_without_streaming(&self, samples: &[f32], sample_rate: f32) -> Result<Transcript> {
        let mut batch_slot = self.batch_stream.lock();
        let stream = match batch_slot.as_ref() {
            Some(stream) => stream.clone(),
            None => {
                let state = self.new_stream_state(-1)?;
                let stream = Arc::new(Mutex::new(state));
                *batch_slot = Some(stream.clone());
                stream
            }
        };
        drop(batch_slot);

        let mut stream = stream.lock();
        stream.transcript = Transcript::new();
        stream.line_tracker = LineIdTracker::new();
        stream.speaker_assigned.clear();
        stream.cluster_order.clear();
        stream.vad.start();

        if let Some(debug_wav) = &mut stream.debug_wav {
            debug_wav.append(samples, sample_rate)?;
        }
        let resampled = resample_audio(samples, sample_rate, INTERNAL_SAMPLE_RATE);
        stream.vad.process_audio(&resampled, INTERNAL_SAMPLE_RATE)?;
        stream.vad.stop();
        if let Some(debug_wav) = &mut stream.debug_wav {
            debug_wav.flush()?;
        }
        let segments = stream.vad.segments().to_vec();

        self.merge_segments(&mut stream, &segments)?;
        mark_all_lines_complete(&mut stream.transcript);
        self.assign_speaker_ids(&mut stream)?;

        Ok(stream.transcript.clone())
    }

    fn merge_segments(&self, stream: &mut StreamState, segments: &[crate::vad::VadSegment]) -> Result<()> {
        let transcriber = &self.transcriber;
        let skip_transcription = self.options.skip_transcription;
        let mut transcribe_error: Option<Error> = None;

        let next_line_id = &mut || self.alloc_line_id();
        stream.line_tracker.update_transcript_from_segments(
            &mut stream.transcript,
            segments,
            next_line_id,
            self.options.return_audio_data,
            |audio| {
                if skip_transcription || transcriber.is_none() || transcribe_error.is_some() {
                    return (None, 0);
                }
                let started = std::time::Instant::now();
                let result = transcriber
                    .as_ref()
                    .expect("checked above")
                    .lock()
                    .transcribe(audio);
                let latency_ms = started.elapsed().as_millis() as u32;
                match result {
                    Ok(text) => (Some(text), latency_ms),
                    Err(e) => {
                        tracing::error!(error = %e, "segment transcription failed");
                        transcribe_error = Some(e);
                        (None, latency_ms)
                    }
                }
            },
        );

        if let Some(err) = transcribe_error {
            return Err(err);
        }
        Ok(())
    }

    /// Assigns `speaker_id`/`speaker_index` to every line that just
    /// transitioned to complete, if speaker identification is enabled.
    fn assign_speaker_ids(&self, stream: &mut StreamState) -> Result<()> {
        if !self.options.identify_speakers {
            return Ok(());
        }
        let Some(speaker_model) = &self.speaker_model else {
            return Ok(());
        };

        let newly_complete: Vec<usize> = stream
            .transcript
            .lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.is_complete && !stream.speaker_assigned.contains(&line.id))
            .map(|(index, _)| index)
            .collect();

        for index in newly_complete {
            let line_id = stream.transcript.lines[index].id;
            let audio = stream.transcript.lines[index].audio.clone();
            if audio.is_empty() {
                continue;
            }
            let duration_s = audio.len() as f32 / INTERNAL_SAMPLE_RATE;
            let padded = pad_by_repetition(
                &audio,
                (IDEAL_SPEAKER_EMBEDDING_DURATION_S * INTERNAL_SAMPLE_RATE) as usize,
            );

            let embedding = speaker_model.lock().embed(&padded)?;
            let cluster_id = self
                .clusterer
                .lock()
                .embed_and_cluster(&embedding, duration_s)?;

            let speaker_index = match stream.cluster_order.iter().position(|id| *id == cluster_id) {
                Some(position) => position as u32,
                None => {
                    stream.cluster_order.push(cluster_id);
                    (stream.cluster_order.len() - 1) as u32
                }
            };

            let line = &mut stream.transcript.lines[index];
            line.has_speaker_id = true;
            line.speaker_id = Some(cluster_id);
            line.speaker_index = Some(speaker_index);
            stream.speaker_assigned.insert(line_id);
        }

        Ok(())
    }
}

fn mark_all_lines_complete(transcript: &mut Transcript) {
    for line in &mut transcript.lines {
        if !line.is_complete {
            line.is_complete = true;
            line.is_updated = true;
        }
    }
}

/// Repeats `audio` until it reaches at least `target_len` samples, then
/// truncates to exactly that length. A no-op if already long enough.
fn pad_by_repetition(audio: &[f32], target_len: usize) -> Vec<f32> {
    if audio.is_empty() || audio.len() >= target_len {
        return audio[..audio.len().min(target_len.max(audio.len()))].to_vec();
    }
    let mut padded = Vec::with_capacity(target_len);
    while padded.len() < target_len {
        let remaining = target_len - padded.len();
        padded.extend_from_slice(&audio[..remaining.min(audio.len())]);
    }
    padded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as CrateResult;

    struct EchoTranscriber;
    impl Transcriber for EchoTranscriber {
        fn transcribe(&mut self, audio: &[f32]) -> CrateResult<String> {
            Ok(format!("{} samples", audio.len()))
        }
    }

    struct ConstantEmbedder(Vec<f32>);
    impl SpeakerEmbeddingModel for ConstantEmbedder {
        fn embed(&mut self, _audio: &[f32]) -> CrateResult<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    fn orchestrator_with_defaults() -> Orchestrator {
        let mut options = OrchestratorOptions::default();
        options.vad_threshold = 0.0; // always-voice, no real VAD model needed
        options.vad_max_segment_duration_s = 100.0;
        options.transcription_interval_s = 0.0;
        Orchestrator::new(
            options,
            Some(Box::new(EchoTranscriber)),
            Some(Box::new(ConstantEmbedder(vec![1.0; 512]))),
            || None,
        )
    }

    #[test]
    fn create_start_add_audio_and_transcribe_round_trip() {
        let orchestrator = orchestrator_with_defaults();
        let stream_id = orchestrator.create_stream().unwrap();
        orchestrator.start(stream_id).unwrap();

        let samples = vec![0.1f32; (INTERNAL_SAMPLE_RATE * 2.0) as usize];
        orchestrator
            .add_audio_to_stream(stream_id, &samples, INTERNAL_SAMPLE_RATE)
            .unwrap();
        let transcript = orchestrator.transcribe_stream(stream_id, FLAG_FORCE_UPDATE).unwrap();

        assert_eq!(transcript.lines.len(), 1);
        assert!(transcript.lines[0].is_new);
        assert!(transcript.lines[0].text.is_some());
    }

    #[test]
    fn add_audio_before_start_fails_with_invalid_state() {
        let orchestrator = orchestrator_with_defaults();
        let stream_id = orchestrator.create_stream().unwrap();
        let err = orchestrator
            .add_audio_to_stream(stream_id, &[0.0; 10], INTERNAL_SAMPLE_RATE)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn unknown_stream_id_fails_with_invalid_handle() {
        let orchestrator = orchestrator_with_defaults();
        let err = orchestrator.start(999).unwrap_err();
        assert!(matches!(err, Error::InvalidHandle(_)));
    }

    #[test]
    fn short_pending_buffer_is_skipped_unless_forced() {
        let mut options = OrchestratorOptions::default();
        options.vad_threshold = 0.0;
        options.transcription_interval_s = 10.0; // never "long enough"
        let orchestrator = Orchestrator::new(options, Some(Box::new(EchoTranscriber)), None, || None);
        let stream_id = orchestrator.create_stream().unwrap();
        orchestrator.start(stream_id).unwrap();
        orchestrator
            .add_audio_to_stream(stream_id, &vec![0.1f32; 1600], INTERNAL_SAMPLE_RATE)
            .unwrap();

        let transcript = orchestrator.transcribe_stream(stream_id, 0).unwrap();
        assert!(transcript.lines.is_empty());
    }

    #[test]
    fn stopping_marks_incomplete_lines_complete() {
        let orchestrator = orchestrator_with_defaults();
        let stream_id = orchestrator.create_stream().unwrap();
        orchestrator.start(stream_id).unwrap();
        let samples = vec![0.1f32; (INTERNAL_SAMPLE_RATE * 2.0) as usize];
        orchestrator
            .add_audio_to_stream(stream_id, &samples, INTERNAL_SAMPLE_RATE)
            .unwrap();
        orchestrator.transcribe_stream(stream_id, FLAG_FORCE_UPDATE).unwrap();
        orchestrator.stop(stream_id).unwrap();

        let transcript = orchestrator.transcribe_stream(stream_id, FLAG_FORCE_UPDATE).unwrap();
        assert!(transcript.lines.iter().all(|l| l.is_complete));
    }

    #[test]
    fn transcribe_without_streaming_marks_every_line_complete_with_speaker_id() {
        let orchestrator = orchestrator_with_defaults();
        let samples = vec![0.1f32; (INTERNAL_SAMPLE_RATE * 2.0) as usize];
        let transcript = orchestrator
            .transcribe_without_streaming(&samples, INTERNAL_SAMPLE_RATE)
            .unwrap();

        assert!(!transcript.lines.is_empty());
        for line in &transcript.lines {
            assert!(line.is_complete);
            assert!(line.has_speaker_id);
        }
    }

    #[test]
    fn pad_by_repetition_reaches_target_length() {
        let audio = vec![1.0f32, 2.0, 3.0];
        let padded = pad_by_repetition(&audio, 10);
        assert_eq!(padded.len(), 10);
        assert_eq!(&padded[0..3], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn pad_by_repetition_leaves_long_enough_audio_unchanged() {
        let audio = vec![1.0f32; 20];
        let padded = pad_by_repetition(&audio, 10);
        assert_eq!(padded.len(), 20);
    }

    #[test]
    fn save_input_wav_path_dumps_stream_audio_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = OrchestratorOptions::default();
        options.vad_threshold = 0.0;
        options.transcription_interval_s = 0.0;
        options.save_input_wav_path = Some(dir.path().to_path_buf());
        let orchestrator = Orchestrator::new(options, Some(Box::new(EchoTranscriber)), None, || None);

        let stream_id = orchestrator.create_stream().unwrap();
        orchestrator.start(stream_id).unwrap();
        let one_second = vec![0.1f32; INTERNAL_SAMPLE_RATE as usize];
        orchestrator
            .add_audio_to_stream(stream_id, &one_second, INTERNAL_SAMPLE_RATE)
            .unwrap();

        assert!(dir.path().join(format!("input_{stream_id}.wav")).exists());
    }
}
