//! Voice-activity segmentation: sliding-window speech detection driving
//! segment open/continue/finalize transitions, with look-behind prefix
//! capture and forced fade-out for runaway segments.
//!
//! The neural half (Silero) is an opaque tensor oracle behind the
//! `SpeechProbabilityModel` trait, matching how the reference treats it --
//! the state machine in this module owns none of the ONNX plumbing.

use crate::error::Result;
use crate::onnx::OnnxSessionOptions;
use crate::resampler::resample_audio;
use ndarray::{Array, Array2, ArrayD};
use ort::session::{Session, SessionInputs};
use ort::value::Tensor;
use std::collections::VecDeque;
use std::path::Path;

pub const INTERNAL_SAMPLE_RATE: f32 = 16000.0;
const SILERO_CONTEXT_SAMPLES: usize = 64;

/// A segmented utterance, as produced by the VAD engine.
#[derive(Debug, Clone, Default)]
pub struct VadSegment {
    pub audio: Vec<f32>,
    pub start_time_s: f32,
    pub end_time_s: f32,
    pub is_complete: bool,
    pub just_updated: bool,
}

/// Capability interface for the speech-probability oracle (Silero or a
/// test double). Takes a single window of samples, returns P(speech).
pub trait SpeechProbabilityModel: Send {
    fn infer(&mut self, window: &[f32]) -> Result<f32>;
    fn reset(&mut self);
}

/// Silero VAD: a stateful recurrent ONNX model. State is a `[2, 1, 128]`
/// tensor threaded across calls; inputs are `(frame, state, sample_rate)`,
/// outputs are `(output, stateN)`.
pub struct SileroVad {
    session: Session,
    state: ArrayD<f32>,
    sample_rate: Array<i64, ndarray::Ix1>,
}

impl SileroVad {
    pub fn load(model_path: impl AsRef<Path>, options: &OnnxSessionOptions) -> Result<Self> {
        let session = crate::onnx::load_session(model_path, options)?;
        Ok(Self {
            session,
            state: ArrayD::<f32>::zeros([2, 1, 128].as_slice()),
            sample_rate: Array::from_shape_vec([1], vec![INTERNAL_SAMPLE_RATE as i64]).unwrap(),
        })
    }
}

impl SpeechProbabilityModel for SileroVad {
    fn infer(&mut self, window: &[f32]) -> Result<f32> {
        let frame: Array2<f32> =
            Array2::from_shape_vec((1, window.len()), window.to_vec()).unwrap();
        let frame_tensor = Tensor::from_array(frame)?;
        let state_tensor = Tensor::from_array(std::mem::take(&mut self.state))?;
        let sample_rate_tensor = Tensor::from_array(self.sample_rate.clone())?;

        let inputs = ort::inputs![frame_tensor, state_tensor, sample_rate_tensor];
        let outputs = self.session.run(SessionInputs::ValueSlice::<3>(&inputs))?;

        self.state = outputs["stateN"].try_extract_array::<f32>()?.to_owned();
        let output = outputs["output"].try_extract_tensor::<f32>()?;
        Ok(output.1[0])
    }

    fn reset(&mut self) {
        self.state = ArrayD::<f32>::zeros([2, 1, 128].as_slice());
    }
}

#[derive(Debug, Clone)]
pub struct VadOptions {
    pub threshold: f32,
    pub window_count: usize,
    pub hop_size: usize,
    pub look_behind_samples: usize,
    pub max_segment_duration_s: f32,
}

impl Default for VadOptions {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            window_count: 32,
            hop_size: 512,
            look_behind_samples: 4096,
            max_segment_duration_s: 15.0,
        }
    }
}

/// Drives speech/non-speech transitions over fixed-size hops of 16 kHz
/// audio, emitting `VadSegment`s through open/continue/finalize lifecycle.
pub struct VoiceActivityDetector {
    options: VadOptions,
    oracle: Option<Box<dyn SpeechProbabilityModel>>,
    max_segment_samples: usize,

    prob_ring: VecDeque<f32>,
    look_behind_ring: VecDeque<f32>,
    prev_tail: Vec<f32>,
    remainder: Vec<f32>,

    segments: Vec<VadSegment>,
    previous_is_voice: bool,
    samples_processed: u64,
    is_active: bool,
}

impl VoiceActivityDetector {
    pub fn new(options: VadOptions, oracle: Option<Box<dyn SpeechProbabilityModel>>) -> Self {
        let max_segment_samples = (options.max_segment_duration_s * INTERNAL_SAMPLE_RATE) as usize;
        let look_behind_samples = options.look_behind_samples;
        Self {
            options,
            oracle,
            max_segment_samples,
            prob_ring: VecDeque::with_capacity(32),
            look_behind_ring: VecDeque::from(vec![0.0f32; look_behind_samples]),
            prev_tail: vec![0.0f32; SILERO_CONTEXT_SAMPLES],
            remainder: Vec::new(),
            segments: Vec::new(),
            previous_is_voice: false,
            samples_processed: 0,
            is_active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn segments(&self) -> &[VadSegment] {
        &self.segments
    }

    pub fn take_segments(&mut self) -> Vec<VadSegment> {
        std::mem::take(&mut self.segments)
    }

    /// Resets all buffers (look-behind zero-filled), clears segments, and
    /// marks the detector active.
    pub fn start(&mut self) {
        self.prob_ring.clear();
        self.look_behind_ring = VecDeque::from(vec![0.0f32; self.options.look_behind_samples]);
        self.prev_tail = vec![0.0f32; SILERO_CONTEXT_SAMPLES];
        self.remainder.clear();
        self.segments.clear();
        self.previous_is_voice = false;
        self.samples_processed = 0;
        self.is_active = true;
        if let Some(oracle) = self.oracle.as_deref_mut() {
            oracle.reset();
        }
    }

    /// Finalizes any open segment and marks the detector inactive.
    pub fn stop(&mut self) {
        if self.previous_is_voice {
            if let Some(segment) = self.segments.last_mut() {
                if !segment.is_complete {
                    segment.is_complete = true;
                    segment.just_updated = true;
                }
            }
        }
        self.is_active = false;
    }

    /// Resamples `buf` to 16 kHz, buffers it, and processes every full hop
    /// that accumulates. Clears `just_updated` on all existing segments
    /// before processing any new hops.
    pub fn process_audio(&mut self, buf: &[f32], sample_rate: f32) -> Result<()> {
        for segment in self.segments.iter_mut() {
            segment.just_updated = false;
        }

        let resampled = resample_audio(buf, sample_rate, INTERNAL_SAMPLE_RATE);
        self.remainder.extend_from_slice(&resampled);

        let hop_size = self.options.hop_size;
        while self.remainder.len() >= hop_size {
            let chunk: Vec<f32> = self.remainder.drain(..hop_size).collect();
            self.process_chunk(&chunk)?;
        }

        Ok(())
    }

    fn process_chunk(&mut self, chunk: &[f32]) -> Result<()> {
        let hop_size = chunk.len();

        for &sample in chunk {
            if self.look_behind_ring.len() >= self.options.look_behind_samples {
                self.look_behind_ring.pop_front();
            }
            self.look_behind_ring.push_back(sample);
        }

        let smoothed_raw = if self.options.threshold > 0.0 {
            let mut window = self.prev_tail.clone();
            window.extend_from_slice(chunk);

            let prob = match self.oracle.as_deref_mut() {
                Some(oracle) => oracle.infer(&window)?,
                None => 1.0,
            };

            if self.prob_ring.len() >= self.options.window_count {
                self.prob_ring.pop_front();
            }
            self.prob_ring.push_back(prob);

            let sum: f32 = self.prob_ring.iter().sum();
            let smoothed = sum / self.prob_ring.len() as f32;

            if chunk.len() >= SILERO_CONTEXT_SAMPLES {
                self.prev_tail = chunk[chunk.len() - SILERO_CONTEXT_SAMPLES..].to_vec();
            } else {
                let mut tail = self.prev_tail.clone();
                tail.extend_from_slice(chunk);
                let start = tail.len().saturating_sub(SILERO_CONTEXT_SAMPLES);
                self.prev_tail = tail[start..].to_vec();
            }

            smoothed
        } else {
            1.0
        };

        let mut smoothed = smoothed_raw;
        let fade_start = self.max_segment_samples * 2 / 3;
        if let Some(last) = self.segments.last() {
            if !last.is_complete {
                let current_len = last.audio.len();
                if current_len > fade_start {
                    let denom = (self.max_segment_samples - fade_start) as f32;
                    let factor = if denom > 0.0 {
                        ((self.max_segment_samples as f32 - current_len as f32) / denom)
                            .clamp(0.0, 1.0)
                    } else {
                        0.0
                    };
                    smoothed *= factor;
                }
            }
        }

        let current_is_voice = smoothed > self.options.threshold;

        match (self.previous_is_voice, current_is_voice) {
            (false, true) => {
                // `look_behind_ring` already has this chunk appended (the
                // per-sample loop above runs before this match), so the
                // window length must account for it too or the segment
                // silently drops its triggering hop.
                let samples_processed_with_chunk = self.samples_processed + hop_size as u64;
                let window_len = (self.options.look_behind_samples as u64)
                    .min(samples_processed_with_chunk) as usize;
                let audio: Vec<f32> = self
                    .look_behind_ring
                    .iter()
                    .rev()
                    .take(window_len)
                    .rev()
                    .copied()
                    .collect();
                let start_time = (samples_processed_with_chunk as f32 - window_len as f32)
                    / INTERNAL_SAMPLE_RATE;
                let end_time = start_time + audio.len() as f32 / INTERNAL_SAMPLE_RATE;
                self.segments.push(VadSegment {
                    audio,
                    start_time_s: start_time,
                    end_time_s: end_time,
                    is_complete: false,
                    just_updated: true,
                });
            }
            (true, true) => {
                if let Some(segment) = self.segments.last_mut() {
                    segment.audio.extend_from_slice(chunk);
                    segment.end_time_s += hop_size as f32 / INTERNAL_SAMPLE_RATE;
                    segment.just_updated = true;
                }
            }
            (true, false) => {
                if let Some(segment) = self.segments.last_mut() {
                    segment.audio.extend_from_slice(chunk);
                    segment.end_time_s += hop_size as f32 / INTERNAL_SAMPLE_RATE;
                    segment.is_complete = true;
                    segment.just_updated = true;
                }
                self.look_behind_ring = VecDeque::from(vec![0.0f32; self.options.look_behind_samples]);
            }
            (false, false) => {}
        }

        self.previous_is_voice = current_is_voice;
        self.samples_processed += hop_size as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstantOracle(f32);
    impl SpeechProbabilityModel for ConstantOracle {
        fn infer(&mut self, _window: &[f32]) -> Result<f32> {
            Ok(self.0)
        }
        fn reset(&mut self) {}
    }

    fn vad_with_threshold_zero(hop: usize) -> VoiceActivityDetector {
        VoiceActivityDetector::new(
            VadOptions {
                threshold: 0.0,
                window_count: 8,
                hop_size: hop,
                look_behind_samples: 1024,
                max_segment_duration_s: 15.0,
            },
            None,
        )
    }

    #[test]
    fn threshold_zero_produces_exactly_one_segment() {
        let hop = 512;
        let mut vad = vad_with_threshold_zero(hop);
        vad.start();
        let seconds = 2.0;
        let samples = vec![0.1f32; (seconds * INTERNAL_SAMPLE_RATE) as usize];
        vad.process_audio(&samples, INTERNAL_SAMPLE_RATE).unwrap();
        vad.stop();

        let segments = vad.segments();
        assert_eq!(segments.len(), 1);
        let segment = &segments[0];
        assert!(segment.start_time_s < hop as f32 / INTERNAL_SAMPLE_RATE);
        assert!(segment.is_complete);
        let expected_len = samples.len();
        assert!(segment.audio.len() as i64 - expected_len as i64 <= 0);
        assert!(segment.audio.len() + hop >= expected_len);
    }

    #[test]
    fn only_last_segment_may_be_incomplete() {
        let mut vad = VoiceActivityDetector::new(
            VadOptions {
                threshold: 0.5,
                window_count: 4,
                hop_size: 160,
                look_behind_samples: 320,
                max_segment_duration_s: 15.0,
            },
            Some(Box::new(ConstantOracle(0.0))),
        );
        vad.start();
        // Silence the whole time: no segment should be created.
        let silence = vec![0.0f32; 3200];
        vad.process_audio(&silence, INTERNAL_SAMPLE_RATE).unwrap();
        assert!(vad.segments().is_empty());
    }

    #[test]
    fn start_resets_segments_and_buffers() {
        let mut vad = vad_with_threshold_zero(256);
        vad.start();
        vad.process_audio(&vec![0.05f32; 4096], INTERNAL_SAMPLE_RATE)
            .unwrap();
        vad.stop();
        assert!(!vad.segments().is_empty());
        vad.start();
        assert!(vad.segments().is_empty());
        assert!(vad.is_active());
    }

    #[test]
    fn forced_fade_out_bounds_segment_duration() {
        let hop = 512;
        let mut vad = VoiceActivityDetector::new(
            VadOptions {
                threshold: 0.3,
                window_count: 1,
                hop_size: hop,
                look_behind_samples: 1024,
                max_segment_duration_s: 1.0,
            },
            Some(Box::new(ConstantOracle(1.0))),
        );
        vad.start();
        let samples = vec![0.1f32; (5.0 * INTERNAL_SAMPLE_RATE) as usize];
        vad.process_audio(&samples, INTERNAL_SAMPLE_RATE).unwrap();
        let max_segment_samples = INTERNAL_SAMPLE_RATE as usize;
        if let Some(segment) = vad.segments().last() {
            assert!(segment.audio.len() <= max_segment_samples + hop);
        }
    }
}
