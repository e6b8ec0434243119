//! Per-stream debug WAV dump: every stream whose orchestrator has
//! `save_input_wav_path` set gets its raw (pre-resample) input audio
//! mirrored to `input_<stream_id>.wav` (`input_batch.wav` for the implicit
//! batch stream), rewritten once per accumulated second of audio so a
//! developer can inspect exactly what reached the engine.
//!
//! Ported from the reference `TranscriberStream::save_audio_data_to_wav`:
//! the whole buffer is rewritten on every flush rather than appended to,
//! and the "once per second" check is driven by the internal 16 kHz rate
//! regardless of the stream's actual input rate, matching the reference
//! exactly.

use crate::error::{Error, Result};
use crate::vad::INTERNAL_SAMPLE_RATE;
use std::path::{Path, PathBuf};

pub struct DebugWavWriter {
    path: PathBuf,
    samples: Vec<f32>,
    last_sample_rate: u32,
}

impl DebugWavWriter {
    pub fn new(dir: &Path, stream_id: i32) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let filename = if stream_id < 0 {
            "input_batch.wav".to_string()
        } else {
            format!("input_{stream_id}.wav")
        };
        let path = dir.join(filename);
        let _ = std::fs::remove_file(&path);
        Ok(Self {
            path,
            samples: Vec::new(),
            last_sample_rate: 0,
        })
    }

    /// Appends `audio` (at its original `sample_rate`) to the pending
    /// buffer, flushing the whole buffer to disk if a new second's worth
    /// of audio has accumulated since the last flush.
    pub fn append(&mut self, audio: &[f32], sample_rate: f32) -> Result<()> {
        let previous_second = self.samples.len() / INTERNAL_SAMPLE_RATE as usize;
        self.samples.extend_from_slice(audio);
        self.last_sample_rate = sample_rate as u32;
        let current_second = self.samples.len() / INTERNAL_SAMPLE_RATE as usize;
        if current_second != previous_second {
            self.flush()?;
        }
        Ok(())
    }

    /// Unconditionally rewrites the buffer to disk, regardless of whether a
    /// new second has accumulated. Called when a stream stops so the last
    /// partial second isn't lost.
    pub fn flush(&mut self) -> Result<()> {
        if self.samples.is_empty() || self.last_sample_rate == 0 {
            return Ok(());
        }
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.last_sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&self.path, spec)
            .map_err(|e| Error::Internal(format!("opening debug wav file: {e}")))?;
        for &sample in &self.samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Internal(format!("writing debug wav sample: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| Error::Internal(format!("finalizing debug wav file: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_flushes_a_real_wav_file_once_a_second_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DebugWavWriter::new(dir.path(), 7).unwrap();
        let one_second = vec![0.0f32; INTERNAL_SAMPLE_RATE as usize];
        writer.append(&one_second, INTERNAL_SAMPLE_RATE).unwrap();

        let path = dir.path().join("input_7.wav");
        assert!(path.exists());
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, INTERNAL_SAMPLE_RATE as u32);
    }

    #[test]
    fn batch_stream_id_uses_fixed_filename() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DebugWavWriter::new(dir.path(), -1).unwrap();
        writer
            .append(&vec![0.0f32; INTERNAL_SAMPLE_RATE as usize], INTERNAL_SAMPLE_RATE)
            .unwrap();
        assert!(dir.path().join("input_batch.wav").exists());
    }

    #[test]
    fn flush_on_empty_buffer_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DebugWavWriter::new(dir.path(), 0).unwrap();
        writer.flush().unwrap();
        assert!(!dir.path().join("input_0.wav").exists());
    }

    #[test]
    fn partial_second_is_captured_by_an_explicit_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DebugWavWriter::new(dir.path(), 3).unwrap();
        writer
            .append(&vec![0.0f32; 100], INTERNAL_SAMPLE_RATE)
            .unwrap();
        let path = dir.path().join("input_3.wav");
        assert!(!path.exists());
        writer.flush().unwrap();
        assert!(path.exists());
    }
}
