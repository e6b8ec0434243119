//! Sample-rate conversion between arbitrary input rates and the engine's
//! fixed 16 kHz internal rate.
//!
//! Box-filter downsample and linear-interpolation upsample, ported from the
//! reference resampler with its exact tail-clamp behavior preserved (the
//! last output sample's averaging window is clamped to the input length
//! rather than left out of bounds).

/// Resamples `audio` from `input_sample_rate` to `output_sample_rate`.
///
/// Returns the input unchanged (a clone) when the rates are equal.
pub fn resample_audio(audio: &[f32], input_sample_rate: f32, output_sample_rate: f32) -> Vec<f32> {
    if input_sample_rate == output_sample_rate {
        return audio.to_vec();
    }
    if input_sample_rate > output_sample_rate {
        downsample_audio(audio, input_sample_rate, output_sample_rate)
    } else {
        upsample_audio(audio, input_sample_rate, output_sample_rate)
    }
}

/// Box-filter downsample: each output sample is the arithmetic mean of the
/// input samples whose fractional positions fall within `[i*r, (i+1)*r)`.
pub fn downsample_audio(audio: &[f32], input_sample_rate: f32, output_sample_rate: f32) -> Vec<f32> {
    let input_len = audio.len();
    let output_len = (input_len as f32 * output_sample_rate / input_sample_rate) as usize;
    let mut output = vec![0.0f32; output_len];

    let ratio = input_sample_rate / output_sample_rate;

    for (i, out_sample) in output.iter_mut().enumerate() {
        let start_pos = i as f32 * ratio;
        let end_pos = (i + 1) as f32 * ratio;

        let start_idx = start_pos as usize;
        let mut end_idx = end_pos as usize;
        if end_idx >= input_len {
            end_idx = input_len - 1;
        }

        let mut sum = 0.0f32;
        let mut count = 0usize;
        for sample in audio.iter().take(end_idx + 1).skip(start_idx) {
            sum += *sample;
            count += 1;
        }

        *out_sample = if count > 0 { sum / count as f32 } else { 0.0 };
    }

    output
}

/// Linear-interpolation upsample between `floor(i*r)` and its successor;
/// at the tail, repeats the last input sample.
pub fn upsample_audio(audio: &[f32], input_sample_rate: f32, output_sample_rate: f32) -> Vec<f32> {
    let input_len = audio.len();
    let output_len = (input_len as f32 * output_sample_rate / input_sample_rate) as usize;
    let mut output = vec![0.0f32; output_len];

    let ratio = input_sample_rate / output_sample_rate;

    for (i, out_sample) in output.iter_mut().enumerate() {
        let pos = i as f32 * ratio;
        let index = pos as usize;
        let fraction = pos - index as f32;

        *out_sample = if index >= input_len - 1 {
            audio[input_len - 1]
        } else {
            let sample0 = audio[index];
            let sample1 = audio[index + 1];
            sample0 + fraction * (sample1 - sample0)
        };
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, freq: f32, rate: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin())
            .collect()
    }

    #[test]
    fn equal_rates_returns_input_unchanged() {
        let audio = vec![0.1, -0.2, 0.3];
        assert_eq!(resample_audio(&audio, 16000.0, 16000.0), audio);
    }

    #[test]
    fn downsample_halves_length() {
        let audio = sine(32000, 440.0, 48000.0);
        let out = resample_audio(&audio, 48000.0, 16000.0);
        assert_eq!(out.len(), audio.len() * 16000 / 48000);
    }

    #[test]
    fn upsample_grows_length() {
        let audio = sine(1600, 440.0, 16000.0);
        let out = resample_audio(&audio, 16000.0, 48000.0);
        assert_eq!(out.len(), audio.len() * 3);
    }

    #[test]
    fn resampled_statistics_stay_close_to_source() {
        let audio = sine(16000, 220.0, 16000.0);
        let out = resample_audio(&audio, 16000.0, 48000.0);
        let mean_in: f32 = audio.iter().sum::<f32>() / audio.len() as f32;
        let mean_out: f32 = out.iter().sum::<f32>() / out.len() as f32;
        assert!((mean_in - mean_out).abs() < 0.001);
        let max_in = audio.iter().cloned().fold(f32::MIN, f32::max);
        let max_out = out.iter().cloned().fold(f32::MIN, f32::max);
        assert!((max_in - max_out).abs() < 0.005);
    }

    #[test]
    fn downsample_tail_does_not_panic_on_short_input() {
        let audio = vec![1.0, 2.0, 3.0];
        let out = downsample_audio(&audio, 48000.0, 16000.0);
        assert_eq!(out.len(), 1);
    }
}
