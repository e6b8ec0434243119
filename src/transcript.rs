//! `Line`/`Transcript` data model and the segment-to-line merge logic that
//! binds VAD segments to stable line identities across repeated
//! `transcribe_stream` calls.
//!
//! Ported from the reference `transcript_t`/`transcript_line_t` and
//! `update_transcript_from_segments` in `transcriber.cpp`.

use crate::utf8::sanitize_text;
use crate::vad::VadSegment;

/// One unit of displayed transcript, corresponding 1:1 to a VAD segment in
/// its producing stream.
#[derive(Debug, Clone)]
pub struct Line {
    /// Stable, randomly-seeded id; never reused within a stream session.
    pub id: u64,
    /// Absent if transcription is disabled for this stream.
    pub text: Option<String>,
    pub audio: Vec<f32>,
    pub start_time_s: f32,
    pub duration_s: f32,
    pub is_complete: bool,
    pub is_new: bool,
    pub is_updated: bool,
    pub has_text_changed: bool,
    pub has_speaker_id: bool,
    pub speaker_id: Option<u64>,
    pub speaker_index: Option<u32>,
    pub last_transcription_latency_ms: u32,
}

/// An ordered sequence of [`Line`]s. Only the tail line may be incomplete.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pub lines: Vec<Line>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flattens every line's text into one string, in line order, separated
    /// by a single space. Lines with no text (transcription disabled, or not
    /// yet transcribed) contribute nothing.
    pub fn to_string_lossy(&self) -> String {
        self.lines
            .iter()
            .filter_map(|line| line.text.as_deref())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Tracks the line-id assignment for one stream's segment list across
/// repeated update calls: new segments get a freshly allocated line id, and
/// existing segments are merged into their previously assigned line.
pub struct LineIdTracker {
    /// `ordered_line_ids[i]` is the line id bound to segment index `i`.
    ordered_line_ids: Vec<u64>,
}

impl LineIdTracker {
    pub fn new() -> Self {
        Self {
            ordered_line_ids: Vec::new(),
        }
    }

    /// Rebuilds `transcript` from `segments`, allocating a new line id (via
    /// `next_line_id`) for any segment index beyond what's already tracked,
    /// and reusing ids for indices already seen. `transcribe` is invoked with
    /// a segment's audio only when that segment is new or was updated by the
    /// VAD since the last call (`just_updated`), and `return_audio_data`
    /// controls whether the resulting line retains a copy of the audio.
    pub fn update_transcript_from_segments(
        &mut self,
        transcript: &mut Transcript,
        segments: &[VadSegment],
        next_line_id: &mut dyn FnMut() -> u64,
        return_audio_data: bool,
        mut transcribe: impl FnMut(&[f32]) -> (Option<String>, u32),
    ) {
        for (segment_index, segment) in segments.iter().enumerate() {
            let is_new_line = segment_index >= self.ordered_line_ids.len();
            if is_new_line {
                self.ordered_line_ids.push(next_line_id());
                transcript.lines.push(Line {
                    id: *self.ordered_line_ids.last().unwrap(),
                    text: None,
                    audio: Vec::new(),
                    start_time_s: segment.start_time_s,
                    duration_s: segment.end_time_s - segment.start_time_s,
                    is_complete: segment.is_complete,
                    is_new: true,
                    is_updated: false,
                    has_text_changed: false,
                    has_speaker_id: false,
                    speaker_id: None,
                    speaker_index: None,
                    last_transcription_latency_ms: 0,
                });
            }

            let line_id = self.ordered_line_ids[segment_index];
            let line = transcript
                .lines
                .iter_mut()
                .find(|line| line.id == line_id)
                .expect("line id tracked without a corresponding transcript line");

            line.is_new = is_new_line;
            line.is_updated = !is_new_line && segment.just_updated;
            line.start_time_s = segment.start_time_s;
            line.duration_s = segment.end_time_s - segment.start_time_s;
            line.is_complete = segment.is_complete;

            if is_new_line || segment.just_updated {
                let started = std::time::Instant::now();
                let (text, measured_latency_ms) = transcribe(&segment.audio);
                let latency_ms = if measured_latency_ms != 0 {
                    measured_latency_ms
                } else {
                    started.elapsed().as_millis() as u32
                };
                let sanitized = text.map(|t| sanitize_text(&t));
                line.has_text_changed = sanitized != line.text;
                line.text = sanitized;
                line.last_transcription_latency_ms = latency_ms;
                if return_audio_data {
                    line.audio = segment.audio.clone();
                }
            } else {
                line.has_text_changed = false;
            }
        }
    }
}

impl Default for LineIdTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(start: f32, end: f32, complete: bool, updated: bool) -> VadSegment {
        VadSegment {
            audio: vec![0.0; 10],
            start_time_s: start,
            end_time_s: end,
            is_complete: complete,
            just_updated: updated,
        }
    }

    #[test]
    fn new_segment_allocates_a_fresh_line_id() {
        let mut tracker = LineIdTracker::new();
        let mut transcript = Transcript::new();
        let mut next_id = 100u64;
        let mut allocate = || {
            let id = next_id;
            next_id += 1;
            id
        };

        tracker.update_transcript_from_segments(
            &mut transcript,
            &[segment(0.0, 1.0, false, true)],
            &mut allocate,
            true,
            |_audio| (Some("hello".to_string()), 5),
        );

        assert_eq!(transcript.lines.len(), 1);
        assert_eq!(transcript.lines[0].id, 100);
        assert!(transcript.lines[0].is_new);
        assert_eq!(transcript.lines[0].text.as_deref(), Some("hello"));
    }

    #[test]
    fn existing_segment_reuses_its_line_id_and_only_transcribes_when_updated() {
        let mut tracker = LineIdTracker::new();
        let mut transcript = Transcript::new();
        let mut next_id = 0u64;
        let mut allocate = || {
            let id = next_id;
            next_id += 1;
            id
        };

        let mut calls = 0usize;
        tracker.update_transcript_from_segments(
            &mut transcript,
            &[segment(0.0, 1.0, false, true)],
            &mut allocate,
            true,
            |_audio| {
                calls += 1;
                (Some("first".to_string()), 1)
            },
        );
        let first_id = transcript.lines[0].id;

        // Segment 0 unchanged (no just_updated): no new transcription, text
        // and id both stay the same.
        tracker.update_transcript_from_segments(
            &mut transcript,
            &[segment(0.0, 1.0, false, false)],
            &mut allocate,
            true,
            |_audio| {
                calls += 1;
                (Some("second".to_string()), 1)
            },
        );

        assert_eq!(transcript.lines.len(), 1);
        assert_eq!(transcript.lines[0].id, first_id);
        assert_eq!(transcript.lines[0].text.as_deref(), Some("first"));
        assert_eq!(calls, 1);
        assert!(!transcript.lines[0].is_new);
        assert!(!transcript.lines[0].is_updated);
    }

    #[test]
    fn second_segment_gets_its_own_new_line_while_first_stays_stable() {
        let mut tracker = LineIdTracker::new();
        let mut transcript = Transcript::new();
        let mut next_id = 0u64;
        let mut allocate = || {
            let id = next_id;
            next_id += 1;
            id
        };

        tracker.update_transcript_from_segments(
            &mut transcript,
            &[segment(0.0, 1.0, true, true)],
            &mut allocate,
            true,
            |_audio| (Some("first".to_string()), 1),
        );
        tracker.update_transcript_from_segments(
            &mut transcript,
            &[segment(0.0, 1.0, true, false), segment(1.0, 2.0, false, true)],
            &mut allocate,
            true,
            |_audio| (Some("second".to_string()), 1),
        );

        assert_eq!(transcript.lines.len(), 2);
        assert_eq!(transcript.lines[0].text.as_deref(), Some("first"));
        assert_eq!(transcript.lines[1].text.as_deref(), Some("second"));
        assert!(transcript.lines[1].is_new);
    }

    #[test]
    fn return_audio_data_false_leaves_line_audio_empty() {
        let mut tracker = LineIdTracker::new();
        let mut transcript = Transcript::new();
        let mut next_id = 0u64;
        let mut allocate = || {
            let id = next_id;
            next_id += 1;
            id
        };

        tracker.update_transcript_from_segments(
            &mut transcript,
            &[segment(0.0, 1.0, true, true)],
            &mut allocate,
            false,
            |_audio| (Some("x".to_string()), 1),
        );
        assert!(transcript.lines[0].audio.is_empty());
    }

    #[test]
    fn to_string_lossy_joins_non_empty_line_text() {
        let transcript = Transcript {
            lines: vec![
                Line {
                    id: 0,
                    text: Some("hello".to_string()),
                    audio: Vec::new(),
                    start_time_s: 0.0,
                    duration_s: 1.0,
                    is_complete: true,
                    is_new: false,
                    is_updated: false,
                    has_text_changed: false,
                    has_speaker_id: false,
                    speaker_id: None,
                    speaker_index: None,
                    last_transcription_latency_ms: 0,
                },
                Line {
                    id: 1,
                    text: None,
                    audio: Vec::new(),
                    start_time_s: 1.0,
                    duration_s: 1.0,
                    is_complete: false,
                    is_new: true,
                    is_updated: false,
                    has_text_changed: false,
                    has_speaker_id: false,
                    speaker_id: None,
                    speaker_index: None,
                    last_transcription_latency_ms: 0,
                },
                Line {
                    id: 2,
                    text: Some("world".to_string()),
                    audio: Vec::new(),
                    start_time_s: 2.0,
                    duration_s: 1.0,
                    is_complete: true,
                    is_new: false,
                    is_updated: false,
                    has_text_changed: false,
                    has_speaker_id: false,
                    speaker_id: None,
                    speaker_index: None,
                    last_transcription_latency_ms: 0,
                },
            ],
        };
        assert_eq!(transcript.to_string_lossy(), "hello world");
    }
}
