//! Intent recognition: match transcript lines against registered phrases by
//! embedding-space cosine similarity.
//!
//! Ported from the reference `IntentRecognizer`. One divergence: the
//! reference keys registrations by `trigger_phrase` and removes them by
//! re-supplying that phrase, which silently no-ops on a phrase typo. Callers
//! here instead get a `RegistrationToken` back from `register_intent` and use
//! it to unregister, so a stale or mistyped removal request fails to compile
//! rather than silently matching nothing.

use crate::error::{Error, Result};
use crate::transcript::Transcript;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A black-box embedding model: turns text into a dense vector. Callers
/// supply a concrete implementation backed by whatever embedding network
/// they've loaded (e.g. an ONNX session via [`crate::onnx`]).
pub trait EmbeddingModel: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

pub type IntentCallback = Box<dyn Fn(&str, f32) + Send + Sync>;

/// Opaque handle returned by [`IntentRecognizer::register_intent`], used to
/// remove that registration later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationToken(u64);

struct Intent {
    token: RegistrationToken,
    trigger_phrase: String,
    embedding: Vec<f32>,
    callback: IntentCallback,
}

struct State {
    intents: Vec<Intent>,
    processed_line_ids: Vec<u64>,
    threshold: f32,
}

/// Matches transcript lines against a set of registered trigger phrases via
/// cosine similarity in an embedding model's vector space.
pub struct IntentRecognizer {
    embedding_model: Box<dyn EmbeddingModel>,
    state: Mutex<State>,
    next_token: AtomicU64,
}

impl IntentRecognizer {
    pub fn new(embedding_model: Box<dyn EmbeddingModel>, threshold: f32) -> Self {
        Self {
            embedding_model,
            state: Mutex::new(State {
                intents: Vec::new(),
                processed_line_ids: Vec::new(),
                threshold,
            }),
            next_token: AtomicU64::new(1),
        }
    }

    /// Registers a phrase and callback, embedding the phrase once up front.
    /// Returns a token that later removes this exact registration.
    pub fn register_intent(
        &self,
        trigger_phrase: impl Into<String>,
        callback: IntentCallback,
    ) -> Result<RegistrationToken> {
        let trigger_phrase = trigger_phrase.into();
        let embedding = self.embedding_model.embed(&trigger_phrase)?;
        let token = RegistrationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock().unwrap();
        state.intents.push(Intent {
            token,
            trigger_phrase,
            embedding,
            callback,
        });
        Ok(token)
    }

    /// Removes a registration. Returns `false` if the token is unknown
    /// (already removed, or never valid for this recognizer).
    pub fn unregister_intent(&self, token: RegistrationToken) -> bool {
        let mut state = self.state.lock().unwrap();
        let before = state.intents.len();
        state.intents.retain(|intent| intent.token != token);
        state.intents.len() != before
    }

    pub fn set_threshold(&self, threshold: f32) {
        self.state.lock().unwrap().threshold = threshold;
    }

    pub fn threshold(&self) -> f32 {
        self.state.lock().unwrap().threshold
    }

    pub fn intent_count(&self) -> usize {
        self.state.lock().unwrap().intents.len()
    }

    pub fn clear_intents(&self) {
        self.state.lock().unwrap().intents.clear();
    }

    /// Embeds `utterance` and invokes the callback of whichever registered
    /// intent is most similar, if that similarity clears the threshold.
    /// Returns whether a callback was invoked.
    pub fn process_utterance(&self, utterance: &str) -> Result<bool> {
        if utterance.is_empty() {
            return Ok(false);
        }

        let utterance_embedding = self.embedding_model.embed(utterance)?;
        let state = self.state.lock().unwrap();
        if state.intents.is_empty() {
            return Ok(false);
        }

        let mut best_similarity = f32::NEG_INFINITY;
        let mut best_index = None;
        for (index, intent) in state.intents.iter().enumerate() {
            let similarity = cosine_similarity(&utterance_embedding, &intent.embedding)?;
            if similarity > best_similarity {
                best_similarity = similarity;
                best_index = Some(index);
            }
        }

        if let Some(index) = best_index {
            if best_similarity >= state.threshold {
                (state.intents[index].callback)(utterance, best_similarity);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Processes every complete, not-yet-seen line in `transcript`,
    /// calling [`Self::process_utterance`] on its text. Idempotent: lines
    /// whose id has already been processed are skipped, so repeated calls
    /// with the same or a growing transcript do no redundant work.
    pub fn process_transcript(&self, transcript: &Transcript) -> Result<()> {
        for line in &transcript.lines {
            if !line.is_complete {
                continue;
            }
            let mut state = self.state.lock().unwrap();
            if state.processed_line_ids.contains(&line.id) {
                continue;
            }
            state.processed_line_ids.push(line.id);
            drop(state);

            if let Some(text) = &line.text {
                self.process_utterance(text)?;
            }
        }
        Ok(())
    }

    /// Returns the trigger phrase registered under `token`, if still present.
    pub fn trigger_phrase(&self, token: RegistrationToken) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .intents
            .iter()
            .find(|intent| intent.token == token)
            .map(|intent| intent.trigger_phrase.clone())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(Error::InvalidArgument(format!(
            "embedding dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    let mut dot = 0.0f32;
    let mut norm_a_sq = 0.0f32;
    let mut norm_b_sq = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a_sq += x * x;
        norm_b_sq += y * y;
    }
    let norm_a = norm_a_sq.sqrt();
    let norm_b = norm_b_sq.sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a * norm_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Line;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    /// Embeds a string as a one-hot vector over a tiny fixed vocabulary, so
    /// tests can reason about similarity without a real embedding network.
    struct OneHotEmbedder;

    impl EmbeddingModel for OneHotEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let vocab = ["lights on", "lights off", "play music"];
            let mut vector = vec![0.0f32; vocab.len()];
            if let Some(index) = vocab.iter().position(|v| *v == text) {
                vector[index] = 1.0;
            } else {
                // Unknown strings get a small uniform vector so they're
                // never an exact match for any registered intent.
                vector.iter_mut().for_each(|v| *v = 0.1);
            }
            Ok(vector)
        }
    }

    #[test]
    fn exact_match_invokes_callback() {
        let recognizer = IntentRecognizer::new(Box::new(OneHotEmbedder), 0.9);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        recognizer
            .register_intent(
                "lights on",
                Box::new(move |_text, _similarity| {
                    fired_clone.store(true, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let handled = recognizer.process_utterance("lights on").unwrap();
        assert!(handled);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn below_threshold_does_not_invoke_callback() {
        let recognizer = IntentRecognizer::new(Box::new(OneHotEmbedder), 0.9);
        recognizer
            .register_intent("lights on", Box::new(|_, _| {}))
            .unwrap();
        let handled = recognizer.process_utterance("something unrelated").unwrap();
        assert!(!handled);
    }

    #[test]
    fn unregister_removes_intent() {
        let recognizer = IntentRecognizer::new(Box::new(OneHotEmbedder), 0.9);
        let token = recognizer
            .register_intent("lights on", Box::new(|_, _| {}))
            .unwrap();
        assert_eq!(recognizer.intent_count(), 1);
        assert!(recognizer.unregister_intent(token));
        assert_eq!(recognizer.intent_count(), 0);
        assert!(!recognizer.unregister_intent(token));
    }

    #[test]
    fn process_transcript_skips_incomplete_and_already_processed_lines() {
        let recognizer = IntentRecognizer::new(Box::new(OneHotEmbedder), 0.9);
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        recognizer
            .register_intent(
                "play music",
                Box::new(move |_, _| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let transcript = Transcript {
            lines: vec![
                Line {
                    id: 1,
                    text: Some("play music".to_string()),
                    audio: Vec::new(),
                    start_time_s: 0.0,
                    duration_s: 1.0,
                    is_complete: true,
                    is_new: true,
                    is_updated: false,
                    has_text_changed: true,
                    has_speaker_id: false,
                    speaker_id: None,
                    speaker_index: None,
                    last_transcription_latency_ms: 0.0,
                },
                Line {
                    id: 2,
                    text: Some("play music".to_string()),
                    audio: Vec::new(),
                    start_time_s: 1.0,
                    duration_s: 1.0,
                    is_complete: false,
                    is_new: true,
                    is_updated: false,
                    has_text_changed: true,
                    has_speaker_id: false,
                    speaker_id: None,
                    speaker_index: None,
                    last_transcription_latency_ms: 0.0,
                },
            ],
        };

        recognizer.process_transcript(&transcript).unwrap();
        recognizer.process_transcript(&transcript).unwrap();
        // Only line 1 is complete; line 2 never fires. Repeated calls on
        // the same transcript must not double-fire line 1 either.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cosine_similarity_dimension_mismatch_errors() {
        assert!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]).is_err());
    }
}
