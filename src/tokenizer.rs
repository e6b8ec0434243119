//! Byte-level tokenizer matching the reference's bespoke binary vocabulary
//! format: a sequence of length-prefixed byte records, encoded with a
//! varint-like length byte and decoded with greedy longest-prefix matching.

use crate::error::{Error, Result};
use std::path::Path;

const DEFAULT_SPACE_MARKER: &str = "\u{2581}";

/// A loaded token table: `tokens_to_bytes[id]` is the byte sequence for
/// token `id`. A zero-length entry marks a reserved/special-token slot with
/// no literal bytes of its own and cannot be produced by `decode`.
pub struct Tokenizer {
    tokens_to_bytes: Vec<Vec<u8>>,
    space_marker: String,
}

impl Tokenizer {
    /// Loads a tokenizer table from its binary file representation.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())
            .map_err(|e| Error::LoadError(format!("failed to read tokenizer file: {e}")))?;
        Self::load_from_bytes(&data)
    }

    /// Parses a tokenizer table from an in-memory binary blob.
    pub fn load_from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::LoadError("tokenizer data is empty".to_string()));
        }
        let mut tokens_to_bytes = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let first_byte = data[offset];
            offset += 1;
            if first_byte == 0 {
                tokens_to_bytes.push(Vec::new());
                continue;
            }
            let byte_count = if first_byte < 128 {
                first_byte as usize
            } else {
                let second_byte = *data.get(offset).ok_or_else(|| {
                    Error::LoadError("tokenizer file truncated (missing length byte)".to_string())
                })?;
                offset += 1;
                (second_byte as usize) * 128 + (first_byte as usize) - 128
            };
            let end = offset + byte_count;
            let bytes = data
                .get(offset..end)
                .ok_or_else(|| Error::LoadError("tokenizer file truncated (record body)".to_string()))?
                .to_vec();
            offset = end;
            tokens_to_bytes.push(bytes);
        }
        if tokens_to_bytes.is_empty() {
            return Err(Error::LoadError("no tokens found in tokenizer data".to_string()));
        }
        Ok(Self {
            tokens_to_bytes,
            space_marker: DEFAULT_SPACE_MARKER.to_string(),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.tokens_to_bytes.len()
    }

    /// Encodes `text` into token ids via greedy longest-prefix matching
    /// against the vocabulary, after substituting the space marker for ' '.
    pub fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let marked = text.replace(' ', &self.space_marker);
        let mut remaining: Vec<u8> = marked.into_bytes();
        let mut result = Vec::new();

        while !remaining.is_empty() {
            let mut longest_match_len = 0usize;
            let mut longest_match_token: Option<i64> = None;

            for (id, bytes) in self.tokens_to_bytes.iter().enumerate() {
                if bytes.is_empty() || bytes.len() > remaining.len() {
                    continue;
                }
                if remaining[..bytes.len()] == bytes[..] && bytes.len() > longest_match_len {
                    longest_match_len = bytes.len();
                    longest_match_token = Some(id as i64);
                }
            }

            match longest_match_token {
                Some(token) => {
                    result.push(token);
                    remaining.drain(..longest_match_len);
                }
                None => {
                    return Err(Error::EncodingError(format!(
                        "no vocabulary entry matches remaining bytes starting with {:?}",
                        &remaining[..remaining.len().min(8)]
                    )));
                }
            }
        }

        Ok(result)
    }

    /// Decodes a sequence of token ids back to text, dropping any token
    /// whose bytes look like a special-token marker (`<...>`) when
    /// `skip_special` is set, then restoring the space marker and trimming
    /// outer whitespace.
    pub fn decode(&self, tokens: &[i64], skip_special: bool) -> Result<String> {
        let mut result_bytes = Vec::new();
        for &token in tokens {
            let idx = usize::try_from(token)
                .map_err(|_| Error::EncodingError(format!("invalid token id {token}")))?;
            let bytes = self
                .tokens_to_bytes
                .get(idx)
                .ok_or_else(|| Error::EncodingError(format!("invalid token id {token}")))?;
            if bytes.is_empty() {
                return Err(Error::EncodingError(format!("invalid token {token}: empty record")));
            }
            if skip_special && bytes.len() > 2 && bytes[0] == b'<' && bytes[bytes.len() - 1] == b'>' {
                continue;
            }
            result_bytes.extend_from_slice(bytes);
        }
        let raw = String::from_utf8_lossy(&result_bytes).into_owned();
        Ok(raw.replace(&self.space_marker, " ").trim().to_string())
    }
}
