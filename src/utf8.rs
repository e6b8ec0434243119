//! Byte-level UTF-8 repair for transcriber output.
//!
//! Ported from the reference `sanitize_text`: walks the byte string
//! left-to-right, recognizing 1/2/3/4-byte sequences by their leading-byte
//! pattern with continuation-byte validation, replacing any invalid or
//! truncated sequence with `?` and advancing a single byte on failure.

/// Replaces invalid or incomplete UTF-8 byte sequences in `text` with `?`.
///
/// Always produces valid UTF-8; valid input is returned unchanged.
pub fn sanitize_text(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0usize;

    while i < bytes.len() {
        let remaining = bytes.len() - i;
        let c = bytes[i];

        if c < 0x80 {
            result.push(c);
            i += 1;
        } else if (c & 0xE0) == 0xC0 {
            if remaining < 2 || (bytes[i + 1] & 0xC0) != 0x80 {
                result.push(b'?');
                i += 1;
            } else {
                result.push(bytes[i]);
                result.push(bytes[i + 1]);
                i += 2;
            }
        } else if (c & 0xF0) == 0xE0 {
            if remaining < 3 || (bytes[i + 1] & 0xC0) != 0x80 || (bytes[i + 2] & 0xC0) != 0x80 {
                result.push(b'?');
                i += 1;
            } else {
                result.push(bytes[i]);
                result.push(bytes[i + 1]);
                result.push(bytes[i + 2]);
                i += 3;
            }
        } else if (c & 0xF8) == 0xF0 {
            if remaining < 4
                || (bytes[i + 1] & 0xC0) != 0x80
                || (bytes[i + 2] & 0xC0) != 0x80
                || (bytes[i + 3] & 0xC0) != 0x80
            {
                result.push(b'?');
                i += 1;
            } else {
                result.push(bytes[i]);
                result.push(bytes[i + 1]);
                result.push(bytes[i + 2]);
                result.push(bytes[i + 3]);
                i += 4;
            }
        } else {
            result.push(b'?');
            i += 1;
        }
    }

    // `bytes` is a well-formed &str's bytes with invalid sequences replaced
    // 1:1 by the ASCII byte '?', so the result is always valid UTF-8.
    String::from_utf8(result).expect("sanitize_text always produces valid UTF-8")
}

/// Sanitizes a raw, possibly-invalid byte buffer (e.g. output copied directly
/// from an inference runtime before `String` conversion is attempted).
pub fn sanitize_bytes(bytes: &[u8]) -> String {
    // SAFETY-equivalent: operate on the raw bytes the same way the str path
    // does, without requiring well-formed UTF-8 up front.
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0usize;

    while i < bytes.len() {
        let remaining = bytes.len() - i;
        let c = bytes[i];

        if c < 0x80 {
            result.push(c);
            i += 1;
        } else if (c & 0xE0) == 0xC0 {
            if remaining < 2 || (bytes[i + 1] & 0xC0) != 0x80 {
                result.push(b'?');
                i += 1;
            } else {
                result.extend_from_slice(&bytes[i..i + 2]);
                i += 2;
            }
        } else if (c & 0xF0) == 0xE0 {
            if remaining < 3 || (bytes[i + 1] & 0xC0) != 0x80 || (bytes[i + 2] & 0xC0) != 0x80 {
                result.push(b'?');
                i += 1;
            } else {
                result.extend_from_slice(&bytes[i..i + 3]);
                i += 3;
            }
        } else if (c & 0xF8) == 0xF0 {
            if remaining < 4
                || (bytes[i + 1] & 0xC0) != 0x80
                || (bytes[i + 2] & 0xC0) != 0x80
                || (bytes[i + 3] & 0xC0) != 0x80
            {
                result.push(b'?');
                i += 1;
            } else {
                result.extend_from_slice(&bytes[i..i + 4]);
                i += 4;
            }
        } else {
            result.push(b'?');
            i += 1;
        }
    }

    String::from_utf8(result).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}
