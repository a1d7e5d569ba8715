//! # Content Codec
//!
//! Transport-safe textual encoding of raw document bytes.
//!
//! ## Overview
//!
//! Document bytes cross process and store boundaries as padded base64. The
//! codec is a pure transform with a strict decode contract: a payload whose
//! stripped length is not a multiple of 4, or that contains characters
//! outside the base64 alphabet, is `MalformedContent` and is rejected
//! outright. Decode never truncates and never pads on the caller's behalf.
//!
//! Padding repair exists only as [`ContentCodec::repair_padding`], an
//! explicit remediation step for historical records. It logs every repair so
//! the operation leaves an audit trail; the hot path never calls it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::warn;

/// Base64 quantum: every well-formed padded payload is a multiple of this.
pub const ENCODED_BLOCK_SIZE: usize = 4;

/// Errors produced by decode-side validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed content: stripped length {0} is not a multiple of 4")]
    MalformedLength(usize),

    #[error("malformed content: {0}")]
    MalformedAlphabet(String),
}

/// Pure encode/decode transform for document payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentCodec;

impl ContentCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode raw bytes as padded base64. Always succeeds; the output length
    /// is always a multiple of 4 with no injected whitespace or newlines.
    pub fn encode(&self, bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    /// Decode a textual payload back to raw bytes.
    ///
    /// Surrounding whitespace is stripped first; after that the payload must
    /// be structurally valid or the whole decode fails. Partial output is
    /// never returned.
    pub fn decode(&self, text: &str) -> Result<Vec<u8>, CodecError> {
        let stripped = text.trim();

        if stripped.len() % ENCODED_BLOCK_SIZE != 0 {
            return Err(CodecError::MalformedLength(stripped.len()));
        }

        STANDARD
            .decode(stripped)
            .map_err(|e| CodecError::MalformedAlphabet(e.to_string()))
    }

    /// Validate a payload without materializing the decoded bytes.
    ///
    /// Used by the content store to reject malformed payloads at write time.
    pub fn validate(&self, text: &str) -> Result<(), CodecError> {
        self.decode(text).map(|_| ())
    }

    /// One-time remediation for a historical record whose padding was lost.
    ///
    /// Appends the missing `=` characters when that alone makes the payload
    /// well-formed, and logs the repair. Returns the repaired payload, or the
    /// original error when padding is not the problem.
    pub fn repair_padding(&self, key: &str, text: &str) -> Result<String, CodecError> {
        let stripped = text.trim();
        let remainder = stripped.len() % ENCODED_BLOCK_SIZE;

        if remainder == 0 {
            return match self.validate(stripped) {
                Ok(()) => Ok(stripped.to_string()),
                Err(e) => Err(e),
            };
        }

        // A single lost character of a quantum cannot be reconstructed
        if remainder == 1 {
            return Err(CodecError::MalformedLength(stripped.len()));
        }

        let padded = format!(
            "{stripped}{}",
            "=".repeat(ENCODED_BLOCK_SIZE - remainder)
        );
        self.validate(&padded)?;

        warn!(
            content_key = %key,
            original_length = stripped.len(),
            padded_length = padded.len(),
            "Repaired missing base64 padding on legacy content record"
        );

        Ok(padded)
    }
}
