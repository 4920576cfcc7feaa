//! Decoding of captured worker stdout into a JSON document

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("worker produced no output")]
    Empty,

    #[error("invalid JSON: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Decode stdout as exactly one JSON document.
///
/// Surrounding whitespace is allowed; trailing content after the document
/// is an error. The input is never modified.
pub fn decode_output(stdout: &[u8]) -> Result<Value, DecodeError> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }
    Ok(serde_json::from_slice(stdout)?)
}
