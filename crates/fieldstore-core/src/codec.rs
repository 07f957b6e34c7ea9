// ABOUTME: Converts record bodies between in-memory JSON values and canonical JSON text.
// ABOUTME: Schema-agnostic and free of I/O; malformed input is a recoverable CodecError.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// The arbitrarily nested payload of a record.
pub type Body = serde_json::Value;

/// Errors produced while encoding or decoding record bodies.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Body text that does not parse. Callers treat this as a corrupt record,
    /// never as a fatal fault.
    #[error("malformed record data at line {line}, column {column}{}: {message}", schema_suffix(.schema_version))]
    Malformed {
        line: usize,
        column: usize,
        message: String,
        schema_version: Option<String>,
    },

    /// The record has no decoded body to encode, because its stored text was
    /// corrupt. Encoding a placeholder would overwrite that text.
    #[error("record has no body to encode")]
    MissingBody,

    #[error("record body could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}

fn schema_suffix(schema_version: &Option<String>) -> String {
    match schema_version {
        Some(v) => format!(" (schema {v})"),
        None => String::new(),
    }
}

impl CodecError {
    fn malformed(err: serde_json::Error, schema_version: Option<&str>) -> Self {
        CodecError::Malformed {
            line: err.line(),
            column: err.column(),
            message: err.to_string(),
            schema_version: schema_version.map(str::to_string),
        }
    }
}

/// Serialize a body to compact JSON text. Object keys come out sorted, so the
/// same logical value always produces the same text.
pub fn serialize<T: Serialize + ?Sized>(body: &T) -> Result<String, CodecError> {
    // Go through Value so struct-shaped bodies get the same sorted key order.
    let value = serde_json::to_value(body).map_err(CodecError::Encode)?;
    serde_json::to_string(&value).map_err(CodecError::Encode)
}

/// Deserialize body text. The schema version, when known, is only carried
/// into the error for diagnostics; no validation against it is attempted.
pub fn deserialize(text: &str, schema_hint: Option<&str>) -> Result<Body, CodecError> {
    deserialize_as(text, schema_hint)
}

/// Deserialize body text straight into a caller-defined type.
pub fn deserialize_as<T: DeserializeOwned>(
    text: &str,
    schema_hint: Option<&str>,
) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::malformed(e, schema_hint))
}
