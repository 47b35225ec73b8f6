//! Framing of stream payloads: JSON carried in a single `data` field.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::StreamError;

/// Name of the stream field holding the encoded payload.
pub const DATA_FIELD: &str = "data";

pub fn encode<T: Serialize>(value: &T) -> Result<String, StreamError> {
    Ok(serde_json::to_string(value)?)
}

/// Decoding failures are returned as-is; callers treat them as malformed
/// messages rather than stream failures.
pub fn decode<T: DeserializeOwned>(payload: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(payload)
}
