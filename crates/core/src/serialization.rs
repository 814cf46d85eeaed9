//! Pure functions for encoding values to and from their stored text form.
//!
//! Every cached value, session record and published payload is stored as
//! JSON, which keeps values human-readable in `redis-cli` and lets the
//! decoder reject anything that does not fit the requested type.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CacheError, Result};

/// Encodes a value as JSON text.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))
}

/// Decodes JSON text into `T`.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| CacheError::Deserialization(e.to_string()))
}
