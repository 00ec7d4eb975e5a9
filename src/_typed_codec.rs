//! Codec seam for typed orchestration/activity/entity payloads.
//!
//! Everything crosses the engine as strings; typed APIs encode at the edges.

use serde::Serialize;
use serde::de::DeserializeOwned;

pub trait Codec {
    fn encode<T: Serialize>(value: &T) -> Result<String, String>;
    fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, String>;
}

/// JSON codec used by all `*_typed` APIs.
pub struct Json;

impl Codec for Json {
    fn encode<T: Serialize>(value: &T) -> Result<String, String> {
        serde_json::to_string(value).map_err(|e| format!("encode: {e}"))
    }

    fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
        serde_json::from_str(raw).map_err(|e| format!("decode: {e}"))
    }
}
