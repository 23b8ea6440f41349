//! Base64 wire encoding.
//!
//! Every binary payload that crosses the realtime channel is standard,
//! padded base64. The conversion is lossless in both directions.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::error::CryptoError;

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn from_base64(input: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(input)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}

/// `#[serde(with = "crate::encoding::base64_bytes")]` for `Vec<u8>` fields.
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::to_base64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        super::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}
