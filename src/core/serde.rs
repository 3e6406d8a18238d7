use serde::{Serialize, Deserialize, Serializer, Deserializer};
use serde::de::Error as _;
use std::time::Duration;

use super::KEY_SIZE;

/// Serializes Duration as seconds
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    duration.as_secs_f64().serialize(serializer)
}

/// Deserializes Duration from seconds
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(D::Error::custom(format!("invalid duration: {}", secs)));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Serializes a device key as the local key string handed out by the cloud.
///
/// Keys that are not valid UTF-8 fall back to a hex string prefixed with `hex:`.
pub fn serialize_key<S>(key: &[u8; KEY_SIZE], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match std::str::from_utf8(key) {
        Ok(text) => text.serialize(serializer),
        Err(_) => format!("hex:{}", hex::encode(key)).serialize(serializer),
    }
}

/// Deserializes a device key from a 16 character local key or a `hex:` string
pub fn deserialize_key<'de, D>(deserializer: D) -> Result<[u8; KEY_SIZE], D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_key(&text).map_err(D::Error::custom)
}

/// Parses a device key from its textual form
pub fn parse_key(text: &str) -> Result<[u8; KEY_SIZE], String> {
    let bytes = match text.strip_prefix("hex:") {
        Some(hex_text) => hex::decode(hex_text).map_err(|e| format!("invalid hex key: {}", e))?,
        None => text.as_bytes().to_vec(),
    };

    bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("device key must be {} bytes, got {}", KEY_SIZE, bytes.len()))
}
