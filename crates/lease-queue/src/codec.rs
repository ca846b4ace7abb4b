//! Message body wire format.
//!
//! Payloads are serialized to JSON and percent-encoded twice before they are
//! handed to the transport. The query-string transport decodes one layer on
//! the service side, so the stored body still carries one layer of escaping
//! and survives parentheses, spaces, ampersands and control characters. On
//! receipt both layers are removed and the JSON is parsed back.

use crate::error::SerializationError;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;

/// Encode a payload into the text stored as the message body
pub fn encode_body<T>(payload: &T) -> Result<String, SerializationError>
where
    T: Serialize + ?Sized,
{
    let json = serde_json::to_string(payload)?;
    let escaped = urlencoding::encode(&json);
    Ok(urlencoding::encode(&escaped).into_owned())
}

/// Decode a message body produced by [`encode_body`]
pub fn decode_body<T>(body: &str) -> Result<T, SerializationError>
where
    T: DeserializeOwned,
{
    let escaped = unescape(body)?;
    let json = unescape(&escaped)?;
    Ok(serde_json::from_str(&json)?)
}

fn unescape(text: &str) -> Result<String, SerializationError> {
    urlencoding::decode(text)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| SerializationError::Encoding {
            message: e.to_string(),
        })
}
