//! Decoding of base64 image payloads returned by the generation API.

use base64::{engine::general_purpose, Engine as _};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Image payload is empty")]
    Empty,

    #[error("Invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Decode an image payload, accepting either bare base64 or a
/// `data:<mime>;base64,` URL.
pub fn decode_image(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let data = match payload.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => payload,
    };
    let data = data.trim();
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(general_purpose::STANDARD.decode(data)?)
}
