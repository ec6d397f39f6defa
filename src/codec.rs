//! Conversions between PEM/base64 text and raw key or signature bytes.

use base64::{engine::general_purpose, Engine as _};
use pkcs8::der::pem::{self, LineEnding};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid PEM: {0}")]
    Pem(String),
}

pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Decode standard padded base64. Surrounding whitespace is ignored, which is
/// how TXT record values and header values usually arrive.
pub fn decode_base64(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(general_purpose::STANDARD.decode(text.trim())?)
}

/// Returns the PEM label (e.g. `PRIVATE KEY`) and the DER payload.
pub fn pem_to_der(pem_text: &str) -> Result<(String, Vec<u8>), CodecError> {
    let (label, der) = pem::decode_vec(pem_text.trim().as_bytes())
        .map_err(|e| CodecError::Pem(e.to_string()))?;
    Ok((label.to_string(), der))
}

pub fn der_to_pem(label: &str, der: &[u8]) -> Result<String, CodecError> {
    pem::encode_string(label, LineEnding::LF, der).map_err(|e| CodecError::Pem(e.to_string()))
}
