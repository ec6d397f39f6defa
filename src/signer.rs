//! Proxy-side response signing.
//!
//! The signer works on fully buffered bodies: it undoes upstream compression,
//! signs the exact bytes that will be forwarded and rewrites the framing
//! headers so they describe those bytes.

use std::io::Read;

use bytes::Bytes;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec;
use crate::content_policy::EligibleSet;
use crate::core::observability;
use crate::key_management::{SignError, SigningKey, ALGORITHM};

pub const HEADER_ALGO: HeaderName = HeaderName::from_static("x-arc-algo");
pub const HEADER_DIGEST: HeaderName = HeaderName::from_static("x-arc-digest");
pub const HEADER_SIGNATURE: HeaderName = HeaderName::from_static("x-arc-signature");

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("failed to decode {encoding} body: {source}")]
    Decompress {
        encoding: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error("invalid header value: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),
}

/// A buffered upstream response on its way through the signer.
#[derive(Debug, Clone)]
pub struct SignedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl SignedResponse {
    pub fn content_type(&self) -> &str {
        header_str(&self.headers, &CONTENT_TYPE).unwrap_or_default()
    }

    pub fn content_encoding(&self) -> Option<&str> {
        header_str(&self.headers, &CONTENT_ENCODING)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    pub algo: String,
    /// Troubleshooting aid only. Verifiers never consult it.
    pub digest: Option<String>,
    pub signature: String,
}

impl AuthHeaders {
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), SignerError> {
        headers.insert(HEADER_ALGO, HeaderValue::from_str(&self.algo)?);
        if let Some(digest) = &self.digest {
            headers.insert(HEADER_DIGEST, HeaderValue::from_str(digest)?);
        }
        headers.insert(HEADER_SIGNATURE, HeaderValue::from_str(&self.signature)?);
        Ok(())
    }
}

pub struct Signer {
    key: SigningKey,
    eligible: EligibleSet,
    emit_digest: bool,
}

impl Signer {
    pub fn new(key: SigningKey) -> Self {
        Self {
            key,
            eligible: EligibleSet::default(),
            emit_digest: false,
        }
    }

    pub fn with_digest(mut self, emit_digest: bool) -> Self {
        self.emit_digest = emit_digest;
        self
    }

    pub fn with_eligible_set(mut self, eligible: EligibleSet) -> Self {
        self.eligible = eligible;
        self
    }

    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    /// Sign `body` if `content_type` is eligible. Ineligible content yields
    /// `Ok(None)`; a crypto failure is an error, never an unsigned success.
    pub fn sign(&self, body: &[u8], content_type: &str) -> Result<Option<AuthHeaders>, SignerError> {
        if !self.eligible.is_eligible(content_type) {
            return Ok(None);
        }

        let digest = self
            .emit_digest
            .then(|| codec::encode_base64(&Sha256::digest(body)));
        let signature = codec::encode_base64(&self.key.sign(body)?);

        Ok(Some(AuthHeaders {
            algo: ALGORITHM.to_string(),
            digest,
            signature,
        }))
    }

    /// Decompress, sign and rewrite headers of a buffered upstream response.
    pub fn prepare(&self, mut response: SignedResponse) -> Result<SignedResponse, SignerError> {
        let content_type = response.content_type().to_string();
        let eligible = self.eligible.is_eligible(&content_type);

        // Upstream may try to smuggle its own authentication headers through.
        response.headers.remove(HEADER_ALGO);
        response.headers.remove(HEADER_DIGEST);
        response.headers.remove(HEADER_SIGNATURE);

        if let Some(encoding) = response.content_encoding().map(str::to_ascii_lowercase) {
            match decompress(&encoding, &response.body) {
                Ok(Some(decoded)) => {
                    debug!(
                        encoding = %encoding,
                        compressed = response.body.len(),
                        decompressed = decoded.len(),
                        "Decompressed upstream body"
                    );
                    response.body = Bytes::from(decoded);
                    response.headers.remove(CONTENT_ENCODING);
                }
                Ok(None) => {
                    response.headers.remove(CONTENT_ENCODING);
                }
                // Nothing to sign, so the encoded body can travel as-is.
                Err(SignerError::UnsupportedEncoding(encoding)) if !eligible => {
                    debug!(encoding = %encoding, "Forwarding body with unsupported encoding unsigned");
                }
                Err(SignerError::Decompress { encoding, source }) if !eligible => {
                    debug!(encoding = %encoding, error = %source, "Forwarding undecodable body unsigned");
                }
                Err(e) => return Err(e),
            }
        }

        // The body is buffered, so the framing is always a plain length.
        response.headers.remove(TRANSFER_ENCODING);
        let true_length = response.body.len().to_string();
        if let Some(advertised) = header_str(&response.headers, &CONTENT_LENGTH) {
            if advertised != true_length {
                debug!(advertised = %advertised, actual = %true_length, "Correcting Content-Length");
            }
        }
        response
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from_str(&true_length)?);

        // The exact bytes are signed; charsets are never decoded here.
        match self.sign(&response.body, &content_type) {
            Ok(Some(auth)) => {
                auth.apply(&mut response.headers)?;
                observability::record_signed();
                debug!(
                    content_type = %content_type,
                    bytes = response.body.len(),
                    "Signed response"
                );
            }
            Ok(None) => {
                observability::record_passthrough();
            }
            Err(e) => {
                observability::record_sign_failure();
                warn!(error = %e, content_type = %content_type, "Signing failed");
                return Err(e);
            }
        }

        Ok(response)
    }
}

/// `Ok(None)` for the identity encoding.
fn decompress(encoding: &str, body: &[u8]) -> Result<Option<Vec<u8>>, SignerError> {
    let io_error = |source| SignerError::Decompress {
        encoding: encoding.to_string(),
        source,
    };

    let mut decoded = Vec::new();
    match encoding.trim() {
        "" | "identity" => return Ok(None),
        "gzip" | "x-gzip" => {
            MultiGzDecoder::new(body)
                .read_to_end(&mut decoded)
                .map_err(io_error)?;
        }
        "deflate" => {
            // Servers disagree on whether "deflate" carries the zlib wrapper.
            if ZlibDecoder::new(body).read_to_end(&mut decoded).is_err() {
                decoded.clear();
                DeflateDecoder::new(body)
                    .read_to_end(&mut decoded)
                    .map_err(io_error)?;
            }
        }
        other => return Err(SignerError::UnsupportedEncoding(other.to_string())),
    }
    Ok(Some(decoded))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_management::VerifyingKey;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use proptest::prelude::*;
    use std::io::Write;

    fn signer() -> (Signer, VerifyingKey) {
        let (key, _) = SigningKey::generate().unwrap();
        let verifying = VerifyingKey::from_spki_der(&key.public_key_spki()).unwrap();
        (Signer::new(key), verifying)
    }

    fn response(content_type: &str, body: &[u8]) -> SignedResponse {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        SignedResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::copy_from_slice(body),
        }
    }

    fn gzip(body: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_eligible_body_gets_verifiable_signature() {
        let (signer, verifying) = signer();
        let auth = signer.sign(b"<html></html>", "text/html").unwrap().unwrap();

        assert_eq!(auth.algo, "ECDSA_P-256; SHA-256");
        assert!(auth.digest.is_none());
        assert!(verifying.verify_encoded(b"<html></html>", &auth.signature).is_ok());
    }

    #[test]
    fn test_ineligible_body_is_not_signed() {
        let (signer, _) = signer();
        assert!(signer.sign(&[0x89, 0x50, 0x4e, 0x47], "image/png").unwrap().is_none());

        let prepared = signer.prepare(response("image/png", &[1, 2, 3])).unwrap();
        assert!(prepared.headers.get(HEADER_SIGNATURE).is_none());
        assert!(prepared.headers.get(HEADER_ALGO).is_none());
    }

    #[test]
    fn test_digest_is_opt_in() {
        let (signer, _) = signer();
        let signer = signer.with_digest(true);
        let auth = signer.sign(b"{}", "application/json").unwrap().unwrap();
        assert_eq!(
            auth.digest.unwrap(),
            codec::encode_base64(&Sha256::digest(b"{}"))
        );
    }

    #[test]
    fn test_gzip_body_is_decompressed_and_length_corrected() {
        let (signer, verifying) = signer();
        let body = b"{\"message\":\"hello hello hello hello\"}".repeat(20);
        let compressed = gzip(&body);

        let mut upstream = response("application/json", &compressed);
        upstream.headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        upstream.headers.insert(
            CONTENT_LENGTH,
            HeaderValue::from_str(&compressed.len().to_string()).unwrap(),
        );

        let prepared = signer.prepare(upstream).unwrap();

        assert_eq!(prepared.body.as_ref(), body.as_slice());
        assert!(prepared.headers.get(CONTENT_ENCODING).is_none());
        assert_eq!(
            prepared.headers.get(CONTENT_LENGTH).unwrap(),
            body.len().to_string().as_str()
        );
        let signature = prepared.headers.get(HEADER_SIGNATURE).unwrap().to_str().unwrap();
        assert!(verifying.verify_encoded(&body, signature).is_ok());
    }

    #[test]
    fn test_upstream_auth_headers_are_stripped() {
        let (signer, _) = signer();
        let mut upstream = response("image/png", b"png");
        upstream
            .headers
            .insert(HEADER_SIGNATURE, HeaderValue::from_static("forged"));

        let prepared = signer.prepare(upstream).unwrap();
        assert!(prepared.headers.get(HEADER_SIGNATURE).is_none());
    }

    #[test]
    fn test_corrupt_gzip_fails_loudly() {
        let (signer, _) = signer();
        let mut upstream = response("text/html", b"definitely not gzip");
        upstream.headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        assert!(matches!(
            signer.prepare(upstream),
            Err(SignerError::Decompress { .. })
        ));
    }

    #[test]
    fn test_corrupt_gzip_image_is_forwarded_unchanged() {
        let (signer, _) = signer();
        let mut upstream = response("image/png", b"definitely not gzip");
        upstream.headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        let prepared = signer.prepare(upstream).unwrap();
        assert_eq!(prepared.headers.get(CONTENT_ENCODING).unwrap(), "gzip");
        assert!(prepared.headers.get(HEADER_SIGNATURE).is_none());
        assert_eq!(&prepared.body[..], b"definitely not gzip");
    }

    #[test]
    fn test_unsupported_encoding_only_passes_for_ineligible_content() {
        let (signer, _) = signer();

        let mut binary = response("image/webp", b"\x00\x01");
        binary.headers.insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        let prepared = signer.prepare(binary).unwrap();
        assert_eq!(prepared.headers.get(CONTENT_ENCODING).unwrap(), "br");

        let mut text = response("text/html", b"\x00\x01");
        text.headers.insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        assert!(matches!(
            signer.prepare(text),
            Err(SignerError::UnsupportedEncoding(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_single_bit_flip_breaks_signature(
            body in proptest::collection::vec(any::<u8>(), 1..512),
            bit in any::<usize>(),
        ) {
            let (signer, verifying) = signer();
            let auth = signer.sign(&body, "text/plain").unwrap().unwrap();
            prop_assert!(verifying.verify_encoded(&body, &auth.signature).is_ok());

            let mut tampered = body.clone();
            let bit = bit % (tampered.len() * 8);
            tampered[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(verifying.verify_encoded(&tampered, &auth.signature).is_err());
        }
    }
}
