//! ECDSA P-256 key import, signing and verification.
//!
//! Signatures use the fixed-width `r || s` encoding (64 bytes), which is what
//! WebCrypto emits and expects, so either side of the protocol can be
//! replaced by a browser implementation.

use const_oid::db::rfc5912::{ID_EC_PUBLIC_KEY, SECP_256_R_1};
use pkcs8::der::Decode;
use pkcs8::{PrivateKeyInfo, SubjectPublicKeyInfoRef};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED,
    ECDSA_P256_SHA256_FIXED_SIGNING,
};
use thiserror::Error;

use crate::codec::{self, CodecError};

/// Value of the `X-ARC-ALGO` header.
pub const ALGORITHM: &str = "ECDSA_P-256; SHA-256";

const PKCS8_PEM_LABEL: &str = "PRIVATE KEY";

/// DER prefix of a P-256 `SubjectPublicKeyInfo` holding an uncompressed point.
const P256_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

#[derive(Debug, Error)]
pub enum KeyError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("malformed DER: {0}")]
    Der(#[from] pkcs8::der::Error),

    #[error("key rejected: {0}")]
    Rejected(#[from] ring::error::KeyRejected),

    #[error("expected a PRIVATE KEY PEM block, found {0}")]
    UnexpectedPemLabel(String),

    #[error("not an EC P-256 key")]
    UnsupportedKeyType,

    #[error("malformed key")]
    MalformedKey,
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error("crypto backend failed to sign")]
    Backend,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("signature mismatch")]
    Mismatch,
}

/// The proxy's private key. Import failures are fatal at startup.
pub struct SigningKey {
    pair: EcdsaKeyPair,
    rng: SystemRandom,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Parse an EC P-256 private key from its PKCS#8 PEM form.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, KeyError> {
        let (label, der) = codec::pem_to_der(pem)?;
        if label != PKCS8_PEM_LABEL {
            return Err(KeyError::UnexpectedPemLabel(label));
        }
        Self::from_pkcs8_der(&der)
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, KeyError> {
        let info = PrivateKeyInfo::from_der(der)?;
        if info.algorithm.oid != ID_EC_PUBLIC_KEY {
            return Err(KeyError::UnsupportedKeyType);
        }
        match info.algorithm.parameters_oid() {
            Ok(curve) if curve == SECP_256_R_1 => {}
            _ => return Err(KeyError::UnsupportedKeyType),
        }

        let rng = SystemRandom::new();
        let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, der, &rng)?;
        Ok(Self { pair, rng })
    }

    /// Generate a fresh key and return it with its PKCS#8 DER encoding.
    pub fn generate() -> Result<(Self, Vec<u8>), KeyError> {
        let rng = SystemRandom::new();
        let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| KeyError::MalformedKey)?;
        let der = document.as_ref().to_vec();
        Ok((Self::from_pkcs8_der(&der)?, der))
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignError> {
        self.pair
            .sign(&self.rng, message)
            .map(|signature| signature.as_ref().to_vec())
            .map_err(|_| SignError::Backend)
    }

    /// `SubjectPublicKeyInfo` DER of the matching public key.
    pub fn public_key_spki(&self) -> Vec<u8> {
        let point = self.pair.public_key().as_ref();
        let mut der = Vec::with_capacity(P256_SPKI_PREFIX.len() + point.len());
        der.extend_from_slice(&P256_SPKI_PREFIX);
        der.extend_from_slice(point);
        der
    }

    /// Base64 SPKI as it appears in the DNS TXT record.
    pub fn public_key_base64(&self) -> String {
        codec::encode_base64(&self.public_key_spki())
    }
}

/// A domain's published key, imported from base64 SPKI DER.
#[derive(Debug, Clone)]
pub struct VerifyingKey {
    key: UnparsedPublicKey<Vec<u8>>,
}

impl VerifyingKey {
    pub fn from_spki_base64(encoded: &str) -> Result<Self, KeyError> {
        Self::from_spki_der(&codec::decode_base64(encoded)?)
    }

    pub fn from_spki_der(der: &[u8]) -> Result<Self, KeyError> {
        let spki = SubjectPublicKeyInfoRef::from_der(der)?;
        if spki.algorithm.oid != ID_EC_PUBLIC_KEY {
            return Err(KeyError::UnsupportedKeyType);
        }
        match spki.algorithm.parameters_oid() {
            Ok(curve) if curve == SECP_256_R_1 => {}
            _ => return Err(KeyError::UnsupportedKeyType),
        }

        let point = spki
            .subject_public_key
            .as_bytes()
            .ok_or(KeyError::MalformedKey)?;
        // Uncompressed SEC1 point: 0x04 || X || Y
        if point.len() != 65 || point[0] != 0x04 {
            return Err(KeyError::MalformedKey);
        }

        Ok(Self {
            key: UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, point.to_vec()),
        })
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), VerifyError> {
        self.key
            .verify(message, signature)
            .map_err(|_| VerifyError::Mismatch)
    }

    /// Verify against a base64 signature header value.
    pub fn verify_encoded(&self, message: &[u8], encoded_signature: &str) -> Result<(), VerifyError> {
        let signature = codec::decode_base64(encoded_signature)?;
        self.verify(message, &signature)
    }
}
