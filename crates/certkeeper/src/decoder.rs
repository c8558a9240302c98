//! Key document decoding
//!
//! The provider publishes `{ "<kid>": "<PEM X.509 certificate>", ... }`. Each
//! certificate is parsed, its subject public key must be RSA, and the key is
//! kept as a standalone SubjectPublicKeyInfo plus a ready-to-use
//! [`DecodingKey`].
//!
//! Decoding is all-or-nothing: the first bad entry fails the whole document, so
//! a refresh either publishes the provider's complete key set or leaves the
//! previous table in place.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use jsonwebtoken::DecodingKey;
use tracing::debug;
use x509_parser::pem::parse_x509_pem;
use x509_parser::public_key::PublicKey;

use crate::cache::KeyTable;
use crate::error::DocumentError;

/// A provider public key, tagged by algorithm family
///
/// Only RSA keys are representable. Certificates carrying any other key type
/// are rejected while decoding, so verification never has to re-check what
/// kind of key it was handed.
#[derive(Clone)]
#[non_exhaustive]
pub enum VerificationKey {
    /// RSA public key, usable for the RS* signature family
    Rsa(RsaKey),
}

impl VerificationKey {
    /// The key in the form the signature primitive consumes
    pub fn decoding_key(&self) -> &DecodingKey {
        match self {
            Self::Rsa(key) => &key.decoding_key,
        }
    }

    /// DER encoded SubjectPublicKeyInfo
    pub fn public_key_der(&self) -> &[u8] {
        match self {
            Self::Rsa(key) => &key.spki_der,
        }
    }

    /// Standalone `PUBLIC KEY` PEM block for the key
    pub fn to_pem(&self) -> String {
        let encoded = STANDARD.encode(self.public_key_der());
        let mut pem = String::with_capacity(encoded.len() + encoded.len() / 64 + 64);
        pem.push_str("-----BEGIN PUBLIC KEY-----\n");
        // base64 output is ASCII, so byte chunks are valid str slices
        for line in encoded.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str("-----END PUBLIC KEY-----\n");
        pem
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsa(key) => f.debug_tuple("Rsa").field(key).finish(),
        }
    }
}

/// RSA public key extracted from a provider certificate
#[derive(Clone)]
pub struct RsaKey {
    spki_der: Vec<u8>,
    bits: usize,
    decoding_key: DecodingKey,
}

impl RsaKey {
    /// Modulus size in bits
    pub fn bits(&self) -> usize {
        self.bits
    }
}

// DecodingKey holds raw key material; print only what identifies the key
impl fmt::Debug for RsaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKey")
            .field("bits", &self.bits)
            .field("spki_len", &self.spki_der.len())
            .finish()
    }
}

/// Decode a key document body into a key table
///
/// # Errors
///
/// Returns [`DocumentError::InvalidJson`] if the body is not a JSON object of
/// strings, [`DocumentError::EmptyKeySet`] if it lists no keys, and the
/// per-entry errors from [`decode_certificate`] for the first entry that fails.
pub fn decode_key_document(body: &[u8]) -> Result<KeyTable, DocumentError> {
    let entries: BTreeMap<String, String> = serde_json::from_slice(body)?;
    if entries.is_empty() {
        return Err(DocumentError::EmptyKeySet);
    }

    let mut keys = BTreeMap::new();
    for (kid, pem) in entries {
        let key = decode_certificate(&kid, &pem)?;
        debug!(kid = %kid, "Decoded provider signing key");
        keys.insert(kid, Arc::new(key));
    }

    Ok(KeyTable::from_keys(keys))
}

/// Decode a single PEM certificate into a verification key
///
/// # Errors
///
/// Returns [`DocumentError::InvalidPem`] if the text is not a `CERTIFICATE` PEM
/// block, [`DocumentError::InvalidCertificate`] if the DER is not X.509, and
/// [`DocumentError::UnsupportedKeyType`] if the public key is not RSA.
pub fn decode_certificate(kid: &str, pem: &str) -> Result<VerificationKey, DocumentError> {
    let (_, block) = parse_x509_pem(pem.as_bytes()).map_err(|e| DocumentError::InvalidPem {
        kid: kid.to_string(),
        reason: e.to_string(),
    })?;

    if block.label != "CERTIFICATE" {
        return Err(DocumentError::InvalidPem {
            kid: kid.to_string(),
            reason: format!("expected CERTIFICATE block, found {}", block.label),
        });
    }

    let certificate = block
        .parse_x509()
        .map_err(|e| DocumentError::InvalidCertificate {
            kid: kid.to_string(),
            reason: e.to_string(),
        })?;

    let spki = certificate.public_key();
    let unsupported = |key_type: String| DocumentError::UnsupportedKeyType {
        kid: kid.to_string(),
        key_type,
    };

    match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => Ok(VerificationKey::Rsa(RsaKey {
            spki_der: spki.raw.to_vec(),
            bits: rsa.key_size(),
            // subjectPublicKey of an RSA SPKI is the PKCS#1 RSAPublicKey DER
            decoding_key: DecodingKey::from_rsa_der(&spki.subject_public_key.data),
        })),
        Ok(PublicKey::EC(_)) => Err(unsupported("EC".to_string())),
        Ok(PublicKey::DSA(_)) => Err(unsupported("DSA".to_string())),
        Ok(_) | Err(_) => Err(unsupported(format!(
            "algorithm {}",
            spki.algorithm.algorithm
        ))),
    }
}
