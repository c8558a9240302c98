//! Error types for the refresh path, the verification path and configuration
//!
//! The two paths never share an error type. Refresh failures ([`RefreshError`])
//! are absorbed by the scheduler's backoff and only ever reach logs and
//! [`RefreshStats`](crate::RefreshStats). Verification failures
//! ([`VerifyError`]) are returned synchronously to the caller as a rejected
//! token.

use http::StatusCode;
use thiserror::Error;

/// A refresh attempt failed somewhere between the request and the cache swap
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The request never produced a response (DNS, connect, TLS, timeout)
    #[error("key endpoint request failed: {0}")]
    Transport(String),

    /// The endpoint answered with something other than 200 OK
    #[error("key endpoint returned HTTP {}", .0.as_u16())]
    Status(StatusCode),

    /// The response body exceeded the configured limit
    #[error("key document larger than {limit} bytes")]
    ResponseTooLarge {
        /// Configured maximum document size in bytes
        limit: usize,
    },

    /// Headers or body could not be turned into a key table
    #[error("malformed key document: {0}")]
    MalformedDocument(#[from] DocumentError),
}

impl RefreshError {
    /// Whether this failure belongs to the transport class (network or non-200)
    /// rather than to a malformed document.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Status(_) | Self::ResponseTooLarge { .. }
        )
    }
}

/// The key document (headers or body) could not be decoded
#[derive(Debug, Error)]
pub enum DocumentError {
    /// A freshness header is absent
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    /// A freshness header is present but its value cannot be used
    #[error("invalid {name} header value {value:?}")]
    InvalidHeader {
        /// Header (or directive) name
        name: &'static str,
        /// Offending raw value
        value: String,
    },

    /// The body is not a JSON object of key id to PEM string
    #[error("invalid key document JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The document parsed but lists no keys
    #[error("key document contains no keys")]
    EmptyKeySet,

    /// An entry is not a PEM encoded certificate
    #[error("key {kid}: invalid PEM certificate: {reason}")]
    InvalidPem {
        /// Key id of the failing entry
        kid: String,
        /// Parser detail
        reason: String,
    },

    /// The PEM payload is not a parseable X.509 certificate
    #[error("key {kid}: invalid X.509 certificate: {reason}")]
    InvalidCertificate {
        /// Key id of the failing entry
        kid: String,
        /// Parser detail
        reason: String,
    },

    /// The certificate carries a public key that is not RSA
    #[error("key {kid}: unsupported public key type {key_type}")]
    UnsupportedKeyType {
        /// Key id of the failing entry
        kid: String,
        /// Human readable key type (e.g. `EC`)
        key_type: String,
    },
}

/// A token was rejected
///
/// Only [`VerifyError::UnknownKey`] can change outcome on a later call (a
/// refresh may publish the key in the meantime); every other variant is a
/// deterministic function of the token and will be returned again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// Not three base64url segments, or an undecodable header or payload
    #[error("malformed token: {0}")]
    TokenStructure(String),

    /// The header names an algorithm other than the accepted one
    #[error("unsupported signing algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    /// The header's `kid` is not in the current key table
    #[error("no signing key with id {0:?}")]
    UnknownKey(String),

    /// The signature does not verify under the selected key
    #[error("token signature is invalid")]
    SignatureInvalid,
}

impl VerifyError {
    /// Whether retrying the whole `verify` call later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UnknownKey(_))
    }
}

/// Invalid [`VerifierConfig`](crate::VerifierConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The certificates URL does not parse
    #[error("invalid certificates URL {url:?}: {reason}")]
    InvalidUrl {
        /// The configured URL
        url: String,
        /// Parser detail
        reason: String,
    },

    /// The certificates URL uses a scheme other than https (http is allowed on loopback only)
    #[error("certificates URL must use https (http only allowed for loopback hosts): {0}")]
    InsecureUrl(String),

    /// The HTTP client could not be built
    #[error("failed to create HTTP client: {0}")]
    HttpClient(String),
}
