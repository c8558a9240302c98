//! ID token verification against the cached provider keys
//!
//! # Caller responsibilities
//!
//! A successful [`TokenVerifier::verify`] means exactly one thing: the token
//! was signed with RS256 by a key the provider currently publishes. It does
//! **not** check `aud`, `iss`, `exp` or `nbf`. A token minted by the same
//! provider for a different application verifies just as well (the confused
//! deputy problem), so callers must check at least the audience, issuer and
//! expiry on the returned [`Claims`] before trusting them.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::cache::KeyCache;
use crate::config::UnknownKeyPolicy;
use crate::error::VerifyError;
use crate::key_metrics;
use crate::scheduler::RefreshTrigger;

/// The only signature algorithm accepted in token headers
pub const ACCEPTED_ALGORITHM: Algorithm = Algorithm::RS256;

const ACCEPTED_ALGORITHM_NAME: &str = "RS256";

/// The JOSE header fields used for key selection
///
/// Used only to pick the key and enforce the algorithm; nothing in here is
/// trusted for authorization.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenHeader {
    /// Signature algorithm name as written by the signer
    pub alg: String,
    /// Key id of the signing key
    #[serde(default)]
    pub kid: Option<String>,
    /// Media type, informational
    #[serde(default)]
    pub typ: Option<String>,
}

/// Verified payload of a token, exactly as the provider encoded it
///
/// The accessors only read; none of them enforces anything. See the
/// [module documentation](self) for the checks callers must do themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims(Map<String, Value>);

impl Claims {
    /// Raw claim value by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// All claims
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// All claims, by value
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Deserialize the claims into an application type
    ///
    /// # Errors
    ///
    /// Returns the serde error if the claims do not match `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.0.clone()))
    }

    /// `iss`
    pub fn issuer(&self) -> Option<&str> {
        self.0.get("iss").and_then(Value::as_str)
    }

    /// `sub`
    pub fn subject(&self) -> Option<&str> {
        self.0.get("sub").and_then(Value::as_str)
    }

    /// `aud`, which may be a single string or an array of strings
    pub fn audiences(&self) -> Vec<&str> {
        match self.0.get("aud") {
            Some(Value::String(aud)) => vec![aud.as_str()],
            Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// `exp` as a point in time
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.timestamp("exp")
    }

    /// `iat` as a point in time
    pub fn issued_at(&self) -> Option<SystemTime> {
        self.timestamp("iat")
    }

    /// `nbf` as a point in time
    pub fn not_before(&self) -> Option<SystemTime> {
        self.timestamp("nbf")
    }

    fn timestamp(&self, name: &str) -> Option<SystemTime> {
        let seconds = self.0.get(name)?.as_u64()?;
        UNIX_EPOCH.checked_add(Duration::from_secs(seconds))
    }
}

/// Verifies RS256 tokens against a [`KeyCache`]
///
/// Cheap to clone; all clones share the cache.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    cache: Arc<KeyCache>,
    unknown_key_policy: UnknownKeyPolicy,
    trigger: Option<RefreshTrigger>,
}

impl TokenVerifier {
    /// Verifier reading from `cache`
    pub fn new(cache: Arc<KeyCache>) -> Self {
        Self {
            cache,
            unknown_key_policy: UnknownKeyPolicy::Ignore,
            trigger: None,
        }
    }

    /// Trigger used when the policy asks for a refresh on unknown key ids
    pub fn with_refresh_trigger(mut self, trigger: RefreshTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Set the unknown key policy
    pub fn with_unknown_key_policy(mut self, policy: UnknownKeyPolicy) -> Self {
        self.unknown_key_policy = policy;
        self
    }

    /// The cache this verifier reads
    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    /// Verify a compact-serialized token and return its claims
    ///
    /// Steps, in order: split and base64url-decode the three segments, decode
    /// the header, require `alg` to be exactly `RS256`, look up `kid` in the
    /// cache (no fallback to any other key), verify the signature over
    /// `header.payload`, then decode the payload.
    ///
    /// `exp`, `aud`, `iss` and `nbf` are **not** checked; see the
    /// [module documentation](self).
    ///
    /// # Errors
    ///
    /// - [`VerifyError::TokenStructure`] for anything that is not three valid
    ///   base64url segments with JSON header and payload, or a header without `kid`
    /// - [`VerifyError::UnsupportedAlgorithm`] if `alg` is not `RS256`
    /// - [`VerifyError::UnknownKey`] if `kid` is not in the current key table
    /// - [`VerifyError::SignatureInvalid`] if the signature does not verify
    pub fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        let result = self.verify_token(token);
        key_metrics::record_verification(match &result {
            Ok(_) => "accepted",
            Err(VerifyError::TokenStructure(_)) => "token_structure",
            Err(VerifyError::UnsupportedAlgorithm(_)) => "unsupported_algorithm",
            Err(VerifyError::UnknownKey(_)) => "unknown_key",
            Err(VerifyError::SignatureInvalid) => "signature_invalid",
        });
        result
    }

    fn verify_token(&self, token: &str) -> Result<Claims, VerifyError> {
        let segments = Segments::split(token)?;

        let header: TokenHeader = serde_json::from_slice(&segments.header)
            .map_err(|e| VerifyError::TokenStructure(format!("invalid header: {e}")))?;

        if header.alg != ACCEPTED_ALGORITHM_NAME {
            warn!(algorithm = %header.alg, "Rejected token with unexpected signing algorithm");
            return Err(VerifyError::UnsupportedAlgorithm(header.alg));
        }

        let kid = header
            .kid
            .ok_or_else(|| VerifyError::TokenStructure("header has no kid".to_string()))?;

        let Some(key) = self.cache.get(&kid) else {
            debug!(kid = %kid, key_count = self.cache.len(), "Token signed by unknown key");
            if self.unknown_key_policy == UnknownKeyPolicy::RequestRefresh
                && let Some(trigger) = &self.trigger
            {
                trigger.request();
            }
            return Err(VerifyError::UnknownKey(kid));
        };

        match jsonwebtoken::crypto::verify(
            segments.signature,
            segments.signing_input.as_bytes(),
            key.decoding_key(),
            ACCEPTED_ALGORITHM,
        ) {
            Ok(true) => {}
            Ok(false) => {
                debug!(kid = %kid, "Token signature did not verify");
                return Err(VerifyError::SignatureInvalid);
            }
            Err(e) => {
                debug!(kid = %kid, error = %e, "Signature primitive rejected token");
                return Err(VerifyError::SignatureInvalid);
            }
        }

        let claims: Map<String, Value> = serde_json::from_slice(&segments.payload)
            .map_err(|e| VerifyError::TokenStructure(format!("invalid payload: {e}")))?;

        Ok(Claims(claims))
    }
}

/// A token split into its parts
struct Segments<'a> {
    /// `header.payload` exactly as it appears in the token
    signing_input: &'a str,
    /// Signature segment, still base64url encoded
    signature: &'a str,
    header: Vec<u8>,
    payload: Vec<u8>,
}

impl<'a> Segments<'a> {
    fn split(token: &'a str) -> Result<Self, VerifyError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(VerifyError::TokenStructure(
                "expected three dot-separated segments".to_string(),
            ));
        };

        let decode = |name: &str, segment: &str| {
            URL_SAFE_NO_PAD.decode(segment).map_err(|e| {
                VerifyError::TokenStructure(format!("{name} is not valid base64url: {e}"))
            })
        };

        let header_bytes = decode("header", header)?;
        let payload_bytes = decode("payload", payload)?;
        decode("signature", signature)?;

        Ok(Self {
            signing_input: &token[..header.len() + 1 + payload.len()],
            signature,
            header: header_bytes,
            payload: payload_bytes,
        })
    }
}
