//! Verifier configuration
//!
//! The only setting an operator is expected to touch is the certificates URL.
//! Everything else has a default matching the provider's published behaviour
//! and exists mainly so tests can shrink timings.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Google's published signing certificates (JSON map of key id to PEM certificate)
pub const DEFAULT_CERTIFICATES_URL: &str = "https://www.googleapis.com/oauth2/v1/certs";

/// What the verifier does when a token names a key id that is not cached
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownKeyPolicy {
    /// Reject and wait for the next scheduled refresh
    #[default]
    Ignore,
    /// Reject, and ask the scheduler for an early refresh
    ///
    /// Requests are rate limited by [`VerifierConfig::min_refresh_interval`]
    /// after a successful refresh. While the endpoint is failing they are held
    /// back until the current backoff delay has elapsed, so unknown key ids
    /// cannot make the loop hammer a struggling endpoint.
    RequestRefresh,
}

/// Configuration for [`KeyService`](crate::KeyService) and its parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Endpoint publishing `{ "<kid>": "<PEM certificate>", ... }`
    pub certificates_url: String,
    /// Per-request timeout for the key endpoint
    pub request_timeout: Duration,
    /// Upper bound on the key document body size in bytes
    pub max_document_size: usize,
    /// User agent sent to the key endpoint
    pub user_agent: String,
    /// Delay that seeds the backoff before the first attempt
    pub initial_delay: Duration,
    /// Once the previous delay exceeds this, failure backoff restarts at `initial_delay`
    pub backoff_ceiling: Duration,
    /// Floor for refresh delays and rate limit for out-of-band refreshes
    pub min_refresh_interval: Duration,
    /// Reaction to tokens signed by an unknown key
    pub unknown_key_policy: UnknownKeyPolicy,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            certificates_url: DEFAULT_CERTIFICATES_URL.to_string(),
            request_timeout: Duration::from_secs(10),
            max_document_size: 64 * 1024, // 64 KB
            user_agent: format!("certkeeper/{}", env!("CARGO_PKG_VERSION")),
            initial_delay: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(60),
            min_refresh_interval: Duration::from_secs(1),
            unknown_key_policy: UnknownKeyPolicy::Ignore,
        }
    }
}

impl VerifierConfig {
    /// Default configuration pointed at a different certificates URL
    pub fn with_certificates_url(url: impl Into<String>) -> Self {
        Self {
            certificates_url: url.into(),
            ..Self::default()
        }
    }

    /// Set the request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the maximum accepted key document size
    pub fn max_document_size(mut self, bytes: usize) -> Self {
        self.max_document_size = bytes;
        self
    }

    /// Set the backoff seed and ceiling
    pub fn backoff(mut self, initial: Duration, ceiling: Duration) -> Self {
        self.initial_delay = initial;
        self.backoff_ceiling = ceiling;
        self
    }

    /// Set the minimum interval between two refreshes
    pub fn min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Set the unknown key policy
    pub fn unknown_key_policy(mut self, policy: UnknownKeyPolicy) -> Self {
        self.unknown_key_policy = policy;
        self
    }

    /// Check the certificates URL
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`] if the URL does not parse and
    /// [`ConfigError::InsecureUrl`] if it is not https. Plain http is accepted
    /// for loopback hosts so local mock endpoints work.
    pub fn validate(&self) -> Result<url::Url, ConfigError> {
        let url =
            url::Url::parse(&self.certificates_url).map_err(|e| ConfigError::InvalidUrl {
                url: self.certificates_url.clone(),
                reason: e.to_string(),
            })?;

        match url.scheme() {
            "https" => Ok(url),
            "http" if is_loopback(&url) => Ok(url),
            _ => Err(ConfigError::InsecureUrl(self.certificates_url.clone())),
        }
    }
}

fn is_loopback(url: &url::Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(url::Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}
