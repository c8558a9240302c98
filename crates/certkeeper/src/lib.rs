//! # certkeeper - self-refreshing signing keys for ID token verification
//!
//! Keeps an identity provider's published signing certificates in memory,
//! refreshes them on the schedule the provider advertises, and verifies RS256
//! tokens against them.
//!
//! ## Architecture
//!
//! - [`fetcher`] - HTTP GET of the key document (`{ kid: PEM certificate }`)
//! - [`freshness`] - `max-age` minus `Age` from the response headers
//! - [`decoder`] - certificates to RSA verification keys, all-or-nothing
//! - [`cache`] - key table published by atomic whole-table replacement
//! - [`scheduler`] - background refresh loop with failure backoff
//! - [`verifier`] - RS256 token verification against the cache
//! - [`service`] - [`KeyService`], wiring the above together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use certkeeper::{KeyService, VerifierConfig};
//!
//! # async fn run(token: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let service = KeyService::start(VerifierConfig::default())?;
//! service.wait_until_ready(Duration::from_secs(5)).await;
//!
//! let claims = service.verifier().verify(token)?;
//! if claims.audiences().contains(&"my-client-id") {
//!     println!("token for {:?}", claims.subject());
//! }
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Caller Responsibilities
//!
//! Verification proves only that the provider signed the token. `aud`, `iss`,
//! `exp` and `nbf` are returned untouched in [`Claims`]; checking them is up
//! to the caller. Skipping the audience check lets any token the provider
//! issued for another application through.
//!
//! ## Feature Flags
//!
//! - `metrics` - refresh and verification counters via the `metrics` facade
//!   (see [`init_key_metrics`])

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod cache;
pub mod config;
pub mod decoder;
pub mod error;
pub mod fetcher;
pub mod freshness;
mod key_metrics;
pub mod scheduler;
pub mod service;
pub mod verifier;

pub use cache::{KeyCache, KeyTable};
pub use config::{DEFAULT_CERTIFICATES_URL, UnknownKeyPolicy, VerifierConfig};
pub use decoder::{RsaKey, VerificationKey, decode_certificate, decode_key_document};
pub use error::{ConfigError, DocumentError, RefreshError, VerifyError};
pub use fetcher::{HttpKeySource, KeyDocument, KeyDocumentSource};
pub use freshness::{Freshness, MAX_FRESHNESS, freshness_delay};
pub use key_metrics::init_key_metrics;
pub use scheduler::{
    Backoff, RefreshOutcome, RefreshScheduler, RefreshStats, RefreshTrigger, SchedulerHandle,
};
pub use service::KeyService;
pub use verifier::{ACCEPTED_ALGORITHM, Claims, TokenHeader, TokenVerifier};
