//! Composition root tying the cache, the refresh loop and the verifier together
//!
//! Nothing in this crate is a process-wide singleton. A [`KeyService`] owns one
//! cache and one refresh loop; create as many as you need (one per identity
//! provider, one per test) and drop or [`shutdown`](KeyService::shutdown) them
//! when done.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cache::KeyCache;
use crate::config::VerifierConfig;
use crate::error::ConfigError;
use crate::fetcher::{HttpKeySource, KeyDocumentSource};
use crate::scheduler::{RefreshScheduler, RefreshStats, SchedulerHandle};
use crate::verifier::TokenVerifier;

/// A running key cache with its refresh loop and a verifier bound to it
///
/// The loop stops when the service is shut down or dropped.
#[derive(Debug)]
pub struct KeyService {
    cache: Arc<KeyCache>,
    verifier: TokenVerifier,
    scheduler: SchedulerHandle,
}

impl KeyService {
    /// Start refreshing from the configured HTTP endpoint
    ///
    /// The first fetch starts immediately in the background; use
    /// [`wait_until_ready`](Self::wait_until_ready) to wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the certificates URL is unusable or the HTTP
    /// client cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(config: VerifierConfig) -> Result<Self, ConfigError> {
        let source = HttpKeySource::new(&config)?;
        Ok(Self::with_source(config, Arc::new(source)))
    }

    /// Start refreshing from an arbitrary source
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn with_source(config: VerifierConfig, source: Arc<dyn KeyDocumentSource>) -> Self {
        info!(
            source = source.describe(),
            unknown_key_policy = ?config.unknown_key_policy,
            "Starting key service"
        );

        let cache = Arc::new(KeyCache::new());
        let scheduler = RefreshScheduler::new(source, Arc::clone(&cache), &config).spawn();
        let verifier = TokenVerifier::new(Arc::clone(&cache))
            .with_unknown_key_policy(config.unknown_key_policy)
            .with_refresh_trigger(scheduler.trigger());

        Self {
            cache,
            verifier,
            scheduler,
        }
    }

    /// Verifier reading this service's cache; clone it freely
    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    /// The shared key cache
    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    /// Refresh loop counters
    pub fn stats(&self) -> RefreshStats {
        self.scheduler.stats()
    }

    /// Ask for a refresh ahead of schedule (rate limited)
    pub fn refresh_now(&self) {
        self.scheduler.refresh_now();
    }

    /// Wait until the first key table has been published
    ///
    /// Returns `false` if the timeout elapsed with the cache still empty.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        self.cache.wait_for_keys(timeout).await
    }

    /// Stop the refresh loop and wait for it to exit
    ///
    /// Verifiers cloned from this service keep working against the last
    /// published table.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        info!("Key service stopped");
    }
}
