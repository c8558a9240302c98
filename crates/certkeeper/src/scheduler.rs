//! Background refresh of the key cache
//!
//! One long-lived task runs `fetch -> freshness -> decode -> publish`, computes
//! the next delay and sleeps. There is no terminal state: the loop alternates
//! between *waiting* and *refreshing* until it is shut down.
//!
//! # Delay policy
//!
//! - Success: the freshness window reported by the server (`max-age - Age`),
//!   floored at `min_refresh_interval`.
//! - Failure: previous delay doubled, never below `initial_delay`. Once the
//!   previous delay exceeds `backoff_ceiling` the next failure delay drops back
//!   to `initial_delay` instead of compounding.
//! - The first attempt runs immediately, with `initial_delay` seeding
//!   "previous delay".
//! - Out-of-band requests run at most once per `min_refresh_interval` after a
//!   success. After a failure they wait for the backoff delay like everything
//!   else.
//! - Delays are capped at [`MAX_FRESHNESS`].
//!
//! Failures never reach token verification; the last good table keeps serving.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use http::StatusCode;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::KeyCache;
use crate::config::VerifierConfig;
use crate::decoder::decode_key_document;
use crate::error::RefreshError;
use crate::fetcher::KeyDocumentSource;
use crate::freshness::{MAX_FRESHNESS, freshness_delay};
use crate::key_metrics;

/// Failure backoff: doubling, restarting at `initial` past `ceiling`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    ceiling: Duration,
}

impl Backoff {
    /// Create a backoff policy
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self { initial, ceiling }
    }

    /// Seed delay and restart value
    pub fn initial(&self) -> Duration {
        self.initial
    }

    /// Delay after a failure, given the delay that preceded it
    pub fn next_failure_delay(&self, previous: Duration) -> Duration {
        if previous > self.ceiling {
            self.initial
        } else {
            previous.saturating_mul(2).max(self.initial)
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Result of one refresh cycle
#[derive(Debug)]
pub struct RefreshOutcome {
    /// When to run the next cycle
    pub next_delay: Duration,
    /// Why this cycle failed, if it did
    pub error: Option<RefreshError>,
}

impl RefreshOutcome {
    /// Whether the cycle published a new table
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Counters describing the refresh loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshStats {
    /// Cycles started
    pub attempts: u64,
    /// Cycles that published a table
    pub successes: u64,
    /// Cycles that failed
    pub failures: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Message of the most recent failure
    pub last_error: Option<String>,
    /// Wall-clock time of the most recent success
    pub last_success: Option<SystemTime>,
    /// Delay chosen after the most recent cycle
    pub next_delay: Duration,
    /// Keys published by the most recent success
    pub key_count: usize,
}

/// Handle used to ask the refresh loop for an early cycle
#[derive(Debug, Clone)]
pub struct RefreshTrigger(pub(crate) Arc<Notify>);

impl RefreshTrigger {
    /// Request a refresh; coalesced and rate limited by the loop
    pub fn request(&self) {
        self.0.notify_one();
    }
}

/// Drives the key cache from a [`KeyDocumentSource`]
pub struct RefreshScheduler {
    source: Arc<dyn KeyDocumentSource>,
    cache: Arc<KeyCache>,
    backoff: Backoff,
    min_refresh_interval: Duration,
    stats: Arc<Mutex<RefreshStats>>,
}

impl std::fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("source", &self.source.describe())
            .field("backoff", &self.backoff)
            .field("min_refresh_interval", &self.min_refresh_interval)
            .finish_non_exhaustive()
    }
}

impl RefreshScheduler {
    /// Create a scheduler publishing into `cache`
    pub fn new(
        source: Arc<dyn KeyDocumentSource>,
        cache: Arc<KeyCache>,
        config: &VerifierConfig,
    ) -> Self {
        Self {
            source,
            cache,
            backoff: Backoff::new(config.initial_delay, config.backoff_ceiling),
            min_refresh_interval: config.min_refresh_interval,
            stats: Arc::new(Mutex::new(RefreshStats::default())),
        }
    }

    /// Fetch, decode and publish once
    ///
    /// Returns the server's freshness window. On error the cache is left
    /// exactly as it was.
    ///
    /// # Errors
    ///
    /// Returns the first [`RefreshError`] from fetching, reading the freshness
    /// headers, or decoding the keys.
    pub async fn refresh_once(&self) -> Result<Duration, RefreshError> {
        let document = self.source.fetch().await?;
        if document.status != StatusCode::OK {
            return Err(RefreshError::Status(document.status));
        }

        let freshness = freshness_delay(&document.headers)?;
        let table = decode_key_document(&document.body)?;
        let key_count = table.len();

        self.cache.replace_all(table);
        key_metrics::record_cached_keys(key_count);

        if freshness.is_stale() {
            warn!(
                source = self.source.describe(),
                max_age_secs = freshness.max_age.as_secs(),
                age_secs = freshness.age.as_secs(),
                "Key document already stale when fetched"
            );
        }

        Ok(freshness.delay())
    }

    /// Run one cycle and decide the next delay
    pub async fn run_cycle(&self, previous_delay: Duration) -> RefreshOutcome {
        let result = self.refresh_once().await;
        key_metrics::record_refresh(result.is_ok());

        let outcome = match result {
            Ok(window) => {
                let next_delay = window.max(self.min_refresh_interval);
                info!(
                    source = self.source.describe(),
                    key_count = self.cache.len(),
                    delay_ms = next_delay.as_millis() as u64,
                    "Refreshed signing keys"
                );
                RefreshOutcome {
                    next_delay,
                    error: None,
                }
            }
            Err(error) => {
                let next_delay = self.backoff.next_failure_delay(previous_delay);
                warn!(
                    source = self.source.describe(),
                    error = %error,
                    delay_ms = next_delay.as_millis() as u64,
                    "Signing key refresh failed, keeping previous keys"
                );
                RefreshOutcome {
                    next_delay,
                    error: Some(error),
                }
            }
        };

        self.record(&outcome);
        outcome
    }

    fn record(&self, outcome: &RefreshOutcome) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.attempts += 1;
        stats.next_delay = outcome.next_delay;
        match &outcome.error {
            None => {
                stats.successes += 1;
                stats.consecutive_failures = 0;
                stats.last_success = Some(SystemTime::now());
                stats.key_count = self.cache.len();
            }
            Some(error) => {
                stats.failures += 1;
                stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
                stats.last_error = Some(error.to_string());
            }
        }
    }

    /// Current counters
    pub fn stats(&self) -> RefreshStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start the refresh loop on the current tokio runtime
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let shutdown = CancellationToken::new();
        let notify = Arc::new(Notify::new());
        let stats = Arc::clone(&self.stats);
        let task = tokio::spawn(self.run(shutdown.clone(), Arc::clone(&notify)));

        SchedulerHandle {
            shutdown,
            trigger: RefreshTrigger(notify),
            stats,
            task: Some(task),
        }
    }

    async fn run(self, shutdown: CancellationToken, notify: Arc<Notify>) {
        info!(source = self.source.describe(), "Starting signing key refresh loop");

        let mut previous_delay = self.backoff.initial();
        loop {
            let outcome = self.run_cycle(previous_delay).await;
            let last_attempt = Instant::now();
            previous_delay = outcome.next_delay;
            let mut deadline = deadline_after(last_attempt, outcome.next_delay);

            // While backing off, early requests wait out the backoff too
            let cooldown = if outcome.is_success() {
                self.min_refresh_interval
            } else {
                outcome.next_delay.max(self.min_refresh_interval)
            };
            let earliest = deadline_after(last_attempt, cooldown);

            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        info!(source = self.source.describe(), "Stopping signing key refresh loop");
                        return;
                    }
                    () = tokio::time::sleep_until(deadline) => break,
                    () = notify.notified() => {
                        if Instant::now() >= earliest {
                            debug!(source = self.source.describe(), "Out-of-band refresh requested");
                            break;
                        }
                        // Too soon after the last cycle; bring the next one forward instead
                        deadline = deadline.min(earliest);
                        debug!(source = self.source.describe(), "Out-of-band refresh rate limited");
                    }
                }
            }
        }
    }
}

// Instant + Duration panics on overflow; fall back to the cap
fn deadline_after(start: Instant, delay: Duration) -> Instant {
    start
        .checked_add(delay)
        .or_else(|| start.checked_add(MAX_FRESHNESS))
        .unwrap_or(start)
}

/// Owner of a running refresh loop; dropping it stops the loop
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    trigger: RefreshTrigger,
    stats: Arc<Mutex<RefreshStats>>,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Ask the loop for an early refresh
    pub fn refresh_now(&self) {
        self.trigger.request();
    }

    /// A cloneable trigger for the verifier
    pub fn trigger(&self) -> RefreshTrigger {
        self.trigger.clone()
    }

    /// Current counters
    pub fn stats(&self) -> RefreshStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the loop task has exited
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the loop and wait for it to exit
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Signing key refresh loop ended abnormally");
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
