//! In-memory key table shared by the refresh scheduler and the verifier
//!
//! The table is published through an [`ArcSwap`]: a reader loads one `Arc` to
//! a complete table and keeps using it, the writer builds a new table off to
//! the side and swaps the reference. No reader can observe a half-written
//! table, and neither side ever waits on the other for more than the pointer
//! swap.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::debug;

use crate::decoder::VerificationKey;

/// Immutable mapping from key id to verification key
#[derive(Debug, Clone, Default)]
pub struct KeyTable {
    keys: BTreeMap<String, Arc<VerificationKey>>,
}

impl KeyTable {
    /// Empty table, the state before the first successful refresh
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from decoded keys
    pub fn from_keys(keys: BTreeMap<String, Arc<VerificationKey>>) -> Self {
        Self { keys }
    }

    /// Look up a key by id
    pub fn get(&self, kid: &str) -> Option<&Arc<VerificationKey>> {
        self.keys.get(kid)
    }

    /// Whether `kid` is present
    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the table holds no keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key ids in sorted order
    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// `(kid, key)` pairs in sorted order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<VerificationKey>)> {
        self.keys.iter().map(|(kid, key)| (kid.as_str(), key))
    }
}

impl FromIterator<(String, VerificationKey)> for KeyTable {
    fn from_iter<I: IntoIterator<Item = (String, VerificationKey)>>(iter: I) -> Self {
        Self {
            keys: iter
                .into_iter()
                .map(|(kid, key)| (kid, Arc::new(key)))
                .collect(),
        }
    }
}

/// Concurrently readable key cache
///
/// Created empty, filled by the first successful refresh, replaced wholesale by
/// each later one. Entries never expire on their own; a key disappears only
/// when a refresh publishes a table without it.
#[derive(Debug)]
pub struct KeyCache {
    table: ArcSwap<KeyTable>,
    /// Bumped after every replacement; lets callers wait for a refresh
    generation: watch::Sender<u64>,
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyCache {
    /// Create an empty cache
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            table: ArcSwap::from_pointee(KeyTable::new()),
            generation,
        }
    }

    /// Look up a key by id in the current table
    pub fn get(&self, kid: &str) -> Option<Arc<VerificationKey>> {
        self.table.load().get(kid).cloned()
    }

    /// The current table as one consistent snapshot
    pub fn snapshot(&self) -> Arc<KeyTable> {
        self.table.load_full()
    }

    /// Atomically replace the whole table
    pub fn replace_all(&self, table: KeyTable) {
        let key_count = table.len();
        self.table.store(Arc::new(table));
        self.generation.send_modify(|generation| *generation += 1);
        debug!(key_count, generation = self.generation(), "Key table replaced");
    }

    /// Number of keys in the current table
    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    /// Whether the current table is empty
    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }

    /// Number of replacements so far (0 until the first successful refresh)
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Receiver notified on every replacement
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Wait until the cache holds at least one key, or the timeout elapses
    ///
    /// Returns whether keys are available.
    pub async fn wait_for_keys(&self, timeout: Duration) -> bool {
        let mut updates = self.subscribe();
        let wait = async {
            while self.is_empty() {
                if updates.changed().await.is_err() {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        !self.is_empty()
    }
}
