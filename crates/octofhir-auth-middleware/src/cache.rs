//! Bounded, time-expiring cache of authentication results.
//!
//! Entries are keyed by a credential fingerprint (see
//! [`fingerprint`](crate::middleware::fingerprint)). Expiry is lazy: an
//! entry older than the TTL is purged by the lookup that finds it, there is
//! no background sweep. When full, inserting a new key evicts the oldest
//! inserted entry.
//!
//! The cache is an explicit dependency of the middleware, so separate
//! middleware instances (e.g. one per tenant) never share entries unless
//! they are handed the same `Arc<AuthCache>`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let cache = Arc::new(AuthCache::new(1000, Duration::from_secs(5)));
//! cache.set("Bearer abc:".to_string(), result);
//! assert!(cache.get("Bearer abc:").is_some());
//! ```

use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::{DEFAULT_CACHE_TTL, DEFAULT_MAX_CACHE_SIZE};
use crate::types::AuthenticationResult;

/// A cached authentication result and the time it was stored.
#[derive(Debug, Clone)]
struct CacheEntry {
    result: AuthenticationResult,
    inserted_at: Instant,
}

/// Mutable cache state, guarded as a whole by one mutex.
#[derive(Debug, Default)]
struct CacheState {
    /// Entries in insertion order; index 0 is the oldest.
    entries: IndexMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

/// In-memory authentication result cache.
#[derive(Debug)]
pub struct AuthCache {
    state: Mutex<CacheState>,
    max_size: usize,
    ttl: Duration,
}

impl Default for AuthCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHE_SIZE, DEFAULT_CACHE_TTL)
    }
}

impl AuthCache {
    /// Create a cache holding at most `max_size` entries for `ttl` each.
    ///
    /// A `max_size` of zero is treated as one.
    #[must_use]
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_size: max_size.max(1),
            ttl,
        }
    }

    /// Returns the cached result for `key`, if present and not expired.
    ///
    /// An expired entry is removed by this call.
    pub fn get(&self, key: &str) -> Option<AuthenticationResult> {
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
        };

        if expired {
            state.entries.shift_remove(key);
            state.expirations += 1;
            state.misses += 1;
            tracing::trace!(key_len = key.len(), "Auth cache entry expired");
            return None;
        }

        state.hits += 1;
        state.entries.get(key).map(|entry| entry.result.clone())
    }

    /// Stores `result` under `key`.
    ///
    /// When the cache is full and `key` is new, the oldest entry is evicted
    /// first. Overwriting an existing key refreshes its timestamp in place.
    pub fn set(&self, key: String, result: AuthenticationResult) {
        let mut state = self.state.lock();

        if !state.entries.contains_key(&key)
            && state.entries.len() >= self.max_size
            && state.entries.shift_remove_index(0).is_some()
        {
            state.evictions += 1;
        }

        state.entries.insert(
            key,
            CacheEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Removes a single entry.
    pub fn invalidate(&self, key: &str) -> bool {
        self.state.lock().entries.shift_remove(key).is_some()
    }

    /// Removes every entry. Counters are kept.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let removed = state.entries.len();
        state.entries.clear();
        tracing::debug!(removed, "Auth cache cleared");
    }

    /// Number of stored entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns `true` if no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Entry time-to-live.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get cache statistics.
    #[must_use]
    pub fn stats(&self) -> AuthCacheStats {
        let state = self.state.lock();
        AuthCacheStats {
            size: state.entries.len(),
            max_size: self.max_size,
            ttl: self.ttl,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
        }
    }
}

// =============================================================================
// Cache Statistics
// =============================================================================

/// Statistics about the authentication cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCacheStats {
    /// Number of stored entries.
    pub size: usize,

    /// Configured capacity.
    pub max_size: usize,

    /// Entry time-to-live.
    pub ttl: Duration,

    /// Lookups answered from the cache.
    pub hits: u64,

    /// Lookups that found nothing or an expired entry.
    pub misses: u64,

    /// Entries removed to make room for new keys.
    pub evictions: u64,

    /// Entries purged because they outlived the TTL.
    pub expirations: u64,
}

// =============================================================================
// Tests
// =============================================================================
