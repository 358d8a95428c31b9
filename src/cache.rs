//! Time-boxed memoization for expensive read queries.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Expired entries are swept every `CLEANUP_FACTOR` TTLs.
const CLEANUP_FACTOR: u32 = 10;

struct CacheState<K, V> {
    entries: HashMap<K, (V, Instant)>,
    next_cleanup: Instant,
}

/// A map from query to value where each entry lives for a fixed TTL.
///
/// Eviction is lazy: a lookup that finds the cleanup deadline passed sweeps
/// every expired entry first. The map is behind a mutex that is never held
/// while a value is being computed.
pub struct TimedCache<K, V> {
    ttl: Duration,
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> TimedCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                next_cleanup: Instant::now() + ttl * CLEANUP_FACTOR,
            }),
        }
    }

    /// Return the live value for `key`, or compute, store and return it.
    ///
    /// Errors from `compute` are returned as-is and nothing is stored.
    pub fn get_or_try_insert_with<E, F>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let now = Instant::now();
        {
            let mut state = self.lock_state();
            if now >= state.next_cleanup {
                let before = state.entries.len();
                state.entries.retain(|_, (_, expires)| *expires > now);
                tracing::debug!(
                    "Cache sweep removed {} expired entries",
                    before - state.entries.len()
                );
                state.next_cleanup = now + self.ttl * CLEANUP_FACTOR;
            }

            if let Some((value, expires)) = state.entries.get(&key) {
                if *expires > now {
                    return Ok(value.clone());
                }
            }
        }

        let value = compute()?;
        self.lock_state()
            .entries
            .insert(key, (value.clone(), Instant::now() + self.ttl));
        Ok(value)
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
